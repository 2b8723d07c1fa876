use std::{fmt::Display, sync::Arc};

use anyhow::Result;
use apptest_core::config::Config;
use axum::{
    body::Bytes,
    extract::{FromRef, FromRequest, Request},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use hmac::{Hmac, Mac};
use octocrab::models::webhook_events::WebhookEvent;
use sha2::Sha256;

/// Verified and typed GitHub webhook payload.
#[derive(Clone)]
#[must_use]
pub struct GitHubEvent {
    pub event: WebhookEvent,
}

impl<S> FromRequest<S> for GitHubEvent
where
    Arc<Config>: FromRef<S>,
    S: Send + Sync + Clone,
{
    type Rejection = Response;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        fn err(m: impl Display) -> Response {
            tracing::error!("{m}");
            (StatusCode::BAD_REQUEST, m.to_string()).into_response()
        }
        let event = req
            .headers()
            .get("X-GitHub-Event")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| err("X-GitHub-Event header missing"))?
            .to_string();
        let signature = req
            .headers()
            .get("X-Hub-Signature-256")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let config = <Arc<Config>>::from_ref(state);
        let body = Bytes::from_request(req, state).await.map_err(|_| err("error reading body"))?;
        if let Some(secret) = &config.github.webhook_secret {
            verify_signature(secret, signature.as_deref(), &body).map_err(err)?;
        }
        // Payloads that don't match the typed event schema are rejected here.
        let value = WebhookEvent::try_from_header_and_body(&event, &body)
            .map_err(|_| err("error parsing body"))?;
        Ok(GitHubEvent { event: value })
    }
}

/// Check an `X-Hub-Signature-256` header value against the HMAC of `body`.
pub fn verify_signature(
    secret: &str,
    signature: Option<&str>,
    body: &[u8],
) -> Result<(), &'static str> {
    let signature = signature
        .ok_or("X-Hub-Signature-256 missing")?
        .strip_prefix("sha256=")
        .ok_or("X-Hub-Signature-256 sha256= prefix missing")?;
    let signature = hex::decode(signature).map_err(|_| "X-Hub-Signature-256 malformed")?;
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|_| "invalid webhook secret")?;
    mac.update(body);
    mac.verify_slice(&signature).map_err(|_| "signature mismatch")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn test_verify_signature() {
        let body = br#"{"action":"created"}"#;
        let signature = sign("secret", body);
        assert_eq!(verify_signature("secret", Some(&signature), body), Ok(()));
        assert_eq!(
            verify_signature("other", Some(&signature), body),
            Err("signature mismatch")
        );
        assert_eq!(
            verify_signature("secret", Some(&signature), br#"{"action":"deleted"}"#),
            Err("signature mismatch")
        );
        assert_eq!(verify_signature("secret", None, body), Err("X-Hub-Signature-256 missing"));
        assert_eq!(
            verify_signature("secret", Some("sha1=abc"), body),
            Err("X-Hub-Signature-256 sha256= prefix missing")
        );
        assert_eq!(
            verify_signature("secret", Some("sha256=zz"), body),
            Err("X-Hub-Signature-256 malformed")
        );
    }
}
