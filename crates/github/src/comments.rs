use std::time::Duration;

use anyhow::{Context, Result, bail};
use apptest_core::{
    config::{GitHubConfig, NotificationConfig},
    util::truncate,
};
use async_trait::async_trait;
use reqwest::{Client, header};
use serde::Serialize;
use url::Url;

/// Destination for human-readable run updates.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver `message` to `target`. A rejected delivery is an error.
    async fn post(&self, target: &Url, message: &str) -> Result<()>;
}

#[derive(Serialize)]
struct CommentBody<'a> {
    body: &'a str,
}

/// Posts issue comments through the GitHub REST API.
#[derive(Clone)]
pub struct CommentClient {
    client: Client,
    token: String,
    banner: String,
    enabled: bool,
}

impl CommentClient {
    pub fn new(github: &GitHubConfig, notifications: &NotificationConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(notifications.request_timeout_secs))
            .user_agent(concat!("apptest/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create comment client")?;
        Ok(Self {
            client,
            token: github.token.clone(),
            banner: notifications.banner.clone(),
            enabled: notifications.enabled,
        })
    }

    pub fn format(&self, message: &str) -> String { format!("{}\n\n{}", self.banner, message) }
}

#[async_trait]
impl Notifier for CommentClient {
    async fn post(&self, target: &Url, message: &str) -> Result<()> {
        let body = self.format(message);
        if !self.enabled {
            tracing::info!(url = %target, "Comments disabled, not posting:\n{}", body);
            return Ok(());
        }
        let response = self
            .client
            .post(target.clone())
            .bearer_auth(&self.token)
            .header(header::ACCEPT, "application/vnd.github+json")
            .json(&CommentBody { body: &body })
            .send()
            .await
            .with_context(|| format!("Failed to post comment to {target}"))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            bail!("Posting comment to {} returned {}: {}", target, status, truncate(&text, 500));
        }
        tracing::debug!(url = %target, "Posted comment");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use httpmock::prelude::*;
    use serde_json::json;

    use super::*;

    fn client(enabled: bool) -> CommentClient {
        CommentClient::new(
            &GitHubConfig { token: "ghp_test".to_string(), ..Default::default() },
            &NotificationConfig {
                enabled,
                banner: "**bot**".to_string(),
                request_timeout_secs: 1,
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_post_comment() {
        let server = MockServer::start();
        let comment = server.mock(|when, then| {
            when.method(POST)
                .path("/repos/o/r/issues/7/comments")
                .header("authorization", "Bearer ghp_test")
                .json_body(json!({ "body": "**bot**\n\nDeleted test app `x`." }));
            then.status(201).json_body(json!({ "id": 1 }));
        });
        let target = Url::parse(&server.url("/repos/o/r/issues/7/comments")).unwrap();
        client(true).post(&target, "Deleted test app `x`.").await.unwrap();
        comment.assert_calls(1);
    }

    #[tokio::test]
    async fn test_rejected_comment_is_an_error() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/repos/o/r/issues/7/comments");
            then.status(403).body("Resource not accessible by integration");
        });
        let target = Url::parse(&server.url("/repos/o/r/issues/7/comments")).unwrap();
        let err = client(true).post(&target, "hello").await.unwrap_err();
        assert!(err.to_string().contains("403"), "{err}");
    }

    #[tokio::test]
    async fn test_hung_comment_request_times_out() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/repos/o/r/issues/7/comments");
            then.status(201).delay(Duration::from_secs(5));
        });
        let target = Url::parse(&server.url("/repos/o/r/issues/7/comments")).unwrap();
        let started = std::time::Instant::now();
        assert!(client(true).post(&target, "hello").await.is_err());
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_kill_switch_skips_delivery() {
        let server = MockServer::start();
        let comment = server.mock(|when, then| {
            when.method(POST);
            then.status(201);
        });
        let target = Url::parse(&server.url("/repos/o/r/issues/7/comments")).unwrap();
        client(false).post(&target, "hello").await.unwrap();
        comment.assert_calls(0);
    }
}
