//! Client for the deployment backend that creates, deploys to and deletes test apps.

use std::time::Duration;

use anyhow::{Context, Result};
use apptest_core::{
    config::BackendConfig,
    models::{RemoteJobHandle, RunRequest, RunStatus},
    util::truncate,
};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use url::Url;

/// Header carrying the backend's static API key.
pub const API_KEY_HEADER: &str = "x-functions-key";

pub const CREATE_APP_PATH: &str = "api/CreateNewFunctionApp";
pub const DEPLOY_PATH: &str = "api/DeployToFunctionApp";
pub const DELETE_APP_PATH: &str = "api/DeleteFunctionApp";

/// Result of a call that reached the backend.
///
/// Transport faults and unparseable success bodies are not represented here; they are
/// returned as errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CallOutcome<T> {
    Success(T),
    Failure { status: u16, body: String },
}

impl<T> CallOutcome<T> {
    pub fn is_success(&self) -> bool { matches!(self, Self::Success(_)) }
}

/// Body returned by the backend once it accepted a deployment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployResponse {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub status_query_get_uri: Option<String>,
}

impl DeployResponse {
    /// The job handle, if the response carries a usable job id and status query URL.
    pub fn handle(&self) -> Option<RemoteJobHandle> {
        let id = self.id.as_deref().filter(|id| !id.is_empty())?;
        let status_query_url = Url::parse(self.status_query_get_uri.as_deref()?).ok()?;
        matches!(status_query_url.scheme(), "http" | "https")
            .then(|| RemoteJobHandle { id: id.to_string(), status_query_url })
    }
}

/// Operations the workflow needs from the backend.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn create_app(&self, request: &RunRequest) -> Result<CallOutcome<()>>;

    async fn deploy(&self, request: &RunRequest) -> Result<CallOutcome<DeployResponse>>;

    async fn delete_app(&self, request: &RunRequest) -> Result<CallOutcome<()>>;

    async fn status(&self, handle: &RemoteJobHandle) -> Result<CallOutcome<RunStatus>>;
}

#[derive(Clone)]
pub struct RemoteCallExecutor {
    client: Client,
    base_url: Url,
    api_key: String,
}

impl RemoteCallExecutor {
    pub fn new(config: &BackendConfig) -> Result<Self> {
        let mut base_url = config.base_url()?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .user_agent(concat!("apptest/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create backend client")?;
        Ok(Self { client, base_url, api_key: config.api_key.clone() })
    }

    pub fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .with_context(|| format!("Invalid backend path {path}"))
    }

    /// POST `body` as JSON to `path` and parse a successful response as `T`.
    pub async fn call<B, T>(&self, path: &str, body: &B) -> Result<CallOutcome<T>>
    where
        B: Serialize + ?Sized + Sync,
        T: DeserializeOwned,
    {
        let url = self.endpoint(path)?;
        let request = self.client.post(url.clone()).json(body);
        self.execute(request, &url, |bytes| {
            serde_json::from_slice(bytes)
                .with_context(|| format!("Failed to parse response from {}", url.path()))
        })
        .await
    }

    /// POST `body` as JSON to `path`, ignoring the response body on success.
    pub async fn call_without_response<B>(&self, path: &str, body: &B) -> Result<CallOutcome<()>>
    where B: Serialize + ?Sized + Sync {
        let url = self.endpoint(path)?;
        let request = self.client.post(url.clone()).json(body);
        self.execute(request, &url, |_| Ok(())).await
    }

    /// GET an absolute URL handed out by the backend and parse a successful response as `T`.
    pub async fn get<T>(&self, url: &Url) -> Result<CallOutcome<T>>
    where T: DeserializeOwned {
        let request = self.client.get(url.clone());
        self.execute(request, url, |bytes| {
            serde_json::from_slice(bytes)
                .with_context(|| format!("Failed to parse response from {}", url.path()))
        })
        .await
    }

    async fn execute<T>(
        &self,
        request: RequestBuilder,
        url: &Url,
        parse: impl FnOnce(&[u8]) -> Result<T>,
    ) -> Result<CallOutcome<T>> {
        let response = request
            .header(API_KEY_HEADER, &self.api_key)
            .send()
            .await
            .with_context(|| format!("Request to {} failed", url.path()))?;
        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .with_context(|| format!("Failed to read response from {}", url.path()))?;
        if status.as_u16() < 300 {
            tracing::debug!("Backend {} returned {}", url.path(), status);
            Ok(CallOutcome::Success(parse(&bytes[..])?))
        } else {
            let body = truncate(&String::from_utf8_lossy(&bytes), 2000);
            tracing::warn!("Backend {} returned {}: {}", url.path(), status, body);
            Ok(CallOutcome::Failure { status: status.as_u16(), body })
        }
    }
}

#[async_trait]
impl Backend for RemoteCallExecutor {
    async fn create_app(&self, request: &RunRequest) -> Result<CallOutcome<()>> {
        self.call_without_response(CREATE_APP_PATH, request).await
    }

    async fn deploy(&self, request: &RunRequest) -> Result<CallOutcome<DeployResponse>> {
        self.call(DEPLOY_PATH, request).await
    }

    async fn delete_app(&self, request: &RunRequest) -> Result<CallOutcome<()>> {
        self.call_without_response(DELETE_APP_PATH, request).await
    }

    async fn status(&self, handle: &RemoteJobHandle) -> Result<CallOutcome<RunStatus>> {
        self.get(&handle.status_query_url).await
    }
}
