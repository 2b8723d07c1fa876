pub mod command;
pub mod comments;
pub mod webhook;

use std::sync::Arc;

use anyhow::{Context, Result};
use apptest_core::config::GitHubConfig;
use http::StatusCode;
use octocrab::{GitHubError, Octocrab};

#[derive(Clone)]
pub struct GitHub {
    pub client: Octocrab,
}

impl GitHub {
    pub async fn new(config: &GitHubConfig) -> Result<Arc<Self>> {
        let client = Octocrab::builder()
            .personal_token(config.token.clone())
            .build()
            .context("Failed to create GitHub client")?;
        let profile = client.current().user().await.context("Failed to fetch current user")?;
        tracing::info!("Logged in as {}", profile.login);
        Ok(Arc::new(Self { client }))
    }

    /// Head branch of a pull request, or `None` if it doesn't exist.
    pub async fn pull_request_branch(
        &self,
        owner: &str,
        repo: &str,
        number: u64,
    ) -> Result<Option<String>> {
        match self.client.pulls(owner, repo).get(number).await {
            Ok(pull_request) => Ok(Some(pull_request.head.ref_field)),
            Err(octocrab::Error::GitHub { source, .. })
                if matches!(*source, GitHubError { status_code: StatusCode::NOT_FOUND, .. }) =>
            {
                Ok(None)
            }
            Err(e) => Err(e).with_context(|| format!("Failed to fetch {owner}/{repo}#{number}")),
        }
    }
}
