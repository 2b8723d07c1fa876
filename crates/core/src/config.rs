use std::path::Path;

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};
use url::Url;

/// Environment variables that override values from the config file.
pub const ENV_BACKEND_URL: &str = "APPTEST_BACKEND_URL";
pub const ENV_BACKEND_API_KEY: &str = "APPTEST_BACKEND_API_KEY";
pub const ENV_GITHUB_TOKEN: &str = "APPTEST_GITHUB_TOKEN";
pub const ENV_NOTIFICATIONS_DISABLED: &str = "APPTEST_NOTIFICATIONS_DISABLED";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub server: ServerConfig,
    pub db: DbConfig,
    #[serde(default)]
    pub github: GitHubConfig,
    #[serde(default)]
    pub notifications: NotificationConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    pub target: TargetConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub workflow: WorkflowConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
}

impl Config {
    /// Load the config file, apply environment overrides and validate the result.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to open config file {}", path.display()))?;
        let mut config = Self::parse(&contents)?;
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn parse(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).context("Failed to parse config file")
    }

    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(url) = var(ENV_BACKEND_URL) {
            self.backend.base_url = url;
        }
        if let Some(key) = var(ENV_BACKEND_API_KEY) {
            self.backend.api_key = key;
        }
        if let Some(token) = var(ENV_GITHUB_TOKEN) {
            self.github.token = token;
        }
        if let Some(value) = var(ENV_NOTIFICATIONS_DISABLED) {
            let disabled = matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes");
            self.notifications.enabled = !disabled;
        }
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            !self.backend.base_url.is_empty(),
            "backend.base_url is not configured (set {ENV_BACKEND_URL})"
        );
        self.backend.base_url()?;
        ensure!(
            !self.backend.api_key.is_empty(),
            "backend.api_key is not configured (set {ENV_BACKEND_API_KEY})"
        );
        ensure!(
            !self.github.token.is_empty(),
            "github.token is not configured (set {ENV_GITHUB_TOKEN})"
        );
        ensure!(!self.target.subscription_id.is_empty(), "target.subscription_id is empty");
        ensure!(!self.target.resource_group.is_empty(), "target.resource_group is empty");
        ensure!(
            self.workflow.start_poll_interval_secs > 0,
            "workflow.start_poll_interval_secs must be greater than 0"
        );
        ensure!(
            self.workflow.run_poll_interval_secs > 0,
            "workflow.run_poll_interval_secs must be greater than 0"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DbConfig {
    /// Run history database.
    pub url: String,
    /// Job queue database.
    pub jobs_url: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GitHubConfig {
    #[serde(default)]
    pub token: String,
    pub webhook_secret: Option<String>,
    #[serde(default = "default_command_prefix")]
    pub command_prefix: String,
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self { token: String::new(), webhook_secret: None, command_prefix: default_command_prefix() }
    }
}

fn default_command_prefix() -> String { "/apptest".to_string() }

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NotificationConfig {
    /// Kill switch: when false, messages are logged instead of posted.
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_banner")]
    pub banner: String,
    #[serde(default = "default_comment_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            banner: default_banner(),
            request_timeout_secs: default_comment_timeout_secs(),
        }
    }
}

fn default_comment_timeout_secs() -> u64 { 30 }

fn default_true() -> bool { true }

fn default_banner() -> String { "**apptest bot**".to_string() }

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendConfig {
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key: String::new(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

fn default_request_timeout_secs() -> u64 { 230 }

impl BackendConfig {
    pub fn base_url(&self) -> Result<Url> {
        Url::parse(&self.base_url)
            .with_context(|| format!("Invalid backend.base_url {:?}", self.base_url))
    }
}

/// Where test apps are created.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TargetConfig {
    pub subscription_id: String,
    pub resource_group: String,
    #[serde(default = "default_app_name_prefix")]
    pub app_name_prefix: String,
}

fn default_app_name_prefix() -> String { "apptest".to_string() }

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AnalysisConfig {
    pub portal_url: Url,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self { portal_url: Url::parse("https://portal.azure.com/").expect("valid portal url") }
    }
}

/// Timing policy of a run. All durations are measured on the run's virtual clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkflowConfig {
    pub start_poll_interval_secs: u64,
    pub start_timeout_secs: u64,
    pub run_poll_interval_secs: u64,
    pub deletion_delay_secs: u64,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            start_poll_interval_secs: 10,
            start_timeout_secs: 5 * 60,
            run_poll_interval_secs: 60,
            deletion_delay_secs: 60 * 60,
        }
    }
}

impl WorkflowConfig {
    pub fn start_poll_interval(&self) -> time::Duration { secs(self.start_poll_interval_secs) }

    pub fn start_timeout(&self) -> time::Duration { secs(self.start_timeout_secs) }

    pub fn run_poll_interval(&self) -> time::Duration { secs(self.run_poll_interval_secs) }

    pub fn deletion_delay(&self) -> time::Duration { secs(self.deletion_delay_secs) }
}

fn secs(value: u64) -> time::Duration { time::Duration::seconds(value.min(i64::MAX as u64) as i64) }

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub run_concurrency: usize,
    pub retry_attempts: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self { Self { run_concurrency: 16, retry_attempts: 3 } }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    const MINIMAL: &str = r#"
server:
  port: 3000
db:
  url: sqlite://history.db
  jobs_url: sqlite://jobs.db
github:
  token: ghp_example
backend:
  base_url: https://backend.example.net
  api_key: secret
target:
  subscription_id: 00000000-0000-0000-0000-000000000000
  resource_group: apptest-rg
"#;

    #[test]
    fn test_parse_defaults() {
        let config = Config::parse(MINIMAL).unwrap();
        config.validate().unwrap();
        assert!(config.notifications.enabled);
        assert_eq!(config.github.command_prefix, "/apptest");
        assert_eq!(config.target.app_name_prefix, "apptest");
        assert_eq!(config.workflow, WorkflowConfig::default());
        assert_eq!(config.workflow.start_timeout(), time::Duration::minutes(5));
        assert_eq!(config.workflow.deletion_delay(), time::Duration::hours(1));
        assert_eq!(config.worker.run_concurrency, 16);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::parse(MINIMAL).unwrap();
        let env = HashMap::from([
            (ENV_BACKEND_URL, "https://other.example.net/"),
            (ENV_BACKEND_API_KEY, "other-key"),
            (ENV_NOTIFICATIONS_DISABLED, "TRUE"),
        ]);
        config.apply_env(|key| env.get(key).map(|v| v.to_string()));
        assert_eq!(config.backend.base_url, "https://other.example.net/");
        assert_eq!(config.backend.api_key, "other-key");
        assert_eq!(config.github.token, "ghp_example");
        assert!(!config.notifications.enabled);
    }

    #[test]
    fn test_missing_backend_is_fatal() {
        let yaml = MINIMAL.replace("  base_url: https://backend.example.net\n", "");
        let config = Config::parse(&yaml).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains(ENV_BACKEND_URL), "{err}");

        let yaml = MINIMAL.replace("base_url: https://backend.example.net", "base_url: not a url");
        assert!(Config::parse(&yaml).unwrap().validate().is_err());

        let yaml = MINIMAL.replace("  api_key: secret\n", "");
        let err = Config::parse(&yaml).unwrap().validate().unwrap_err();
        assert!(err.to_string().contains(ENV_BACKEND_API_KEY), "{err}");
    }

    #[test]
    fn test_zero_poll_interval_is_fatal() {
        let config = Config::parse(&format!("{MINIMAL}workflow:\n  run_poll_interval_secs: 0\n"))
            .unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("run_poll_interval_secs"), "{err}");

        let config =
            Config::parse(&format!("{MINIMAL}workflow:\n  start_poll_interval_secs: 0\n")).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("start_poll_interval_secs"), "{err}");
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yml");
        std::fs::write(&path, MINIMAL).unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.server.port, 3000);
        assert!(Config::load(dir.path().join("missing.yml")).is_err());
    }
}
