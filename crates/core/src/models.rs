use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use url::Url;

/// Input to a single run. Built once by the trigger layer and never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    pub subscription_id: String,
    pub resource_group: String,
    pub app_name: String,
    pub test_name: String,
    pub test_parameters: String,
    pub detector_name: String,
    #[serde(rename = "gitHubCommentApiUrl")]
    pub comment_api_url: Url,
    pub branch_name: String,
}

/// Handle to a test run the backend accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteJobHandle {
    pub id: String,
    pub status_query_url: Url,
}

/// Lifecycle stage reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum LifecycleStage {
    Pending,
    Running,
    Completed,
    Failed,
    Terminated,
    Other(String),
}

impl LifecycleStage {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Pending => "Pending",
            Self::Running => "Running",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::Terminated => "Terminated",
            Self::Other(value) => value,
        }
    }

    pub fn is_terminal(&self) -> bool { !matches!(self, Self::Pending | Self::Running) }
}

impl From<String> for LifecycleStage {
    fn from(value: String) -> Self {
        match value.as_str() {
            "Pending" => Self::Pending,
            "Running" => Self::Running,
            "Completed" => Self::Completed,
            "Failed" => Self::Failed,
            "Terminated" => Self::Terminated,
            _ => Self::Other(value),
        }
    }
}

impl From<LifecycleStage> for String {
    fn from(value: LifecycleStage) -> Self {
        match value {
            LifecycleStage::Other(value) => value,
            stage => stage.as_str().to_string(),
        }
    }
}

impl fmt::Display for LifecycleStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Status snapshot of a remote test run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStatus {
    #[serde(rename = "runtimeStatus")]
    pub stage: LifecycleStage,
    /// Free-text progress marker. Non-string JSON is kept in its serialized form.
    #[serde(rename = "customStatus", default, deserialize_with = "deserialize_progress")]
    pub progress: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
}

impl RunStatus {
    pub fn new(stage: LifecycleStage) -> Self { Self { stage, progress: None, output: None } }

    pub fn with_progress(mut self, progress: impl Into<String>) -> Self {
        self.progress = Some(progress.into());
        self
    }
}

fn deserialize_progress<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where D: Deserializer<'de> {
    Ok(match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) => Some(s),
        other => Some(other.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_run_request_wire_shape() {
        let request = RunRequest {
            subscription_id: "sub".to_string(),
            resource_group: "rg".to_string(),
            app_name: "apptest-manysequences-1".to_string(),
            test_name: "ManySequences".to_string(),
            test_parameters: "count=100".to_string(),
            detector_name: "detector".to_string(),
            comment_api_url: Url::parse("https://api.github.com/repos/o/r/issues/1/comments")
                .unwrap(),
            branch_name: "main".to_string(),
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(
            value,
            json!({
                "subscriptionId": "sub",
                "resourceGroup": "rg",
                "appName": "apptest-manysequences-1",
                "testName": "ManySequences",
                "testParameters": "count=100",
                "detectorName": "detector",
                "gitHubCommentApiUrl": "https://api.github.com/repos/o/r/issues/1/comments",
                "branchName": "main",
            })
        );
    }

    #[test]
    fn test_lifecycle_stage_parsing() {
        let cases = [
            ("Pending", LifecycleStage::Pending, false),
            ("Running", LifecycleStage::Running, false),
            ("Completed", LifecycleStage::Completed, true),
            ("Failed", LifecycleStage::Failed, true),
            ("Terminated", LifecycleStage::Terminated, true),
            ("ContinuedAsNew", LifecycleStage::Other("ContinuedAsNew".to_string()), true),
        ];
        for (raw, expected, terminal) in cases {
            let stage: LifecycleStage = serde_json::from_value(json!(raw)).unwrap();
            assert_eq!(stage, expected);
            assert_eq!(stage.is_terminal(), terminal);
            assert_eq!(serde_json::to_value(&stage).unwrap(), json!(raw));
        }
    }

    #[test]
    fn test_run_status_progress() {
        let status: RunStatus = serde_json::from_value(json!({
            "name": "ManySequences",
            "runtimeStatus": "Running",
            "customStatus": "running:10%",
            "createdTime": "2026-10-15T10:00:00Z",
        }))
        .unwrap();
        assert_eq!(status, RunStatus::new(LifecycleStage::Running).with_progress("running:10%"));

        let status: RunStatus =
            serde_json::from_value(json!({ "runtimeStatus": "Pending", "customStatus": null }))
                .unwrap();
        assert_eq!(status.progress, None);

        let status: RunStatus = serde_json::from_value(
            json!({ "runtimeStatus": "Running", "customStatus": { "done": 3 } }),
        )
        .unwrap();
        assert_eq!(status.progress.as_deref(), Some(r#"{"done":3}"#));

        let status: RunStatus = serde_json::from_value(json!({ "runtimeStatus": "Completed" }))
            .unwrap();
        assert_eq!(status.progress, None);
    }
}
