//! In-process collaborators for controller and poller tests.

use std::{
    collections::VecDeque,
    sync::{
        Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use anyhow::{Result, anyhow, bail};
use apptest_backend::{Backend, CallOutcome, DeployResponse};
use apptest_core::models::{LifecycleStage, RemoteJobHandle, RunRequest, RunStatus};
use apptest_github::comments::Notifier;
use async_trait::async_trait;
use url::Url;

pub fn request() -> RunRequest {
    RunRequest {
        subscription_id: "sub-1".to_string(),
        resource_group: "rg-1".to_string(),
        app_name: "apptest-manysequences-7".to_string(),
        test_name: "ManySequences".to_string(),
        test_parameters: "count=5000".to_string(),
        detector_name: "ManySequencesAnalysis".to_string(),
        comment_api_url: Url::parse("https://api.github.com/repos/o/r/issues/1/comments").unwrap(),
        branch_name: "main".to_string(),
    }
}

pub fn status(stage: LifecycleStage, progress: Option<&str>) -> StatusReply {
    let mut status = RunStatus::new(stage);
    status.progress = progress.map(str::to_string);
    StatusReply::Status(status)
}

pub fn accepted() -> CallOutcome<DeployResponse> {
    CallOutcome::Success(DeployResponse {
        id: Some("job-1".to_string()),
        status_query_get_uri: Some("https://backend.test/runtime/job-1".to_string()),
    })
}

pub fn rejected<T>(status: u16) -> CallOutcome<T> {
    CallOutcome::Failure { status, body: format!("rejected with {status}") }
}

#[derive(Debug, Clone)]
pub enum StatusReply {
    Status(RunStatus),
    Rejected(u16),
    Fault,
}

/// Scripted backend. Status replies are consumed in order; the last one repeats.
pub struct FakeBackend {
    pub create: CallOutcome<()>,
    pub deploy: CallOutcome<DeployResponse>,
    pub delete: CallOutcome<()>,
    pub create_fault: bool,
    statuses: Mutex<VecDeque<StatusReply>>,
    /// While set, status queries never complete.
    pub hang_status: AtomicBool,
    pub creates: AtomicUsize,
    pub deploys: AtomicUsize,
    pub deletes: AtomicUsize,
    pub status_queries: AtomicUsize,
}

impl FakeBackend {
    pub fn new(statuses: impl IntoIterator<Item = StatusReply>) -> Self {
        Self {
            create: CallOutcome::Success(()),
            deploy: accepted(),
            delete: CallOutcome::Success(()),
            create_fault: false,
            statuses: Mutex::new(statuses.into_iter().collect()),
            hang_status: AtomicBool::new(false),
            creates: AtomicUsize::new(0),
            deploys: AtomicUsize::new(0),
            deletes: AtomicUsize::new(0),
            status_queries: AtomicUsize::new(0),
        }
    }

    pub fn count(counter: &AtomicUsize) -> usize { counter.load(Ordering::SeqCst) }

    fn next_status(&self) -> Result<StatusReply> {
        let mut statuses = self.statuses.lock().map_err(|_| anyhow!("poisoned"))?;
        match statuses.len() {
            0 => bail!("no status scripted"),
            1 => Ok(statuses[0].clone()),
            _ => statuses.pop_front().ok_or_else(|| anyhow!("no status scripted")),
        }
    }
}

#[async_trait]
impl Backend for FakeBackend {
    async fn create_app(&self, _request: &RunRequest) -> Result<CallOutcome<()>> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        if self.create_fault {
            bail!("connection refused");
        }
        Ok(self.create.clone())
    }

    async fn deploy(&self, _request: &RunRequest) -> Result<CallOutcome<DeployResponse>> {
        self.deploys.fetch_add(1, Ordering::SeqCst);
        Ok(self.deploy.clone())
    }

    async fn delete_app(&self, _request: &RunRequest) -> Result<CallOutcome<()>> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        Ok(self.delete.clone())
    }

    async fn status(&self, handle: &RemoteJobHandle) -> Result<CallOutcome<RunStatus>> {
        if self.hang_status.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.status_queries.fetch_add(1, Ordering::SeqCst);
        assert_eq!(handle.id, "job-1");
        match self.next_status()? {
            StatusReply::Status(status) => Ok(CallOutcome::Success(status)),
            StatusReply::Rejected(code) => Ok(rejected(code)),
            StatusReply::Fault => bail!("connection reset by peer"),
        }
    }
}

/// Records every message. Fails every post while `failing` is set.
#[derive(Default)]
pub struct RecordingNotifier {
    messages: Mutex<Vec<String>>,
    pub failing: AtomicBool,
}

impl RecordingNotifier {
    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().map(|m| m.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn post(&self, _target: &Url, message: &str) -> Result<()> {
        self.messages.lock().map_err(|_| anyhow!("poisoned"))?.push(message.to_string());
        if self.failing.load(Ordering::SeqCst) {
            bail!("comment rejected with 403");
        }
        Ok(())
    }
}
