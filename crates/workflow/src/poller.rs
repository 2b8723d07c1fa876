use anyhow::{Result, anyhow};
use apptest_backend::{Backend, CallOutcome};
use apptest_core::{
    config::WorkflowConfig,
    models::{LifecycleStage, RemoteJobHandle, RunStatus},
    util::truncate,
};
use async_trait::async_trait;

use crate::durable::RunContext;

pub const GET_STATUS: &str = "GetStatus";

#[derive(Debug, Clone, PartialEq)]
pub enum StartOutcome {
    Started(RunStatus),
    DidNotStart { last: RunStatus },
}

/// Receives each distinct progress marker while a job runs.
#[async_trait]
pub trait ProgressObserver: Send {
    async fn on_progress(&mut self, ctx: &mut RunContext, marker: &str) -> Result<()>;
}

/// Observes a remote job through its status query URL, on the run's virtual clock.
pub struct StatusPoller<'a> {
    backend: &'a dyn Backend,
    config: WorkflowConfig,
}

impl<'a> StatusPoller<'a> {
    pub fn new(backend: &'a dyn Backend, config: WorkflowConfig) -> Self { Self { backend, config } }

    /// A rejected status query is an error like a transport fault; neither is retried.
    async fn fetch(&self, ctx: &mut RunContext, handle: &RemoteJobHandle) -> Result<RunStatus> {
        let backend = self.backend;
        match ctx.call(GET_STATUS, || backend.status(handle)).await? {
            CallOutcome::Success(status) => Ok(status),
            CallOutcome::Failure { status, body } => Err(anyhow!(
                "Status query for job {} returned HTTP {}: {}",
                handle.id,
                status,
                truncate(&body, 500)
            )),
        }
    }

    /// Poll until the job leaves `Pending`, giving up once the start timeout has elapsed.
    pub async fn wait_for_start(
        &self,
        ctx: &mut RunContext,
        handle: &RemoteJobHandle,
    ) -> Result<StartOutcome> {
        let deadline = ctx.now() + self.config.start_timeout();
        loop {
            let status = self.fetch(ctx, handle).await?;
            if status.stage != LifecycleStage::Pending {
                return Ok(StartOutcome::Started(status));
            }
            if ctx.now() >= deadline {
                tracing::warn!(run_id = %ctx.run_id(), "Job {} still pending at deadline", handle.id);
                return Ok(StartOutcome::DidNotStart { last: status });
            }
            ctx.sleep(self.config.start_poll_interval()).await?;
        }
    }

    /// Poll until the job leaves `Running`. There is no overall deadline.
    pub async fn poll_until_terminal(
        &self,
        ctx: &mut RunContext,
        handle: &RemoteJobHandle,
        observer: &mut dyn ProgressObserver,
    ) -> Result<RunStatus> {
        let mut last_progress: Option<String> = None;
        loop {
            let status = self.fetch(ctx, handle).await?;
            if status.progress != last_progress {
                if let Some(marker) = &status.progress {
                    observer.on_progress(ctx, marker).await?;
                }
                last_progress = status.progress.clone();
            }
            if status.stage != LifecycleStage::Running {
                return Ok(status);
            }
            ctx.sleep(self.config.run_poll_interval()).await?;
        }
    }
}
