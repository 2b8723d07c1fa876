//! The run state machine.
//!
//! ```text
//! Provisioning -> Deploying -> AwaitingStart -> Monitoring -> Reporting -> Cleanup -> Done
//!      |              |              |               |            |
//!      +-> Done       +--------------+---------------+------------+-> Cleanup
//! ```
//!
//! Once the app exists, every failure edge leads to `Cleanup`, which runs exactly once.

use std::sync::Arc;

use anyhow::{Context, Result};
use apptest_backend::{Backend, CallOutcome};
use apptest_core::{
    config::WorkflowConfig,
    models::{RemoteJobHandle, RunRequest, RunStatus},
};
use apptest_github::comments::Notifier;
use async_trait::async_trait;
use url::Url;

use crate::{
    durable::{RunContext, is_history_error},
    messages,
    poller::{ProgressObserver, StartOutcome, StatusPoller},
};

pub const CREATE_APP: &str = "CreateNewFunctionApp";
pub const DEPLOY: &str = "DeployToFunctionApp";
pub const DELETE_APP: &str = "DeleteFunctionApp";
pub const POST_COMMENT: &str = "PostComment";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Provisioning,
    Deploying,
    AwaitingStart,
    Monitoring,
    Reporting,
    Cleanup,
    Done,
}

/// How a stage ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Succeeded,
    /// The stage reported a failure to the audience.
    Failed,
    /// The stage returned an unexpected error.
    Faulted,
}

impl Stage {
    pub fn next(self, transition: Transition) -> Stage {
        use Stage::*;
        use Transition::*;
        match (self, transition) {
            (Provisioning, Succeeded) => Deploying,
            // Nothing to clean up.
            (Provisioning, Failed | Faulted) => Done,
            (Deploying, Succeeded) => AwaitingStart,
            (AwaitingStart, Succeeded) => Monitoring,
            // Any terminal stage of the job is a result to report.
            (Monitoring, Succeeded | Failed) => Reporting,
            (Reporting, Succeeded | Failed) => Cleanup,
            (Deploying | AwaitingStart | Monitoring | Reporting, _) => Cleanup,
            (Cleanup | Done, _) => Done,
        }
    }
}

/// Why a run ended in error. These are final and not worth retrying.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("creating app {app} was rejected with HTTP {status}")]
    Provisioning { app: String, status: u16 },
    #[error("deploying {branch} to app {app} was rejected with HTTP {status}")]
    Deployment { app: String, branch: String, status: u16 },
    #[error("deployment to app {app} returned no usable status query URL")]
    MissingStatusUrl { app: String },
    #[error("test {test} did not start within {timeout}")]
    StartTimeout { test: String, timeout: time::Duration },
    #[error("deleting app {app} was rejected with HTTP {status}")]
    Teardown { app: String, status: u16 },
    #[error("unexpected failure: {0:#}")]
    Unexpected(anyhow::Error),
    #[error("{}", join_errors(.0))]
    Multiple(Vec<RunError>),
}

fn join_errors(errors: &[RunError]) -> String {
    errors.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub app_name: String,
    pub outcome: Option<RunStatus>,
    pub app_deleted: bool,
}

pub struct WorkflowController {
    backend: Arc<dyn Backend>,
    notifier: Arc<dyn Notifier>,
    config: WorkflowConfig,
    portal_url: Url,
}

impl WorkflowController {
    pub fn new(
        backend: Arc<dyn Backend>,
        notifier: Arc<dyn Notifier>,
        config: WorkflowConfig,
        portal_url: Url,
    ) -> Self {
        Self { backend, notifier, config, portal_url }
    }

    /// Drive `request` to completion on `ctx`.
    ///
    /// Run failures are reported to the audience and returned as [`RunError`]. A
    /// [`HistoryError`](apptest_core::history::HistoryError) aborts the run on the spot; the run
    /// can be resumed by executing it again against the same history.
    pub async fn run(&self, ctx: &mut RunContext, request: &RunRequest) -> Result<RunSummary> {
        let mut run = Run {
            controller: self,
            request,
            handle: None,
            outcome: None,
            app_deleted: false,
            errors: Vec::new(),
        };
        let mut stage = Stage::Provisioning;
        while stage != Stage::Done {
            tracing::debug!(
                run_id = %ctx.run_id(),
                ?stage,
                replaying = ctx.is_replaying(),
                "Entering stage"
            );
            let transition = match run.step(ctx, stage).await {
                Ok(transition) => transition,
                Err(e) if is_history_error(&e) => return Err(e),
                Err(e) => {
                    run.fault(ctx, stage, e).await?;
                    Transition::Faulted
                }
            };
            stage = stage.next(transition);
        }
        run.finish()
    }

    /// Give up on a run that cannot make progress, typically because its history can't be
    /// written. Bypasses the history: the app is deleted and the audience told directly, both on a
    /// best-effort basis.
    pub async fn abandon(&self, request: &RunRequest, error: &anyhow::Error) {
        tracing::error!(app = %request.app_name, "Abandoning test run: {:#}", error);
        let app_deleted = match self.backend.delete_app(request).await {
            Ok(CallOutcome::Success(())) => true,
            Ok(CallOutcome::Failure { status, .. }) => {
                tracing::error!(app = %request.app_name, "Deleting abandoned app returned {}", status);
                false
            }
            Err(e) => {
                tracing::error!(app = %request.app_name, "Failed to delete abandoned app: {:#}", e);
                false
            }
        };
        let message = messages::abandoned(request, error, app_deleted);
        if let Err(e) = self.notifier.post(&request.comment_api_url, &message).await {
            tracing::error!(app = %request.app_name, "Failed to report abandoned run: {:#}", e);
        }
    }

    fn poller(&self) -> StatusPoller<'_> { StatusPoller::new(self.backend.as_ref(), self.config) }
}

async fn post(
    ctx: &mut RunContext,
    notifier: &dyn Notifier,
    target: &Url,
    message: &str,
) -> Result<()> {
    ctx.call(POST_COMMENT, || notifier.post(target, message)).await
}

struct ProgressNotifier<'a> {
    notifier: &'a dyn Notifier,
    target: &'a Url,
}

#[async_trait]
impl ProgressObserver for ProgressNotifier<'_> {
    async fn on_progress(&mut self, ctx: &mut RunContext, marker: &str) -> Result<()> {
        post(ctx, self.notifier, self.target, &messages::progress(marker)).await
    }
}

struct Run<'a> {
    controller: &'a WorkflowController,
    request: &'a RunRequest,
    handle: Option<RemoteJobHandle>,
    outcome: Option<RunStatus>,
    app_deleted: bool,
    errors: Vec<RunError>,
}

impl Run<'_> {
    async fn step(&mut self, ctx: &mut RunContext, stage: Stage) -> Result<Transition> {
        match stage {
            Stage::Provisioning => self.provision(ctx).await,
            Stage::Deploying => self.deploy(ctx).await,
            Stage::AwaitingStart => self.await_start(ctx).await,
            Stage::Monitoring => self.monitor(ctx).await,
            Stage::Reporting => self.report(ctx).await,
            Stage::Cleanup => self.cleanup(ctx).await,
            Stage::Done => Ok(Transition::Succeeded),
        }
    }

    async fn provision(&mut self, ctx: &mut RunContext) -> Result<Transition> {
        let backend = self.controller.backend.clone();
        let request = self.request;
        match ctx.call(CREATE_APP, || backend.create_app(request)).await? {
            CallOutcome::Success(()) => {
                tracing::info!(run_id = %ctx.run_id(), app = %request.app_name, "Created test app");
                Ok(Transition::Succeeded)
            }
            CallOutcome::Failure { status, body } => {
                let error = RunError::Provisioning { app: request.app_name.clone(), status };
                self.fail(ctx, error, &messages::provisioning_failed(request, status, &body)).await?;
                Ok(Transition::Failed)
            }
        }
    }

    async fn deploy(&mut self, ctx: &mut RunContext) -> Result<Transition> {
        let backend = self.controller.backend.clone();
        let request = self.request;
        self.notify(ctx, &messages::deploying(request)).await?;
        let response = match ctx.call(DEPLOY, || backend.deploy(request)).await? {
            CallOutcome::Success(response) => response,
            CallOutcome::Failure { status, body } => {
                let error = RunError::Deployment {
                    app: request.app_name.clone(),
                    branch: request.branch_name.clone(),
                    status,
                };
                self.fail(ctx, error, &messages::deployment_failed(request, status, &body)).await?;
                return Ok(Transition::Failed);
            }
        };
        let Some(handle) = response.handle() else {
            let error = RunError::MissingStatusUrl { app: request.app_name.clone() };
            self.fail(ctx, error, &messages::missing_status_url(request)).await?;
            return Ok(Transition::Failed);
        };
        tracing::info!(
            run_id = %ctx.run_id(),
            app = %request.app_name,
            "Deployed {}, job {}",
            request.branch_name,
            handle.id
        );
        self.handle = Some(handle);
        Ok(Transition::Succeeded)
    }

    async fn await_start(&mut self, ctx: &mut RunContext) -> Result<Transition> {
        let controller = self.controller;
        let request = self.request;
        let handle = self.handle.clone().context("No job handle after deployment")?;
        match controller.poller().wait_for_start(ctx, &handle).await? {
            StartOutcome::Started(status) => {
                self.notify(ctx, &messages::started(request, &status)).await?;
                Ok(Transition::Succeeded)
            }
            StartOutcome::DidNotStart { .. } => {
                let timeout = controller.config.start_timeout();
                let error = RunError::StartTimeout { test: request.test_name.clone(), timeout };
                self.fail(ctx, error, &messages::start_timeout(request, timeout)).await?;
                Ok(Transition::Failed)
            }
        }
    }

    async fn monitor(&mut self, ctx: &mut RunContext) -> Result<Transition> {
        let controller = self.controller;
        let request = self.request;
        let handle = self.handle.clone().context("No job handle after deployment")?;
        let mut observer = ProgressNotifier {
            notifier: controller.notifier.as_ref(),
            target: &request.comment_api_url,
        };
        let status = controller.poller().poll_until_terminal(ctx, &handle, &mut observer).await?;
        tracing::info!(run_id = %ctx.run_id(), "Job {} ended with {}", handle.id, status.stage);
        self.outcome = Some(status);
        Ok(Transition::Succeeded)
    }

    async fn report(&mut self, ctx: &mut RunContext) -> Result<Transition> {
        let controller = self.controller;
        let request = self.request;
        let status = self.outcome.clone().context("No terminal status to report")?;
        let end = ctx.now();
        let deletion_at = end + controller.config.deletion_delay();
        let link = messages::analysis_link(&controller.portal_url, request, ctx.started_at(), end);
        self.notify(ctx, &messages::report(request, &status, &link, deletion_at)).await?;
        tracing::info!(run_id = %ctx.run_id(), app = %request.app_name, "Deleting at {}", deletion_at);
        ctx.sleep_until(deletion_at).await?;
        Ok(Transition::Succeeded)
    }

    async fn cleanup(&mut self, ctx: &mut RunContext) -> Result<Transition> {
        let backend = self.controller.backend.clone();
        let request = self.request;
        match ctx.call(DELETE_APP, || backend.delete_app(request)).await? {
            CallOutcome::Success(()) => {
                self.app_deleted = true;
                tracing::info!(run_id = %ctx.run_id(), app = %request.app_name, "Deleted test app");
                self.notify(ctx, &messages::deleted(request)).await?;
                Ok(Transition::Succeeded)
            }
            CallOutcome::Failure { status, body } => {
                let error = RunError::Teardown { app: request.app_name.clone(), status };
                self.fail(ctx, error, &messages::deletion_failed(request, status, &body)).await?;
                Ok(Transition::Failed)
            }
        }
    }

    async fn notify(&self, ctx: &mut RunContext, message: &str) -> Result<()> {
        post(ctx, self.controller.notifier.as_ref(), &self.request.comment_api_url, message).await
    }

    /// Record a run failure and tell the audience about it.
    async fn fail(&mut self, ctx: &mut RunContext, error: RunError, message: &str) -> Result<()> {
        tracing::warn!(run_id = %ctx.run_id(), app = %self.request.app_name, "{}", error);
        self.errors.push(error);
        self.notify_failure(ctx, message).await
    }

    async fn fault(&mut self, ctx: &mut RunContext, stage: Stage, error: anyhow::Error) -> Result<()> {
        tracing::error!(
            run_id = %ctx.run_id(),
            app = %self.request.app_name,
            ?stage,
            "Unexpected failure: {:#}",
            error
        );
        let message = match stage {
            Stage::Provisioning => messages::unexpected_provisioning_failure(self.request, &error),
            Stage::Cleanup => messages::unexpected_cleanup_failure(self.request, &error),
            _ => messages::unexpected_failure(&error),
        };
        self.errors.push(RunError::Unexpected(error));
        self.notify_failure(ctx, &message).await
    }

    /// A failed failure notification is added to the run's errors. Only history errors escape.
    async fn notify_failure(&mut self, ctx: &mut RunContext, message: &str) -> Result<()> {
        match self.notify(ctx, message).await {
            Err(e) if !is_history_error(&e) => {
                tracing::error!(run_id = %ctx.run_id(), "Failed to post failure notification: {:#}", e);
                self.errors.push(RunError::Unexpected(e.context("Failed to post failure notification")));
                Ok(())
            }
            result => result,
        }
    }

    fn finish(mut self) -> Result<RunSummary> {
        match self.errors.len() {
            0 => Ok(RunSummary {
                app_name: self.request.app_name.clone(),
                outcome: self.outcome,
                app_deleted: self.app_deleted,
            }),
            1 => Err(self.errors.remove(0).into()),
            _ => Err(RunError::Multiple(self.errors).into()),
        }
    }
}
