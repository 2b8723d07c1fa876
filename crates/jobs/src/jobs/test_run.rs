use anyhow::Result;
use apalis::prelude::*;
use apptest_core::models::RunRequest;
use apptest_workflow::{RunContext, RunError};
use serde::{Deserialize, Serialize};
use tracing::Instrument;

use crate::JobContext;

/// Job to run one requested test from provisioning to teardown.
///
/// The run id keys the run's history. Executing the same job again resumes the run instead of
/// starting a new one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessTestRunJob {
    pub run_id: String,
    pub request: RunRequest,
}

pub async fn process_test_run_job(
    job: ProcessTestRunJob,
    ctx: Data<JobContext>,
    attempt: Attempt,
) -> Result<()> {
    execute(&job, &ctx, attempt.current()).await
}

/// Run failures are final and already reported to the requester, so only infrastructure
/// errors are returned for a retry. Once `attempt` (counted from 1) exceeds the configured
/// retries, the run is abandoned.
async fn execute(job: &ProcessTestRunJob, ctx: &JobContext, attempt: usize) -> Result<()> {
    let span = tracing::info_span!(
        "test_run",
        run_id = %job.run_id,
        app = %job.request.app_name,
        attempt
    );
    async move {
        let result = run(job, ctx).await;
        if let Err(e) = &result
            && attempt > ctx.retry_attempts
        {
            ctx.controller.abandon(&job.request, e).await;
        }
        result
    }
    .instrument(span)
    .await
}

async fn run(job: &ProcessTestRunJob, ctx: &JobContext) -> Result<()> {
    tracing::info!(
        "Processing test run: test={} branch={} parameters={:?}",
        job.request.test_name,
        job.request.branch_name,
        job.request.test_parameters
    );
    let mut run =
        RunContext::start(job.run_id.as_str(), ctx.history.clone(), ctx.clock.clone()).await?;
    match ctx.controller.run(&mut run, &job.request).await {
        Ok(summary) => {
            let stage = summary.outcome.as_ref().map(|s| s.stage.to_string());
            tracing::info!(
                "Test run finished: outcome={} deleted={}",
                stage.as_deref().unwrap_or("none"),
                summary.app_deleted
            );
            Ok(())
        }
        Err(e) => match e.downcast_ref::<RunError>() {
            Some(error) => {
                tracing::warn!("Test run failed: {}", error);
                Ok(())
            }
            None => {
                tracing::error!("Test run interrupted at position {}: {:#}", run.position(), e);
                Err(e)
            }
        },
    }
}
