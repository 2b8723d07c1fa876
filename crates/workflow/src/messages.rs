//! Notification texts posted while a run progresses.

use apptest_core::{
    models::{LifecycleStage, RunRequest, RunStatus},
    util::truncate,
};
use time::{OffsetDateTime, UtcOffset, format_description::BorrowedFormatItem, macros::format_description};
use url::Url;

const BODY_LIMIT: usize = 1000;

const DISPLAY_TIME: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute] UTC");
const LINK_TIME: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day]T[hour]:[minute]");

fn format_time(t: OffsetDateTime, format: &[BorrowedFormatItem<'_>]) -> String {
    let t = t.to_offset(UtcOffset::UTC);
    t.format(format).unwrap_or_else(|_| t.to_string())
}

pub fn deploying(request: &RunRequest) -> String {
    format!(
        "Created test app `{}`. Deploying branch `{}` and starting test `{}`...",
        request.app_name, request.branch_name, request.test_name
    )
}

pub fn provisioning_failed(request: &RunRequest, status: u16, body: &str) -> String {
    format!(
        "Failed to create test app `{}` (HTTP {}):\n```\n{}\n```",
        request.app_name,
        status,
        truncate(body, BODY_LIMIT)
    )
}

pub fn deployment_failed(request: &RunRequest, status: u16, body: &str) -> String {
    format!(
        "Failed to deploy branch `{}` to test app `{}` (HTTP {}), test app will be deleted:\n```\n{}\n```",
        request.branch_name,
        request.app_name,
        status,
        truncate(body, BODY_LIMIT)
    )
}

pub fn missing_status_url(request: &RunRequest) -> String {
    format!(
        "Deployment to test app `{}` returned no usable status URL, test app will be deleted.",
        request.app_name
    )
}

pub fn started(request: &RunRequest, status: &RunStatus) -> String {
    format!("Test `{}` started, status: {}.", request.test_name, status.stage)
}

pub fn start_timeout(request: &RunRequest, timeout: time::Duration) -> String {
    format!(
        "Test `{}` did not start within {} minutes, test app will be deleted.",
        request.test_name,
        timeout.whole_minutes()
    )
}

pub fn progress(marker: &str) -> String { format!("Progress: {marker}") }

/// Summary line for a terminal stage.
pub fn outcome(request: &RunRequest, stage: &LifecycleStage) -> String {
    let test = &request.test_name;
    match stage {
        LifecycleStage::Completed => format!("Test `{test}` completed successfully."),
        LifecycleStage::Failed => format!("Test `{test}` failed."),
        LifecycleStage::Terminated => format!("Test `{test}` was terminated or timed out."),
        other => format!("Test `{test}` stopped unexpectedly, stage={other}."),
    }
}

/// Deep link into the portal's analysis view of the app, covering `[start, end]`.
pub fn analysis_link(
    portal: &Url,
    request: &RunRequest,
    start: OffsetDateTime,
    end: OffsetDateTime,
) -> Url {
    let mut url = portal.clone();
    url.query_pairs_mut().append_pair(
        "websitesextension_ext",
        &format!("asd.featurePath=detectors/{}", request.detector_name),
    );
    url.set_fragment(Some(&format!(
        "resource/subscriptions/{}/resourceGroups/{}/providers/Microsoft.Web/sites/{}/troubleshoot?startTime={}&endTime={}",
        request.subscription_id,
        request.resource_group,
        request.app_name,
        format_time(start, LINK_TIME),
        format_time(end, LINK_TIME),
    )));
    url
}

pub fn report(
    request: &RunRequest,
    status: &RunStatus,
    analysis: &Url,
    deletion_at: OffsetDateTime,
) -> String {
    let mut message = outcome(request, &status.stage);
    if let Some(output) = &status.output {
        message.push_str(&format!(
            "\n\nOutput:\n```\n{}\n```",
            truncate(&output.to_string(), BODY_LIMIT)
        ));
    }
    message.push_str(&format!(
        "\n\n[Analysis]({analysis})\n\nTest app `{}` will be deleted at {}.",
        request.app_name,
        format_time(deletion_at, DISPLAY_TIME)
    ));
    message
}

pub fn deleted(request: &RunRequest) -> String {
    format!("Deleted test app `{}`.", request.app_name)
}

pub fn deletion_failed(request: &RunRequest, status: u16, body: &str) -> String {
    format!(
        "Failed to delete test app `{}` (HTTP {}), it must be deleted manually:\n```\n{}\n```",
        request.app_name,
        status,
        truncate(body, BODY_LIMIT)
    )
}

pub fn unexpected_failure(error: &anyhow::Error) -> String {
    format!("Unexpected failure, test app will be deleted: {error:#}")
}

pub fn unexpected_provisioning_failure(request: &RunRequest, error: &anyhow::Error) -> String {
    format!("Unexpected failure while creating test app `{}`: {error:#}", request.app_name)
}

pub fn unexpected_cleanup_failure(request: &RunRequest, error: &anyhow::Error) -> String {
    format!(
        "Unexpected failure while deleting test app `{}`, it may need to be deleted manually: {error:#}",
        request.app_name
    )
}

/// The run gave up without going through its own cleanup.
pub fn abandoned(request: &RunRequest, error: &anyhow::Error, app_deleted: bool) -> String {
    let cleanup = if app_deleted {
        format!("Test app `{}` was deleted.", request.app_name)
    } else {
        format!("Test app `{}` may still exist and must be deleted manually.", request.app_name)
    };
    format!(
        "Test `{}` was abandoned after repeated failures: {error:#}\n\n{cleanup}",
        request.test_name
    )
}
