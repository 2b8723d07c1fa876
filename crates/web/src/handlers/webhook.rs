use anyhow::Context;
use apalis::prelude::TaskSink;
use apptest_core::{
    AppError,
    catalog::{TestCatalog, TestMetadata},
    config::Config,
    models::RunRequest,
    util::app_name,
};
use apptest_github::{
    command::{Command, CommandParser, catalog_table},
    comments::Notifier,
    webhook::GitHubEvent,
};
use apptest_jobs::ProcessTestRunJob;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use octocrab::models::webhook_events::{
    WebhookEventPayload, payload::IssueCommentWebhookEventAction,
};
use url::Url;

use crate::AppState;

/// What to do about a command.
#[derive(Debug, Clone, PartialEq)]
enum Action {
    Reply(String),
    Run { test: TestMetadata, parameters: String },
}

/// Webhook handler that turns comment commands into queued test runs.
pub async fn webhook(
    State(state): State<AppState>,
    GitHubEvent { event }: GitHubEvent,
) -> Result<Response, AppError> {
    let WebhookEventPayload::IssueComment(inner) = &event.specific else {
        tracing::debug!("Ignoring webhook event {:?}", event.kind);
        return Ok((StatusCode::OK, "Event ignored").into_response());
    };
    if inner.action != IssueCommentWebhookEventAction::Created {
        return Ok((StatusCode::OK, "Event ignored").into_response());
    }
    if inner.comment.user.r#type == "Bot" {
        return Ok((StatusCode::OK, "Bot comment ignored").into_response());
    }
    let Some(command) = state.commands.parse(inner.comment.body.as_deref().unwrap_or_default())
    else {
        return Ok((StatusCode::OK, "No command").into_response());
    };
    let Some(repository) = &event.repository else {
        tracing::warn!("Received comment command without repository");
        return Ok((StatusCode::OK, "No repository").into_response());
    };
    let issue = &inner.issue;
    let comment_id = inner.comment.id.0;
    tracing::info!(
        "Received {:?} from @{} on {}#{}",
        command,
        inner.comment.user.login,
        repository.full_name.as_deref().unwrap_or(&repository.name),
        issue.number
    );

    let (test, parameters) = match resolve(command, &state.catalog, &state.commands) {
        Action::Reply(message) => {
            state
                .comments
                .post(&issue.comments_url, &message)
                .await
                .context("Failed to reply to command")?;
            return Ok((StatusCode::OK, "Replied").into_response());
        }
        Action::Run { test, parameters } => (test, parameters),
    };

    let mut branch = None;
    if issue.pull_request.is_some() {
        if let Some(owner) = &repository.owner {
            branch = state
                .github
                .pull_request_branch(&owner.login, &repository.name, issue.number)
                .await?;
        }
    }
    let branch = branch
        .or_else(|| repository.default_branch.clone())
        .unwrap_or_else(|| "main".to_string());

    let request = run_request(
        &state.config,
        &test,
        parameters,
        comment_id,
        issue.comments_url.clone(),
        branch,
    );
    let run_id = format!("{}-{}", repository.id.0, comment_id);
    tracing::info!(
        run_id = %run_id,
        app = %request.app_name,
        "Queueing test {} on branch {}",
        request.test_name,
        request.branch_name
    );
    let message = format!(
        "Queued test `{}` on branch `{}` with parameters `{}`. Test app: `{}`.",
        request.test_name, request.branch_name, request.test_parameters, request.app_name
    );
    // Redelivered webhooks map to the same run id and are queued only once.
    if !state.db.register_run(&run_id, &request.app_name).await? {
        tracing::info!(run_id = %run_id, "Run already queued, ignoring redelivery");
        return Ok((StatusCode::OK, "Already queued").into_response());
    }
    let mut storage = state.jobs.test_run();
    let pushed = storage
        .push(ProcessTestRunJob { run_id: run_id.clone(), request })
        .await
        .context("Failed to enqueue test run job");
    if let Err(e) = pushed {
        state.db.unregister_run(&run_id).await?;
        return Err(e.into());
    }
    // The run is queued either way; a lost acknowledgement is only logged.
    if let Err(e) = state.comments.post(&issue.comments_url, &message).await {
        tracing::warn!("Failed to acknowledge command: {e:#}");
    }
    Ok((StatusCode::ACCEPTED, "Queued").into_response())
}

fn resolve(command: Command, catalog: &TestCatalog, commands: &CommandParser) -> Action {
    match command {
        Command::Help => Action::Reply(commands.usage()),
        Command::List => Action::Reply(format!("Available tests:\n\n{}", catalog_table(catalog))),
        Command::Run { test, parameters } => match catalog.resolve(&test) {
            None => Action::Reply(format!(
                "Unknown test `{}`. Available tests:\n\n{}",
                test,
                catalog_table(catalog)
            )),
            Some(metadata) if !metadata.enabled => {
                Action::Reply(format!("Test `{}` is disabled.", metadata.name))
            }
            Some(metadata) => Action::Run {
                test: metadata.clone(),
                parameters: parameters.unwrap_or_else(|| metadata.default_parameters.clone()),
            },
        },
    }
}

fn run_request(
    config: &Config,
    test: &TestMetadata,
    parameters: String,
    comment_id: u64,
    comment_api_url: Url,
    branch_name: String,
) -> RunRequest {
    RunRequest {
        subscription_id: config.target.subscription_id.clone(),
        resource_group: config.target.resource_group.clone(),
        app_name: app_name(&config.target.app_name_prefix, &test.name, &comment_id.to_string()),
        test_name: test.name.clone(),
        test_parameters: parameters,
        detector_name: test.detector.clone(),
        comment_api_url,
        branch_name,
    }
}
