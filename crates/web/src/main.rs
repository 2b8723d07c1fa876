mod handlers;

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    str::FromStr,
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use apptest_backend::RemoteCallExecutor;
use apptest_core::{catalog::TestCatalog, config::Config};
use apptest_db::Database;
use apptest_github::{GitHub, command::CommandParser, comments::CommentClient};
use apptest_jobs::{JobContext, JobStorage, create_monitor};
use apptest_workflow::{SystemClock, WorkflowController};
use axum::{
    Router,
    extract::{ConnectInfo, FromRef},
    http::{HeaderName, Request, StatusCode, header},
};
use tokio::{net::TcpListener, signal};
use tower::ServiceBuilder;
use tower_http::{
    ServiceBuilderExt,
    normalize_path::NormalizePathLayer,
    timeout::TimeoutLayer,
    trace::{DefaultOnResponse, MakeSpan, TraceLayer},
};
use tracing::{Level, Span};
use tracing_subscriber::{
    EnvFilter, Layer, filter::LevelFilter, layer::SubscriberExt, util::SubscriberInitExt,
};

use crate::handlers::build_router;

const ENV_CONFIG_PATH: &str = "APPTEST_CONFIG";

#[derive(Clone, FromRef)]
pub struct AppState {
    config: Arc<Config>,
    db: Arc<Database>,
    github: Arc<GitHub>,
    jobs: Arc<JobStorage>,
    catalog: Arc<TestCatalog>,
    commands: Arc<CommandParser>,
    comments: Arc<CommentClient>,
}

#[tokio::main]
async fn main() {
    let env_filter = EnvFilter::builder()
        // Default to info level
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(env_filter))
        .init();

    let config_path = std::env::var(ENV_CONFIG_PATH).unwrap_or_else(|_| "config.yml".to_string());
    let config = Arc::new(Config::load(&config_path).expect("Failed to load config"));
    let db = Arc::new(Database::new(&config.db).await.expect("Failed to open database"));
    let github = GitHub::new(&config.github).await.expect("Failed to create GitHub client");
    let jobs = JobStorage::setup(&config.db).await.expect("Failed to set up job storage");
    let catalog = Arc::new(TestCatalog::embedded().expect("Failed to load test catalog"));
    let commands = Arc::new(
        CommandParser::new(&config.github.command_prefix).expect("Failed to create command parser"),
    );
    let comments = Arc::new(
        CommentClient::new(&config.github, &config.notifications)
            .expect("Failed to create comment client"),
    );
    if !config.notifications.enabled {
        tracing::warn!("Notifications disabled, comments will only be logged");
    }
    let backend =
        Arc::new(RemoteCallExecutor::new(&config.backend).expect("Failed to create backend client"));
    tracing::info!("Loaded {} tests, backend {}", catalog.len(), config.backend.base_url);

    let controller = Arc::new(WorkflowController::new(
        backend,
        comments.clone(),
        config.workflow,
        config.analysis.portal_url.clone(),
    ));
    let job_context = JobContext {
        history: db.clone(),
        controller,
        clock: Arc::new(SystemClock),
        retry_attempts: config.worker.retry_attempts,
    };
    let state = AppState {
        config: config.clone(),
        db: db.clone(),
        github,
        jobs,
        catalog,
        commands,
        comments,
    };

    // Create the job monitor
    let monitor = create_monitor(state.jobs.clone(), job_context, &config.worker);

    // Build the router
    let port = state.config.server.port;
    let router = app(state).into_make_service_with_connect_info::<SocketAddr>();

    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    tracing::info!("Web server: Listening on {}", addr);
    let listener = TcpListener::bind(addr).await.expect("bind error");

    // Run both the web server and job monitor concurrently, with graceful shutdown
    let web_server = async {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .context("Web server error");
        tracing::info!("Web server stopped");
        result
    };
    let job_monitor = async {
        let result =
            monitor.run_with_signal(shutdown_signal_io()).await.context("Job monitor error");
        tracing::info!("Job monitor stopped");
        result
    };

    // Wait for both to complete gracefully (early return on error)
    if let Err(e) = tokio::try_join!(web_server, job_monitor) {
        tracing::error!("{e}");
    }

    db.close().await;
    tracing::info!("Shut down gracefully");
}

fn app(state: AppState) -> Router {
    let sensitive_headers: Arc<[_]> = vec![
        header::AUTHORIZATION,
        header::COOKIE,
        HeaderName::from_static("x-hub-signature-256"),
    ]
    .into();
    let middleware = ServiceBuilder::new()
        .sensitive_request_headers(sensitive_headers.clone())
        .sensitive_response_headers(sensitive_headers)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(MyMakeSpan { level: Level::INFO })
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(30),
        ))
        .layer(NormalizePathLayer::trim_trailing_slash())
        .compression();
    build_router().with_state(state).layer(middleware)
}

async fn shutdown_signal() { shutdown_signal_io().await.unwrap() }

/// Shutdown signal that returns io::Result for apalis compatibility.
async fn shutdown_signal_io() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        tokio::select! {
            result = signal::ctrl_c() => result,
            _ = sigterm.recv() => Ok(()),
        }
    }
    #[cfg(not(unix))]
    {
        signal::ctrl_c().await
    }
}

#[derive(Debug, Clone)]
pub struct MyMakeSpan {
    level: Level,
}

impl<B> MakeSpan<B> for MyMakeSpan {
    fn make_span(&mut self, request: &Request<B>) -> Span {
        let forwarded_for = request
            .headers()
            .get("X-Forwarded-For")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.split(',').next())
            .and_then(|s| IpAddr::from_str(s.trim()).ok());
        let ip = forwarded_for.or_else(|| {
            request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(socket_addr)| socket_addr.ip())
        });
        let ip = ip.unwrap_or(IpAddr::from([0, 0, 0, 0]));
        let github_event = request
            .headers()
            .get("X-GitHub-Event")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("-");
        macro_rules! make_span {
            ($level:expr) => {
                tracing::span!(
                    $level,
                    "request",
                    method = %request.method(),
                    uri = %request.uri(),
                    ip = %ip,
                    github_event = %github_event,
                )
            }
        }
        match self.level {
            Level::ERROR => make_span!(Level::ERROR),
            Level::WARN => make_span!(Level::WARN),
            Level::INFO => make_span!(Level::INFO),
            Level::DEBUG => make_span!(Level::DEBUG),
            Level::TRACE => make_span!(Level::TRACE),
        }
    }
}
