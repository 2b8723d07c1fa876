mod jobs;

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use apalis::{
    layers::retry::{
        HasherRng, RetryPolicy,
        backoff::{ExponentialBackoffMaker, MakeBackoff},
    },
    prelude::*,
};
use apalis_codec::json::JsonCodec;
use apalis_sqlite::{CompactType, SqliteStorage, fetcher::SqliteFetcher};
use apptest_core::{
    config::{DbConfig, WorkerConfig},
    history::HistoryStore,
};
use apptest_workflow::{Clock, WorkflowController};
pub use jobs::{ProcessTestRunJob, process_test_run_job};
use sqlx::{Sqlite, migrate::MigrateDatabase, sqlite::SqlitePool};

/// Shared context available to all job handlers.
#[derive(Clone)]
pub struct JobContext {
    pub history: Arc<dyn HistoryStore>,
    pub controller: Arc<WorkflowController>,
    pub clock: Arc<dyn Clock>,
    /// Retries after the first attempt. A run still failing after the last one is abandoned.
    pub retry_attempts: usize,
}

/// Type alias for the default codec used by SqliteStorage.
type DefaultCodec = JsonCodec<CompactType>;

pub type TestRunStorage = SqliteStorage<ProcessTestRunJob, DefaultCodec, SqliteFetcher>;

/// Storage handles for pushing jobs from request handlers.
#[derive(Clone)]
pub struct JobStorage {
    test_run: TestRunStorage,
}

impl JobStorage {
    /// Set up job storage tables and create storage instances.
    pub async fn setup(db: &DbConfig) -> Result<Arc<Self>> {
        if !Sqlite::database_exists(&db.jobs_url).await.unwrap_or(false) {
            tracing::info!(url = %db.jobs_url, "Creating database");
            Sqlite::create_database(&db.jobs_url).await.context("Failed to create database")?;
            tracing::info!("Database created");
        }
        let pool =
            SqlitePool::connect(&db.jobs_url).await.context("Failed to connect to database")?;
        SqliteStorage::setup(&pool).await?;
        Ok(Arc::new(Self { test_run: create_storage(&pool) }))
    }

    /// Get a clone of the test run storage for pushing jobs.
    pub fn test_run(&self) -> TestRunStorage { self.test_run.clone() }
}

fn create_storage<T>(pool: &SqlitePool) -> SqliteStorage<T, DefaultCodec, SqliteFetcher> {
    let config = apalis_sqlite::Config::new(std::any::type_name::<T>()).with_poll_interval(
        StrategyBuilder::new()
            .apply(
                IntervalStrategy::new(Duration::from_millis(250))
                    .with_backoff(BackoffConfig::new(Duration::from_secs(2))),
            )
            .build(),
    );
    SqliteStorage::new_with_config(pool, &config)
}

/// Create the job monitor with the test run worker.
///
/// A retried run resumes from its recorded history, so retries never repeat a remote call.
pub fn create_monitor(
    storage: Arc<JobStorage>,
    context: JobContext,
    config: &WorkerConfig,
) -> Monitor {
    let &WorkerConfig { run_concurrency, retry_attempts } = config;

    let backoff = ExponentialBackoffMaker::new(
        Duration::from_secs(5),
        Duration::from_secs(300),
        1.5,
        HasherRng::default(),
    )
    .unwrap()
    .make_backoff();
    let retry_policy = RetryPolicy::retries(retry_attempts).with_backoff(backoff);

    Monitor::new()
        .register(move |_| {
            WorkerBuilder::new("test-run-worker")
                .backend(storage.test_run.clone())
                .retry(retry_policy.clone())
                .enable_tracing()
                .catch_panic()
                .concurrency(run_concurrency)
                .data(context.clone())
                .build(process_test_run_job)
        })
        .shutdown_timeout(Duration::from_secs(30))
}
