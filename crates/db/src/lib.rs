use anyhow::{Context, Result, anyhow};
use apptest_core::{
    config::DbConfig,
    history::{HistoryError, HistoryEvent, HistoryStore},
};
use async_trait::async_trait;
use serde::Serialize;
use sqlx::{Pool, Row, Sqlite, SqlitePool, migrate::MigrateDatabase};
use time::OffsetDateTime;

#[derive(Clone)]
pub struct Database {
    pub pool: Pool<Sqlite>,
}

/// A recorded history event with its storage metadata.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryEntry {
    pub sequence: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
    pub event: HistoryEvent,
}

impl Database {
    pub async fn new(config: &DbConfig) -> Result<Self> {
        if !Sqlite::database_exists(&config.url).await.unwrap_or(false) {
            tracing::info!(url = %config.url, "Creating database");
            Sqlite::create_database(&config.url).await.context("Failed to create database")?;
            tracing::info!("Database created");
        }
        let pool =
            SqlitePool::connect(&config.url).await.context("Failed to connect to database")?;
        sqlx::migrate!("../../migrations")
            .run(&pool)
            .await
            .context("Failed to run database migrations")?;
        Ok(Self { pool })
    }

    pub async fn close(&self) { self.pool.close().await }

    /// Record that a run was queued. Returns false if the run id was queued before.
    pub async fn register_run(&self, run_id: &str, app_name: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO runs (run_id, app_name, queued_at)
            VALUES (?, ?, ?)
            ON CONFLICT (run_id) DO NOTHING
            "#,
        )
        .bind(run_id)
        .bind(app_name)
        .bind(OffsetDateTime::now_utc())
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to register run {run_id}"))?;
        Ok(result.rows_affected() == 1)
    }

    /// Undo [`Database::register_run`] for a run that could not be queued.
    pub async fn unregister_run(&self, run_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM runs WHERE run_id = ?")
            .bind(run_id)
            .execute(&self.pool)
            .await
            .with_context(|| format!("Failed to unregister run {run_id}"))?;
        Ok(())
    }

    /// Full history of a run, oldest first.
    pub async fn history(&self, run_id: &str) -> Result<Vec<HistoryEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT sequence, recorded_at, event
            FROM run_history
            WHERE run_id = ?
            ORDER BY sequence
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("Failed to load history of run {run_id}"))?;
        rows.iter()
            .map(|row| -> Result<HistoryEntry> {
                let event: String = row.try_get("event")?;
                Ok(HistoryEntry {
                    sequence: row.try_get("sequence")?,
                    recorded_at: row.try_get("recorded_at")?,
                    event: serde_json::from_str(&event)
                        .with_context(|| format!("Malformed history event in run {run_id}"))?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl HistoryStore for Database {
    async fn load(&self, run_id: &str) -> Result<Vec<HistoryEvent>, HistoryError> {
        let entries = self.history(run_id).await?;
        Ok(entries.into_iter().map(|entry| entry.event).collect())
    }

    async fn append(
        &self,
        run_id: &str,
        position: usize,
        event: &HistoryEvent,
    ) -> Result<(), HistoryError> {
        let sequence = i64::try_from(position).map_err(|e| anyhow!(e))?;
        let data = serde_json::to_string(event).context("Failed to serialize history event")?;
        // Only appends directly after the last recorded event.
        let result = sqlx::query(
            r#"
            INSERT INTO run_history (run_id, sequence, event, recorded_at)
            SELECT ?, ?, ?, ?
            WHERE (SELECT COUNT(*) FROM run_history WHERE run_id = ?) = ?
            "#,
        )
        .bind(run_id)
        .bind(sequence)
        .bind(data)
        .bind(OffsetDateTime::now_utc())
        .bind(run_id)
        .bind(sequence)
        .execute(&self.pool)
        .await;
        match result {
            Ok(done) if done.rows_affected() == 1 => Ok(()),
            Ok(_) => Err(HistoryError::Conflict { run_id: run_id.to_string(), position }),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(HistoryError::Conflict { run_id: run_id.to_string(), position })
            }
            Err(e) => Err(anyhow::Error::new(e)
                .context(format!("Failed to record history of run {run_id}"))
                .into()),
        }
    }
}
