//! Recorded history of a run.
//!
//! Every remote call and timer a run performs is appended here at its position. Re-executing a
//! run against its history returns the recorded outcomes instead of repeating the side effects.
//! A call claims its position with [`HistoryEvent::CallScheduled`] before it is made, so of two
//! executions of the same run only the one that recorded the claim performs the call.

use std::{collections::HashMap, sync::Mutex};

use anyhow::anyhow;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HistoryEvent {
    /// Always the first event; pins the run's start time.
    Started {
        #[serde(with = "time::serde::rfc3339")]
        at: OffsetDateTime,
    },
    /// Written before the call is made. Without a following outcome, the call was interrupted.
    CallScheduled {
        name: String,
        #[serde(with = "time::serde::rfc3339")]
        at: OffsetDateTime,
    },
    CallCompleted {
        name: String,
        #[serde(with = "time::serde::rfc3339")]
        at: OffsetDateTime,
        result: serde_json::Value,
    },
    CallFailed {
        name: String,
        #[serde(with = "time::serde::rfc3339")]
        at: OffsetDateTime,
        error: String,
    },
    TimerFired {
        #[serde(with = "time::serde::rfc3339")]
        fire_at: OffsetDateTime,
    },
}

impl HistoryEvent {
    pub fn describe(&self) -> String {
        match self {
            Self::Started { .. } => "start".to_string(),
            Self::CallScheduled { name, .. }
            | Self::CallCompleted { name, .. }
            | Self::CallFailed { name, .. } => {
                format!("call {name}")
            }
            Self::TimerFired { fire_at } => format!("timer at {fire_at}"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("position {position} of run {run_id} is already recorded")]
    Conflict { run_id: String, position: usize },
    #[error(
        "history of run {run_id} diverged at position {position}: expected {expected}, found {found}"
    )]
    Nondeterminism { run_id: String, position: usize, expected: String, found: String },
    #[error("failed to decode recorded result of {name} in run {run_id}")]
    Decode {
        run_id: String,
        name: String,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Durable storage for run histories.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Events recorded for the run, in position order.
    async fn load(&self, run_id: &str) -> Result<Vec<HistoryEvent>, HistoryError>;

    /// Record `event` at `position`. Fails with [`HistoryError::Conflict`] if the position is
    /// already taken or does not directly follow the last recorded event.
    async fn append(
        &self,
        run_id: &str,
        position: usize,
        event: &HistoryEvent,
    ) -> Result<(), HistoryError>;
}

/// In-process history store.
#[derive(Debug, Default)]
pub struct MemoryHistory {
    runs: Mutex<HashMap<String, Vec<HistoryEvent>>>,
}

impl MemoryHistory {
    pub fn new() -> Self { Self::default() }

    pub fn events(&self, run_id: &str) -> Vec<HistoryEvent> {
        self.runs
            .lock()
            .map(|runs| runs.get(run_id).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    /// Drop everything recorded after the first `len` events, as if the process had stopped
    /// right after recording them.
    pub fn truncate(&self, run_id: &str, len: usize) {
        if let Ok(mut runs) = self.runs.lock()
            && let Some(events) = runs.get_mut(run_id)
        {
            events.truncate(len);
        }
    }
}

#[async_trait]
impl HistoryStore for MemoryHistory {
    async fn load(&self, run_id: &str) -> Result<Vec<HistoryEvent>, HistoryError> {
        let runs = self.runs.lock().map_err(|_| anyhow!("history lock poisoned"))?;
        Ok(runs.get(run_id).cloned().unwrap_or_default())
    }

    async fn append(
        &self,
        run_id: &str,
        position: usize,
        event: &HistoryEvent,
    ) -> Result<(), HistoryError> {
        let mut runs = self.runs.lock().map_err(|_| anyhow!("history lock poisoned"))?;
        let events = runs.entry(run_id.to_string()).or_default();
        if position != events.len() {
            return Err(HistoryError::Conflict { run_id: run_id.to_string(), position });
        }
        events.push(event.clone());
        Ok(())
    }
}
