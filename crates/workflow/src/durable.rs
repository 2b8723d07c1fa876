//! Replayable execution context for a single run.
//!
//! A run is a deterministic function of its history. Every side effect goes through
//! [`RunContext::call`] or [`RunContext::sleep_until`], which consult the history at the current
//! position before doing anything. When a run is re-executed after a restart, recorded positions
//! return their recorded outcome and the virtual clock follows the recorded timestamps, so the
//! run takes the same decisions without repeating a remote call.

use std::{future::Future, sync::Arc};

use anyhow::{Result, anyhow};
use apptest_core::history::{HistoryError, HistoryEvent, HistoryStore};
use serde::{Serialize, de::DeserializeOwned};
use time::OffsetDateTime;

use crate::clock::Clock;

pub struct RunContext {
    run_id: String,
    store: Arc<dyn HistoryStore>,
    clock: Arc<dyn Clock>,
    history: Vec<HistoryEvent>,
    position: usize,
    started_at: OffsetDateTime,
    now: OffsetDateTime,
}

impl RunContext {
    /// Load the run's history, recording its start time if this is the first execution.
    pub async fn start(
        run_id: impl Into<String>,
        store: Arc<dyn HistoryStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, HistoryError> {
        let run_id = run_id.into();
        let history = store.load(&run_id).await?;
        let mut ctx = Self {
            run_id,
            store,
            clock,
            history,
            position: 0,
            started_at: OffsetDateTime::UNIX_EPOCH,
            now: OffsetDateTime::UNIX_EPOCH,
        };
        let started_at = match ctx.next_recorded() {
            Some(HistoryEvent::Started { at }) => at,
            Some(other) => return Err(ctx.diverged("start", &other)),
            None => {
                let at = ctx.clock.now();
                ctx.record(HistoryEvent::Started { at }).await?;
                at
            }
        };
        if ctx.history.len() > 1 {
            tracing::info!(
                run_id = %ctx.run_id,
                "Resuming run with {} recorded events",
                ctx.history.len()
            );
        }
        ctx.started_at = started_at;
        ctx.now = started_at;
        Ok(ctx)
    }

    pub fn run_id(&self) -> &str { &self.run_id }

    pub fn started_at(&self) -> OffsetDateTime { self.started_at }

    /// Virtual time: the completion time of the last call or timer.
    pub fn now(&self) -> OffsetDateTime { self.now }

    pub fn position(&self) -> usize { self.position }

    /// Whether the next position is already recorded.
    pub fn is_replaying(&self) -> bool { self.position < self.history.len() }

    /// Perform a side effect at the current position, or return its recorded outcome.
    ///
    /// The position is claimed in the store before `f` runs; a concurrent execution of the same
    /// run fails with [`HistoryError::Conflict`] without invoking `f`. A call that was claimed but
    /// never completed is made again.
    ///
    /// Errors returned by `f` are recorded and replayed as errors carrying the same message.
    /// [`HistoryError`]s are returned through the `anyhow::Error` and can be recovered with
    /// `downcast_ref`.
    pub async fn call<T, F, Fut>(&mut self, name: &str, f: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut interrupted = false;
        while let Some(event) = self.next_recorded() {
            match event {
                HistoryEvent::CallScheduled { name: recorded, .. } if recorded == name => {
                    interrupted = true;
                }
                HistoryEvent::CallCompleted { name: recorded, at, result } if recorded == name => {
                    tracing::debug!(run_id = %self.run_id, "Replayed {}", name);
                    self.now = at;
                    return serde_json::from_value(result).map_err(|source| {
                        HistoryError::Decode {
                            run_id: self.run_id.clone(),
                            name: name.to_string(),
                            source,
                        }
                        .into()
                    });
                }
                HistoryEvent::CallFailed { name: recorded, at, error } if recorded == name => {
                    tracing::debug!(run_id = %self.run_id, "Replayed failed {}", name);
                    self.now = at;
                    return Err(anyhow!(error));
                }
                other => return Err(self.diverged(&format!("call {name}"), &other).into()),
            }
        }
        if interrupted {
            tracing::warn!(run_id = %self.run_id, "Repeating interrupted call {}", name);
        }

        self.record(HistoryEvent::CallScheduled { name: name.to_string(), at: self.clock.now() })
            .await?;
        let result = f().await;
        let at = self.clock.now();
        let event = match &result {
            Ok(value) => HistoryEvent::CallCompleted {
                name: name.to_string(),
                at,
                result: serde_json::to_value(value).map_err(|e| {
                    HistoryError::Store(anyhow::Error::new(e).context(format!(
                        "Failed to serialize result of {name} in run {}",
                        self.run_id
                    )))
                })?,
            },
            Err(e) => HistoryEvent::CallFailed { name: name.to_string(), at, error: format!("{e:#}") },
        };
        self.record(event).await?;
        self.now = at;
        result
    }

    /// Suspend until `fire_at`, or return immediately if the timer already fired.
    pub async fn sleep_until(&mut self, fire_at: OffsetDateTime) -> Result<(), HistoryError> {
        if let Some(event) = self.next_recorded() {
            return match event {
                HistoryEvent::TimerFired { fire_at: recorded } if recorded == fire_at => {
                    self.now = fire_at;
                    Ok(())
                }
                other => Err(self.diverged(&format!("timer at {fire_at}"), &other)),
            };
        }
        self.clock.sleep_until(fire_at).await;
        self.record(HistoryEvent::TimerFired { fire_at }).await?;
        self.now = fire_at;
        Ok(())
    }

    pub async fn sleep(&mut self, duration: time::Duration) -> Result<(), HistoryError> {
        self.sleep_until(self.now + duration).await
    }

    fn next_recorded(&mut self) -> Option<HistoryEvent> {
        let event = self.history.get(self.position).cloned()?;
        self.position += 1;
        Some(event)
    }

    async fn record(&mut self, event: HistoryEvent) -> Result<(), HistoryError> {
        self.store.append(&self.run_id, self.position, &event).await?;
        self.history.push(event);
        self.position += 1;
        Ok(())
    }

    /// Called after `next_recorded` consumed the mismatching event.
    fn diverged(&self, expected: &str, found: &HistoryEvent) -> HistoryError {
        HistoryError::Nondeterminism {
            run_id: self.run_id.clone(),
            position: self.position - 1,
            expected: expected.to_string(),
            found: found.describe(),
        }
    }
}

/// Whether `error` was caused by the history store rather than by the run itself.
pub fn is_history_error(error: &anyhow::Error) -> bool {
    error.chain().any(|cause| cause.is::<HistoryError>())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use apptest_core::history::MemoryHistory;
    use time::macros::datetime;

    use super::*;
    use crate::clock::ManualClock;

    const START: OffsetDateTime = datetime!(2026-10-15 10:00 UTC);

    fn setup() -> (Arc<MemoryHistory>, Arc<ManualClock>) {
        (Arc::new(MemoryHistory::new()), Arc::new(ManualClock::new(START)))
    }

    async fn done() -> Result<()> { Ok(()) }

    async fn failing(message: &'static str) -> Result<()> { Err(anyhow!(message)) }

    async fn context(history: &Arc<MemoryHistory>, clock: &Arc<ManualClock>) -> RunContext {
        RunContext::start("run-1", history.clone(), clock.clone()).await.unwrap()
    }

    #[tokio::test]
    async fn test_start_time_is_pinned() {
        let (history, clock) = setup();
        let ctx = context(&history, &clock).await;
        assert_eq!(ctx.started_at(), START);
        assert_eq!(history.events("run-1"), vec![HistoryEvent::Started { at: START }]);

        clock.advance(time::Duration::hours(2));
        let ctx = context(&history, &clock).await;
        assert_eq!(ctx.started_at(), START);
        assert_eq!(ctx.now(), START);
    }

    #[tokio::test]
    async fn test_recorded_call_is_not_repeated() {
        let (history, clock) = setup();
        let invocations = AtomicUsize::new(0);
        let counter = &invocations;
        let invoke = move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, anyhow::Error>(42u32)
        };

        let mut ctx = context(&history, &clock).await;
        clock.advance(time::Duration::seconds(5));
        assert_eq!(ctx.call("Answer", invoke).await.unwrap(), 42);
        assert_eq!(ctx.now(), START + time::Duration::seconds(5));

        clock.advance(time::Duration::minutes(30));
        let mut ctx = context(&history, &clock).await;
        assert!(ctx.is_replaying());
        assert_eq!(ctx.call("Answer", invoke).await.unwrap(), 42);
        assert_eq!(ctx.now(), START + time::Duration::seconds(5));
        assert!(!ctx.is_replaying());
        assert_eq!(invocations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_call_replays_as_error() {
        let (history, clock) = setup();
        let mut ctx = context(&history, &clock).await;
        let err = ctx.call("Explode", || failing("connection reset")).await.unwrap_err();
        assert_eq!(err.to_string(), "connection reset");

        let mut ctx = context(&history, &clock).await;
        let err = ctx.call("Explode", || failing("invoked again")).await.unwrap_err();
        assert_eq!(err.to_string(), "connection reset");
        assert!(err.downcast_ref::<HistoryError>().is_none());
    }

    #[tokio::test]
    async fn test_divergent_history_is_detected() {
        let (history, clock) = setup();
        let mut ctx = context(&history, &clock).await;
        ctx.call("First", || done()).await.unwrap();

        let mut ctx = context(&history, &clock).await;
        let err = ctx.call("Second", || done()).await.unwrap_err();
        match err.downcast_ref::<HistoryError>() {
            Some(HistoryError::Nondeterminism { position, expected, found, .. }) => {
                assert_eq!(*position, 1);
                assert_eq!(expected, "call Second");
                assert_eq!(found, "call First");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_timers() {
        let (history, clock) = setup();
        let mut ctx = context(&history, &clock).await;
        ctx.sleep(time::Duration::minutes(1)).await.unwrap();
        assert_eq!(ctx.now(), START + time::Duration::minutes(1));
        assert_eq!(clock.now(), START + time::Duration::minutes(1));

        // A replayed timer does not wait.
        let replay_clock = Arc::new(ManualClock::new(START));
        let mut ctx = context(&history, &replay_clock).await;
        ctx.sleep(time::Duration::minutes(1)).await.unwrap();
        assert_eq!(ctx.now(), START + time::Duration::minutes(1));
        assert_eq!(replay_clock.now(), START);
    }

    #[tokio::test]
    async fn test_concurrent_execution_does_not_repeat_call() {
        let (history, clock) = setup();
        let invocations = AtomicUsize::new(0);
        let counter = &invocations;
        let invoke = move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, anyhow::Error>(())
        };
        let mut first = context(&history, &clock).await;
        let mut second = context(&history, &clock).await;
        first.call("Create", invoke).await.unwrap();
        let err = second.call("Create", invoke).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<HistoryError>(),
            Some(HistoryError::Conflict { position: 1, .. })
        ));
        assert_eq!(invocations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_interrupted_call_is_made_again() {
        let (history, clock) = setup();
        let mut ctx = context(&history, &clock).await;
        ctx.call("First", || done()).await.unwrap();
        // Claimed but never completed.
        history.truncate("run-1", 2);

        let mut ctx = context(&history, &clock).await;
        clock.advance(time::Duration::seconds(3));
        assert_eq!(ctx.call("First", || async { Ok::<_, anyhow::Error>(7u8) }).await.unwrap(), 7);
        assert_eq!(ctx.now(), START + time::Duration::seconds(3));
        let events = history.events("run-1");
        assert_eq!(events.len(), 4);
        assert!(matches!(&events[1], HistoryEvent::CallScheduled { name, .. } if name == "First"));
        assert!(matches!(&events[2], HistoryEvent::CallScheduled { name, .. } if name == "First"));
        assert!(matches!(&events[3], HistoryEvent::CallCompleted { name, .. } if name == "First"));

        // Replays the completed attempt.
        let mut ctx = context(&history, &clock).await;
        assert_eq!(ctx.call("First", || async { Ok::<_, anyhow::Error>(9u8) }).await.unwrap(), 7);
        assert!(!ctx.is_replaying());
    }
}
