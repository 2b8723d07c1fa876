use std::sync::Mutex;

use async_trait::async_trait;
use time::OffsetDateTime;

/// Source of wall-clock time for live (non-replayed) execution.
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> OffsetDateTime;

    async fn sleep_until(&self, deadline: OffsetDateTime);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime { OffsetDateTime::now_utc() }

    async fn sleep_until(&self, deadline: OffsetDateTime) {
        let remaining = deadline - self.now();
        if remaining.is_positive() {
            tokio::time::sleep(remaining.unsigned_abs()).await;
        }
    }
}

/// A clock that jumps to the deadline instead of waiting.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<OffsetDateTime>,
}

impl ManualClock {
    pub fn new(start: OffsetDateTime) -> Self { Self { now: Mutex::new(start) } }

    pub fn advance(&self, duration: time::Duration) {
        if let Ok(mut now) = self.now.lock() {
            *now += duration;
        }
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> OffsetDateTime {
        self.now.lock().map(|now| *now).unwrap_or(OffsetDateTime::UNIX_EPOCH)
    }

    async fn sleep_until(&self, deadline: OffsetDateTime) {
        if let Ok(mut now) = self.now.lock()
            && *now < deadline
        {
            *now = deadline;
        }
    }
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;

    #[tokio::test]
    async fn test_manual_clock() {
        let clock = ManualClock::new(datetime!(2026-10-15 10:00 UTC));
        clock.sleep_until(datetime!(2026-10-15 11:00 UTC)).await;
        assert_eq!(clock.now(), datetime!(2026-10-15 11:00 UTC));
        // Never moves backwards.
        clock.sleep_until(datetime!(2026-10-15 10:30 UTC)).await;
        assert_eq!(clock.now(), datetime!(2026-10-15 11:00 UTC));
        clock.advance(time::Duration::seconds(10));
        assert_eq!(clock.now(), datetime!(2026-10-15 11:00:10 UTC));
    }

    #[tokio::test]
    async fn test_system_clock_past_deadline() {
        let clock = SystemClock;
        let before = clock.now();
        clock.sleep_until(before - time::Duration::hours(1)).await;
        assert!(clock.now() >= before);
    }
}
