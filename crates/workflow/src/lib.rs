//! Durable workflow that provisions a test app, runs a test in it and always tears it down.

pub mod clock;
pub mod controller;
pub mod durable;
pub mod messages;
pub mod poller;
#[cfg(test)]
mod test_support;

pub use clock::{Clock, ManualClock, SystemClock};
pub use controller::{RunError, RunSummary, WorkflowController};
pub use durable::{RunContext, is_history_error};
