//! Scheduler error types.

use thiserror::Error;

/// Errors that can occur while talking to the batch scheduler.
///
/// A scheduler that refuses a state change is not an error; see
/// [`crate::Scheduler::set_node_state`].
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("scheduler unreachable: {0}")]
    Transport(String),

    #[error("unexpected scheduler output: {0}")]
    Parse(String),
}

impl From<batchscale_core::ExecError> for SchedulerError {
    fn from(e: batchscale_core::ExecError) -> Self {
        Self::Transport(e.to_string())
    }
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
