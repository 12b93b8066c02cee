//! Provisioning error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("cloud backend unreachable: {0}")]
    Transport(String),

    #[error("cloud backend rejected {name}: {reason}")]
    Rejected { name: String, reason: String },

    #[error("instance {0} has no private address")]
    NoAddress(String),

    #[error("instance {name} not reachable after {attempts} attempts")]
    ReachabilityTimeout { name: String, attempts: u32 },

    #[error("unexpected cloud backend output: {0}")]
    Parse(String),
}

impl From<batchscale_core::ExecError> for ProvisionError {
    fn from(e: batchscale_core::ExecError) -> Self {
        Self::Transport(e.to_string())
    }
}

pub type ProvisionResult<T> = Result<T, ProvisionError>;
