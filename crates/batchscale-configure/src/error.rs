//! Configuration port error types.
//!
//! A playbook that runs and fails is not an error: it is an
//! [`crate::ApplyOutcome`] with a nonzero exit code.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigureError {
    #[error("configuration executor unavailable: {0}")]
    Transport(String),

    #[error("failed to write inventory {path}: {source}")]
    Inventory {
        path: std::path::PathBuf,
        source: std::io::Error,
    },
}

impl From<batchscale_core::ExecError> for ConfigureError {
    fn from(e: batchscale_core::ExecError) -> Self {
        Self::Transport(e.to_string())
    }
}

pub type ConfigureResult<T> = Result<T, ConfigureError>;
