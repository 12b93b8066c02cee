//! Node lifecycle error types.

use thiserror::Error;

use batchscale_configure::ConfigureError;
use batchscale_provision::ProvisionError;
use batchscale_scheduler::SchedulerError;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("provisioning error: {0}")]
    Provision(#[from] ProvisionError),

    #[error("configuration error: {0}")]
    Configure(#[from] ConfigureError),

    /// A freshly allocated name is already a cluster member. Only
    /// possible if another process is scaling the same cluster.
    #[error("node name {0} is already in use")]
    NameCollision(String),
}

pub type NodeResult<T> = Result<T, NodeError>;
