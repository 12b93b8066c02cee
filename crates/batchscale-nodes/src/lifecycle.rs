//! Node lifecycle state machine.
//!
//! batchscale keeps no per-node state between calls; the lifecycle is
//! observed through the scheduler and logged as the manager drives a
//! node through it.

use std::fmt;

use tracing::{error, info};

use batchscale_core::NodeState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeLifecycle {
    /// Not known to batchscale or the scheduler.
    Unmanaged,
    /// Instance requested from the cloud backend.
    Provisioning,
    /// Instance reachable; configuration run in progress.
    Configuring,
    /// Scheduler member, eligible for work.
    Member,
    /// Down requested; the scheduler stops dispatching to it.
    Draining,
    /// Administratively down in the scheduler.
    Down,
    /// Backing instance terminated.
    Terminated,
}

impl NodeLifecycle {
    /// Whether `self → next` is a legal step.
    pub fn can_transition_to(self, next: NodeLifecycle) -> bool {
        use NodeLifecycle::*;
        matches!(
            (self, next),
            (Unmanaged, Provisioning)
                | (Provisioning, Configuring)
                | (Configuring, Member)
                // Failed provisioning or configuration leaves nothing the
                // scheduler knows about.
                | (Provisioning, Unmanaged)
                | (Configuring, Unmanaged)
                | (Member, Draining)
                | (Draining, Down)
                | (Down, Terminated)
                // Removal without instance deletion.
                | (Down, Unmanaged)
                // The scheduler refused DOWN; the node leaves the
                // inventory regardless.
                | (Draining, Terminated)
                | (Draining, Unmanaged)
        )
    }

    /// Lifecycle stage implied by a scheduler-reported node state.
    pub fn observed(state: &NodeState) -> Self {
        match state {
            NodeState::Drain => Self::Draining,
            NodeState::Down => Self::Down,
            _ => Self::Member,
        }
    }
}

impl fmt::Display for NodeLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unmanaged => "unmanaged",
            Self::Provisioning => "provisioning",
            Self::Configuring => "configuring",
            Self::Member => "member",
            Self::Draining => "draining",
            Self::Down => "down",
            Self::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// Record a lifecycle step for `node`.
pub(crate) fn transition(node: &str, from: NodeLifecycle, to: NodeLifecycle) -> NodeLifecycle {
    if from.can_transition_to(to) {
        info!(%node, %from, %to, "node lifecycle transition");
    } else {
        error!(%node, %from, %to, "illegal node lifecycle transition");
    }
    to
}
