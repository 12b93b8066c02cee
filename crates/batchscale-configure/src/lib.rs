//! batchscale-configure: converge the cluster onto a server list.
//!
//! `ConfigurationApplier::apply` is total, not incremental: the list it
//! receives is the complete desired worker set. `AnsibleApplier`
//! renders that list into a static inventory and runs the site
//! playbook against it.

pub mod ansible;
pub mod error;
pub mod inventory;

pub use ansible::AnsibleApplier;
pub use error::{ConfigureError, ConfigureResult};
pub use inventory::Inventory;

use batchscale_core::{BoxFuture, Server};

/// Result of a configuration run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub exit_code: i32,
    pub output: String,
}

impl ApplyOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Last `lines` lines of the captured output.
    pub fn tail(&self, lines: usize) -> String {
        let all: Vec<&str> = self.output.lines().collect();
        all[all.len().saturating_sub(lines)..].join("\n")
    }
}

/// Reconfigures the cluster so it contains exactly `servers`.
///
/// Must be idempotent: applying the same list twice converges to the
/// same membership.
pub trait ConfigurationApplier: Send + Sync {
    fn apply<'a>(&'a self, servers: &'a [Server]) -> BoxFuture<'a, ConfigureResult<ApplyOutcome>>;
}
