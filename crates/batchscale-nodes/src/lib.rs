//! batchscale-nodes: the node lifecycle manager.
//!
//! Owns naming, adding, removing, and reconfiguring worker nodes. The
//! scheduler's node list is the source of truth for membership; the
//! configuration inventory is always derived from it and always sent
//! whole.
//!
//! # Lifecycle
//!
//! ```text
//! Unmanaged → Provisioning → Configuring → Member → Draining → Down → Terminated
//! ```
//!
//! # Ordering
//!
//! Removal marks nodes down in the scheduler, then applies the reduced
//! member list, and only after a successful apply terminates instances.
//! A failed apply leaves the nodes down but alive.

pub mod error;
pub mod lifecycle;
pub mod manager;
pub mod naming;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use error::{NodeError, NodeResult};
pub use lifecycle::NodeLifecycle;
pub use manager::{AddOutcome, NodeManager};
pub use naming::next_name;
