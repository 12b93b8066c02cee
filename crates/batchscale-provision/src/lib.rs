//! batchscale-provision: virtual machines for the worker fleet.
//!
//! `InstanceProvisioner` is the capability the node lifecycle manager
//! consumes. `OpenStackCli` implements it with the `openstack` client;
//! `ReachabilityProbe` decides when a fresh instance can be configured.
//!
//! # Create
//!
//! ```text
//! openstack server create --wait   (backend reports ACTIVE)
//!   └── ReachabilityProbe::wait    (TCP connect to ip:ssh_port,
//!                                   fixed delay, bounded attempts)
//!   └── forget_host_key            (ssh-keygen -R ip)
//! ```
//!
//! # Delete
//!
//! Logical instances are resolved against the live server list by
//! (name, ip). Anything already gone is skipped.

pub mod error;
pub mod openstack;
pub mod probe;

pub use error::{ProvisionError, ProvisionResult};
pub use openstack::OpenStackCli;
pub use probe::ReachabilityProbe;

use batchscale_core::{BoxFuture, Instance, Server};

/// Creates and terminates worker instances.
pub trait InstanceProvisioner: Send + Sync {
    /// Launch an instance and wait until it is reachable.
    fn create<'a>(&'a self, name: &'a str) -> BoxFuture<'a, ProvisionResult<Instance>>;

    /// Terminate the live instances backing `servers`. Returns how many
    /// instances were terminated; servers with no live instance are skipped.
    fn delete<'a>(&'a self, servers: &'a [Server]) -> BoxFuture<'a, ProvisionResult<usize>>;
}
