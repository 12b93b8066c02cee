//! batchscale-scheduler: read/write access to the batch scheduler.
//!
//! The `Scheduler` facade wraps a `SchedulerBackend` and never caches:
//! every call reflects the scheduler's state at call time.
//!
//! # Architecture
//!
//! ```text
//! Scheduler (filtering, logging)
//!   └── dyn SchedulerBackend
//!       └── SlurmCli (squeue --json, scontrol --json, scontrol update)
//! ```

pub mod error;
pub mod scheduler;
pub mod slurm;

pub use error::{SchedulerError, SchedulerResult};
pub use scheduler::{Scheduler, SchedulerBackend};
pub use slurm::SlurmCli;
