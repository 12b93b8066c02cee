//! batchscale-autoscale: queue-driven worker scaling.
//!
//! Each cycle takes a fresh scheduler snapshot and makes at most one
//! decision:
//!
//! ```text
//! idle nodes exist            → remove all idle nodes
//! else waiting jobs exist     → add one node
//! else                        → nothing
//! ```
//!
//! A job is waiting when it is PENDING for `Resources` or `Priority`
//! and has been eligible for longer than the grace period. Idle-node
//! removal always wins over growth in the same cycle.
//!
//! Cycles never overlap. A shutdown signal received mid-cycle takes
//! effect once the cycle finishes, so a removal is never abandoned
//! between marking nodes down and deleting their instances.

pub mod scaler;

pub use scaler::{Autoscaler, CycleOutcome, ScaleDecision, count_waiting};
