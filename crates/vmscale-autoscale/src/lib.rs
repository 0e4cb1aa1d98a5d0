//! vmscale-autoscale — CPU-driven vertical scaling.
//!
//! Polls every VM with autoscaling enabled, samples its CPU usage through
//! the control plane, and grows or shrinks its cores and memory within
//! fixed bounds. Every applied change is persisted to the VM record and
//! recorded as a `ScalingEvent` in the same transaction.
//!
//! # Scaling Algorithm
//!
//! ```text
//! if status != running or no usage sample: hold
//!
//! if usage > high:
//!     cores'  = min(cores + 1, 4)
//!     memory' = min(floor(memory * 1.25), 8192)
//!
//! if usage < low:
//!     cores'  = max(cores - 1, 1)
//!     memory' = max(floor(memory * 0.8), 512)
//!
//! otherwise, or if nothing changes: hold
//! ```
//!
//! A value already past a bound is left where it is; scaling never moves
//! a resource the wrong way.

pub mod controller;
pub mod policy;
pub mod scaler;

pub use controller::AutoscaleController;
pub use policy::{Decision, HoldReason, ScalePlan, Thresholds, decide};
pub use scaler::{Autoscaler, CycleReport, SkipReason, VmOutcome};
