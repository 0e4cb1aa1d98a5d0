//! vmscale-control — the hypervisor control-plane boundary.
//!
//! Everything vmscale does to a VM goes through the [`ControlPlane`]
//! contract: list nodes, list/get VMs, status, config, partial config
//! updates, and the lifecycle calls (create, start, stop, delete).
//!
//! # Implementations
//!
//! - [`ProxmoxClient`] speaks the Proxmox VE JSON API over HTTPS with an
//!   API token.
//! - [`InMemoryControlPlane`] keeps simulated VMs in process, with fault
//!   injection and artificial latency.
//!
//! [`ResourceProbe`] sits on top of either one and bounds every call with
//! a timeout; it is the probe and actuator the autoscaler uses.

pub mod error;
pub mod memory;
pub mod plane;
pub mod probe;
pub mod proxmox;
pub mod types;

pub use error::{ControlError, ControlResult};
pub use memory::{Fault, InMemoryControlPlane, SimVm};
pub use plane::ControlPlane;
pub use probe::{ResourceProbe, Sample, with_timeout};
pub use proxmox::ProxmoxClient;
pub use types::*;
