//! Domain types for the vmscale state store.
//!
//! All persisted types serialize to JSON for storage in redb tables.

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Internal durable identifier of a VM record.
pub type VmId = u64;

/// Identifier of a scaling event.
pub type EventId = u64;

// ── VM ────────────────────────────────────────────────────────────

/// Lifecycle status of a VM as last observed or applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmStatus {
    Stopped,
    Running,
    Paused,
}

impl VmStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VmStatus::Stopped => "stopped",
            VmStatus::Running => "running",
            VmStatus::Paused => "paused",
        }
    }
}

impl fmt::Display for VmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VmStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stopped" => Ok(VmStatus::Stopped),
            "running" => Ok(VmStatus::Running),
            "paused" => Ok(VmStatus::Paused),
            other => Err(format!("unknown vm status: {other}")),
        }
    }
}

/// A managed virtual machine.
///
/// `cores` and `memory_mb` cache the last configuration successfully
/// applied on the control plane.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VmRecord {
    pub id: VmId,
    pub name: String,
    /// Hypervisor node hosting the VM.
    pub node: String,
    /// Hypervisor-assigned numeric id.
    pub vmid: u32,
    pub status: VmStatus,
    pub cores: u32,
    pub memory_mb: u32,
    pub disk_gb: u32,
    pub os_type: String,
    /// Candidate for the autoscaler.
    pub autoscaling_enabled: bool,
    /// Software catalog keys requested at provisioning.
    #[serde(default)]
    pub software: Vec<String>,
    /// Unix timestamp (seconds) of creation.
    pub created_at: u64,
    /// Unix timestamp (seconds) of the last write.
    pub updated_at: u64,
}

impl VmRecord {
    /// Build the control-plane address key for the `vm_keys` table.
    pub fn external_key(&self) -> String {
        vm_key(&self.node, self.vmid)
    }
}

/// Compose the `{node}/{vmid}` key.
pub fn vm_key(node: &str, vmid: u32) -> String {
    format!("{node}/{vmid}")
}

/// Fields for a VM record about to be created; the store assigns the id
/// and timestamps.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewVm {
    pub name: String,
    pub node: String,
    pub vmid: u32,
    pub status: VmStatus,
    pub cores: u32,
    pub memory_mb: u32,
    #[serde(default)]
    pub disk_gb: u32,
    #[serde(default)]
    pub os_type: String,
    #[serde(default)]
    pub autoscaling_enabled: bool,
    #[serde(default)]
    pub software: Vec<String>,
}

/// Partial update of a VM's resources. `None` fields are left untouched.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cores: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<u32>,
}

impl ResourceUpdate {
    pub fn is_empty(&self) -> bool {
        self.cores.is_none() && self.memory_mb.is_none()
    }

    /// Write the touched fields into `vm`.
    pub fn apply_to(&self, vm: &mut VmRecord) {
        if let Some(cores) = self.cores {
            vm.cores = cores;
        }
        if let Some(memory_mb) = self.memory_mb {
            vm.memory_mb = memory_mb;
        }
    }
}

// ── Scaling events ────────────────────────────────────────────────

/// Direction of an applied scaling action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingKind {
    ScaleUp,
    ScaleDown,
}

impl ScalingKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScalingKind::ScaleUp => "scale_up",
            ScalingKind::ScaleDown => "scale_down",
        }
    }
}

impl fmt::Display for ScalingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable audit record of one applied scaling action.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScalingEvent {
    pub id: EventId,
    pub vm_id: VmId,
    pub kind: ScalingKind,
    /// CPU usage percentage (0–100) that triggered the action.
    pub cpu_usage: f64,
    pub old_cores: u32,
    pub new_cores: u32,
    pub old_memory_mb: u32,
    pub new_memory_mb: u32,
    /// Unix timestamp (seconds) when the action was recorded.
    pub timestamp: u64,
}

/// Event payload before the store assigns id, VM and timestamp.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NewScalingEvent {
    pub kind: ScalingKind,
    pub cpu_usage: f64,
    pub old_cores: u32,
    pub new_cores: u32,
    pub old_memory_mb: u32,
    pub new_memory_mb: u32,
}

impl NewScalingEvent {
    /// The partial update this event describes: only fields that changed.
    pub fn resource_update(&self) -> ResourceUpdate {
        ResourceUpdate {
            cores: (self.new_cores != self.old_cores).then_some(self.new_cores),
            memory_mb: (self.new_memory_mb != self.old_memory_mb).then_some(self.new_memory_mb),
        }
    }
}

pub(crate) fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
