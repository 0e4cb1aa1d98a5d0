//! Wire and domain types for the control plane.
//!
//! Field names follow the Proxmox VE API so responses deserialize
//! directly. Proxmox reports some numeric config values as strings, so
//! those fields accept either form.

use serde::{Deserialize, Deserializer, Serialize};

const MIB: f64 = 1024.0 * 1024.0;
const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// A hypervisor node as listed by `/nodes`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSummary {
    pub node: String,
    #[serde(default)]
    pub status: String,
    /// CPU utilization fraction (0.0–1.0).
    #[serde(default)]
    pub cpu: f64,
    #[serde(default)]
    pub maxcpu: u32,
    #[serde(default)]
    pub mem: u64,
    #[serde(default)]
    pub maxmem: u64,
    #[serde(default)]
    pub uptime: u64,
}

/// A VM as listed by `/nodes/{node}/qemu`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmSummary {
    #[serde(deserialize_with = "u32_lenient")]
    pub vmid: u32,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub status: String,
    /// Filled in by the client; not part of the listing payload.
    #[serde(default)]
    pub node: String,
    #[serde(default)]
    pub cpus: Option<u32>,
    #[serde(default)]
    pub maxmem: u64,
}

/// Current runtime status of one VM (`status/current`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmStatusReport {
    /// `running`, `stopped`, or `paused`.
    pub status: String,
    /// CPU utilization fraction (0.0–1.0).
    #[serde(default)]
    pub cpu: f64,
    /// Memory in use, bytes.
    #[serde(default)]
    pub mem: u64,
    #[serde(default)]
    pub maxmem: u64,
    /// Disk in use, bytes.
    #[serde(default)]
    pub disk: u64,
    /// Uptime, seconds.
    #[serde(default)]
    pub uptime: u64,
    #[serde(default)]
    pub cpus: Option<u32>,
}

impl VmStatusReport {
    /// Convert raw counters into the units the autoscaler works in.
    pub fn resource_usage(&self) -> ResourceUsage {
        ResourceUsage {
            cpu_percent: self.cpu * 100.0,
            memory_used_mb: self.mem as f64 / MIB,
            disk_used_gb: self.disk as f64 / GIB,
            uptime_secs: self.uptime,
        }
    }
}

/// Utilization sample for one VM.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// CPU usage on a 0–100 scale.
    pub cpu_percent: f64,
    pub memory_used_mb: f64,
    pub disk_used_gb: f64,
    pub uptime_secs: u64,
}

/// Applied VM configuration (`config`). Only the fields vmscale reads are
/// typed; the rest is kept verbatim.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VmConfig {
    #[serde(default, deserialize_with = "opt_u32_lenient")]
    pub cores: Option<u32>,
    #[serde(default, deserialize_with = "opt_u32_lenient")]
    pub sockets: Option<u32>,
    /// Memory in MB.
    #[serde(default, deserialize_with = "opt_u32_lenient")]
    pub memory: Option<u32>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Partial configuration update. Absent fields are not sent, so values
/// managed outside vmscale are never overwritten.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cores: Option<u32>,
    /// Memory in MB.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<u32>,
}

impl ConfigUpdate {
    pub fn is_empty(&self) -> bool {
        self.cores.is_none() && self.memory.is_none()
    }
}

/// Parameters for provisioning a VM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateVmParams {
    /// Requested id; the control plane allocates one when absent.
    #[serde(default)]
    pub vmid: Option<u32>,
    pub name: String,
    #[serde(default = "default_memory")]
    pub memory: u32,
    #[serde(default = "default_one")]
    pub cores: u32,
    #[serde(default = "default_one")]
    pub sockets: u32,
    #[serde(default = "default_net")]
    pub net0: String,
    #[serde(default = "default_ostype")]
    pub ostype: String,
    #[serde(default = "default_storage")]
    pub storage: String,
    #[serde(default = "default_disk_gb")]
    pub disk_gb: u32,
    #[serde(default)]
    pub description: Option<String>,
}

impl CreateVmParams {
    /// Parameters with the defaults used by the provisioning API.
    pub fn named(name: &str) -> Self {
        Self {
            vmid: None,
            name: name.to_string(),
            memory: default_memory(),
            cores: default_one(),
            sockets: default_one(),
            net0: default_net(),
            ostype: default_ostype(),
            storage: default_storage(),
            disk_gb: default_disk_gb(),
            description: None,
        }
    }
}

fn default_memory() -> u32 {
    1024
}

fn default_one() -> u32 {
    1
}

fn default_net() -> String {
    "virtio,bridge=vmbr0".to_string()
}

fn default_ostype() -> String {
    "l26".to_string()
}

fn default_storage() -> String {
    "local-lvm".to_string()
}

fn default_disk_gb() -> u32 {
    10
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NumOrString {
    Num(u64),
    Str(String),
}

fn to_u32<E: serde::de::Error>(raw: NumOrString) -> Result<u32, E> {
    match raw {
        NumOrString::Num(n) => u32::try_from(n).map_err(E::custom),
        NumOrString::Str(s) => s.trim().parse().map_err(E::custom),
    }
}

fn u32_lenient<'de, D: Deserializer<'de>>(d: D) -> Result<u32, D::Error> {
    to_u32(NumOrString::deserialize(d)?)
}

fn opt_u32_lenient<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u32>, D::Error> {
    match Option::<NumOrString>::deserialize(d)? {
        Some(raw) => to_u32(raw).map(Some),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_converts_to_percent_and_megabytes() {
        let report: VmStatusReport = serde_json::from_str(
            r#"{"status":"running","cpu":0.853,"mem":2147483648,"maxmem":4294967296,
                "disk":10737418240,"uptime":3600,"cpus":2}"#,
        )
        .unwrap();
        let usage = report.resource_usage();
        assert!((usage.cpu_percent - 85.3).abs() < 1e-9);
        assert_eq!(usage.memory_used_mb, 2048.0);
        assert_eq!(usage.disk_used_gb, 10.0);
        assert_eq!(usage.uptime_secs, 3600);
    }

    #[test]
    fn config_accepts_string_numbers_and_keeps_extra_fields() {
        let config: VmConfig = serde_json::from_str(
            r#"{"cores":2,"memory":"2048","name":"web","net0":"virtio,bridge=vmbr0"}"#,
        )
        .unwrap();
        assert_eq!(config.cores, Some(2));
        assert_eq!(config.memory, Some(2048));
        assert_eq!(config.extra["net0"], "virtio,bridge=vmbr0");
    }

    #[test]
    fn config_rejects_garbage_numbers() {
        let res: Result<VmConfig, _> = serde_json::from_str(r#"{"memory":"lots"}"#);
        assert!(res.is_err());
    }

    #[test]
    fn update_serializes_only_present_fields() {
        let update = ConfigUpdate { cores: Some(3), memory: None };
        assert_eq!(serde_json::to_string(&update).unwrap(), r#"{"cores":3}"#);
        assert!(ConfigUpdate::default().is_empty());
    }

    #[test]
    fn create_params_fill_defaults() {
        let params: CreateVmParams = serde_json::from_str(r#"{"name":"build-box"}"#).unwrap();
        assert_eq!(params, CreateVmParams::named("build-box"));
        assert_eq!(params.memory, 1024);
        assert_eq!(params.storage, "local-lvm");
    }
}
