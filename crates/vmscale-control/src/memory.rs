//! In-process control plane.
//!
//! Holds simulated nodes and VMs behind a mutex. Used by the test suites
//! and by `vmscaled serve --simulate`. Per-VM faults and a global latency
//! let callers exercise timeout and failure paths without a hypervisor.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::error::{ControlError, ControlResult};
use crate::plane::ControlPlane;
use crate::types::*;

const FIRST_VMID: u32 = 100;
const MIB: u64 = 1024 * 1024;

/// Which call on a VM should fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fault {
    Status,
    Config,
    Update,
}

/// A simulated VM.
#[derive(Debug, Clone, PartialEq)]
pub struct SimVm {
    pub name: String,
    pub status: String,
    pub cores: u32,
    pub memory_mb: u32,
    /// CPU utilization fraction (0.0–1.0).
    pub cpu: f64,
    /// Memory in use, bytes.
    pub mem: u64,
    /// Disk in use, bytes.
    pub disk: u64,
    pub uptime: u64,
}

impl SimVm {
    /// A running VM at rest.
    pub fn running(name: &str, cores: u32, memory_mb: u32) -> Self {
        Self {
            name: name.to_string(),
            status: "running".to_string(),
            cores,
            memory_mb,
            cpu: 0.0,
            mem: 0,
            disk: 0,
            uptime: 0,
        }
    }

    fn report(&self) -> VmStatusReport {
        VmStatusReport {
            status: self.status.clone(),
            cpu: self.cpu,
            mem: self.mem,
            maxmem: u64::from(self.memory_mb) * MIB,
            disk: self.disk,
            uptime: self.uptime,
            cpus: Some(self.cores),
        }
    }
}

#[derive(Default)]
struct Inner {
    nodes: BTreeMap<String, BTreeMap<u32, SimVm>>,
    faults: HashSet<(String, u32, Fault)>,
    updates: Vec<(String, u32, ConfigUpdate)>,
    latency: Duration,
}

impl Inner {
    fn vm(&self, node: &str, vmid: u32) -> ControlResult<&SimVm> {
        self.nodes
            .get(node)
            .and_then(|vms| vms.get(&vmid))
            .ok_or_else(|| ControlError::NotFound(format!("vm {node}/{vmid}")))
    }

    fn vm_mut(&mut self, node: &str, vmid: u32) -> ControlResult<&mut SimVm> {
        self.nodes
            .get_mut(node)
            .and_then(|vms| vms.get_mut(&vmid))
            .ok_or_else(|| ControlError::NotFound(format!("vm {node}/{vmid}")))
    }

    fn check_fault(&self, node: &str, vmid: u32, fault: Fault) -> ControlResult<()> {
        if self.faults.contains(&(node.to_string(), vmid, fault)) {
            return Err(ControlError::Status {
                status: 500,
                message: format!("injected {fault:?} fault on {node}/{vmid}"),
            });
        }
        Ok(())
    }
}

/// Simulated control plane. Clones share state.
#[derive(Clone, Default)]
pub struct InMemoryControlPlane {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryControlPlane {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Artificial delay applied before every call.
    async fn pause(&self) {
        let latency = self.state().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    pub fn add_node(&self, node: &str) {
        self.state().nodes.entry(node.to_string()).or_default();
    }

    /// Insert or replace a VM, creating the node if needed.
    pub fn add_vm(&self, node: &str, vmid: u32, vm: SimVm) {
        self.state()
            .nodes
            .entry(node.to_string())
            .or_default()
            .insert(vmid, vm);
    }

    /// Set the CPU usage a VM reports, on a 0–100 scale.
    pub fn set_cpu(&self, node: &str, vmid: u32, percent: f64) {
        if let Ok(vm) = self.state().vm_mut(node, vmid) {
            vm.cpu = percent / 100.0;
        }
    }

    pub fn set_fault(&self, node: &str, vmid: u32, fault: Fault, enabled: bool) {
        let key = (node.to_string(), vmid, fault);
        let mut state = self.state();
        if enabled {
            state.faults.insert(key);
        } else {
            state.faults.remove(&key);
        }
    }

    pub fn set_latency(&self, latency: Duration) {
        self.state().latency = latency;
    }

    /// Config updates that were applied, in order.
    pub fn updates(&self) -> Vec<(String, u32, ConfigUpdate)> {
        self.state().updates.clone()
    }

    pub fn vm(&self, node: &str, vmid: u32) -> Option<SimVm> {
        self.state().vm(node, vmid).ok().cloned()
    }
}

#[async_trait]
impl ControlPlane for InMemoryControlPlane {
    async fn list_nodes(&self) -> ControlResult<Vec<NodeSummary>> {
        self.pause().await;
        let state = self.state();
        Ok(state
            .nodes
            .iter()
            .map(|(name, vms)| NodeSummary {
                node: name.clone(),
                status: "online".to_string(),
                cpu: 0.0,
                maxcpu: vms.values().map(|vm| vm.cores).sum(),
                mem: vms.values().map(|vm| vm.mem).sum(),
                maxmem: vms.values().map(|vm| u64::from(vm.memory_mb) * MIB).sum(),
                uptime: 0,
            })
            .collect())
    }

    async fn list_vms(&self, node: Option<&str>) -> ControlResult<Vec<VmSummary>> {
        self.pause().await;
        let state = self.state();
        if let Some(n) = node {
            if !state.nodes.contains_key(n) {
                return Err(ControlError::NotFound(format!("node {n}")));
            }
        }
        Ok(state
            .nodes
            .iter()
            .filter(|(name, _)| node.is_none_or(|n| n == name.as_str()))
            .flat_map(|(name, vms)| {
                vms.iter().map(move |(vmid, vm)| VmSummary {
                    vmid: *vmid,
                    name: Some(vm.name.clone()),
                    status: vm.status.clone(),
                    node: name.clone(),
                    cpus: Some(vm.cores),
                    maxmem: u64::from(vm.memory_mb) * MIB,
                })
            })
            .collect())
    }

    async fn vm_status(&self, node: &str, vmid: u32) -> ControlResult<VmStatusReport> {
        self.pause().await;
        let state = self.state();
        state.check_fault(node, vmid, Fault::Status)?;
        Ok(state.vm(node, vmid)?.report())
    }

    async fn vm_config(&self, node: &str, vmid: u32) -> ControlResult<VmConfig> {
        self.pause().await;
        let state = self.state();
        state.check_fault(node, vmid, Fault::Config)?;
        let vm = state.vm(node, vmid)?;
        Ok(VmConfig {
            cores: Some(vm.cores),
            sockets: Some(1),
            memory: Some(vm.memory_mb),
            name: Some(vm.name.clone()),
            extra: serde_json::Map::new(),
        })
    }

    async fn update_vm_config(
        &self,
        node: &str,
        vmid: u32,
        update: &ConfigUpdate,
    ) -> ControlResult<()> {
        self.pause().await;
        let mut state = self.state();
        state.check_fault(node, vmid, Fault::Update)?;
        if update.cores == Some(0) || update.memory == Some(0) {
            return Err(ControlError::Rejected(format!(
                "zero-sized resource for {node}/{vmid}"
            )));
        }
        let vm = state.vm_mut(node, vmid)?;
        if let Some(cores) = update.cores {
            vm.cores = cores;
        }
        if let Some(memory) = update.memory {
            vm.memory_mb = memory;
        }
        state.updates.push((node.to_string(), vmid, *update));
        debug!(node, vmid, ?update, "simulated config update applied");
        Ok(())
    }

    async fn create_vm(&self, node: &str, params: &CreateVmParams) -> ControlResult<u32> {
        self.pause().await;
        let mut state = self.state();
        if !state.nodes.contains_key(node) {
            return Err(ControlError::NotFound(format!("node {node}")));
        }
        let vmid = match params.vmid {
            Some(id) => {
                let taken = state.nodes.values().any(|vms| vms.contains_key(&id));
                if taken {
                    return Err(ControlError::Rejected(format!("vmid {id} already exists")));
                }
                id
            }
            None => state
                .nodes
                .values()
                .flat_map(|vms| vms.keys().copied())
                .max()
                .map_or(FIRST_VMID, |max| max + 1),
        };
        let vm = SimVm {
            status: "stopped".to_string(),
            ..SimVm::running(&params.name, params.cores, params.memory)
        };
        state
            .nodes
            .entry(node.to_string())
            .or_default()
            .insert(vmid, vm);
        Ok(vmid)
    }

    async fn start_vm(&self, node: &str, vmid: u32) -> ControlResult<()> {
        self.pause().await;
        self.state().vm_mut(node, vmid)?.status = "running".to_string();
        Ok(())
    }

    async fn stop_vm(&self, node: &str, vmid: u32) -> ControlResult<()> {
        self.pause().await;
        let mut state = self.state();
        let vm = state.vm_mut(node, vmid)?;
        vm.status = "stopped".to_string();
        vm.cpu = 0.0;
        vm.uptime = 0;
        Ok(())
    }

    async fn delete_vm(&self, node: &str, vmid: u32) -> ControlResult<()> {
        self.pause().await;
        let mut state = self.state();
        state.vm(node, vmid)?;
        if let Some(vms) = state.nodes.get_mut(node) {
            vms.remove(&vmid);
        }
        Ok(())
    }
}
