//! The control-plane contract.

use async_trait::async_trait;

use crate::error::ControlResult;
use crate::types::*;

/// Operations vmscale needs from a hypervisor management API.
///
/// VMs are addressed by `(node, vmid)`. Implementations report every
/// failure (unreachable node, unknown VM, rejected update) as an `Err`;
/// a successful `update_vm_config` means the whole partial update landed.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn list_nodes(&self) -> ControlResult<Vec<NodeSummary>>;

    /// List VMs on one node, or on every node when `node` is `None`.
    async fn list_vms(&self, node: Option<&str>) -> ControlResult<Vec<VmSummary>>;

    async fn vm_status(&self, node: &str, vmid: u32) -> ControlResult<VmStatusReport>;

    async fn vm_config(&self, node: &str, vmid: u32) -> ControlResult<VmConfig>;

    async fn update_vm_config(
        &self,
        node: &str,
        vmid: u32,
        update: &ConfigUpdate,
    ) -> ControlResult<()>;

    /// Provision a VM and return its vmid.
    async fn create_vm(&self, node: &str, params: &CreateVmParams) -> ControlResult<u32>;

    async fn start_vm(&self, node: &str, vmid: u32) -> ControlResult<()>;

    async fn stop_vm(&self, node: &str, vmid: u32) -> ControlResult<()>;

    async fn delete_vm(&self, node: &str, vmid: u32) -> ControlResult<()>;
}
