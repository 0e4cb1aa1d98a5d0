//! Timeout-bounded probe and actuator over a control plane.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::error::{ControlError, ControlResult};
use crate::plane::ControlPlane;
use crate::types::{ConfigUpdate, ResourceUsage, VmConfig};

/// Run `fut`, failing with [`ControlError::Timeout`] after `timeout`.
pub async fn with_timeout<T, F>(
    timeout: Duration,
    what: impl Into<String>,
    fut: F,
) -> ControlResult<T>
where
    F: Future<Output = ControlResult<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(res) => res,
        Err(_) => {
            let what = what.into();
            warn!(what = %what, timeout_ms = timeout.as_millis() as u64, "control plane call timed out");
            Err(ControlError::Timeout(what))
        }
    }
}

/// One status read: the live power state plus utilization.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// Power state as reported by the control plane (`running`, `stopped`, ...).
    pub status: String,
    pub usage: ResourceUsage,
}

/// Samples utilization and applies resource changes for the autoscaler.
///
/// Every call is bounded by the same timeout so one stuck VM cannot stall
/// a polling cycle.
#[derive(Clone)]
pub struct ResourceProbe {
    plane: Arc<dyn ControlPlane>,
    timeout: Duration,
}

impl ResourceProbe {
    pub fn new(plane: Arc<dyn ControlPlane>, timeout: Duration) -> Self {
        Self { plane, timeout }
    }

    pub fn control_plane(&self) -> &Arc<dyn ControlPlane> {
        &self.plane
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Current power state and utilization of one VM.
    pub async fn sample(&self, node: &str, vmid: u32) -> ControlResult<Sample> {
        let report = with_timeout(
            self.timeout,
            format!("status of {node}/{vmid}"),
            self.plane.vm_status(node, vmid),
        )
        .await?;
        Ok(Sample {
            usage: report.resource_usage(),
            status: report.status,
        })
    }

    /// Applied configuration of one VM.
    pub async fn read_config(&self, node: &str, vmid: u32) -> ControlResult<VmConfig> {
        with_timeout(
            self.timeout,
            format!("config of {node}/{vmid}"),
            self.plane.vm_config(node, vmid),
        )
        .await
    }

    /// Push a partial resource update.
    pub async fn apply(&self, node: &str, vmid: u32, update: &ConfigUpdate) -> ControlResult<()> {
        with_timeout(
            self.timeout,
            format!("config update of {node}/{vmid}"),
            self.plane.update_vm_config(node, vmid, update),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryControlPlane, SimVm};

    fn probe(latency: Duration, timeout: Duration) -> (InMemoryControlPlane, ResourceProbe) {
        let plane = InMemoryControlPlane::new();
        plane.add_vm("pve1", 100, SimVm::running("web", 2, 2048));
        plane.set_latency(latency);
        let probe = ResourceProbe::new(Arc::new(plane.clone()), timeout);
        (plane, probe)
    }

    #[tokio::test]
    async fn sample_returns_percent() {
        let (plane, probe) = probe(Duration::ZERO, Duration::from_secs(1));
        plane.set_cpu("pve1", 100, 85.0);
        let sample = probe.sample("pve1", 100).await.unwrap();
        assert_eq!(sample.status, "running");
        assert!((sample.usage.cpu_percent - 85.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn sample_reports_live_power_state() {
        let (plane, probe) = probe(Duration::ZERO, Duration::from_secs(1));
        plane.stop_vm("pve1", 100).await.unwrap();
        let sample = probe.sample("pve1", 100).await.unwrap();
        assert_eq!(sample.status, "stopped");
        assert_eq!(sample.usage.cpu_percent, 0.0);
    }

    #[tokio::test]
    async fn slow_plane_times_out() {
        let (_plane, probe) = probe(Duration::from_millis(200), Duration::from_millis(20));
        let err = probe.sample("pve1", 100).await.unwrap_err();
        assert!(matches!(err, ControlError::Timeout(_)));
    }

    #[tokio::test]
    async fn timed_out_update_is_not_applied() {
        let (plane, probe) = probe(Duration::from_millis(200), Duration::from_millis(20));
        let update = ConfigUpdate { cores: Some(3), memory: None };
        assert!(probe.apply("pve1", 100, &update).await.is_err());
        assert_eq!(plane.vm("pve1", 100).unwrap().cores, 2);
    }

    #[tokio::test]
    async fn apply_and_read_back() {
        let (_plane, probe) = probe(Duration::ZERO, Duration::from_secs(1));
        let update = ConfigUpdate { cores: None, memory: Some(2560) };
        probe.apply("pve1", 100, &update).await.unwrap();
        let config = probe.read_config("pve1", 100).await.unwrap();
        assert_eq!(config.memory, Some(2560));
        assert_eq!(config.cores, Some(2));
    }
}
