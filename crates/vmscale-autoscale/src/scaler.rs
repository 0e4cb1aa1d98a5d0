//! Autoscaler — evaluates VMs and applies scaling plans.
//!
//! One evaluation is: lock the VM, re-read its record, sample usage,
//! decide, check the applied config is readable, push the partial update
//! to the control plane, then persist the new resources and the event.
//! Nothing is written unless the control plane accepted the update.

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use vmscale_control::{ControlError, ResourceProbe};
use vmscale_state::*;

use crate::policy::{Decision, HoldReason, Thresholds, decide};

/// Why a VM was not evaluated to a decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// The record vanished since the VM was listed.
    Missing,
    /// Autoscaling was turned off since the VM was listed.
    Disabled,
    SampleFailed(String),
    ConfigUnavailable(String),
    Store(String),
}

/// Result of evaluating one VM.
#[derive(Debug, Clone)]
pub enum VmOutcome {
    Skipped(SkipReason),
    Held(HoldReason),
    Scaled(ScalingEvent),
    /// The control plane rejected or timed out the update. Nothing was
    /// written.
    ActuationFailed(ControlError),
    /// The update landed but the store write failed.
    PersistFailed(String),
}

/// Summary of one polling cycle.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    pub candidates: usize,
    pub evaluated: usize,
    pub held: usize,
    pub skipped: usize,
    pub failed: usize,
    pub events: Vec<ScalingEvent>,
    /// The cycle stopped early on shutdown.
    pub interrupted: bool,
}

impl CycleReport {
    fn record(&mut self, outcome: VmOutcome) {
        self.evaluated += 1;
        match outcome {
            VmOutcome::Skipped(_) => self.skipped += 1,
            VmOutcome::Held(_) => self.held += 1,
            VmOutcome::Scaled(event) => self.events.push(event),
            VmOutcome::ActuationFailed(_) | VmOutcome::PersistFailed(_) => self.failed += 1,
        }
    }
}

/// Evaluates autoscaling candidates against the store and control plane.
pub struct Autoscaler {
    store: StateStore,
    probe: ResourceProbe,
    locks: VmLocks,
    thresholds: Thresholds,
}

impl Autoscaler {
    pub fn new(
        store: StateStore,
        probe: ResourceProbe,
        locks: VmLocks,
        thresholds: Thresholds,
    ) -> Self {
        Self {
            store,
            probe,
            locks,
            thresholds,
        }
    }

    pub fn thresholds(&self) -> Thresholds {
        self.thresholds
    }

    /// Evaluate one VM. Never fails: every problem is reported in the
    /// outcome and logged.
    pub async fn evaluate_vm(&self, id: VmId) -> VmOutcome {
        let _guard = self.locks.lock(id).await;

        let vm = match self.store.get_vm(id) {
            Ok(Some(vm)) => vm,
            Ok(None) => return VmOutcome::Skipped(SkipReason::Missing),
            Err(e) => {
                warn!(vm_id = id, error = %e, "failed to read vm record");
                return VmOutcome::Skipped(SkipReason::Store(e.to_string()));
            }
        };
        if !vm.autoscaling_enabled {
            return VmOutcome::Skipped(SkipReason::Disabled);
        }
        if vm.status != VmStatus::Running {
            debug!(vm_id = id, status = %vm.status, "vm not running, skipping");
            return VmOutcome::Held(HoldReason::NotRunning(vm.status));
        }

        let sample = match self.probe.sample(&vm.node, vm.vmid).await {
            Ok(sample) => sample,
            Err(e) => {
                warn!(vm_id = id, node = %vm.node, vmid = vm.vmid, error = %e, "usage sample unavailable");
                return VmOutcome::Skipped(SkipReason::SampleFailed(e.to_string()));
            }
        };
        // A VM powered off outside vmscale still reads `running` in its
        // record; the live state decides.
        let live_status = match sample.status.parse::<VmStatus>() {
            Ok(status) => status,
            Err(e) => {
                warn!(vm_id = id, status = %sample.status, "unrecognised live status");
                return VmOutcome::Skipped(SkipReason::SampleFailed(e));
            }
        };
        if live_status != vm.status {
            debug!(vm_id = id, record = %vm.status, live = %live_status, "live status differs from record");
        }
        let cpu = sample.usage.cpu_percent;

        let plan = match decide(live_status, Some(cpu), vm.cores, vm.memory_mb, &self.thresholds) {
            Decision::Scale(plan) => plan,
            Decision::Hold(reason) => {
                debug!(vm_id = id, cpu, ?reason, "no scaling needed");
                return VmOutcome::Held(reason);
            }
        };

        match self.probe.read_config(&vm.node, vm.vmid).await {
            Ok(config) => {
                if config.cores != Some(vm.cores) || config.memory != Some(vm.memory_mb) {
                    debug!(
                        vm_id = id,
                        record_cores = vm.cores,
                        record_memory_mb = vm.memory_mb,
                        applied_cores = ?config.cores,
                        applied_memory_mb = ?config.memory,
                        "applied config differs from record"
                    );
                }
            }
            Err(e) => {
                warn!(vm_id = id, error = %e, "vm config unavailable, skipping");
                return VmOutcome::Skipped(SkipReason::ConfigUnavailable(e.to_string()));
            }
        }

        if let Err(e) = self.probe.apply(&vm.node, vm.vmid, &plan.update()).await {
            warn!(
                vm_id = id,
                kind = %plan.kind,
                error = %e,
                transient = e.is_transient(),
                "scaling update failed"
            );
            return VmOutcome::ActuationFailed(e);
        }

        match self.store.record_scaling(id, plan.event()) {
            Ok((_, event)) => {
                info!(
                    vm_id = id,
                    vm = %vm.name,
                    kind = %event.kind,
                    cpu = event.cpu_usage,
                    old_cores = event.old_cores,
                    new_cores = event.new_cores,
                    old_memory_mb = event.old_memory_mb,
                    new_memory_mb = event.new_memory_mb,
                    "vm scaled"
                );
                VmOutcome::Scaled(event)
            }
            Err(e) => {
                error!(vm_id = id, error = %e, "scaling applied but not recorded");
                VmOutcome::PersistFailed(e.to_string())
            }
        }
    }

    /// Evaluate every autoscaling candidate once, in order.
    ///
    /// `shutdown` is checked before each VM. Only listing the candidates
    /// can fail the cycle.
    pub async fn run_cycle(&self, shutdown: &watch::Receiver<bool>) -> StateResult<CycleReport> {
        let candidates = self.store.list_autoscale_vms()?;
        let mut report = CycleReport {
            candidates: candidates.len(),
            ..CycleReport::default()
        };

        for vm in candidates {
            if *shutdown.borrow() {
                debug!(remaining = report.candidates - report.evaluated, "cycle interrupted");
                report.interrupted = true;
                break;
            }
            let outcome = self.evaluate_vm(vm.id).await;
            report.record(outcome);
        }

        Ok(report)
    }
}
