//! Per-VM scaling policy.
//!
//! A pure function of the VM's status, its CPU usage and its current
//! resources. No I/O happens here.

use serde::Serialize;

use vmscale_control::ConfigUpdate;
use vmscale_core::AutoscaleSettings;
use vmscale_state::{NewScalingEvent, ScalingKind, VmStatus};

pub const MIN_CORES: u32 = 1;
pub const MAX_CORES: u32 = 4;
pub const MIN_MEMORY_MB: u32 = 512;
pub const MAX_MEMORY_MB: u32 = 8192;

/// Memory grows by 5/4 (x1.25) on scale-up.
const GROW: (u64, u64) = (5, 4);
/// Memory shrinks by 4/5 (x0.8) on scale-down.
const SHRINK: (u64, u64) = (4, 5);

/// CPU thresholds on a 0–100 scale.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Thresholds {
    pub high: f64,
    pub low: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            high: 80.0,
            low: 20.0,
        }
    }
}

impl From<&AutoscaleSettings> for Thresholds {
    fn from(settings: &AutoscaleSettings) -> Self {
        Self {
            high: settings.cpu_threshold_high,
            low: settings.cpu_threshold_low,
        }
    }
}

/// Why a VM was left alone.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "reason", content = "status", rename_all = "snake_case")]
pub enum HoldReason {
    NotRunning(VmStatus),
    NoSample,
    /// Usage between the thresholds.
    DeadBand,
    /// Usage crossed a threshold but the resources are already at the cap.
    AtBound,
}

/// A resource change to apply.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScalePlan {
    pub kind: ScalingKind,
    pub cpu_usage: f64,
    pub old_cores: u32,
    pub new_cores: u32,
    pub old_memory_mb: u32,
    pub new_memory_mb: u32,
}

impl ScalePlan {
    /// The partial config update: only fields that change are set.
    pub fn update(&self) -> ConfigUpdate {
        ConfigUpdate {
            cores: (self.new_cores != self.old_cores).then_some(self.new_cores),
            memory: (self.new_memory_mb != self.old_memory_mb).then_some(self.new_memory_mb),
        }
    }

    pub fn event(&self) -> NewScalingEvent {
        NewScalingEvent {
            kind: self.kind,
            cpu_usage: self.cpu_usage,
            old_cores: self.old_cores,
            new_cores: self.new_cores,
            old_memory_mb: self.old_memory_mb,
            new_memory_mb: self.new_memory_mb,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decision {
    Hold(HoldReason),
    Scale(ScalePlan),
}

/// Decide what to do with one VM.
///
/// `usage` is CPU percent; `None` or NaN means no sample was available.
pub fn decide(
    status: VmStatus,
    usage: Option<f64>,
    cores: u32,
    memory_mb: u32,
    thresholds: &Thresholds,
) -> Decision {
    if status != VmStatus::Running {
        return Decision::Hold(HoldReason::NotRunning(status));
    }
    let usage = match usage {
        Some(u) if !u.is_nan() => u,
        _ => return Decision::Hold(HoldReason::NoSample),
    };

    let (kind, new_cores, new_memory_mb) = if usage > thresholds.high {
        (ScalingKind::ScaleUp, grow_cores(cores), grow_memory(memory_mb))
    } else if usage < thresholds.low {
        (ScalingKind::ScaleDown, shrink_cores(cores), shrink_memory(memory_mb))
    } else {
        return Decision::Hold(HoldReason::DeadBand);
    };

    if new_cores == cores && new_memory_mb == memory_mb {
        return Decision::Hold(HoldReason::AtBound);
    }

    Decision::Scale(ScalePlan {
        kind,
        cpu_usage: usage,
        old_cores: cores,
        new_cores,
        old_memory_mb: memory_mb,
        new_memory_mb,
    })
}

fn grow_cores(cores: u32) -> u32 {
    if cores >= MAX_CORES {
        cores
    } else {
        (cores + 1).min(MAX_CORES)
    }
}

fn shrink_cores(cores: u32) -> u32 {
    if cores <= MIN_CORES {
        cores
    } else {
        (cores - 1).max(MIN_CORES)
    }
}

fn grow_memory(memory_mb: u32) -> u32 {
    if memory_mb >= MAX_MEMORY_MB {
        memory_mb
    } else {
        scale(memory_mb, GROW).min(MAX_MEMORY_MB)
    }
}

fn shrink_memory(memory_mb: u32) -> u32 {
    if memory_mb <= MIN_MEMORY_MB {
        memory_mb
    } else {
        scale(memory_mb, SHRINK).max(MIN_MEMORY_MB)
    }
}

/// `floor(value * num / den)`, saturating at `u32::MAX`.
fn scale(value: u32, (num, den): (u64, u64)) -> u32 {
    u32::try_from(u64::from(value) * num / den).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(usage: f64, cores: u32, memory_mb: u32) -> Decision {
        decide(
            VmStatus::Running,
            Some(usage),
            cores,
            memory_mb,
            &Thresholds::default(),
        )
    }

    fn plan(d: Decision) -> ScalePlan {
        match d {
            Decision::Scale(p) => p,
            Decision::Hold(r) => panic!("expected a scale plan, got hold: {r:?}"),
        }
    }

    #[test]
    fn busy_vm_scales_up() {
        let p = plan(run(85.0, 2, 2000));
        assert_eq!(p.kind, ScalingKind::ScaleUp);
        assert_eq!((p.new_cores, p.new_memory_mb), (3, 2500));
        assert_eq!((p.old_cores, p.old_memory_mb), (2, 2000));
        assert_eq!(p.cpu_usage, 85.0);
    }

    #[test]
    fn idle_vm_scales_down() {
        let p = plan(run(10.0, 2, 1000));
        assert_eq!(p.kind, ScalingKind::ScaleDown);
        assert_eq!((p.new_cores, p.new_memory_mb), (1, 800));
    }

    #[test]
    fn dead_band_holds_including_edges() {
        for usage in [20.0, 50.0, 80.0] {
            assert_eq!(run(usage, 2, 2048), Decision::Hold(HoldReason::DeadBand));
        }
    }

    #[test]
    fn at_cap_holds() {
        assert_eq!(run(95.0, 4, 8192), Decision::Hold(HoldReason::AtBound));
        assert_eq!(run(5.0, 1, 512), Decision::Hold(HoldReason::AtBound));
    }

    #[test]
    fn not_running_or_no_sample_holds() {
        let t = Thresholds::default();
        assert_eq!(
            decide(VmStatus::Stopped, Some(99.0), 2, 2048, &t),
            Decision::Hold(HoldReason::NotRunning(VmStatus::Stopped))
        );
        assert_eq!(
            decide(VmStatus::Running, None, 2, 2048, &t),
            Decision::Hold(HoldReason::NoSample)
        );
        assert_eq!(
            decide(VmStatus::Running, Some(f64::NAN), 2, 2048, &t),
            Decision::Hold(HoldReason::NoSample)
        );
    }

    #[test]
    fn scale_up_stays_within_bounds() {
        for cores in 1..=6 {
            for memory_mb in (256..=10_000).step_by(97) {
                if let Decision::Scale(p) = run(90.0, cores, memory_mb) {
                    assert!(p.new_cores >= cores);
                    assert!(p.new_cores <= MAX_CORES.max(cores));
                    assert!(p.new_memory_mb >= memory_mb);
                    assert!(p.new_memory_mb <= MAX_MEMORY_MB.max(memory_mb));
                }
            }
        }
    }

    #[test]
    fn scale_down_stays_within_bounds() {
        for cores in 0..=6 {
            for memory_mb in (128..=10_000).step_by(89) {
                if let Decision::Scale(p) = run(3.0, cores, memory_mb) {
                    assert!(p.new_cores <= cores);
                    assert!(p.new_cores >= MIN_CORES.min(cores));
                    assert!(p.new_memory_mb <= memory_mb);
                    assert!(p.new_memory_mb >= MIN_MEMORY_MB.min(memory_mb));
                    if memory_mb > MIN_MEMORY_MB {
                        assert_eq!(p.new_memory_mb, (memory_mb * 4 / 5).max(MIN_MEMORY_MB));
                    }
                }
            }
        }
    }

    #[test]
    fn memory_is_truncated_to_whole_mb() {
        // 1001 * 1.25 = 1251.25
        assert_eq!(plan(run(90.0, 1, 1001)).new_memory_mb, 1251);
        // 1001 * 0.8 = 800.8
        assert_eq!(plan(run(1.0, 2, 1001)).new_memory_mb, 800);
    }

    #[test]
    fn oversized_memory_is_not_shrunk_by_scale_up() {
        let p = plan(run(90.0, 2, 9000));
        assert_eq!(p.new_cores, 3);
        assert_eq!(p.new_memory_mb, 9000);
        assert_eq!(p.update(), ConfigUpdate { cores: Some(3), memory: None });
    }

    #[test]
    fn update_carries_only_changes() {
        let p = plan(run(90.0, 4, 2048));
        assert_eq!(p.update(), ConfigUpdate { cores: None, memory: Some(2560) });
        let event = p.event();
        assert_eq!(event.old_cores, 4);
        assert_eq!(event.new_cores, 4);
    }

    #[test]
    fn thresholds_follow_settings() {
        let settings = AutoscaleSettings {
            cpu_threshold_high: 70.0,
            cpu_threshold_low: 30.0,
            ..AutoscaleSettings::default()
        };
        let t = Thresholds::from(&settings);
        assert!(matches!(
            decide(VmStatus::Running, Some(75.0), 2, 2048, &t),
            Decision::Scale(_)
        ));
    }
}
