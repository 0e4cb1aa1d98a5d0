//! Autoscaling controller — owns the background polling loop.
//!
//! Two states: stopped and running. `start` spawns the loop on its own
//! task with a fresh shutdown channel; `stop` signals it and waits a
//! bounded time for it to exit. Each cycle runs on a child task, so a
//! panic inside a cycle is logged and the loop keeps going. A stop that
//! times out aborts both the loop and the cycle in flight.

use std::sync::{Arc, PoisonError};
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};

use vmscale_state::StateResult;

use crate::scaler::{Autoscaler, CycleReport};

/// Abort handle of the cycle task currently in flight, if any.
type CycleSlot = Arc<std::sync::Mutex<Option<AbortHandle>>>;

struct RunHandle {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
    cycle: CycleSlot,
}

/// Start/stop state machine around an [`Autoscaler`].
pub struct AutoscaleController {
    autoscaler: Arc<Autoscaler>,
    interval: Duration,
    stop_timeout: Duration,
    run: Mutex<Option<RunHandle>>,
}

impl AutoscaleController {
    pub fn new(autoscaler: Autoscaler, interval: Duration, stop_timeout: Duration) -> Self {
        Self {
            autoscaler: Arc::new(autoscaler),
            interval,
            stop_timeout,
            run: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn autoscaler(&self) -> &Arc<Autoscaler> {
        &self.autoscaler
    }

    /// Start the polling loop. Returns false if it is already running.
    pub async fn start(&self) -> bool {
        let mut run = self.run.lock().await;
        if run.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            debug!("autoscaler already running");
            return false;
        }

        let (shutdown, rx) = watch::channel(false);
        let cycle = CycleSlot::default();
        let handle = tokio::spawn(run_loop(
            self.autoscaler.clone(),
            self.interval,
            rx,
            cycle.clone(),
        ));
        *run = Some(RunHandle {
            shutdown,
            handle,
            cycle,
        });
        true
    }

    /// Stop the polling loop. Returns false if it was not running.
    ///
    /// The VM being evaluated when the signal arrives is finished; the
    /// rest of the cycle is skipped. If the loop has not exited within the
    /// stop timeout it is aborted along with the cycle in flight.
    pub async fn stop(&self) -> bool {
        let mut run = self.run.lock().await;
        let Some(RunHandle {
            shutdown,
            mut handle,
            cycle,
        }) = run.take()
        else {
            debug!("autoscaler not running");
            return false;
        };

        let _ = shutdown.send(true);
        match tokio::time::timeout(self.stop_timeout, &mut handle).await {
            Ok(Ok(())) => info!("autoscaler stopped"),
            Ok(Err(e)) => warn!(error = %e, "autoscaler task ended abnormally"),
            Err(_) => {
                warn!(
                    timeout_ms = self.stop_timeout.as_millis() as u64,
                    "autoscaler did not stop in time, aborting"
                );
                handle.abort();
                if let Some(inflight) = cycle.lock().unwrap_or_else(PoisonError::into_inner).take() {
                    inflight.abort();
                }
            }
        }
        true
    }

    pub async fn is_running(&self) -> bool {
        self.run
            .lock()
            .await
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }

    /// Run one cycle now, independent of the loop.
    pub async fn run_once(&self) -> StateResult<CycleReport> {
        let (_shutdown, rx) = watch::channel(false);
        self.autoscaler.run_cycle(&rx).await
    }
}

async fn run_loop(
    autoscaler: Arc<Autoscaler>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
    inflight: CycleSlot,
) {
    let thresholds = autoscaler.thresholds();
    info!(
        interval_secs = interval.as_secs(),
        high = thresholds.high,
        low = thresholds.low,
        "autoscaler started"
    );

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => break,
        }
        if *shutdown.borrow() {
            break;
        }

        let scaler = autoscaler.clone();
        let rx = shutdown.clone();
        let cycle = tokio::spawn(async move { scaler.run_cycle(&rx).await });
        *inflight.lock().unwrap_or_else(PoisonError::into_inner) = Some(cycle.abort_handle());
        let joined = cycle.await;
        inflight.lock().unwrap_or_else(PoisonError::into_inner).take();
        match joined {
            Ok(Ok(report)) => {
                if report.events.is_empty() {
                    debug!(
                        candidates = report.candidates,
                        held = report.held,
                        skipped = report.skipped,
                        failed = report.failed,
                        "autoscaling cycle complete"
                    );
                } else {
                    info!(
                        candidates = report.candidates,
                        scaled = report.events.len(),
                        failed = report.failed,
                        "autoscaling cycle complete"
                    );
                }
            }
            Ok(Err(e)) => error!(error = %e, "autoscaling cycle failed"),
            Err(e) => error!(error = %e, "autoscaling cycle panicked"),
        }
    }

    info!("autoscaler shutting down");
}
