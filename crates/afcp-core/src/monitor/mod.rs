//! Periodic health monitoring.
//!
//! The monitor runs on a ticker independent of traffic. Each tick ages out
//! agents whose heartbeat is older than the offline threshold, applies
//! gentle load decay, emits tick metrics, and drives admission garbage
//! collection on its own cadence. The whole tick runs as one registry write,
//! so readers never observe a partially updated agent.
//!
//! The monitor never fails the process: anything unexpected is logged at
//! `warn` and the next tick proceeds as scheduled.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::admission::AdmissionController;
use crate::config::HealthConfig;
use crate::metrics::AfcpMetrics;
use crate::registry::Registry;

/// Ages stale heartbeats and decays load averages on a timer.
pub struct HealthMonitor {
    registry: Arc<Registry>,
    admission: Arc<AdmissionController>,
    metrics: Arc<AfcpMetrics>,
    config: HealthConfig,
}

impl HealthMonitor {
    /// Wires a monitor over shared component handles.
    #[must_use]
    pub fn new(
        registry: Arc<Registry>,
        admission: Arc<AdmissionController>,
        metrics: Arc<AfcpMetrics>,
        config: HealthConfig,
    ) -> Self {
        Self {
            registry,
            admission,
            metrics,
            config,
        }
    }

    /// Runs exactly one tick. Exposed so tests can drive the monitor
    /// deterministically without a timer.
    pub fn tick_once(&self) {
        let report = self.registry.tick(
            self.config.offline_threshold,
            self.config.load_decay_factor,
            self.config.load_decay_step,
        );
        self.metrics.record_tick(&report);
        if report.transitioned_offline > 0 {
            tracing::warn!(
                transitioned_offline = report.transitioned_offline,
                "stale heartbeats aged out"
            );
        }
        tracing::debug!(
            active = report.active,
            degraded = report.degraded,
            offline = report.offline,
            "health tick"
        );

        if self.admission.maybe_gc() {
            tracing::debug!("admission garbage collection ran");
        }
    }

    /// Spawns the tick loop; it stops when `cancel` fires.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::debug!(interval = ?self.config.tick_interval, "health monitor started");
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(self.config.tick_interval) => {},
                }
                self.tick_once();
            }
            tracing::debug!("health monitor stopped");
        })
    }
}
