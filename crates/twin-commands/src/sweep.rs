//! Periodic fleet sweep.
//!
//! Catches divergence the event-driven path missed: devices whose main config
//! is still inconsistent get a fresh check chain, as long as they were heard
//! from recently.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use twin_core::{ConfigStore, LivenessRegistry, Result, ServiceConfig, Severity, TelemetrySink};

use crate::engine::{self, ReconciliationEngine};

/// Sweep configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepConfig {
    /// Time between sweeps
    pub interval: Duration,
    /// Devices silent for at least this many minutes are skipped
    pub inactivity_threshold_mins: i64,
    /// Pause after each checked device
    pub device_delay: Duration,
    /// Deadline for store and liveness calls
    pub rpc_timeout: Duration,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self::from(&ServiceConfig::default())
    }
}

impl From<&ServiceConfig> for SweepConfig {
    fn from(config: &ServiceConfig) -> Self {
        Self {
            interval: config.sweep_interval(),
            inactivity_threshold_mins: config.inactivity_threshold_mins,
            device_delay: Duration::from_millis(config.sweep_device_delay_ms),
            rpc_timeout: config.rpc_timeout(),
        }
    }
}

/// Result of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    /// Devices the store flagged as inconsistent
    pub inconsistent: usize,
    /// Devices whose fields were checked
    pub checked: usize,
    /// Devices skipped for inactivity
    pub skipped_inactive: usize,
    /// Devices skipped because liveness was unavailable
    pub skipped_unknown: usize,
    /// Check chains started
    pub chains_started: usize,
}

/// Fleet sweep runner.
pub struct SweepScheduler {
    engine: ReconciliationEngine,
    store: Arc<dyn ConfigStore>,
    liveness: Arc<dyn LivenessRegistry>,
    telemetry: Arc<dyn TelemetrySink>,
    config: SweepConfig,
    running: Arc<RwLock<bool>>,
    cancel: RwLock<CancellationToken>,
    task_handle: Arc<RwLock<Option<JoinHandle<()>>>>,
}

impl SweepScheduler {
    /// Create a sweep scheduler.
    pub fn new(
        engine: ReconciliationEngine,
        store: Arc<dyn ConfigStore>,
        liveness: Arc<dyn LivenessRegistry>,
        telemetry: Arc<dyn TelemetrySink>,
        config: SweepConfig,
    ) -> Self {
        Self {
            engine,
            store,
            liveness,
            telemetry,
            config,
            running: Arc::new(RwLock::new(false)),
            cancel: RwLock::new(CancellationToken::new()),
            task_handle: Arc::new(RwLock::new(None)),
        }
    }

    /// Get the sweep configuration.
    pub fn config(&self) -> &SweepConfig {
        &self.config
    }

    /// Run one sweep over every inconsistent device.
    pub async fn run_once(&self) -> Result<SweepReport> {
        info!("Running scheduled consistency check");
        let timeout = self.config.rpc_timeout;
        let listed = engine::bounded(timeout, "get inconsistent devices", self.store.inconsistent_devices());
        let devices = match listed.await {
            Ok(devices) => devices,
            Err(e) => {
                self.telemetry
                    .log_error("run_scheduled_consistency_check", &e.to_string(), Severity::Severe);
                return Err(e);
            }
        };

        let mut report = SweepReport {
            inconsistent: devices.len(),
            ..Default::default()
        };

        for device_id in &devices {
            let lookup = self.liveness.minutes_since_last_contact(device_id);
            let minutes = match engine::bounded(timeout, "get connection", lookup).await {
                Ok(minutes) => minutes,
                Err(e) => {
                    debug!(device_id = %device_id, "Skipping device, liveness unavailable: {}", e);
                    report.skipped_unknown += 1;
                    continue;
                }
            };

            if minutes >= self.config.inactivity_threshold_mins {
                debug!(device_id = %device_id, minutes, "Skipping inactive device");
                report.skipped_inactive += 1;
                continue;
            }

            match self
                .engine
                .check_consistency_all_fields_for_device(device_id, 0)
                .await
            {
                Ok(started) => report.chains_started += started,
                Err(e) => {
                    warn!(device_id = %device_id, "Sweep check failed: {}", e);
                    self.telemetry.log_error(
                        "check_consistency_all_fields_for_device",
                        &e.to_string(),
                        Severity::Severe,
                    );
                }
            }
            report.checked += 1;

            // Spread the load on the store
            tokio::time::sleep(self.config.device_delay).await;
        }

        info!(
            inconsistent = report.inconsistent,
            checked = report.checked,
            skipped_inactive = report.skipped_inactive,
            chains_started = report.chains_started,
            "Scheduled consistency check complete"
        );
        Ok(report)
    }

    /// Start sweeping every interval. The first sweep runs one interval from now.
    pub async fn start(self: &Arc<Self>) {
        let mut running = self.running.write().await;
        if *running {
            return;
        }
        *running = true;
        drop(running);

        let cancel = CancellationToken::new();
        *self.cancel.write().await = cancel.clone();

        let scheduler = Arc::clone(self);
        let interval = self.config.interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                // Sweep errors are already reported
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = scheduler.run_once() => {}
                }
            }
            debug!("Sweep loop stopped");
        });

        *self.task_handle.write().await = Some(handle);
        info!(interval_secs = interval.as_secs(), "Sweep scheduler started");
    }

    /// Stop sweeping and wait for the loop to exit.
    pub async fn stop(&self) {
        let mut running = self.running.write().await;
        *running = false;
        drop(running);

        self.cancel.read().await.cancel();

        let mut task = self.task_handle.write().await;
        if let Some(handle) = task.take() {
            drop(task);
            handle.await.ok();
        }
        info!("Sweep scheduler stopped");
    }

    /// Check if the scheduler is running.
    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sweep_config_default() {
        let config = SweepConfig::default();
        assert_eq!(config.interval, Duration::from_secs(1440 * 60));
        assert_eq!(config.inactivity_threshold_mins, 40);
        assert_eq!(config.device_delay, Duration::from_secs(2));
        assert_eq!(config.rpc_timeout, Duration::from_secs(5));
    }
}
