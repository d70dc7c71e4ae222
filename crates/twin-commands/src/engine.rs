//! Reconciliation engine.
//!
//! Pushes desired-value changes to devices and keeps resending them until the
//! device reports the desired value or the retry schedule runs out:
//!
//! ```text
//! set_desired ──▶ send (retry 0) ──▶ check ──▶ consistent? ──▶ done
//!                                      ▲            │ no
//!                                      │            ▼
//!                                      └── resend (retry + 1, window aligned
//!                                          from retry 2 on) until Stop
//! ```
//!
//! Every check re-reads desired/reported when it wakes, so a stale chain that
//! races with a newer `set_desired` or an uplink resolves itself instead of
//! sending outdated values. Check chains run on a [`TaskTracker`] so shutdown
//! can either drain them or cancel the sleeping ones.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use twin_core::{
    codec, ConfigField, ConfigStore, ConsistencyCheckTask, DeviceEvent, DocType, DownlinkCommand,
    DownlinkTransport, Error, FieldSchema, LivenessRegistry, Result, Severity, TelemetrySink, TracingTelemetry,
    ValidationError,
};

use crate::retry::{NextDelay, RetryPolicy};
use crate::window::WindowScheduler;

/// Default deadline for collaborator calls.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(5);

/// Operator request to change a field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetDesiredRequest {
    pub device_id: String,
    pub slot: u32,
    pub field_name: String,
    pub value: String,
}

impl SetDesiredRequest {
    pub fn new(
        device_id: impl Into<String>,
        slot: u32,
        field_name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            slot,
            field_name: field_name.into(),
            value: value.into(),
        }
    }
}

/// What happened to a stored desired value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetDesiredOutcome {
    /// Sent to the device; a check chain is running.
    Transmitted,
    /// Device not registered; the value waits for a later check.
    Deferred,
}

/// Builder for [`ReconciliationEngine`].
pub struct EngineBuilder {
    store: Arc<dyn ConfigStore>,
    transport: Arc<dyn DownlinkTransport>,
    liveness: Arc<dyn LivenessRegistry>,
    telemetry: Arc<dyn TelemetrySink>,
    policy: RetryPolicy,
    window: WindowScheduler,
    rpc_timeout: Duration,
}

impl EngineBuilder {
    /// Set the telemetry sink.
    pub fn telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Set the retry policy.
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Set the window scheduler.
    pub fn window_scheduler(mut self, window: WindowScheduler) -> Self {
        self.window = window;
        self
    }

    /// Set the deadline for store and liveness calls.
    pub fn rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }

    pub fn build(self) -> ReconciliationEngine {
        ReconciliationEngine {
            inner: Arc::new(Inner {
                store: self.store,
                transport: self.transport,
                liveness: self.liveness,
                telemetry: self.telemetry,
                policy: self.policy,
                window: self.window,
                rpc_timeout: self.rpc_timeout,
                tracker: TaskTracker::new(),
                cancel: CancellationToken::new(),
            }),
        }
    }
}

/// Desired/reported reconciliation engine.
///
/// Cheap to clone; clones share the same task scope.
#[derive(Clone)]
pub struct ReconciliationEngine {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<dyn ConfigStore>,
    transport: Arc<dyn DownlinkTransport>,
    liveness: Arc<dyn LivenessRegistry>,
    telemetry: Arc<dyn TelemetrySink>,
    policy: RetryPolicy,
    window: WindowScheduler,
    rpc_timeout: Duration,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl ReconciliationEngine {
    /// Start building an engine around its collaborators.
    pub fn builder(
        store: Arc<dyn ConfigStore>,
        transport: Arc<dyn DownlinkTransport>,
        liveness: Arc<dyn LivenessRegistry>,
    ) -> EngineBuilder {
        EngineBuilder {
            store,
            transport,
            liveness,
            telemetry: Arc::new(TracingTelemetry),
            policy: RetryPolicy::default(),
            window: WindowScheduler::default(),
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
        }
    }

    /// Get the retry policy.
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.inner.policy
    }

    /// Store and send a new desired value.
    ///
    /// Validation, lookup and store errors are returned before anything is
    /// sent. The follow-up checks run in the background.
    pub async fn set_desired(&self, user: &str, request: SetDesiredRequest) -> Result<SetDesiredOutcome> {
        let inner = &self.inner;
        let SetDesiredRequest {
            device_id,
            slot,
            field_name,
            value,
        } = request;

        if device_id.trim().is_empty() {
            return Err(ValidationError::MissingIdentifier.into());
        }
        if field_name.trim().is_empty() {
            return Err(ValidationError::MissingFieldName.into());
        }

        debug!(device_id = %device_id, slot, field = %field_name, value = %value, "Setting desired config");

        let doc_type = DocType::for_slot(slot);
        let firmware = inner.latest_firmware(doc_type).await?;
        let field = inner
            .call(
                "get schema by name",
                inner.store.schema_by_name(&field_name, &firmware, doc_type),
            )
            .await?;
        let payload = codec::encode(&field, &value)?;
        // Stored in decoded form so it compares equal to what the device reports
        let value = codec::canonical(&field, &value)?;

        let previous = inner
            .call(
                "set desired",
                inner.store.set_desired(&device_id, slot, &field, &value),
            )
            .await?;

        inner.telemetry.log_device_event(&DeviceEvent::new(
            user,
            device_id.clone(),
            format!(
                "Changed {} from {} to {} slot {}",
                field_name,
                previous.unwrap_or_default(),
                value,
                slot
            ),
        ));

        let registered = match inner
            .call("get connection", inner.liveness.is_registered(&device_id))
            .await
        {
            Ok(registered) => registered,
            Err(e) => {
                inner.telemetry.log_error(
                    "set_desired",
                    &format!("error getting connection - {}", e),
                    Severity::Fatal,
                );
                return Err(e);
            }
        };

        if !registered {
            info!(device_id = %device_id, field = %field_name, "Device not registered, not sending command");
            return Ok(SetDesiredOutcome::Deferred);
        }

        let command = DownlinkCommand::new(device_id, slot, field.index, firmware, 0, payload);
        inner.transport.send(command.clone()).await?;
        info!(device_id = %command.device_id, slot, field = %field_name, "Sent config command");

        inner.spawn_chain(ConsistencyCheckTask::for_command(&command, field));
        Ok(SetDesiredOutcome::Transmitted)
    }

    /// Decode and store a value reported by a device.
    ///
    /// Returns the decoded display value. Never schedules a check.
    pub async fn update_reported(&self, device_id: &str, slot: u32, field_index: u32, raw: &[u8]) -> Result<String> {
        let inner = &self.inner;
        if device_id.trim().is_empty() {
            return Err(ValidationError::MissingIdentifier.into());
        }

        let doc_type = DocType::for_slot(slot);
        let firmware = inner.latest_firmware(doc_type).await?;
        let field = inner
            .call(
                "get schema by index",
                inner.store.schema_by_index(field_index, &firmware, doc_type),
            )
            .await?;
        let value = codec::decode(&field, raw)?;

        inner
            .call(
                "set reported",
                inner.store.set_reported(device_id, slot, &field, &value),
            )
            .await?;

        debug!(device_id = %device_id, slot, field = %field.name, value = %value, "Updated reported config");
        Ok(value)
    }

    /// Start a check chain for a field at the given retry count.
    pub async fn schedule_check(&self, device_id: &str, slot: u32, field_index: u32, retry_count: u32) -> Result<()> {
        let inner = &self.inner;
        let doc_type = DocType::for_slot(slot);
        let firmware = inner.latest_firmware(doc_type).await?;
        let field = inner
            .call(
                "get schema by index",
                inner.store.schema_by_index(field_index, &firmware, doc_type),
            )
            .await?;

        inner.spawn_chain(ConsistencyCheckTask {
            device_id: device_id.to_string(),
            slot,
            field,
            firmware,
            retry_count,
        });
        Ok(())
    }

    /// Compare one stored field and start a fresh chain if it is inconsistent.
    ///
    /// The first send waits for the device's window. Returns whether a chain
    /// was started.
    pub async fn check_consistency_for_field(
        &self,
        device_id: &str,
        slot: u32,
        field: &ConfigField,
        firmware: &str,
    ) -> Result<bool> {
        let inner = &self.inner;
        let value = field.value();
        let desired = match value.pending() {
            Some(desired) => desired.to_string(),
            None => return Ok(false),
        };

        let doc_type = DocType::for_slot(slot);
        let schema = inner
            .call(
                "get schema by index",
                inner.store.schema_by_index(field.index, firmware, doc_type),
            )
            .await?;
        let payload = codec::encode(&schema, &desired)?;

        info!(
            device_id = %device_id,
            slot,
            field = %field.name,
            desired = %desired,
            "Config mismatch, scheduling command"
        );

        let command = DownlinkCommand::new(device_id, slot, schema.index, firmware, 0, payload);
        Ok(inner.spawn_window_send(command, schema))
    }

    /// Check every field of a device config document.
    ///
    /// Per-field failures are logged and skipped. Returns the number of
    /// chains started.
    pub async fn check_consistency_all_fields_for_device(&self, device_id: &str, slot: u32) -> Result<usize> {
        let inner = &self.inner;
        let firmware = inner.latest_firmware(DocType::for_slot(slot)).await?;
        let fields = inner
            .call("get device config", inner.store.device_config(device_id, slot))
            .await?;

        let mut started = 0;
        for field in &fields {
            match self
                .check_consistency_for_field(device_id, slot, field, &firmware)
                .await
            {
                Ok(true) => started += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(device_id = %device_id, field = %field.name, "Consistency check failed: {}", e);
                    inner.report("check_consistency_all_fields_for_device", &e);
                }
            }
        }
        Ok(started)
    }

    /// Number of check tasks still running.
    pub fn outstanding(&self) -> usize {
        self.inner.tracker.len()
    }

    /// Check if the engine stopped accepting new chains.
    pub fn is_shutting_down(&self) -> bool {
        self.inner.tracker.is_closed()
    }

    /// Stop accepting new chains and wait for running tasks.
    ///
    /// With `drain` running tasks finish their current step; without it
    /// sleeping tasks are cancelled.
    pub async fn shutdown(&self, drain: bool) {
        let inner = &self.inner;
        inner.tracker.close();
        if !drain {
            inner.cancel.cancel();
        }
        info!(outstanding = inner.tracker.len(), drain, "Shutting down reconciliation engine");
        inner.tracker.wait().await;
        info!("Reconciliation engine stopped");
    }
}

/// Bound a collaborator call by a deadline, mapping expiry to [`Error::Timeout`].
pub(crate) async fn bounded<T, F>(timeout: Duration, what: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout(format!("{} after {}ms", what, timeout.as_millis()))),
    }
}

impl Inner {
    /// Bound a collaborator call by the RPC deadline.
    async fn call<T, F>(&self, what: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        bounded(self.rpc_timeout, what, fut).await
    }

    async fn latest_firmware(&self, doc_type: DocType) -> Result<String> {
        self.call("get latest firmware", self.store.latest_firmware(doc_type))
            .await
    }

    fn report(&self, function: &str, error: &Error) {
        self.telemetry
            .log_error(function, &error.to_string(), Severity::Severe);
    }

    /// Sleep unless the engine is cancelled first. Returns false on cancel.
    async fn sleep(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    fn spawn<F>(&self, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.tracker.is_closed() {
            debug!("Engine shutting down, not scheduling check");
            return false;
        }
        self.tracker.spawn(task);
        true
    }

    fn spawn_chain(self: &Arc<Self>, task: ConsistencyCheckTask) -> bool {
        let inner = Arc::clone(self);
        self.spawn(async move { inner.run_chain(task).await })
    }

    fn spawn_window_send(self: &Arc<Self>, command: DownlinkCommand, field: FieldSchema) -> bool {
        let inner = Arc::clone(self);
        self.spawn(async move {
            match inner.send_in_window(command.clone()).await {
                Ok(true) => {
                    inner
                        .run_chain(ConsistencyCheckTask::for_command(&command, field))
                        .await
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(device_id = %command.device_id, field = %field.name, "Scheduled send failed: {}", e);
                    inner.report("schedule_message_send", &e);
                }
            }
        })
    }

    /// Wait for the device's send window, then transmit.
    ///
    /// Returns false if cancelled while waiting.
    async fn send_in_window(&self, command: DownlinkCommand) -> Result<bool> {
        let reserved = self
            .call(
                "get reserved minutes",
                self.store.reserved_minutes(&command.device_id),
            )
            .await?;

        let wait = self.window.time_until_send_window(&reserved);
        if !wait.is_zero() {
            debug!(
                device_id = %command.device_id,
                wait_secs = wait.as_secs(),
                "Waiting for send window"
            );
            if !self.sleep(wait).await {
                return Ok(false);
            }
        }

        self.transport.send(command).await?;
        Ok(true)
    }

    /// Run checks until the field converges, the schedule stops or a step fails.
    async fn run_chain(&self, mut task: ConsistencyCheckTask) {
        loop {
            let delay = match self.policy.next_delay(&task.field.name, task.retry_count) {
                NextDelay::Delay(delay) => delay,
                NextDelay::Stop => {
                    debug!(
                        device_id = %task.device_id,
                        field = %task.field.name,
                        retry_count = task.retry_count,
                        "Retry limit reached, leaving field to the sweep"
                    );
                    return;
                }
            };

            if !self.sleep(delay).await {
                debug!(device_id = %task.device_id, field = %task.field.name, "Check cancelled");
                return;
            }

            match self.check_once(&task).await {
                Ok(Some(next)) => {
                    if self.tracker.is_closed() {
                        debug!(device_id = %task.device_id, field = %task.field.name, "Engine shutting down, ending chain");
                        return;
                    }
                    task = next;
                }
                Ok(None) => return,
                Err(e) => {
                    warn!(
                        device_id = %task.device_id,
                        field = %task.field.name,
                        retry_count = task.retry_count,
                        "Consistency check failed: {}", e
                    );
                    self.report("run_consistency_check", &e);
                    return;
                }
            }
        }
    }

    /// One check: resend if still inconsistent and return the follow-up task.
    async fn check_once(&self, task: &ConsistencyCheckTask) -> Result<Option<ConsistencyCheckTask>> {
        let value = self
            .call(
                "get desired/reported",
                self.store
                    .desired_reported(&task.device_id, task.slot, &task.field.name),
            )
            .await?;

        let desired = match value.pending() {
            Some(desired) => desired.to_string(),
            None => {
                debug!(device_id = %task.device_id, field = %task.field.name, "No need to resend");
                return Ok(None);
            }
        };

        let command = task.resend(codec::encode(&task.field, &desired)?);
        let retry_count = command.retry_count;

        if retry_count <= 1 {
            self.transport.send(command.clone()).await?;
        } else if !self.send_in_window(command.clone()).await? {
            return Ok(None);
        }

        info!(
            device_id = %task.device_id,
            slot = task.slot,
            field = %task.field.name,
            retry_count,
            "Resent config command"
        );
        Ok(Some(ConsistencyCheckTask::for_command(
            &command,
            task.field.clone(),
        )))
    }
}
