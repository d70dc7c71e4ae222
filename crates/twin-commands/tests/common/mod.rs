//! Shared fakes for the engine, sweep and service tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::future::pending;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use twin_commands::{FixedClock, ReconciliationEngine, WindowScheduler};
use twin_core::{
    Authorizer, ConfigField, ConfigFieldValue, ConfigStore, DeviceEvent, DocType, DownlinkCommand,
    DownlinkTransport, Error, FieldSchema, LivenessRegistry, Result, Severity, TelemetrySink,
    ValueType,
};
use twin_storage::MemoryConfigStore;

pub const FIRMWARE: &str = "1.0";

/// Transport that records every command.
#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<DownlinkCommand>>,
}

impl RecordingTransport {
    pub fn sent(&self) -> Vec<DownlinkCommand> {
        self.sent.lock().unwrap().clone()
    }

    pub fn retry_counts(&self) -> Vec<u32> {
        self.sent().iter().map(|c| c.retry_count).collect()
    }
}

#[async_trait]
impl DownlinkTransport for RecordingTransport {
    async fn send(&self, command: DownlinkCommand) -> Result<()> {
        self.sent.lock().unwrap().push(command);
        Ok(())
    }
}

/// Liveness registry with fixed answers. Unknown devices fail, stalled ones never answer.
#[derive(Default)]
pub struct FakeLiveness {
    registered: Mutex<HashSet<String>>,
    minutes: Mutex<HashMap<String, i64>>,
    stalled: Mutex<HashSet<String>>,
}

impl FakeLiveness {
    pub fn register(&self, device_id: &str, minutes: i64) {
        self.registered.lock().unwrap().insert(device_id.to_string());
        self.minutes
            .lock()
            .unwrap()
            .insert(device_id.to_string(), minutes);
    }

    pub fn known_unregistered(&self, device_id: &str, minutes: i64) {
        self.minutes
            .lock()
            .unwrap()
            .insert(device_id.to_string(), minutes);
    }

    pub fn stall(&self, device_id: &str) {
        self.stalled.lock().unwrap().insert(device_id.to_string());
    }

    async fn wait_if_stalled(&self, device_id: &str) {
        let stalled = self.stalled.lock().unwrap().contains(device_id);
        if stalled {
            pending::<()>().await;
        }
    }
}

#[async_trait]
impl LivenessRegistry for FakeLiveness {
    async fn is_registered(&self, device_id: &str) -> Result<bool> {
        self.wait_if_stalled(device_id).await;
        Ok(self.registered.lock().unwrap().contains(device_id))
    }

    async fn minutes_since_last_contact(&self, device_id: &str) -> Result<i64> {
        self.wait_if_stalled(device_id).await;
        self.minutes
            .lock()
            .unwrap()
            .get(device_id)
            .copied()
            .ok_or_else(|| Error::NotFound(format!("no connection for {}", device_id)))
    }
}

/// Telemetry sink that records what it is told.
#[derive(Default)]
pub struct RecordingTelemetry {
    pub errors: Mutex<Vec<(String, String, Severity)>>,
    pub events: Mutex<Vec<DeviceEvent>>,
}

impl RecordingTelemetry {
    pub fn error_count(&self, severity: Severity) -> usize {
        self.errors
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, _, s)| *s == severity)
            .count()
    }

    pub fn event_messages(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.message.clone())
            .collect()
    }
}

impl TelemetrySink for RecordingTelemetry {
    fn log_error(&self, function: &str, message: &str, severity: Severity) {
        self.errors
            .lock()
            .unwrap()
            .push((function.to_string(), message.to_string(), severity));
    }

    fn log_device_event(&self, event: &DeviceEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

/// Authorizer with a fixed token table of `token -> (user, role)`.
#[derive(Default)]
pub struct FakeAuthorizer {
    tokens: HashMap<String, (String, String)>,
}

impl FakeAuthorizer {
    pub fn with(mut self, token: &str, user: &str, role: &str) -> Self {
        self.tokens
            .insert(token.to_string(), (user.to_string(), role.to_string()));
        self
    }
}

#[async_trait]
impl Authorizer for FakeAuthorizer {
    async fn check_token(&self, token: &str, allowed_roles: &[String]) -> Result<String> {
        match self.tokens.get(token) {
            Some((user, role)) if allowed_roles.contains(role) => Ok(user.clone()),
            Some((user, role)) => Err(Error::Unauthorized(format!(
                "{} has role {}",
                user, role
            ))),
            None => Err(Error::Unauthorized("unknown token".to_string())),
        }
    }
}

/// Store whose calls never complete.
pub struct StalledStore;

#[async_trait]
impl ConfigStore for StalledStore {
    async fn put_schema(&self, _: &str, _: DocType, _: Vec<FieldSchema>) -> Result<()> {
        pending().await
    }

    async fn latest_firmware(&self, _: DocType) -> Result<String> {
        pending().await
    }

    async fn schema_by_name(&self, _: &str, _: &str, _: DocType) -> Result<FieldSchema> {
        pending().await
    }

    async fn schema_by_index(&self, _: u32, _: &str, _: DocType) -> Result<FieldSchema> {
        pending().await
    }

    async fn all_schema(&self, _: &str, _: DocType) -> Result<Vec<FieldSchema>> {
        pending().await
    }

    async fn desired_reported(&self, _: &str, _: u32, _: &str) -> Result<ConfigFieldValue> {
        pending().await
    }

    async fn set_desired(&self, _: &str, _: u32, _: &FieldSchema, _: &str) -> Result<Option<String>> {
        pending().await
    }

    async fn set_reported(&self, _: &str, _: u32, _: &FieldSchema, _: &str) -> Result<()> {
        pending().await
    }

    async fn device_config(&self, _: &str, _: u32) -> Result<Vec<ConfigField>> {
        pending().await
    }

    async fn init_config(&self, _: &str, _: u32, _: &[FieldSchema]) -> Result<()> {
        pending().await
    }

    async fn device_ids(&self) -> Result<Vec<String>> {
        pending().await
    }

    async fn delete_config(&self, _: &str, _: u32) -> Result<()> {
        pending().await
    }

    async fn inconsistent_devices(&self) -> Result<Vec<String>> {
        pending().await
    }

    async fn reserved_minutes(&self, _: &str) -> Result<String> {
        pending().await
    }

    async fn next_radio_offset(&self) -> Result<i64> {
        pending().await
    }
}

pub fn main_schema() -> Vec<FieldSchema> {
    vec![
        FieldSchema::new(1, "dlresmin", ValueType::FixedString(4)),
        FieldSchema::new(2, "installd", ValueType::Bool16),
        FieldSchema::new(3, "roffset", ValueType::Int32).with_range(Some(0), Some(3000)),
        FieldSchema::new(4, "txpower", ValueType::Int16).with_range(Some(-10), Some(20)),
    ]
}

pub async fn store_with_schema() -> Arc<MemoryConfigStore> {
    let store = Arc::new(MemoryConfigStore::new());
    store
        .put_schema(FIRMWARE, DocType::Main, main_schema())
        .await
        .unwrap();
    store
}

/// Scheduler whose clock sits at the given minute and second.
pub fn window_at(minute: u32, second: u32) -> WindowScheduler {
    let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, minute, second).unwrap();
    WindowScheduler::new(Arc::new(FixedClock(now)))
}

pub struct Harness {
    pub store: Arc<MemoryConfigStore>,
    pub transport: Arc<RecordingTransport>,
    pub liveness: Arc<FakeLiveness>,
    pub telemetry: Arc<RecordingTelemetry>,
    pub engine: ReconciliationEngine,
}

/// Engine over an in-memory store, with the clock inside the default window.
pub async fn harness() -> Harness {
    harness_with_window(window_at(6, 0)).await
}

pub async fn harness_with_window(window: WindowScheduler) -> Harness {
    let store = store_with_schema().await;
    let transport = Arc::new(RecordingTransport::default());
    let liveness = Arc::new(FakeLiveness::default());
    let telemetry = Arc::new(RecordingTelemetry::default());

    let engine = ReconciliationEngine::builder(store.clone(), transport.clone(), liveness.clone())
        .telemetry(telemetry.clone())
        .window_scheduler(window)
        .build();

    Harness {
        store,
        transport,
        liveness,
        telemetry,
        engine,
    }
}
