//! Contracts of the external services the reconciliation engine relies on.
//!
//! The engine is constructed with handles to these once at startup. Every
//! implementation is shared between concurrent tasks and must be internally
//! synchronized.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::command::{DeviceEvent, DownlinkCommand};
use crate::error::Result;
use crate::schema::{DocType, FieldSchema};
use crate::value::{ConfigField, ConfigFieldValue};

/// Schema and desired/reported value store.
///
/// Reads and writes must be atomic per field; no cross-field transaction is
/// assumed.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Publish a schema for a firmware version. The most recently published
    /// firmware becomes the latest for its document type.
    async fn put_schema(&self, firmware: &str, doc_type: DocType, fields: Vec<FieldSchema>) -> Result<()>;

    /// Get the latest published firmware version.
    async fn latest_firmware(&self, doc_type: DocType) -> Result<String>;

    /// Look up a field by name.
    async fn schema_by_name(&self, name: &str, firmware: &str, doc_type: DocType) -> Result<FieldSchema>;

    /// Look up a field by index.
    async fn schema_by_index(&self, index: u32, firmware: &str, doc_type: DocType) -> Result<FieldSchema>;

    /// Get every field of a schema, ordered by index.
    async fn all_schema(&self, firmware: &str, doc_type: DocType) -> Result<Vec<FieldSchema>>;

    /// Read the desired/reported pair. Unknown devices or fields read as unset.
    async fn desired_reported(&self, device_id: &str, slot: u32, field_name: &str) -> Result<ConfigFieldValue>;

    /// Write the desired value, returning the previous one.
    async fn set_desired(&self, device_id: &str, slot: u32, field: &FieldSchema, value: &str) -> Result<Option<String>>;

    /// Write the reported value.
    async fn set_reported(&self, device_id: &str, slot: u32, field: &FieldSchema, value: &str) -> Result<()>;

    /// Get every field of a device config document, ordered by index.
    async fn device_config(&self, device_id: &str, slot: u32) -> Result<Vec<ConfigField>>;

    /// Rebuild a config document for a schema. Values of fields still in the
    /// schema are kept, new fields start blank and other fields are dropped.
    async fn init_config(&self, device_id: &str, slot: u32, fields: &[FieldSchema]) -> Result<()>;

    /// Devices that have a main config document, sorted.
    async fn device_ids(&self) -> Result<Vec<String>>;

    /// Remove a device config document.
    async fn delete_config(&self, device_id: &str, slot: u32) -> Result<()>;

    /// Devices whose main config has any inconsistent field.
    async fn inconsistent_devices(&self) -> Result<Vec<String>>;

    /// Reserved listen minutes advertised by the device, empty if unknown.
    async fn reserved_minutes(&self, device_id: &str) -> Result<String>;

    /// Allocate the next radio offset.
    async fn next_radio_offset(&self) -> Result<i64>;
}

/// Outbound pub/sub publish. Delivery is not guaranteed.
#[async_trait]
pub trait DownlinkTransport: Send + Sync {
    /// Send a command toward its device.
    async fn send(&self, command: DownlinkCommand) -> Result<()>;
}

/// Connection/liveness registry.
#[async_trait]
pub trait LivenessRegistry: Send + Sync {
    /// Check if the device has a live registration.
    async fn is_registered(&self, device_id: &str) -> Result<bool>;

    /// Minutes since the device was last heard from.
    async fn minutes_since_last_contact(&self, device_id: &str) -> Result<i64>;
}

/// Token validation.
#[async_trait]
pub trait Authorizer: Send + Sync {
    /// Validate a token against the allowed roles, returning the username.
    async fn check_token(&self, token: &str, allowed_roles: &[String]) -> Result<String>;
}

/// Error severity reported to the telemetry sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Warning,
    Severe,
    Fatal,
}

/// Best-effort remote logging. Implementations swallow their own failures.
pub trait TelemetrySink: Send + Sync {
    /// Report an error raised in the named function.
    fn log_error(&self, function: &str, message: &str, severity: Severity);

    /// Record an operator change to a device.
    fn log_device_event(&self, event: &DeviceEvent);
}

/// Telemetry sink that writes to the local tracing subscriber.
#[derive(Debug, Clone, Default)]
pub struct TracingTelemetry;

impl TelemetrySink for TracingTelemetry {
    fn log_error(&self, function: &str, message: &str, severity: Severity) {
        match severity {
            Severity::Info => info!(function = %function, "{}", message),
            Severity::Warning => warn!(function = %function, "{}", message),
            Severity::Severe | Severity::Fatal => {
                error!(function = %function, severity = ?severity, "{}", message)
            }
        }
    }

    fn log_device_event(&self, event: &DeviceEvent) {
        info!(
            user = %event.user,
            device_id = %event.device_id,
            "{}", event.message
        );
    }
}
