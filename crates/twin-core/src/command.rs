//! Downlink command and scheduled check structures.
//!
//! Defines the transient units of work moved between the engine, the transmit
//! queue and the pub/sub bridge. None of these are persisted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::schema::FieldSchema;
use crate::DeviceId;

/// A config value ready to transmit to a device.
///
/// A new command is built on every send attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownlinkCommand {
    /// Target device ID
    pub device_id: DeviceId,
    /// Sub-device slot (0 = main device)
    pub slot: u32,
    /// Schema index of the field
    pub field_index: u32,
    /// Firmware version the payload was encoded for
    pub firmware: String,
    /// Send attempt number, 0 for the first send
    pub retry_count: u32,
    /// Encoded field value
    #[serde(with = "hex_bytes")]
    pub payload: Vec<u8>,
}

impl DownlinkCommand {
    /// Create a new command.
    pub fn new(
        device_id: impl Into<DeviceId>,
        slot: u32,
        field_index: u32,
        firmware: impl Into<String>,
        retry_count: u32,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            slot,
            field_index,
            firmware: firmware.into(),
            retry_count,
            payload,
        }
    }
}

/// A future convergence check for one field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsistencyCheckTask {
    /// Device ID
    pub device_id: DeviceId,
    /// Sub-device slot
    pub slot: u32,
    /// Schema of the field to check
    pub field: FieldSchema,
    /// Firmware version the field schema belongs to
    pub firmware: String,
    /// Retry count of the command this check follows
    pub retry_count: u32,
}

impl ConsistencyCheckTask {
    /// Create a check for the command just sent.
    pub fn for_command(command: &DownlinkCommand, field: FieldSchema) -> Self {
        Self {
            device_id: command.device_id.clone(),
            slot: command.slot,
            field,
            firmware: command.firmware.clone(),
            retry_count: command.retry_count,
        }
    }

    /// Build the resend command for this check.
    pub fn resend(&self, payload: Vec<u8>) -> DownlinkCommand {
        DownlinkCommand::new(
            self.device_id.clone(),
            self.slot,
            self.field.index,
            self.firmware.clone(),
            self.retry_count + 1,
            payload,
        )
    }
}

/// Reported value received from a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UplinkMessage {
    /// Device ID
    pub device_id: DeviceId,
    /// Sub-device slot
    #[serde(default)]
    pub slot: u32,
    /// Schema index of the field
    pub index: u32,
    /// Encoded field value
    #[serde(with = "hex_bytes")]
    pub value: Vec<u8>,
}

/// Connection lifecycle notice published by the connection registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionEvent {
    /// Device ID
    pub device_id: DeviceId,
    /// Free-form message, e.g. "Created connection" or "Added slot 100"
    pub message: String,
}

/// Audit record of an operator change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceEvent {
    /// User who made the change
    pub user: String,
    /// Device ID
    pub device_id: DeviceId,
    /// Description of the change
    pub message: String,
    /// When the change was made
    pub timestamp: DateTime<Utc>,
}

impl DeviceEvent {
    /// Create an event stamped now.
    pub fn new(user: impl Into<String>, device_id: impl Into<DeviceId>, message: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            device_id: device_id.into(),
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Byte payloads travel as hex strings in JSON.
mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}
