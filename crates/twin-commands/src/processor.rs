//! Inbound message dispatch.
//!
//! Routes pub/sub messages by topic: reported config values go to the engine,
//! connection lifecycle notices create or remove config documents.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};
use twin_core::{
    ConfigStore, ConnectionEvent, DocType, Error, Result, Severity, TelemetrySink, UplinkMessage,
};

use crate::engine::{self, ReconciliationEngine, DEFAULT_RPC_TIMEOUT};

/// Topic fragment of reported config values.
pub const UPLINK_TOPIC_MARKER: &str = "uplink/config";

/// Topic fragment of connection lifecycle notices.
pub const CONNECTIONS_TOPIC_MARKER: &str = "connections";

/// Connection lifecycle notice, parsed from its message text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionChange {
    /// Device connection created or pending.
    Created,
    /// Device connection removed.
    Deleted,
    /// Sub-device attached at a slot.
    SlotAdded(u32),
    /// Anything else.
    Other,
}

impl ConnectionChange {
    /// Parse a connection message such as `"Added slot 100"`.
    pub fn parse(message: &str) -> Result<Self> {
        if message.contains("Created pending") || message.contains("Created connection") {
            Ok(Self::Created)
        } else if message.contains("Deleted connection") {
            Ok(Self::Deleted)
        } else if message.contains("Added slot") {
            message
                .split_whitespace()
                .nth(2)
                .and_then(|slot| slot.parse().ok())
                .map(Self::SlotAdded)
                .ok_or_else(|| Error::Decode(format!("no slot number in {:?}", message)))
        } else {
            Ok(Self::Other)
        }
    }
}

/// Dispatches inbound messages.
pub struct MessageProcessor {
    engine: ReconciliationEngine,
    store: Arc<dyn ConfigStore>,
    telemetry: Arc<dyn TelemetrySink>,
    rpc_timeout: Duration,
}

impl MessageProcessor {
    pub fn new(
        engine: ReconciliationEngine,
        store: Arc<dyn ConfigStore>,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Self {
        Self {
            engine,
            store,
            telemetry,
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
        }
    }

    /// Set the deadline for store calls.
    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }

    async fn bounded<T>(&self, what: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        engine::bounded(self.rpc_timeout, what, fut).await
    }

    /// Handle one message. Malformed payloads are reported and rejected.
    pub async fn process(&self, topic: &str, payload: &[u8]) -> Result<()> {
        debug!(topic = %topic, "Processing message");

        if topic.contains(UPLINK_TOPIC_MARKER) {
            let message: UplinkMessage = self.parse(payload)?;
            self.handle_uplink(message).await
        } else if topic.contains(CONNECTIONS_TOPIC_MARKER) {
            let event: ConnectionEvent = self.parse(payload)?;
            self.handle_connection(event).await
        } else {
            debug!(topic = %topic, "Ignoring message on unknown topic");
            Ok(())
        }
    }

    fn parse<T: serde::de::DeserializeOwned>(&self, payload: &[u8]) -> Result<T> {
        serde_json::from_slice(payload).map_err(|e| {
            self.telemetry
                .log_error("process_message", &e.to_string(), Severity::Fatal);
            Error::from(e)
        })
    }

    async fn handle_uplink(&self, message: UplinkMessage) -> Result<()> {
        debug!(
            device_id = %message.device_id,
            index = message.index,
            value = %hex::encode(&message.value),
            "Received config uplink"
        );
        self.engine
            .update_reported(&message.device_id, message.slot, message.index, &message.value)
            .await
            .map(|_| ())
    }

    async fn handle_connection(&self, event: ConnectionEvent) -> Result<()> {
        info!(device_id = %event.device_id, "{}", event.message);

        let change = ConnectionChange::parse(&event.message).inspect_err(|e| {
            self.telemetry
                .log_error("process_message", &e.to_string(), Severity::Fatal);
        })?;

        match change {
            ConnectionChange::Created => self.init_config(&event.device_id, 0).await,
            ConnectionChange::Deleted => {
                self.bounded("delete config", self.store.delete_config(&event.device_id, 0))
                    .await
            }
            ConnectionChange::SlotAdded(slot) => {
                self.init_config(&event.device_id, slot)
                    .await
                    .inspect_err(|e| {
                        self.telemetry
                            .log_error("process_message", &e.to_string(), Severity::Fatal);
                    })
            }
            ConnectionChange::Other => Ok(()),
        }
    }

    /// Rebuild the document for the latest schema of the slot's document type.
    async fn init_config(&self, device_id: &str, slot: u32) -> Result<()> {
        let doc_type = DocType::for_slot(slot);
        let firmware = self
            .bounded("get latest firmware", self.store.latest_firmware(doc_type))
            .await?;
        let fields = self
            .bounded("get schema", self.store.all_schema(&firmware, doc_type))
            .await?;
        self.bounded("init config", self.store.init_config(device_id, slot, &fields))
            .await?;
        info!(device_id = %device_id, slot, firmware = %firmware, fields = fields.len(), "Initialised config");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_connection_change() {
        assert_eq!(
            ConnectionChange::parse("Created pending connection").unwrap(),
            ConnectionChange::Created
        );
        assert_eq!(
            ConnectionChange::parse("Created connection").unwrap(),
            ConnectionChange::Created
        );
        assert_eq!(
            ConnectionChange::parse("Deleted connection").unwrap(),
            ConnectionChange::Deleted
        );
        assert_eq!(
            ConnectionChange::parse("Added slot 100").unwrap(),
            ConnectionChange::SlotAdded(100)
        );
        assert_eq!(
            ConnectionChange::parse("Updated connection").unwrap(),
            ConnectionChange::Other
        );
        assert!(ConnectionChange::parse("Added slot x").is_err());
    }
}
