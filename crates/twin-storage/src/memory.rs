//! In-memory config store.
//!
//! Used by tests and by tooling that does not need persistence.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use twin_core::{
    ConfigField, ConfigFieldValue, ConfigStore, DocType, FieldSchema, Result as TwinResult,
};

use crate::document::{self, SchemaRecord, StoredDoc};
use crate::error::Error;

#[derive(Default)]
struct State {
    schemas: HashMap<(DocType, String), SchemaRecord>,
    docs: HashMap<(String, u32), StoredDoc>,
    next_order: u64,
}

impl State {
    fn schema(&self, firmware: &str, doc_type: DocType) -> Result<&SchemaRecord, Error> {
        self.schemas
            .get(&(doc_type, firmware.to_string()))
            .ok_or_else(|| Error::NotFound(format!("{} for firmware {}", doc_type, firmware)))
    }
}

/// Config store kept entirely in memory.
#[derive(Default)]
pub struct MemoryConfigStore {
    state: RwLock<State>,
}

impl MemoryConfigStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored config documents.
    pub async fn doc_count(&self) -> usize {
        self.state.read().await.docs.len()
    }
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn put_schema(&self, firmware: &str, doc_type: DocType, fields: Vec<FieldSchema>) -> TwinResult<()> {
        let mut state = self.state.write().await;
        state.next_order += 1;
        let order = state.next_order;
        state
            .schemas
            .insert((doc_type, firmware.to_string()), SchemaRecord { order, fields });
        Ok(())
    }

    async fn latest_firmware(&self, doc_type: DocType) -> TwinResult<String> {
        let state = self.state.read().await;
        state
            .schemas
            .iter()
            .filter(|((t, _), _)| *t == doc_type)
            .max_by_key(|(_, record)| record.order)
            .map(|((_, firmware), _)| firmware.clone())
            .ok_or_else(|| Error::NotFound(format!("no firmware published for {}", doc_type)).into())
    }

    async fn schema_by_name(&self, name: &str, firmware: &str, doc_type: DocType) -> TwinResult<FieldSchema> {
        let state = self.state.read().await;
        Ok(state.schema(firmware, doc_type)?.by_name(name)?)
    }

    async fn schema_by_index(&self, index: u32, firmware: &str, doc_type: DocType) -> TwinResult<FieldSchema> {
        let state = self.state.read().await;
        Ok(state.schema(firmware, doc_type)?.by_index(index)?)
    }

    async fn all_schema(&self, firmware: &str, doc_type: DocType) -> TwinResult<Vec<FieldSchema>> {
        let state = self.state.read().await;
        Ok(state.schema(firmware, doc_type)?.sorted())
    }

    async fn desired_reported(&self, device_id: &str, slot: u32, field_name: &str) -> TwinResult<ConfigFieldValue> {
        let state = self.state.read().await;
        Ok(state
            .docs
            .get(&(device_id.to_string(), slot))
            .map(|doc| document::field_value(doc, field_name))
            .unwrap_or_default())
    }

    async fn set_desired(&self, device_id: &str, slot: u32, field: &FieldSchema, value: &str) -> TwinResult<Option<String>> {
        let mut state = self.state.write().await;
        let doc = state.docs.entry((device_id.to_string(), slot)).or_default();
        Ok(document::set_desired(doc, field, value))
    }

    async fn set_reported(&self, device_id: &str, slot: u32, field: &FieldSchema, value: &str) -> TwinResult<()> {
        let mut state = self.state.write().await;
        let doc = state.docs.entry((device_id.to_string(), slot)).or_default();
        document::set_reported(doc, field, value);
        Ok(())
    }

    async fn device_config(&self, device_id: &str, slot: u32) -> TwinResult<Vec<ConfigField>> {
        let state = self.state.read().await;
        Ok(state
            .docs
            .get(&(device_id.to_string(), slot))
            .map(document::config_fields)
            .unwrap_or_default())
    }

    async fn init_config(&self, device_id: &str, slot: u32, fields: &[FieldSchema]) -> TwinResult<()> {
        let mut state = self.state.write().await;
        let doc = state.docs.entry((device_id.to_string(), slot)).or_default();
        document::init_fields(doc, fields);
        Ok(())
    }

    async fn device_ids(&self) -> TwinResult<Vec<String>> {
        let state = self.state.read().await;
        let mut devices: Vec<String> = state
            .docs
            .keys()
            .filter(|(_, slot)| *slot == 0)
            .map(|(device_id, _)| device_id.clone())
            .collect();
        devices.sort();
        Ok(devices)
    }

    async fn delete_config(&self, device_id: &str, slot: u32) -> TwinResult<()> {
        self.state
            .write()
            .await
            .docs
            .remove(&(device_id.to_string(), slot));
        Ok(())
    }

    async fn inconsistent_devices(&self) -> TwinResult<Vec<String>> {
        let state = self.state.read().await;
        let mut devices: Vec<String> = state
            .docs
            .iter()
            .filter(|((_, slot), doc)| *slot == 0 && document::has_inconsistency(doc))
            .map(|((device_id, _), _)| device_id.clone())
            .collect();
        devices.sort();
        Ok(devices)
    }

    async fn reserved_minutes(&self, device_id: &str) -> TwinResult<String> {
        let state = self.state.read().await;
        Ok(document::reserved_minutes(
            state.docs.get(&(device_id.to_string(), 0)),
        ))
    }

    async fn next_radio_offset(&self) -> TwinResult<i64> {
        let state = self.state.read().await;
        let max = state
            .docs
            .iter()
            .filter(|((_, slot), _)| *slot == 0)
            .filter_map(|(_, doc)| document::radio_offset(doc))
            .max();
        Ok(document::next_radio_offset(max))
    }
}
