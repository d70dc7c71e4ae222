//! Stored document layout shared by the store backends.
//!
//! A device config document maps field names to their index and the raw
//! desired/reported JSON values. Values are kept untyped so that documents
//! written by other tools (numbers, booleans) still read back as display
//! strings.

use std::collections::BTreeMap;

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use twin_core::{format_value, ConfigField, ConfigFieldValue, FieldSchema};

use crate::error::{Error, Result};

/// Field carrying the reserved listen minutes reported by a device.
pub const RESERVED_MINUTES_FIELD: &str = "dlresmin";

/// Field carrying the radio offset.
pub const RADIO_OFFSET_FIELD: &str = "roffset";

/// Spacing between consecutive radio offsets.
const RADIO_OFFSET_STEP: i64 = 10;

/// Radio offsets stay below this value.
const RADIO_OFFSET_LIMIT: i64 = 2800;

/// One stored field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoredField {
    pub index: u32,
    #[serde(default)]
    pub desired: Value,
    #[serde(default)]
    pub reported: Value,
}

impl StoredField {
    fn blank(index: u32) -> Self {
        Self {
            index,
            desired: Value::Null,
            reported: Value::Null,
        }
    }

    fn value(&self) -> ConfigFieldValue {
        ConfigFieldValue::new(text(&self.desired), text(&self.reported))
    }
}

/// Device config document keyed by field name.
pub type StoredDoc = BTreeMap<String, StoredField>;

/// Published schema with its publication order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaRecord {
    pub order: u64,
    pub fields: Vec<FieldSchema>,
}

impl SchemaRecord {
    pub fn by_name(&self, name: &str) -> Result<FieldSchema> {
        self.fields
            .iter()
            .find(|f| f.name == name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("field {}", name)))
    }

    pub fn by_index(&self, index: u32) -> Result<FieldSchema> {
        self.fields
            .iter()
            .find(|f| f.index == index)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("field index {}", index)))
    }

    pub fn sorted(&self) -> Vec<FieldSchema> {
        let mut fields = self.fields.clone();
        fields.sort_by_key(|f| f.index);
        fields
    }
}

/// Key of a device config document.
pub fn doc_key(device_id: &str, slot: u32) -> String {
    format!("{}/{}", device_id, slot)
}

/// Split a document key into device ID and slot.
pub fn parse_doc_key(key: &str) -> Option<(&str, u32)> {
    let (device_id, slot) = key.rsplit_once('/')?;
    Some((device_id, slot.parse().ok()?))
}

/// Display string of a stored value; null is unset.
fn text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        other => Some(format_value(other)),
    }
}

pub fn field_value(doc: &StoredDoc, name: &str) -> ConfigFieldValue {
    doc.get(name).map(StoredField::value).unwrap_or_default()
}

/// Write the desired value, returning the previous one.
pub fn set_desired(doc: &mut StoredDoc, field: &FieldSchema, value: &str) -> Option<String> {
    let entry = doc
        .entry(field.name.clone())
        .or_insert_with(|| StoredField::blank(field.index));
    entry.index = field.index;
    let previous = text(&entry.desired);
    entry.desired = Value::String(value.to_string());
    previous
}

pub fn set_reported(doc: &mut StoredDoc, field: &FieldSchema, value: &str) {
    let entry = doc
        .entry(field.name.clone())
        .or_insert_with(|| StoredField::blank(field.index));
    entry.index = field.index;
    entry.reported = Value::String(value.to_string());
}

/// Rebuild a document for a schema, carrying over values of fields it still has.
pub fn init_fields(doc: &mut StoredDoc, fields: &[FieldSchema]) {
    let mut old = std::mem::take(doc);
    for field in fields {
        let mut entry = old
            .remove(&field.name)
            .unwrap_or_else(|| StoredField::blank(field.index));
        entry.index = field.index;
        doc.insert(field.name.clone(), entry);
    }
}

/// Fields ordered by index.
pub fn config_fields(doc: &StoredDoc) -> Vec<ConfigField> {
    let mut fields: Vec<ConfigField> = doc
        .iter()
        .map(|(name, stored)| ConfigField {
            index: stored.index,
            name: name.clone(),
            desired: text(&stored.desired),
            reported: text(&stored.reported),
        })
        .collect();
    fields.sort_by_key(|f| f.index);
    fields
}

pub fn has_inconsistency(doc: &StoredDoc) -> bool {
    doc.values().any(|f| f.value().is_inconsistent())
}

pub fn reserved_minutes(doc: Option<&StoredDoc>) -> String {
    doc.and_then(|d| d.get(RESERVED_MINUTES_FIELD))
        .and_then(|f| text(&f.reported))
        .unwrap_or_default()
}

/// Desired radio offset of a document, if one is assigned.
pub fn radio_offset(doc: &StoredDoc) -> Option<i64> {
    doc.get(RADIO_OFFSET_FIELD)
        .and_then(|f| text(&f.desired))
        .and_then(|v| v.trim().parse().ok())
}

/// Offset following the largest one in use.
pub fn next_radio_offset(max_in_use: Option<i64>) -> i64 {
    match max_in_use.map(|max| max + RADIO_OFFSET_STEP) {
        Some(next) if (0..RADIO_OFFSET_LIMIT).contains(&next) => next,
        _ => rand::thread_rng().gen_range(0..RADIO_OFFSET_LIMIT),
    }
}
