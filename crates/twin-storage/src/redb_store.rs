//! Persistent config store backed by redb.
//!
//! Layout:
//! - `schemas`: `"<doc_type>/<firmware>"` → JSON [`SchemaRecord`]
//! - `configs`: `"<device_id>/<slot>"` → JSON [`StoredDoc`]
//! - `meta`: counters
//!
//! Every mutation of a document runs as a read-modify-write inside one write
//! transaction, so concurrent updates to the same document are serialized.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use redb::{Database, ReadableTable, TableDefinition};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};
use twin_core::{
    ConfigField, ConfigFieldValue, ConfigStore, DocType, FieldSchema, Result as TwinResult,
};

use crate::document::{self, SchemaRecord, StoredDoc};
use crate::error::{Error, Result};

type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

const SCHEMAS_TABLE: JsonTable = TableDefinition::new("schemas");
const CONFIGS_TABLE: JsonTable = TableDefinition::new("configs");
const META_TABLE: TableDefinition<&str, u64> = TableDefinition::new("meta");

const SCHEMA_ORDER_KEY: &str = "schema_order";

fn schema_key(firmware: &str, doc_type: DocType) -> String {
    format!("{}/{}", doc_type.as_str(), firmware)
}

/// redb-backed config store.
#[derive(Clone)]
pub struct RedbConfigStore {
    db: Arc<Database>,
    path: PathBuf,
}

impl RedbConfigStore {
    /// Open or create a store at the given path, creating parent directories.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let db = if path.exists() {
            Database::open(path)?
        } else {
            Database::create(path)?
        };

        // Make sure every table exists so that read transactions can open them
        let txn = db.begin_write()?;
        {
            txn.open_table(SCHEMAS_TABLE)?;
            txn.open_table(CONFIGS_TABLE)?;
            txn.open_table(META_TABLE)?;
        }
        txn.commit()?;

        info!(category = "storage", "Opened config store at {}", path.display());

        Ok(Self {
            db: Arc::new(db),
            path: path.to_path_buf(),
        })
    }

    /// Get the storage path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run a blocking database operation off the async runtime.
    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Database) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(&db)).await?
    }
}

fn read_json<T: DeserializeOwned>(
    db: &Database,
    table: JsonTable,
    key: &str,
) -> Result<Option<T>> {
    let txn = db.begin_read()?;
    let t = txn.open_table(table)?;
    match t.get(key)? {
        Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
        None => Ok(None),
    }
}

fn scan_json<T: DeserializeOwned>(
    db: &Database,
    table: JsonTable,
) -> Result<Vec<(String, T)>> {
    let txn = db.begin_read()?;
    let t = txn.open_table(table)?;

    let mut results = Vec::new();
    for item in t.iter()? {
        let (key, value) = item?;
        results.push((key.value().to_string(), serde_json::from_slice(value.value())?));
    }
    Ok(results)
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

/// Apply a change to one config document in a single write transaction.
fn update_doc<R, F>(db: &Database, key: &str, change: F) -> Result<R>
where
    F: FnOnce(&mut StoredDoc) -> R,
{
    let txn = db.begin_write()?;
    let result = {
        let mut t = txn.open_table(CONFIGS_TABLE)?;
        let existing = t.get(key)?.map(|v| v.value().to_vec());
        let mut doc: StoredDoc = match existing {
            Some(bytes) => serde_json::from_slice(&bytes)?,
            None => StoredDoc::new(),
        };
        let result = change(&mut doc);
        let bytes = encode(&doc)?;
        t.insert(key, bytes.as_slice())?;
        result
    };
    txn.commit()?;
    Ok(result)
}

fn load_schema(db: &Database, firmware: &str, doc_type: DocType) -> Result<SchemaRecord> {
    read_json(db, SCHEMAS_TABLE, &schema_key(firmware, doc_type))?
        .ok_or_else(|| Error::NotFound(format!("{} for firmware {}", doc_type, firmware)))
}

#[async_trait]
impl ConfigStore for RedbConfigStore {
    async fn put_schema(&self, firmware: &str, doc_type: DocType, fields: Vec<FieldSchema>) -> TwinResult<()> {
        let key = schema_key(firmware, doc_type);
        let order = self
            .blocking(move |db| {
                let txn = db.begin_write()?;
                let order = {
                    let mut meta = txn.open_table(META_TABLE)?;
                    let order = meta.get(SCHEMA_ORDER_KEY)?.map(|v| v.value()).unwrap_or(0) + 1;
                    meta.insert(SCHEMA_ORDER_KEY, order)?;

                    let bytes = encode(&SchemaRecord { order, fields })?;
                    let mut schemas = txn.open_table(SCHEMAS_TABLE)?;
                    schemas.insert(key.as_str(), bytes.as_slice())?;
                    order
                };
                txn.commit()?;
                Ok(order)
            })
            .await?;
        debug!(category = "storage", firmware = %firmware, doc_type = %doc_type, order, "Published schema");
        Ok(())
    }

    async fn latest_firmware(&self, doc_type: DocType) -> TwinResult<String> {
        let prefix = format!("{}/", doc_type.as_str());
        let latest = self
            .blocking(move |db| {
                let records: Vec<(String, SchemaRecord)> = scan_json(db, SCHEMAS_TABLE)?;
                Ok(records
                    .into_iter()
                    .filter_map(|(key, record)| {
                        key.strip_prefix(&prefix).map(|fw| (fw.to_string(), record.order))
                    })
                    .max_by_key(|(_, order)| *order)
                    .map(|(firmware, _)| firmware))
            })
            .await?;
        latest.ok_or_else(|| twin_core::Error::NotFound(format!("no firmware published for {}", doc_type)))
    }

    async fn schema_by_name(&self, name: &str, firmware: &str, doc_type: DocType) -> TwinResult<FieldSchema> {
        let (name, firmware) = (name.to_string(), firmware.to_string());
        Ok(self
            .blocking(move |db| load_schema(db, &firmware, doc_type)?.by_name(&name))
            .await?)
    }

    async fn schema_by_index(&self, index: u32, firmware: &str, doc_type: DocType) -> TwinResult<FieldSchema> {
        let firmware = firmware.to_string();
        Ok(self
            .blocking(move |db| load_schema(db, &firmware, doc_type)?.by_index(index))
            .await?)
    }

    async fn all_schema(&self, firmware: &str, doc_type: DocType) -> TwinResult<Vec<FieldSchema>> {
        let firmware = firmware.to_string();
        Ok(self
            .blocking(move |db| Ok(load_schema(db, &firmware, doc_type)?.sorted()))
            .await?)
    }

    async fn desired_reported(&self, device_id: &str, slot: u32, field_name: &str) -> TwinResult<ConfigFieldValue> {
        let key = document::doc_key(device_id, slot);
        let field_name = field_name.to_string();
        Ok(self
            .blocking(move |db| {
                let doc: Option<StoredDoc> = read_json(db, CONFIGS_TABLE, &key)?;
                Ok(doc
                    .map(|d| document::field_value(&d, &field_name))
                    .unwrap_or_default())
            })
            .await?)
    }

    async fn set_desired(&self, device_id: &str, slot: u32, field: &FieldSchema, value: &str) -> TwinResult<Option<String>> {
        let key = document::doc_key(device_id, slot);
        let (field, value) = (field.clone(), value.to_string());
        Ok(self
            .blocking(move |db| update_doc(db, &key, |doc| document::set_desired(doc, &field, &value)))
            .await?)
    }

    async fn set_reported(&self, device_id: &str, slot: u32, field: &FieldSchema, value: &str) -> TwinResult<()> {
        let key = document::doc_key(device_id, slot);
        let (field, value) = (field.clone(), value.to_string());
        Ok(self
            .blocking(move |db| update_doc(db, &key, |doc| document::set_reported(doc, &field, &value)))
            .await?)
    }

    async fn device_config(&self, device_id: &str, slot: u32) -> TwinResult<Vec<ConfigField>> {
        let key = document::doc_key(device_id, slot);
        Ok(self
            .blocking(move |db| {
                let doc: Option<StoredDoc> = read_json(db, CONFIGS_TABLE, &key)?;
                Ok(doc.map(|d| document::config_fields(&d)).unwrap_or_default())
            })
            .await?)
    }

    async fn init_config(&self, device_id: &str, slot: u32, fields: &[FieldSchema]) -> TwinResult<()> {
        let key = document::doc_key(device_id, slot);
        let fields = fields.to_vec();
        Ok(self
            .blocking(move |db| update_doc(db, &key, |doc| document::init_fields(doc, &fields)))
            .await?)
    }

    async fn device_ids(&self) -> TwinResult<Vec<String>> {
        Ok(self
            .blocking(|db| {
                let txn = db.begin_read()?;
                let t = txn.open_table(CONFIGS_TABLE)?;

                let mut devices = Vec::new();
                for item in t.iter()? {
                    let (key, _) = item?;
                    if let Some((device_id, 0)) = document::parse_doc_key(key.value()) {
                        devices.push(device_id.to_string());
                    }
                }
                devices.sort();
                Ok(devices)
            })
            .await?)
    }

    async fn delete_config(&self, device_id: &str, slot: u32) -> TwinResult<()> {
        let key = document::doc_key(device_id, slot);
        Ok(self
            .blocking(move |db| {
                let txn = db.begin_write()?;
                {
                    let mut t = txn.open_table(CONFIGS_TABLE)?;
                    t.remove(key.as_str())?;
                }
                txn.commit()?;
                Ok(())
            })
            .await?)
    }

    async fn inconsistent_devices(&self) -> TwinResult<Vec<String>> {
        Ok(self
            .blocking(|db| {
                let docs: Vec<(String, StoredDoc)> = scan_json(db, CONFIGS_TABLE)?;
                Ok(docs
                    .iter()
                    .filter_map(|(key, doc)| {
                        let (device_id, slot) = document::parse_doc_key(key)?;
                        (slot == 0 && document::has_inconsistency(doc)).then(|| device_id.to_string())
                    })
                    .collect())
            })
            .await?)
    }

    async fn reserved_minutes(&self, device_id: &str) -> TwinResult<String> {
        let key = document::doc_key(device_id, 0);
        Ok(self
            .blocking(move |db| {
                let doc: Option<StoredDoc> = read_json(db, CONFIGS_TABLE, &key)?;
                Ok(document::reserved_minutes(doc.as_ref()))
            })
            .await?)
    }

    async fn next_radio_offset(&self) -> TwinResult<i64> {
        let max = self
            .blocking(|db| {
                let docs: Vec<(String, StoredDoc)> = scan_json(db, CONFIGS_TABLE)?;
                Ok(docs
                    .iter()
                    .filter(|(key, _)| matches!(document::parse_doc_key(key), Some((_, 0))))
                    .filter_map(|(_, doc)| document::radio_offset(doc))
                    .max())
            })
            .await?;
        Ok(document::next_radio_offset(max))
    }
}
