//! Persistent config store tests.

use serde_json::json;
use tempfile::TempDir;
use twin_core::{ConfigStore, DocType, FieldSchema, ValueType};
use twin_storage::RedbConfigStore;

fn main_schema() -> Vec<FieldSchema> {
    vec![
        FieldSchema::new(3, "roffset", ValueType::Int32).with_range(Some(0), Some(3000)),
        FieldSchema::new(5, "installd", ValueType::Bool16),
        FieldSchema::new(9, "dlresmin", ValueType::FixedString(8)),
    ]
}

fn open_store() -> (TempDir, RedbConfigStore) {
    let dir = tempfile::tempdir().unwrap();
    let store = RedbConfigStore::open(dir.path().join("data").join("twin.redb")).unwrap();
    (dir, store)
}

#[tokio::test]
async fn test_schema_lookup_and_latest_firmware() {
    let (_dir, store) = open_store();
    store.put_schema("1.0", DocType::Main, main_schema()).await.unwrap();
    store.put_schema("1.1", DocType::Main, main_schema()).await.unwrap();

    assert_eq!(store.latest_firmware(DocType::Main).await.unwrap(), "1.1");
    assert!(store.latest_firmware(DocType::Slot).await.is_err());

    let by_name = store.schema_by_name("installd", "1.0", DocType::Main).await.unwrap();
    assert_eq!(by_name.index, 5);
    let by_index = store.schema_by_index(3, "1.0", DocType::Main).await.unwrap();
    assert_eq!(by_index.name, "roffset");
    assert_eq!(by_index.max, Some(3000));

    let all = store.all_schema("1.1", DocType::Main).await.unwrap();
    assert_eq!(all.iter().map(|f| f.index).collect::<Vec<_>>(), vec![3, 5, 9]);
}

#[tokio::test]
async fn test_schema_accepts_untyped_layout() {
    let (_dir, store) = open_store();
    let fields: Vec<FieldSchema> = serde_json::from_value(json!([
        { "i": 1, "n": "name", "t": "16", "b": "", "c": "" },
        { "i": 2, "n": "interval", "t": "t", "b": "10", "c": 600 }
    ]))
    .unwrap();
    store.put_schema("2.0", DocType::Slot, fields).await.unwrap();

    let name = store.schema_by_name("name", "2.0", DocType::Slot).await.unwrap();
    assert_eq!(name.value_type, ValueType::FixedString(16));
    let interval = store.schema_by_index(2, "2.0", DocType::Slot).await.unwrap();
    assert_eq!((interval.min, interval.max), (Some(10), Some(600)));
}

#[tokio::test]
async fn test_desired_reported_roundtrip() {
    let (_dir, store) = open_store();
    let roffset = &main_schema()[0];

    let unset = store.desired_reported("dev-1", 0, "roffset").await.unwrap();
    assert_eq!((unset.desired, unset.reported), (None, None));

    assert_eq!(store.set_desired("dev-1", 0, roffset, "2500").await.unwrap(), None);
    let value = store.desired_reported("dev-1", 0, "roffset").await.unwrap();
    assert!(value.is_inconsistent());

    store.set_reported("dev-1", 0, roffset, "2500").await.unwrap();
    let value = store.desired_reported("dev-1", 0, "roffset").await.unwrap();
    assert!(!value.is_inconsistent());

    let previous = store.set_desired("dev-1", 0, roffset, "2510").await.unwrap();
    assert_eq!(previous.as_deref(), Some("2500"));
}

#[tokio::test]
async fn test_init_and_delete_config() {
    let (_dir, store) = open_store();
    let schema = main_schema();
    store.set_reported("dev-1", 0, &schema[0], "120").await.unwrap();
    store.init_config("dev-1", 0, &schema).await.unwrap();

    let fields = store.device_config("dev-1", 0).await.unwrap();
    assert_eq!(fields.len(), 3);
    assert_eq!(fields[0].name, "roffset");
    assert_eq!(fields[0].reported.as_deref(), Some("120"));
    assert_eq!(fields[1].desired, None);

    store.delete_config("dev-1", 0).await.unwrap();
    assert!(store.device_config("dev-1", 0).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_reinit_replaces_document_for_new_schema() {
    let (_dir, store) = open_store();
    let schema = main_schema();
    let stale = FieldSchema::new(12, "oldf", ValueType::Int16);
    store.set_desired("dev-1", 0, &stale, "3").await.unwrap();
    store.set_desired("dev-1", 0, &schema[0], "2500").await.unwrap();
    store.set_reported("dev-1", 0, &schema[0], "2500").await.unwrap();
    store.init_config("dev-2", 0, &schema).await.unwrap();
    store.init_config("dev-3", 100, &schema).await.unwrap();
    assert_eq!(store.inconsistent_devices().await.unwrap(), vec!["dev-1"]);

    store.init_config("dev-1", 0, &schema).await.unwrap();

    let fields = store.device_config("dev-1", 0).await.unwrap();
    let names: Vec<&str> = fields.iter().map(|f| f.name.as_str()).collect();
    assert!(!names.contains(&"oldf"));
    assert_eq!(fields.len(), schema.len());
    assert_eq!(fields[0].desired.as_deref(), Some("2500"));
    assert!(store.inconsistent_devices().await.unwrap().is_empty());
    assert_eq!(store.device_ids().await.unwrap(), vec!["dev-1", "dev-2"]);
}

#[tokio::test]
async fn test_inconsistent_devices_and_reserved_minutes() {
    let (_dir, store) = open_store();
    let schema = main_schema();
    store.set_desired("dev-a", 0, &schema[1], "1").await.unwrap();
    store.set_desired("dev-b", 7, &schema[1], "1").await.unwrap();
    store.set_reported("dev-c", 0, &schema[2], "2,4").await.unwrap();

    assert_eq!(store.inconsistent_devices().await.unwrap(), vec!["dev-a"]);
    assert_eq!(store.reserved_minutes("dev-c").await.unwrap(), "2,4");
    assert_eq!(store.reserved_minutes("dev-a").await.unwrap(), "");
}

#[tokio::test]
async fn test_reopen_keeps_data() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("twin.redb");
    {
        let store = RedbConfigStore::open(&path).unwrap();
        store.put_schema("1.0", DocType::Main, main_schema()).await.unwrap();
        store.set_desired("dev-1", 0, &main_schema()[0], "40").await.unwrap();
    }

    let store = RedbConfigStore::open(&path).unwrap();
    assert_eq!(store.latest_firmware(DocType::Main).await.unwrap(), "1.0");
    assert_eq!(store.next_radio_offset().await.unwrap(), 50);

    store.put_schema("0.9", DocType::Main, main_schema()).await.unwrap();
    assert_eq!(store.latest_firmware(DocType::Main).await.unwrap(), "0.9");
}
