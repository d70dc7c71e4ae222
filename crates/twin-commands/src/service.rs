//! Role-checked operator facade over the engine and store.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use twin_core::config::RoleConfig;
use twin_core::{
    Authorizer, ConfigDoc, ConfigField, ConfigStore, DocType, Error, FieldSchema, Result,
    ValidationError,
};

use crate::engine::{self, ReconciliationEngine, SetDesiredOutcome, SetDesiredRequest, DEFAULT_RPC_TIMEOUT};

/// Field that holds the radio offset.
pub const RADIO_OFFSET_FIELD: &str = "roffset";

/// Pause between devices during a fleet firmware update.
pub const FIRMWARE_UPDATE_STAGGER: Duration = Duration::from_millis(200);

/// Operator-facing config service.
pub struct ConfigService {
    engine: ReconciliationEngine,
    store: Arc<dyn ConfigStore>,
    authorizer: Arc<dyn Authorizer>,
    roles: RoleConfig,
    rpc_timeout: Duration,
}

impl ConfigService {
    /// Create a new config service.
    pub fn new(
        engine: ReconciliationEngine,
        store: Arc<dyn ConfigStore>,
        authorizer: Arc<dyn Authorizer>,
        roles: RoleConfig,
    ) -> Self {
        Self {
            engine,
            store,
            authorizer,
            roles,
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
        }
    }

    /// Set the deadline for auth and store calls.
    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }

    /// Get the engine.
    pub fn engine(&self) -> &ReconciliationEngine {
        &self.engine
    }

    async fn authorize(&self, token: &str, roles: &[String]) -> Result<String> {
        self.bounded("check token", self.authorizer.check_token(token, roles))
            .await
    }

    async fn bounded<T>(&self, what: &str, fut: impl std::future::Future<Output = Result<T>>) -> Result<T> {
        engine::bounded(self.rpc_timeout, what, fut).await
    }

    async fn latest_schema_field(&self, doc_type: DocType, name: Option<&str>, index: Option<u32>) -> Result<(String, FieldSchema)> {
        let firmware = self
            .bounded("get latest firmware", self.store.latest_firmware(doc_type))
            .await?;
        let field = match (name, index) {
            (Some(name), _) => {
                self.bounded(
                    "get schema by name",
                    self.store.schema_by_name(name, &firmware, doc_type),
                )
                .await?
            }
            (None, Some(index)) => {
                self.bounded(
                    "get schema by index",
                    self.store.schema_by_index(index, &firmware, doc_type),
                )
                .await?
            }
            (None, None) => return Err(ValidationError::MissingFieldName.into()),
        };
        Ok((firmware, field))
    }

    /// Change a desired value as the token's user.
    pub async fn set_desired(&self, token: &str, request: SetDesiredRequest) -> Result<SetDesiredOutcome> {
        let user = self.authorize(token, &self.roles.operators()).await?;
        info!(user = %user, device_id = %request.device_id, field = %request.field_name, "Setting config");
        self.engine.set_desired(&user, request).await
    }

    /// Give a device the next free radio offset.
    pub async fn assign_radio_offset(&self, token: &str, device_id: &str) -> Result<(i64, SetDesiredOutcome)> {
        self.authorize(token, &self.roles.operators()).await?;
        let offset = self
            .bounded("get next radio offset", self.store.next_radio_offset())
            .await?;

        let request = SetDesiredRequest::new(device_id, 0, RADIO_OFFSET_FIELD, offset.to_string());
        let outcome = self.set_desired(token, request).await?;
        Ok((offset, outcome))
    }

    /// Read one field by name.
    pub async fn get_config_by_name(&self, token: &str, device_id: &str, slot: u32, field_name: &str) -> Result<ConfigField> {
        self.authorize(token, &self.roles.operators()).await?;
        if field_name.trim().is_empty() {
            return Err(ValidationError::MissingFieldName.into());
        }
        let (_, field) = self
            .latest_schema_field(DocType::for_slot(slot), Some(field_name), None)
            .await?;
        self.read_field(device_id, slot, field).await
    }

    /// Read one field by index.
    pub async fn get_config_by_index(&self, token: &str, device_id: &str, slot: u32, index: u32) -> Result<ConfigField> {
        self.authorize(token, &self.roles.operators()).await?;
        let (_, field) = self
            .latest_schema_field(DocType::for_slot(slot), None, Some(index))
            .await?;
        self.read_field(device_id, slot, field).await
    }

    async fn read_field(&self, device_id: &str, slot: u32, field: FieldSchema) -> Result<ConfigField> {
        let value = self
            .bounded(
                "get desired/reported",
                self.store.desired_reported(device_id, slot, &field.name),
            )
            .await?;
        Ok(ConfigField {
            index: field.index,
            name: field.name,
            desired: value.desired,
            reported: value.reported,
        })
    }

    /// Read a whole config document.
    pub async fn get_device_config(&self, token: &str, device_id: &str, slot: u32) -> Result<Vec<ConfigField>> {
        self.authorize(token, &self.roles.operators()).await?;
        if device_id.trim().is_empty() {
            return Err(ValidationError::MissingIdentifier.into());
        }
        self.bounded("get device config", self.store.device_config(device_id, slot))
            .await
    }

    /// Build a blank document for the latest schema.
    pub async fn new_config_doc(&self, token: &str, device_id: &str, slot: u32) -> Result<ConfigDoc> {
        self.authorize(token, &self.roles.managers()).await?;
        if device_id.trim().is_empty() {
            return Err(ValidationError::MissingIdentifier.into());
        }

        let doc_type = DocType::for_slot(slot);
        let firmware = self
            .bounded("get latest firmware", self.store.latest_firmware(doc_type))
            .await?;
        let fields = self
            .bounded("get schema", self.store.all_schema(&firmware, doc_type))
            .await?;

        let mut doc = ConfigDoc::default();
        for field in fields {
            doc.desired.insert(field.name.clone(), String::new());
            doc.reported.insert(field.name, String::new());
        }
        Ok(doc)
    }

    /// Move every device's main config to the latest main firmware.
    ///
    /// Values of fields the new schema still has are kept, other fields are
    /// dropped. A device that fails to update is logged and skipped. Returns
    /// the number of devices updated.
    pub async fn update_firmware_all_devices(&self, token: &str) -> Result<usize> {
        let user = self.authorize(token, &self.roles.managers()).await?;

        let devices = self
            .bounded("get devices", self.store.device_ids())
            .await?;
        if devices.is_empty() {
            return Err(Error::NotFound("no devices found to update".to_string()));
        }

        let firmware = self
            .bounded("get latest firmware", self.store.latest_firmware(DocType::Main))
            .await?;
        let fields = self
            .bounded("get schema", self.store.all_schema(&firmware, DocType::Main))
            .await?;
        info!(user = %user, firmware = %firmware, devices = devices.len(), "Updating firmware");

        let mut updated = 0;
        for device_id in &devices {
            match self
                .bounded("init config", self.store.init_config(device_id, 0, &fields))
                .await
            {
                Ok(()) => updated += 1,
                Err(e) => warn!(device_id = %device_id, "Failed to update config to new firmware: {}", e),
            }
            tokio::time::sleep(FIRMWARE_UPDATE_STAGGER).await;
        }
        Ok(updated)
    }

    /// Start a check chain for a field at the given retry count.
    pub async fn check_consistency(&self, device_id: &str, slot: u32, field_index: u32, retry_count: u32) -> Result<()> {
        if device_id.trim().is_empty() {
            return Err(ValidationError::MissingIdentifier.into());
        }
        self.engine
            .schedule_check(device_id, slot, field_index, retry_count)
            .await
    }
}
