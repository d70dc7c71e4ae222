//! Service configuration.
//!
//! Sources, lowest priority first:
//! 1. Built-in defaults
//! 2. TOML file (`--config` path, or `devicetwin.toml` in the working directory)
//! 3. Environment variables

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{info, warn};

use crate::error::{Error, Result};

/// Default config file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "devicetwin.toml";

/// Default values.
pub mod defaults {
    /// Seconds before the first, second-to-third and remaining general checks.
    pub const REPEAT_CHECK_SCHEDULE: &str = "25_540_3420";
    /// Field that gets the fast control retry schedule.
    pub const CONTROL_FIELD: &str = "installd";
    /// Minutes between fleet sweeps (24h).
    pub const SWEEP_INTERVAL_MINS: u64 = 1440;
    /// Devices silent for this many minutes are skipped by the sweep.
    pub const INACTIVITY_THRESHOLD_MINS: i64 = 40;
    /// Pause between devices during a sweep.
    pub const SWEEP_DEVICE_DELAY_MS: u64 = 2000;
    /// Outbound transmit queue capacity.
    pub const TRANSMIT_QUEUE_CAPACITY: usize = 2;
    /// Deadline for each store/liveness/auth call.
    pub const RPC_TIMEOUT_MS: u64 = 5000;
    pub const STORE_PATH: &str = "data/devicetwin.redb";

    pub const MQTT_HOST: &str = "localhost";
    pub const MQTT_PORT: u16 = 1883;
    pub const MQTT_DOWNLINK_TOPIC: &str = "application/devicetwin/downlink/config";
    pub const MQTT_UPLINK_TOPIC: &str = "application/devicetwin/uplink/config/#";
    pub const MQTT_CONNECTIONS_TOPIC: &str = "application/devicetwin/connections";

    pub const LIVENESS_URL: &str = "http://localhost:3000";
    pub const LIVENESS_VIEW: &str = "CONNECTIONS_DATA";

    pub const ROLE_ADMIN: &str = "devicetwin-admin";
    pub const ROLE_INSTALLER: &str = "devicetwin-installer";
    pub const ROLE_SUPERUSER: &str = "devicetwin-superuser";
}

/// Environment variable names.
pub mod env_vars {
    pub const REPEAT_CHECK_SCHEDULE: &str = "DEVICETWIN_REPEAT_CHECK_SCHEDULE";
    pub const CONTROL_FIELD: &str = "DEVICETWIN_CONTROL_FIELD";
    pub const SWEEP_INTERVAL_MINS: &str = "DEVICETWIN_SWEEP_INTERVAL_MINS";
    pub const INACTIVITY_THRESHOLD_MINS: &str = "DEVICETWIN_INACTIVITY_THRESHOLD_MINS";
    pub const SWEEP_DEVICE_DELAY_MS: &str = "DEVICETWIN_SWEEP_DEVICE_DELAY_MS";
    pub const TRANSMIT_QUEUE_CAPACITY: &str = "DEVICETWIN_TRANSMIT_QUEUE_CAPACITY";
    pub const RPC_TIMEOUT_MS: &str = "DEVICETWIN_RPC_TIMEOUT_MS";
    pub const STORE_PATH: &str = "DEVICETWIN_STORE_PATH";

    pub const MQTT_HOST: &str = "DEVICETWIN_MQTT_HOST";
    pub const MQTT_PORT: &str = "DEVICETWIN_MQTT_PORT";
    pub const MQTT_USERNAME: &str = "DEVICETWIN_MQTT_USERNAME";
    pub const MQTT_PASSWORD: &str = "DEVICETWIN_MQTT_PASSWORD";
    pub const MQTT_DOWNLINK_TOPIC: &str = "DEVICETWIN_MQTT_DOWNLINK_TOPIC";
    pub const MQTT_UPLINK_TOPIC: &str = "DEVICETWIN_MQTT_UPLINK_TOPIC";
    pub const MQTT_CONNECTIONS_TOPIC: &str = "DEVICETWIN_MQTT_CONNECTIONS_TOPIC";

    pub const LIVENESS_URL: &str = "DEVICETWIN_LIVENESS_URL";
    pub const LIVENESS_TOKEN: &str = "DEVICETWIN_LIVENESS_TOKEN";
    pub const LIVENESS_VIEW: &str = "DEVICETWIN_LIVENESS_VIEW";

    pub const AUTH_TOKENS: &str = "DEVICETWIN_AUTH_TOKENS";

    pub const ROLE_ADMIN: &str = "DEVICETWIN_ROLE_ADMIN";
    pub const ROLE_INSTALLER: &str = "DEVICETWIN_ROLE_INSTALLER";
    pub const ROLE_SUPERUSER: &str = "DEVICETWIN_ROLE_SUPERUSER";

    /// Toggle JSON log output.
    pub const LOG_JSON: &str = "DEVICETWIN_LOG_JSON";
}

/// Top-level service configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Retry delays for general fields, in seconds separated by `_`
    pub repeat_check_schedule: String,
    /// Field name that gets the fast control schedule
    pub control_field: String,
    /// Minutes between fleet sweeps
    pub sweep_interval_mins: u64,
    /// Skip devices silent for at least this many minutes
    pub inactivity_threshold_mins: i64,
    /// Pause between devices during a sweep
    pub sweep_device_delay_ms: u64,
    /// Outbound transmit queue capacity
    pub transmit_queue_capacity: usize,
    /// Deadline for each collaborator call
    pub rpc_timeout_ms: u64,
    /// redb store location
    pub store_path: PathBuf,
    pub mqtt: MqttConfig,
    pub liveness: LivenessConfig,
    pub auth: AuthConfig,
    pub roles: RoleConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            repeat_check_schedule: defaults::REPEAT_CHECK_SCHEDULE.to_string(),
            control_field: defaults::CONTROL_FIELD.to_string(),
            sweep_interval_mins: defaults::SWEEP_INTERVAL_MINS,
            inactivity_threshold_mins: defaults::INACTIVITY_THRESHOLD_MINS,
            sweep_device_delay_ms: defaults::SWEEP_DEVICE_DELAY_MS,
            transmit_queue_capacity: defaults::TRANSMIT_QUEUE_CAPACITY,
            rpc_timeout_ms: defaults::RPC_TIMEOUT_MS,
            store_path: PathBuf::from(defaults::STORE_PATH),
            mqtt: MqttConfig::default(),
            liveness: LivenessConfig::default(),
            auth: AuthConfig::default(),
            roles: RoleConfig::default(),
        }
    }
}

/// MQTT broker connection.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Downlinks are published to `<downlink_topic>/<device_id>`
    pub downlink_topic: String,
    pub uplink_topic: String,
    pub connections_topic: String,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker_host: defaults::MQTT_HOST.to_string(),
            broker_port: defaults::MQTT_PORT,
            username: None,
            password: None,
            downlink_topic: defaults::MQTT_DOWNLINK_TOPIC.to_string(),
            uplink_topic: defaults::MQTT_UPLINK_TOPIC.to_string(),
            connections_topic: defaults::MQTT_CONNECTIONS_TOPIC.to_string(),
        }
    }
}

/// Liveness data API.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LivenessConfig {
    pub base_url: String,
    pub token: String,
    /// Name of the connections data view
    pub view: String,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            base_url: defaults::LIVENESS_URL.to_string(),
            token: String::new(),
            view: defaults::LIVENESS_VIEW.to_string(),
        }
    }
}

/// Static bearer tokens, `token:user:role` entries separated by `;`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub tokens: String,
}

/// Role names accepted by the orchestration layer.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RoleConfig {
    pub admin: String,
    pub installer: String,
    pub superuser: String,
}

impl Default for RoleConfig {
    fn default() -> Self {
        Self {
            admin: defaults::ROLE_ADMIN.to_string(),
            installer: defaults::ROLE_INSTALLER.to_string(),
            superuser: defaults::ROLE_SUPERUSER.to_string(),
        }
    }
}

impl RoleConfig {
    /// Roles allowed to read and change config.
    pub fn operators(&self) -> Vec<String> {
        vec![
            self.admin.clone(),
            self.installer.clone(),
            self.superuser.clone(),
        ]
    }

    /// Roles allowed to manage config documents.
    pub fn managers(&self) -> Vec<String> {
        vec![self.admin.clone(), self.superuser.clone()]
    }
}

impl ServiceConfig {
    /// Load configuration from the given file (or the default file when it
    /// exists), then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                info!(category = "config", "Loading config from: {}", path.display());
                Self::from_file(path)?
            }
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                info!(category = "config", "Loading config from: {}", DEFAULT_CONFIG_FILE);
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => {
                info!(category = "config", "Loading config from environment variables");
                Self::default()
            }
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Parse a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml(&content)
    }

    /// Parse TOML content.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(e.to_string()))
    }

    /// Apply overrides from a variable lookup.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parsed<T: std::str::FromStr>(key: &str, raw: Option<String>) -> Option<T> {
            let raw = raw?;
            match raw.parse() {
                Ok(v) => Some(v),
                Err(_) => {
                    warn!(category = "config", "Ignoring invalid value {:?} for {}", raw, key);
                    None
                }
            }
        }

        if let Some(v) = lookup(env_vars::REPEAT_CHECK_SCHEDULE) {
            self.repeat_check_schedule = v;
        }
        if let Some(v) = lookup(env_vars::CONTROL_FIELD) {
            self.control_field = v;
        }
        if let Some(v) = lookup(env_vars::SWEEP_INTERVAL_MINS) {
            // An unreadable interval falls back to one minute.
            self.sweep_interval_mins = parsed(env_vars::SWEEP_INTERVAL_MINS, Some(v)).unwrap_or(1);
        }
        if let Some(v) = parsed(env_vars::INACTIVITY_THRESHOLD_MINS, lookup(env_vars::INACTIVITY_THRESHOLD_MINS)) {
            self.inactivity_threshold_mins = v;
        }
        if let Some(v) = parsed(env_vars::SWEEP_DEVICE_DELAY_MS, lookup(env_vars::SWEEP_DEVICE_DELAY_MS)) {
            self.sweep_device_delay_ms = v;
        }
        if let Some(v) = parsed(env_vars::TRANSMIT_QUEUE_CAPACITY, lookup(env_vars::TRANSMIT_QUEUE_CAPACITY)) {
            self.transmit_queue_capacity = v;
        }
        if let Some(v) = parsed(env_vars::RPC_TIMEOUT_MS, lookup(env_vars::RPC_TIMEOUT_MS)) {
            self.rpc_timeout_ms = v;
        }
        if let Some(v) = lookup(env_vars::STORE_PATH) {
            self.store_path = PathBuf::from(v);
        }

        if let Some(v) = lookup(env_vars::MQTT_HOST) {
            self.mqtt.broker_host = v;
        }
        if let Some(v) = parsed(env_vars::MQTT_PORT, lookup(env_vars::MQTT_PORT)) {
            self.mqtt.broker_port = v;
        }
        if let Some(v) = lookup(env_vars::MQTT_USERNAME) {
            self.mqtt.username = Some(v);
        }
        if let Some(v) = lookup(env_vars::MQTT_PASSWORD) {
            self.mqtt.password = Some(v);
        }
        if let Some(v) = lookup(env_vars::MQTT_DOWNLINK_TOPIC) {
            self.mqtt.downlink_topic = v;
        }
        if let Some(v) = lookup(env_vars::MQTT_UPLINK_TOPIC) {
            self.mqtt.uplink_topic = v;
        }
        if let Some(v) = lookup(env_vars::MQTT_CONNECTIONS_TOPIC) {
            self.mqtt.connections_topic = v;
        }

        if let Some(v) = lookup(env_vars::LIVENESS_URL) {
            self.liveness.base_url = v;
        }
        if let Some(v) = lookup(env_vars::LIVENESS_TOKEN) {
            self.liveness.token = v;
        }
        if let Some(v) = lookup(env_vars::LIVENESS_VIEW) {
            self.liveness.view = v;
        }

        if let Some(v) = lookup(env_vars::AUTH_TOKENS) {
            self.auth.tokens = v;
        }

        if let Some(v) = lookup(env_vars::ROLE_ADMIN) {
            self.roles.admin = v;
        }
        if let Some(v) = lookup(env_vars::ROLE_INSTALLER) {
            self.roles.installer = v;
        }
        if let Some(v) = lookup(env_vars::ROLE_SUPERUSER) {
            self.roles.superuser = v;
        }
    }

    /// Sweep interval as a duration.
    pub fn sweep_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.sweep_interval_mins.max(1) * 60)
    }

    /// Collaborator call deadline as a duration.
    pub fn rpc_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.rpc_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = ServiceConfig::default();
        assert_eq!(config.repeat_check_schedule, "25_540_3420");
        assert_eq!(config.control_field, "installd");
        assert_eq!(config.sweep_interval_mins, 1440);
        assert_eq!(config.inactivity_threshold_mins, 40);
        assert_eq!(config.transmit_queue_capacity, 2);
    }

    #[test]
    fn test_partial_toml() {
        let config = ServiceConfig::from_toml(
            r#"
            repeat_check_schedule = "15_30_45"

            [mqtt]
            broker_host = "mosquitto"
            "#,
        )
        .unwrap();

        assert_eq!(config.repeat_check_schedule, "15_30_45");
        assert_eq!(config.mqtt.broker_host, "mosquitto");
        assert_eq!(config.mqtt.broker_port, 1883);
        assert_eq!(config.sweep_interval_mins, 1440);
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            (env_vars::MQTT_PORT, "8883"),
            (env_vars::RPC_TIMEOUT_MS, "not-a-number"),
            (env_vars::SWEEP_INTERVAL_MINS, "soon"),
            (env_vars::ROLE_ADMIN, "ops"),
        ]
        .into_iter()
        .collect();

        let mut config = ServiceConfig::default();
        config.apply_env(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.mqtt.broker_port, 8883);
        assert_eq!(config.rpc_timeout_ms, 5000);
        assert_eq!(config.sweep_interval_mins, 1);
        assert_eq!(config.roles.admin, "ops");
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("twin.toml");
        std::fs::write(&path, "inactivity_threshold_mins = 90\n").unwrap();

        let config = ServiceConfig::from_file(&path).unwrap();
        assert_eq!(config.inactivity_threshold_mins, 90);
    }

    #[test]
    fn test_invalid_toml() {
        assert!(matches!(
            ServiceConfig::from_toml("sweep_interval_mins = \"x\""),
            Err(Error::Config(_))
        ));
    }
}
