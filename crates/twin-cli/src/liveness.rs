//! HTTP client for the connection data view.
//!
//! The view answers `GET <base>/<view>?select=LASTRECEIVEDMESSAGE&DEVICEEUI=eq.<id>`
//! with a JSON array of rows. A device is registered iff a row exists; the
//! column holds the minutes since the device was last heard from.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;
use twin_core::config::LivenessConfig;
use twin_core::{Error, LivenessRegistry, Result};

const LAST_RECEIVED_COLUMN: &str = "LASTRECEIVEDMESSAGE";

#[derive(Debug, Deserialize)]
struct ConnectionRow {
    #[serde(rename = "LASTRECEIVEDMESSAGE", default)]
    last_received: Value,
}

/// Liveness registry over HTTP.
pub struct HttpLivenessClient {
    client: reqwest::Client,
    url: String,
    token: String,
}

impl HttpLivenessClient {
    /// Create a client. `timeout` bounds every request.
    pub fn new(config: &LivenessConfig, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("liveness client: {}", e)))?;

        Ok(Self {
            client,
            url: view_url(&config.base_url, &config.view),
            token: config.token.clone(),
        })
    }

    async fn rows(&self, device_id: &str) -> Result<Vec<ConnectionRow>> {
        let mut request = self.client.get(&self.url).query(&[
            ("select", LAST_RECEIVED_COLUMN.to_string()),
            ("DEVICEEUI", format!("eq.{}", device_id)),
        ]);
        if !self.token.is_empty() {
            request = request.bearer_auth(&self.token);
        }

        let response = request
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| transport_error(device_id, e))?;
        let rows: Vec<ConnectionRow> = response
            .json()
            .await
            .map_err(|e| Error::Decode(format!("connection data for {}: {}", device_id, e)))?;

        debug!(device_id = %device_id, rows = rows.len(), "Fetched connection data");
        Ok(rows)
    }
}

#[async_trait]
impl LivenessRegistry for HttpLivenessClient {
    async fn is_registered(&self, device_id: &str) -> Result<bool> {
        Ok(!self.rows(device_id).await?.is_empty())
    }

    async fn minutes_since_last_contact(&self, device_id: &str) -> Result<i64> {
        let rows = self.rows(device_id).await?;
        let row = rows
            .first()
            .ok_or_else(|| Error::NotFound(format!("no connection for {}", device_id)))?;
        minutes(&row.last_received)
            .ok_or_else(|| Error::Decode(format!("bad {} for {}", LAST_RECEIVED_COLUMN, device_id)))
    }
}

fn view_url(base_url: &str, view: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), view.trim_start_matches('/'))
}

fn transport_error(device_id: &str, e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout(format!("connection data for {}", device_id))
    } else {
        Error::Transport(format!("connection data for {}: {}", device_id, e))
    }
}

/// Whole minutes from a numeric or numeric-string column.
fn minutes(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.floor() as i64)),
        Value::String(s) => s.trim().parse::<f64>().ok().map(|f| f.floor() as i64),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_view_url() {
        assert_eq!(
            view_url("http://db:3000/", "CONNECTIONS_DATA"),
            "http://db:3000/CONNECTIONS_DATA"
        );
        assert_eq!(view_url("http://db:3000", "/v"), "http://db:3000/v");
    }

    #[test]
    fn test_minutes_column() {
        assert_eq!(minutes(&json!(12)), Some(12));
        assert_eq!(minutes(&json!(12.9)), Some(12));
        assert_eq!(minutes(&json!("41")), Some(41));
        assert_eq!(minutes(&json!(null)), None);
        assert_eq!(minutes(&json!("soon")), None);
    }

    #[test]
    fn test_rows_parse() {
        let rows: Vec<ConnectionRow> =
            serde_json::from_str(r#"[{"LASTRECEIVEDMESSAGE": 7}]"#).unwrap();
        assert_eq!(minutes(&rows[0].last_received), Some(7));
    }
}
