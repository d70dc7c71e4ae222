//! MQTT bridge.
//!
//! Publishes downlink commands as JSON and feeds uplink and connection
//! messages to the [`MessageProcessor`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use twin_commands::MessageProcessor;
use twin_core::config::MqttConfig;
use twin_core::{DownlinkCommand, DownlinkTransport, Error, Result};
use uuid::Uuid;

/// Capacity of the client request channel.
const REQUEST_CAPACITY: usize = 10;

/// Delay before polling again after a connection error.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Topic a command for `device_id` is published to.
pub fn downlink_topic(base: &str, device_id: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), device_id)
}

/// MQTT client handle shared by the publisher and the event loop.
#[derive(Clone)]
pub struct MqttBridge {
    client: AsyncClient,
    downlink_topic: String,
    subscriptions: Vec<String>,
}

impl MqttBridge {
    /// Create the client. Nothing is sent until the event loop is polled.
    pub fn new(config: &MqttConfig) -> (Self, EventLoop) {
        let client_id = format!("devicetwin-{}", Uuid::new_v4());
        let mut options = MqttOptions::new(client_id, &config.broker_host, config.broker_port);
        options.set_keep_alive(Duration::from_secs(60));
        if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            options.set_credentials(user, pass);
        }

        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let bridge = Self {
            client,
            downlink_topic: config.downlink_topic.clone(),
            subscriptions: vec![config.uplink_topic.clone(), config.connections_topic.clone()],
        };
        (bridge, eventloop)
    }

    /// Ask the broker to close the connection once queued requests are out.
    pub async fn disconnect(&self) {
        if let Err(e) = self.client.disconnect().await {
            debug!("MQTT disconnect failed: {}", e);
        }
    }

    /// Poll the event loop until cancelled or disconnected.
    ///
    /// With a processor, every inbound publish is handled on its own task.
    /// Subscriptions are renewed on every connect.
    pub fn spawn_event_loop(
        &self,
        mut eventloop: EventLoop,
        processor: Option<Arc<MessageProcessor>>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let bridge = self.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = eventloop.poll() => event,
                };

                match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("Connected to MQTT broker");
                        if processor.is_some() {
                            bridge.subscribe();
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        if let Some(processor) = &processor {
                            let processor = Arc::clone(processor);
                            tokio::spawn(async move {
                                if let Err(e) = processor.process(&publish.topic, &publish.payload).await {
                                    debug!(topic = %publish.topic, "Message rejected: {}", e);
                                }
                            });
                        }
                    }
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                        info!("Disconnected from MQTT broker");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("MQTT connection error: {}", e);
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                        }
                    }
                }
            }
            debug!("MQTT event loop stopped");
        })
    }

    fn subscribe(&self) {
        for topic in &self.subscriptions {
            // The event loop drains the request channel, so never block on it here
            match self.client.try_subscribe(topic, QoS::AtLeastOnce) {
                Ok(()) => info!(topic = %topic, "Subscribed"),
                Err(e) => warn!(topic = %topic, "Failed to subscribe: {}", e),
            }
        }
    }
}

#[async_trait]
impl DownlinkTransport for MqttBridge {
    async fn send(&self, command: DownlinkCommand) -> Result<()> {
        let topic = downlink_topic(&self.downlink_topic, &command.device_id);
        let payload = serde_json::to_vec(&command)
            .map_err(|e| Error::Transport(format!("encode command: {}", e)))?;

        self.client
            .publish(topic.as_str(), QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| Error::Transport(format!("publish to {}: {}", topic, e)))?;

        debug!(topic = %topic, retry_count = command.retry_count, "Queued downlink publish");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_downlink_topic() {
        assert_eq!(
            downlink_topic("application/devicetwin/downlink/config", "70b3d5e75e000001"),
            "application/devicetwin/downlink/config/70b3d5e75e000001"
        );
        assert_eq!(downlink_topic("down/", "dev"), "down/dev");
    }

    #[test]
    fn test_command_payload_is_json() {
        let command = DownlinkCommand::new("dev", 0, 3, "1.0", 2, vec![0, 0, 9, 0xC4]);
        let json: serde_json::Value = serde_json::to_value(&command).unwrap();
        assert_eq!(json["device_id"], "dev");
        assert_eq!(json["retry_count"], 2);
        assert_eq!(json["payload"], "000009c4");
    }
}
