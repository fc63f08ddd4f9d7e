use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, ClientError, Event, EventLoop, MqttOptions, Packet, QoS};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{Broker, BrokerError, BrokerEvent, Qos, EVENT_CHANNEL_CAPACITY};

const REQUEST_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub client_id: String,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive: Duration,
    pub reconnect_delay: Duration,
}

impl MqttConfig {
    pub fn new(client_id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            client_id: client_id.into(),
            host: host.into(),
            port,
            username: None,
            password: None,
            keep_alive: Duration::from_secs(60),
            reconnect_delay: Duration::from_secs(2),
        }
    }

    fn options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(&self.client_id, &self.host, self.port);
        options.set_keep_alive(self.keep_alive);
        options.set_clean_session(true);
        if let Some(username) = &self.username {
            options.set_credentials(username, self.password.as_deref().unwrap_or_default());
        }
        options
    }
}

#[derive(Clone)]
pub struct MqttBroker {
    client: AsyncClient,
}

impl MqttBroker {
    /// Starts the connection. The returned task keeps polling the MQTT event
    /// loop (reconnecting after `reconnect_delay`) and forwards connection
    /// edges and inbound publishes until the receiver is dropped.
    pub fn connect(config: &MqttConfig) -> (Self, mpsc::Receiver<BrokerEvent>, JoinHandle<()>) {
        let (client, eventloop) = AsyncClient::new(config.options(), REQUEST_CHANNEL_CAPACITY);
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        info!(host = %config.host, port = config.port, client_id = %config.client_id, "connecting to mqtt broker");
        let pump = tokio::spawn(pump_events(eventloop, events_tx, config.reconnect_delay));
        (Self { client }, events_rx, pump)
    }

    pub async fn disconnect(&self) -> Result<(), BrokerError> {
        self.client
            .try_disconnect()
            .map_err(|error| request_error("disconnect", "", error))
    }
}

/// Requests are queued without waiting. While the connection is down the
/// event loop stops draining the queue, so a full queue fails the call
/// instead of parking the caller until the broker returns.
fn request_error(operation: &'static str, topic: &str, error: ClientError) -> BrokerError {
    match error {
        ClientError::TryRequest(_) => BrokerError::Backlogged {
            operation,
            topic: topic.to_string(),
        },
        other => BrokerError::Closed(other.to_string()),
    }
}

#[async_trait]
impl Broker for MqttBroker {
    async fn subscribe(&self, filter: &str) -> Result<(), BrokerError> {
        self.client
            .try_subscribe(filter, QoS::AtLeastOnce)
            .map_err(|error| request_error("subscribe", filter, error))
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: Qos) -> Result<(), BrokerError> {
        let qos = match qos {
            Qos::AtMostOnce => QoS::AtMostOnce,
            Qos::AtLeastOnce => QoS::AtLeastOnce,
        };
        self.client
            .try_publish(topic, qos, false, payload)
            .map_err(|error| request_error("publish", topic, error))
    }
}

async fn pump_events(
    mut eventloop: EventLoop,
    events: mpsc::Sender<BrokerEvent>,
    reconnect_delay: Duration,
) {
    let mut connected = false;
    loop {
        let event = match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                info!(code = ?ack.code, "mqtt session established");
                connected = true;
                Some(BrokerEvent::Connected)
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => Some(BrokerEvent::Message {
                topic: publish.topic,
                payload: publish.payload.to_vec(),
            }),
            Ok(_) => None,
            Err(error) => {
                let edge = if connected {
                    warn!(%error, "mqtt connection lost");
                    Some(BrokerEvent::Disconnected)
                } else {
                    debug!(%error, "mqtt connection attempt failed");
                    None
                };
                connected = false;
                tokio::time::sleep(reconnect_delay).await;
                edge
            }
        };

        if let Some(event) = event {
            if events.send(event).await.is_err() {
                debug!("broker event receiver dropped; stopping mqtt pump");
                break;
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/mqtt_tests.rs"]
mod tests;
