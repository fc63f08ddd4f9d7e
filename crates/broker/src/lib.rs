use async_trait::async_trait;
use thiserror::Error;

pub mod memory;
pub mod mqtt;

pub use memory::{MemoryBroker, MemoryClient, Published};
pub use mqtt::{MqttBroker, MqttConfig};

/// Capacity of the inbound event channel handed out by every broker.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qos {
    AtMostOnce,
    AtLeastOnce,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    /// The session is (re)established; subscriptions from an earlier session
    /// must be assumed lost.
    Connected,
    Disconnected,
    Message { topic: String, payload: Vec<u8> },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("broker client is closed: {0}")]
    Closed(String),
    #[error("broker rejected {operation} on '{topic}'")]
    Rejected {
        operation: &'static str,
        topic: String,
    },
    #[error("broker request queue full; dropped {operation} on '{topic}'")]
    Backlogged {
        operation: &'static str,
        topic: String,
    },
}

#[async_trait]
pub trait Broker: Send + Sync {
    async fn subscribe(&self, filter: &str) -> Result<(), BrokerError>;
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: Qos) -> Result<(), BrokerError>;
}

/// MQTT topic filter matching with `+` (one level) and `#` (all remaining levels).
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
