//! In-process broker with MQTT filter semantics. Used to run frames and the
//! coordinator against each other without a network.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::warn;

use crate::{topic_matches, Broker, BrokerError, BrokerEvent, Qos, EVENT_CHANNEL_CAPACITY};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub client: String,
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: Qos,
}

struct Session {
    id: u64,
    name: String,
    filters: Vec<String>,
    events: mpsc::Sender<BrokerEvent>,
}

impl Session {
    fn deliver(&self, event: BrokerEvent) {
        if let Err(error) = self.events.try_send(event) {
            warn!(client = %self.name, %error, "dropping event for slow or closed client");
        }
    }
}

#[derive(Default)]
struct Hub {
    next_id: u64,
    sessions: Vec<Session>,
    published: Vec<Published>,
    fail_publishes: bool,
}

#[derive(Clone, Default)]
pub struct MemoryBroker {
    hub: Arc<Mutex<Hub>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a session; `Connected` is already queued on the returned receiver.
    pub fn connect(&self, name: impl Into<String>) -> (MemoryClient, mpsc::Receiver<BrokerEvent>) {
        let (events, receiver) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let mut hub = self.hub.lock();
        hub.next_id += 1;
        let session = Session {
            id: hub.next_id,
            name: name.into(),
            filters: Vec::new(),
            events,
        };
        session.deliver(BrokerEvent::Connected);
        let client = MemoryClient {
            id: session.id,
            name: session.name.clone(),
            hub: Arc::clone(&self.hub),
        };
        hub.sessions.push(session);
        (client, receiver)
    }

    /// Simulates a broker restart: every session loses its subscriptions and
    /// observes a disconnect followed by a fresh connect.
    pub fn reconnect_all(&self) {
        let mut hub = self.hub.lock();
        hub.sessions.retain(|session| !session.events.is_closed());
        for session in &mut hub.sessions {
            session.filters.clear();
            session.deliver(BrokerEvent::Disconnected);
            session.deliver(BrokerEvent::Connected);
        }
    }

    pub fn set_fail_publishes(&self, fail: bool) {
        self.hub.lock().fail_publishes = fail;
    }

    pub fn published(&self) -> Vec<Published> {
        self.hub.lock().published.clone()
    }

    pub fn published_to(&self, topic: &str) -> Vec<Vec<u8>> {
        self.hub
            .lock()
            .published
            .iter()
            .filter(|published| published.topic == topic)
            .map(|published| published.payload.clone())
            .collect()
    }

    pub fn subscriptions(&self, client: &str) -> Vec<String> {
        self.hub
            .lock()
            .sessions
            .iter()
            .filter(|session| session.name == client)
            .flat_map(|session| session.filters.iter().cloned())
            .collect()
    }
}

#[derive(Clone)]
pub struct MemoryClient {
    id: u64,
    name: String,
    hub: Arc<Mutex<Hub>>,
}

#[async_trait]
impl Broker for MemoryClient {
    async fn subscribe(&self, filter: &str) -> Result<(), BrokerError> {
        let mut hub = self.hub.lock();
        let session = hub
            .sessions
            .iter_mut()
            .find(|session| session.id == self.id)
            .ok_or_else(|| BrokerError::Closed(format!("session '{}' is gone", self.name)))?;
        if !session.filters.iter().any(|existing| existing == filter) {
            session.filters.push(filter.to_string());
        }
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: Qos) -> Result<(), BrokerError> {
        let mut hub = self.hub.lock();
        if hub.fail_publishes {
            return Err(BrokerError::Rejected {
                operation: "publish",
                topic: topic.to_string(),
            });
        }
        for session in &hub.sessions {
            if session
                .filters
                .iter()
                .any(|filter| topic_matches(filter, topic))
            {
                session.deliver(BrokerEvent::Message {
                    topic: topic.to_string(),
                    payload: payload.clone(),
                });
            }
        }
        hub.published.push(Published {
            client: self.name.clone(),
            topic: topic.to_string(),
            payload,
            qos,
        });
        Ok(())
    }
}
