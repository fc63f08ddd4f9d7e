//! Debounced inbound requests, accumulated between coordinator ticks.

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use shared::{
    domain::{DeviceId, Group, GroupId},
    error::ProtocolError,
    protocol::InboundRequest,
};

/// Set of pending ids. Recording an id that is already pending is a no-op,
/// and draining hands back everything pending in a single swap.
pub struct Mailbox<K> {
    pending: Mutex<BTreeSet<K>>,
}

impl<K: Ord> Default for Mailbox<K> {
    fn default() -> Self {
        Self {
            pending: Mutex::new(BTreeSet::new()),
        }
    }
}

impl<K: Ord> Mailbox<K> {
    /// Returns `true` when the id was not already pending.
    pub fn record(&self, id: K) -> bool {
        self.pending.lock().insert(id)
    }

    pub fn record_all(&self, ids: impl IntoIterator<Item = K>) {
        self.pending.lock().extend(ids);
    }

    pub fn drain_all(&self) -> Vec<K> {
        std::mem::take(&mut *self.pending.lock())
            .into_iter()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}

#[derive(Default)]
pub struct RequestStore {
    pub logins: Mailbox<DeviceId>,
    pub skips: Mailbox<GroupId>,
}

impl RequestStore {
    pub fn record(&self, request: InboundRequest) {
        match request {
            InboundRequest::Login(device_id) => {
                self.logins.record(device_id);
            }
            InboundRequest::Skip(group_id) => {
                self.skips.record(group_id);
            }
        }
    }

    pub fn record_message(&self, topic: &str, payload: &[u8]) -> Result<(), ProtocolError> {
        self.record(InboundRequest::parse(topic, payload)?);
        Ok(())
    }
}

/// Minimum spacing between two skip-triggered rollovers of one group,
/// measured from the group's last acknowledged skip.
#[derive(Debug, Clone, Copy)]
pub struct SkipCooldown {
    window: Duration,
}

impl SkipCooldown {
    pub fn new(window: Duration) -> Self {
        Self { window }
    }

    pub fn admits(&self, group: &Group, now: DateTime<Utc>) -> bool {
        group.skip_cooldown_elapsed(now, self.window)
    }
}

#[cfg(test)]
#[path = "tests/mailbox_tests.rs"]
mod tests;
