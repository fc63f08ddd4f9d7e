use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::{error::ProtocolError, sequencer};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_newtype!(GroupId);

/// Hardware-derived frame identity. Appears verbatim as a topic level, so it
/// may not contain MQTT separators or wildcards.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        if raw.is_empty()
            || raw
                .chars()
                .any(|c| matches!(c, '/' | '+' | '#') || c.is_whitespace() || c.is_control())
        {
            return Err(ProtocolError::InvalidDeviceId(raw.to_string()));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: GroupId,
    pub name: String,
    pub album_url: String,
    pub album_id: String,
    /// Logical position; mapped to a physical album index by the sequencer.
    pub current_asset: i64,
    pub last_rollover: DateTime<Utc>,
    pub last_skip_request: DateTime<Utc>,
    pub random_seed: i64,
    pub rollover_delay_minutes: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RolloverOutcome {
    pub position: i64,
    pub reseeded: bool,
}

impl Group {
    pub fn rollover_delay(&self) -> Duration {
        Duration::minutes(self.rollover_delay_minutes)
    }

    pub fn rollover_due(&self, now: DateTime<Utc>) -> bool {
        now - self.last_rollover > self.rollover_delay()
    }

    pub fn skip_cooldown_elapsed(&self, now: DateTime<Utc>, cooldown: Duration) -> bool {
        now - self.last_skip_request > cooldown
    }

    /// Advances the logical position against the live album size, drawing a
    /// fresh seed when the position wraps to zero. Leaves the group untouched
    /// and returns `None` for an empty album.
    pub fn roll_over(&mut self, album_size: usize, now: DateTime<Utc>) -> Option<RolloverOutcome> {
        let step = sequencer::advance(self.current_asset, album_size)?;
        self.current_asset = step.position;
        self.last_rollover = now;
        if step.wrapped {
            self.random_seed = rand::random();
        }
        Some(RolloverOutcome {
            position: step.position,
            reseeded: step.wrapped,
        })
    }

    pub fn current_asset_index(&self, album_size: usize) -> Option<usize> {
        sequencer::resolve(self.random_seed, self.current_asset, album_size)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    pub group_id: Option<GroupId>,
    pub owner: Option<String>,
    pub last_seen: Option<DateTime<Utc>>,
}

#[cfg(test)]
#[path = "tests/domain_tests.rs"]
mod tests;
