//! Topic namespace and payloads exchanged between frames and the coordinator.
//!
//! | Topic                        | Direction            | Payload            |
//! |------------------------------|----------------------|--------------------|
//! | `portrait/device/{device}`   | device → coordinator | `LOGIN`            |
//! | `portrait/login/{device}`    | coordinator → device | `{groupid,api_url}`|
//! | `portrait/skip/{group}`      | device → coordinator | `SKIP`             |
//! | `portrait/group/{group}`     | coordinator → device | `RENEW`            |

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{
    domain::{DeviceId, GroupId},
    error::ProtocolError,
};

pub const TOPIC_ROOT: &str = "portrait";
pub const LOGIN_PAYLOAD: &[u8] = b"LOGIN";
pub const SKIP_PAYLOAD: &[u8] = b"SKIP";
pub const RENEW_PAYLOAD: &[u8] = b"RENEW";

/// Filter covering every group's skip topic.
pub const SKIP_FILTER: &str = "portrait/skip/+";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    DeviceBeacon(DeviceId),
    LoginResult(DeviceId),
    Skip(GroupId),
    GroupRenew(GroupId),
}

impl Topic {
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        let mut levels = raw.split('/');
        let (Some(TOPIC_ROOT), Some(kind), Some(id), None) =
            (levels.next(), levels.next(), levels.next(), levels.next())
        else {
            return Err(ProtocolError::UnknownTopic(raw.to_string()));
        };

        let group_id = || {
            id.parse::<i64>()
                .map(GroupId)
                .map_err(|_| ProtocolError::InvalidGroupId {
                    topic: raw.to_string(),
                })
        };

        match kind {
            "device" => Ok(Self::DeviceBeacon(DeviceId::parse(id)?)),
            "login" => Ok(Self::LoginResult(DeviceId::parse(id)?)),
            "skip" => Ok(Self::Skip(group_id()?)),
            "group" => Ok(Self::GroupRenew(group_id()?)),
            _ => Err(ProtocolError::UnknownTopic(raw.to_string())),
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DeviceBeacon(device_id) => write!(f, "{TOPIC_ROOT}/device/{device_id}"),
            Self::LoginResult(device_id) => write!(f, "{TOPIC_ROOT}/login/{device_id}"),
            Self::Skip(group_id) => write!(f, "{TOPIC_ROOT}/skip/{group_id}"),
            Self::GroupRenew(group_id) => write!(f, "{TOPIC_ROOT}/group/{group_id}"),
        }
    }
}

/// Device-originated request as seen by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundRequest {
    Login(DeviceId),
    Skip(GroupId),
}

impl InboundRequest {
    pub fn parse(topic: &str, payload: &[u8]) -> Result<Self, ProtocolError> {
        let unexpected = || ProtocolError::UnexpectedPayload {
            topic: topic.to_string(),
            payload: String::from_utf8_lossy(payload).into_owned(),
        };

        match Topic::parse(topic)? {
            Topic::DeviceBeacon(device_id) if payload == LOGIN_PAYLOAD => {
                Ok(Self::Login(device_id))
            }
            Topic::Skip(group_id) if payload == SKIP_PAYLOAD => Ok(Self::Skip(group_id)),
            Topic::DeviceBeacon(_) | Topic::Skip(_) => Err(unexpected()),
            Topic::LoginResult(_) | Topic::GroupRenew(_) => {
                Err(ProtocolError::WrongDirection(topic.to_string()))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginResult {
    pub groupid: GroupId,
    pub api_url: String,
}

impl LoginResult {
    pub fn to_payload(&self) -> Vec<u8> {
        // Two plain fields; serialization cannot fail.
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(payload)
            .map_err(|error| ProtocolError::MalformedLoginResult(error.to_string()))
    }
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
