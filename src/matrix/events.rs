//! Matrix events as they travel on the wire.
//!
//! Only the envelope is typed. Contents stay as JSON values so unknown or
//! partially valid events never break the parsing of the surrounding batch.

use matrix_sdk::ruma::{OwnedEventId, OwnedUserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event type of encrypted room events.
pub const ENCRYPTED_EVENT_TYPE: &str = "m.room.encrypted";

/// A room event, either from the timeline or from the state block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    pub event_id: OwnedEventId,
    pub sender: OwnedUserId,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_key: Option<String>,
    #[serde(default)]
    pub content: Value,
    #[serde(default)]
    pub origin_server_ts: u64,
    #[serde(default, skip_serializing_if = "Unsigned::is_empty")]
    pub unsigned: Unsigned,
}

impl RawEvent {
    /// Whether the event carries a group-encrypted payload.
    pub fn is_encrypted(&self) -> bool {
        self.event_type == ENCRYPTED_EVENT_TYPE
    }

    /// Whether the event is a state event.
    pub fn is_state(&self) -> bool {
        self.state_key.is_some()
    }
}

/// Server-added, unsigned event data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Unsigned {
    /// Transaction id of the request that sent the event, only for our own events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
}

impl Unsigned {
    fn is_empty(&self) -> bool {
        self.transaction_id.is_none()
    }
}

/// State event of an invite preview. It has no event id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrippedStateEvent {
    pub sender: OwnedUserId,
    #[serde(rename = "type")]
    pub event_type: String,
    pub state_key: String,
    #[serde(default)]
    pub content: Value,
}

/// Event sent directly to our device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToDeviceEvent {
    pub sender: OwnedUserId,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub content: Value,
}

/// Membership of a user in a room, from `m.room.member` content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Membership {
    Join,
    Invite,
    Leave,
    Ban,
    Knock,
}

impl Membership {
    /// Reads the `membership` field of a member event content.
    pub fn from_content(content: &Value) -> Option<Membership> {
        serde_json::from_value(content.get("membership")?.clone()).ok()
    }

    /// Whether the user counts as a room member for key sharing.
    pub fn is_member(&self) -> bool {
        matches!(self, Membership::Join | Membership::Invite)
    }
}

/// Account data and ephemeral events: a type and a content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BasicEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub content: Value,
}
