//! Response structures of the homeserver API.
//!
//! The sync response is parsed leniently: every block defaults to empty and
//! events stay as JSON values until the sync engine types them one by one.

use std::{collections::BTreeMap, fmt};

use matrix_sdk::ruma::{OwnedDeviceId, OwnedEventId, OwnedMxcUri, OwnedRoomId, OwnedUserId};
use serde::Deserialize;
use serde_json::Value;

/// Response of `POST /login`.
#[derive(Deserialize, Clone, PartialEq)]
pub struct LoginResponse {
    pub user_id: OwnedUserId,
    pub access_token: String,
    pub device_id: OwnedDeviceId,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

impl fmt::Debug for LoginResponse {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "user_id={}, device_id={}", self.user_id, self.device_id)
    }
}

/// Response of `POST /refresh`.
#[derive(Deserialize, Clone, PartialEq)]
pub struct RefreshResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

impl fmt::Debug for RefreshResponse {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "refreshed access token, new refresh token={}", self.refresh_token.is_some())
    }
}

/// Standard Matrix error body.
#[derive(Deserialize, Debug, Default)]
#[serde(default)]
pub struct ErrorResponse {
    pub errcode: String,
    pub error: String,
    pub soft_logout: bool,
}

/// Response of `GET /sync`.
#[derive(Deserialize, Debug, Default)]
#[serde(default)]
pub struct SyncResponse {
    pub next_batch: String,
    pub rooms: RoomsResponse,
    pub to_device: EventsResponse,
    pub device_lists: DeviceListsResponse,
    pub device_one_time_keys_count: BTreeMap<String, u64>,
    /// Fallback key algorithms the server still holds, `None` if the server
    /// does not support fallback keys.
    pub device_unused_fallback_key_types: Option<Vec<String>>,
}

/// Rooms block of a sync response, by membership.
#[derive(Deserialize, Debug, Default)]
#[serde(default)]
pub struct RoomsResponse {
    pub join: BTreeMap<OwnedRoomId, JoinedRoomResponse>,
    pub invite: BTreeMap<OwnedRoomId, InvitedRoomResponse>,
    pub leave: BTreeMap<OwnedRoomId, LeftRoomResponse>,
}

/// A list of raw events.
#[derive(Deserialize, Debug, Default)]
#[serde(default)]
pub struct EventsResponse {
    pub events: Vec<Value>,
}

/// Joined room of a sync response.
#[derive(Deserialize, Debug, Default)]
#[serde(default)]
pub struct JoinedRoomResponse {
    pub timeline: TimelineResponse,
    pub state: EventsResponse,
    pub account_data: EventsResponse,
    pub ephemeral: EventsResponse,
    pub unread_notifications: UnreadNotificationsResponse,
    pub summary: RoomSummaryResponse,
}

/// Invited room of a sync response.
#[derive(Deserialize, Debug, Default)]
#[serde(default)]
pub struct InvitedRoomResponse {
    pub invite_state: EventsResponse,
}

/// Left room of a sync response.
#[derive(Deserialize, Debug, Default)]
#[serde(default)]
pub struct LeftRoomResponse {
    pub timeline: TimelineResponse,
    pub state: EventsResponse,
}

/// Timeline slice of a room.
#[derive(Deserialize, Debug, Default)]
#[serde(default)]
pub struct TimelineResponse {
    pub events: Vec<Value>,
    pub limited: bool,
    pub prev_batch: Option<String>,
}

/// Server-computed notification counts.
#[derive(Deserialize, Debug, Default, Clone, PartialEq)]
#[serde(default)]
pub struct UnreadNotificationsResponse {
    pub notification_count: Option<u64>,
    pub highlight_count: Option<u64>,
}

/// Room summary used to name rooms without a name.
#[derive(Deserialize, Debug, Default, Clone, PartialEq)]
#[serde(default)]
pub struct RoomSummaryResponse {
    #[serde(rename = "m.heroes")]
    pub heroes: Option<Vec<OwnedUserId>>,
    #[serde(rename = "m.joined_member_count")]
    pub joined_member_count: Option<u64>,
    #[serde(rename = "m.invited_member_count")]
    pub invited_member_count: Option<u64>,
}

/// Users whose device list changed since the previous sync.
#[derive(Deserialize, Debug, Default)]
#[serde(default)]
pub struct DeviceListsResponse {
    pub changed: Vec<OwnedUserId>,
    pub left: Vec<OwnedUserId>,
}

/// Response of `POST /keys/upload`.
#[derive(Deserialize, Debug, Default, Clone, PartialEq)]
#[serde(default)]
pub struct KeysUploadResponse {
    pub one_time_key_counts: BTreeMap<String, u64>,
}

/// Response of `POST /keys/query`.
#[derive(Deserialize, Debug, Default, Clone, PartialEq)]
#[serde(default)]
pub struct KeysQueryResponse {
    pub device_keys: BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceId, Value>>,
    pub failures: BTreeMap<String, Value>,
    pub master_keys: BTreeMap<OwnedUserId, Value>,
    pub self_signing_keys: BTreeMap<OwnedUserId, Value>,
    pub user_signing_keys: BTreeMap<OwnedUserId, Value>,
}

/// Response of `POST /keys/claim`.
#[derive(Deserialize, Debug, Default, Clone, PartialEq)]
#[serde(default)]
pub struct KeysClaimResponse {
    pub one_time_keys: BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceId, BTreeMap<String, Value>>>,
    pub failures: BTreeMap<String, Value>,
}

/// Response of `PUT /rooms/{roomId}/send/{type}/{txnId}`.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct RoomSendResponse {
    pub event_id: OwnedEventId,
}

/// Response of `GET /rooms/{roomId}/messages`.
#[derive(Deserialize, Debug, Default, Clone, PartialEq)]
#[serde(default)]
pub struct MessagesResponse {
    pub chunk: Vec<Value>,
    pub start: Option<String>,
    pub end: Option<String>,
}

/// Response of `POST /join/{roomIdOrAlias}`.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct JoinResponse {
    pub room_id: OwnedRoomId,
}

/// Response of `GET /profile/{userId}`.
#[derive(Deserialize, Debug, Default, Clone, PartialEq)]
#[serde(default)]
pub struct ProfileResponse {
    pub displayname: Option<String>,
    pub avatar_url: Option<OwnedMxcUri>,
}

/// Downloaded media content.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaResponse {
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_sync_response_missing_blocks() {
        let response: SyncResponse = serde_json::from_value(json!({ "next_batch": "s1" })).unwrap();
        assert_eq!(response.next_batch, "s1");
        assert!(response.rooms.join.is_empty());
        assert!(response.to_device.events.is_empty());
        assert!(response.device_one_time_keys_count.is_empty());
        assert_eq!(response.device_unused_fallback_key_types, None);
    }

    #[test]
    fn test_keys_query_cross_signing_keys() {
        let response: KeysQueryResponse = serde_json::from_value(json!({
            "device_keys": { "@bob:example.org": {} },
            "master_keys": { "@bob:example.org": { "usage": ["master"] } },
        }))
        .unwrap();
        assert_eq!(response.master_keys.len(), 1);
        assert!(response.self_signing_keys.is_empty());
        assert!(response.failures.is_empty());
    }

    #[test]
    fn test_room_summary_names() {
        let summary: RoomSummaryResponse = serde_json::from_value(json!({
            "m.heroes": ["@bob:example.org"],
            "m.joined_member_count": 2,
        }))
        .unwrap();
        assert_eq!(summary.heroes.unwrap().len(), 1);
        assert_eq!(summary.joined_member_count, Some(2));
        assert_eq!(summary.invited_member_count, None);
    }

    #[test]
    fn test_login_response_debug_hides_tokens() {
        let response: LoginResponse = serde_json::from_value(json!({
            "user_id": "@alice:example.org",
            "access_token": "secret-token",
            "device_id": "DEVICE",
        }))
        .unwrap();
        let debug = format!("{:?}", response);
        assert!(!debug.contains("secret-token"));
        assert!(debug.contains("DEVICE"));
    }
}
