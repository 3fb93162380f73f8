//! Request structures of the homeserver API.
//!
//! Each structure gathers the inputs of one endpoint so the [`Homeserver`]
//! trait keeps a mockable signature.
//!
//! [`Homeserver`]: crate::matrix::Homeserver

use std::{collections::BTreeMap, fmt};

use matrix_sdk::ruma::{OwnedDeviceId, OwnedRoomId, OwnedUserId};
use serde::Serialize;
use serde_json::Value;

/// Inputs of `POST /login` with the password flow.
#[derive(Clone, PartialEq)]
pub struct LoginRequest {
    /// Localpart or full Matrix id.
    pub username: String,
    pub password: String,
    /// Display name of the device created by the login.
    pub device_display_name: String,
}

impl fmt::Debug for LoginRequest {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("LoginRequest")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("device_display_name", &self.device_display_name)
            .finish()
    }
}

/// Inputs of `GET /sync`.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncRequest {
    /// Cursor of the previous response, `None` for an initial sync.
    pub since: Option<String>,
    /// Long-poll timeout in milliseconds.
    pub timeout_ms: u64,
    pub full_state: bool,
}

/// Body of `POST /keys/upload`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct KeysUploadRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_keys: Option<Value>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub one_time_keys: BTreeMap<String, Value>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub fallback_keys: BTreeMap<String, Value>,
}

/// Inputs of `POST /keys/query`.
#[derive(Debug, Clone, PartialEq)]
pub struct KeysQueryRequest {
    pub users: Vec<OwnedUserId>,
}

/// Inputs of `POST /keys/claim`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KeysClaimRequest {
    pub devices: BTreeMap<OwnedUserId, Vec<OwnedDeviceId>>,
}

/// Inputs of `PUT /sendToDevice/{type}/{txnId}`.
#[derive(Debug, Clone, PartialEq)]
pub struct ToDeviceRequest {
    pub event_type: String,
    pub txn_id: String,
    pub messages: BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceId, Value>>,
}

/// Inputs of `PUT /rooms/{roomId}/send/{type}/{txnId}`.
#[derive(Debug, Clone, PartialEq)]
pub struct RoomSendRequest {
    pub room_id: OwnedRoomId,
    pub event_type: String,
    pub txn_id: String,
    pub content: Value,
}

/// Inputs of `GET /rooms/{roomId}/messages` walking backwards.
#[derive(Debug, Clone, PartialEq)]
pub struct MessagesRequest {
    pub room_id: OwnedRoomId,
    /// Pagination token to start from.
    pub from: String,
    pub limit: u32,
}

/// Inputs of `POST /join/{roomIdOrAlias}`.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinRequest {
    /// Room id or alias to join.
    pub room: String,
    /// Servers to join through, needed for rooms unknown to our homeserver.
    pub via: Vec<String>,
}

/// Inputs of `GET /profile/{userId}`.
#[derive(Debug, Clone, PartialEq)]
pub struct ProfileRequest {
    pub user_id: OwnedUserId,
}

/// Inputs of the authenticated media download endpoints.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaRequest {
    pub server_name: String,
    pub media_id: String,
    /// Requested thumbnail edge in pixels, `None` downloads the full content.
    pub thumbnail: Option<u32>,
}
