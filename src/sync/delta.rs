//! Typed view of one sync response.

use std::collections::BTreeMap;

use log::{debug, warn};
use matrix_sdk::ruma::{OwnedEventId, OwnedRoomId, OwnedUserId};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use thiserror::Error;

use crate::{
    crypto::DecryptedEvent,
    error::{DecryptionFailure, EngineError},
    matrix::{
        events::{BasicEvent, Membership, RawEvent, StrippedStateEvent, ToDeviceEvent},
        response_structs::{RoomSummaryResponse, SyncResponse, TimelineResponse},
    },
};

/// Room creation type marking a space.
pub const SPACE_ROOM_TYPE: &str = "m.space";

/// A sync response the engine cannot interpret.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("malformed sync response: {reason}")]
pub struct MalformedSync {
    /// Cursor of the response if it could still be read.
    pub next_batch: Option<String>,
    pub reason: String,
}

impl From<MalformedSync> for EngineError {
    fn from(error: MalformedSync) -> Self {
        EngineError::Protocol(error.reason)
    }
}

/// Our membership of a room, from the section of the response it appeared in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RoomMembership {
    Joined,
    Invited,
    Left,
}

/// A timeline event with the outcome of its decryption.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncEvent {
    pub raw: RawEvent,
    /// `None` for cleartext events and for encrypted events not processed yet.
    pub decrypted: Option<Result<DecryptedEvent, DecryptionFailure>>,
}

impl SyncEvent {
    pub fn new(raw: RawEvent) -> Self {
        SyncEvent {
            raw,
            decrypted: None,
        }
    }
}

/// Server side unread counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnreadCounts {
    pub notification_count: Option<u64>,
    pub highlight_count: Option<u64>,
}

/// Changes of one room.
#[derive(Debug, Clone, PartialEq)]
pub struct RoomDelta {
    pub room_id: OwnedRoomId,
    pub membership: RoomMembership,
    /// State preceding the timeline.
    pub state: Vec<RawEvent>,
    pub timeline: Vec<SyncEvent>,
    /// Stripped state of an invite.
    pub invite_state: Vec<StrippedStateEvent>,
    pub account_data: Vec<BasicEvent>,
    /// Receipts and typing notifications.
    pub ephemeral: Vec<BasicEvent>,
    pub unread: UnreadCounts,
    pub heroes: Option<Vec<OwnedUserId>>,
    pub joined_member_count: Option<u64>,
    pub invited_member_count: Option<u64>,
    /// Pagination token of the event preceding the timeline.
    pub prev_batch: Option<String>,
    /// Whether events were skipped between the previous sync and this timeline.
    pub limited: bool,
}

impl RoomDelta {
    fn new(room_id: OwnedRoomId, membership: RoomMembership) -> Self {
        RoomDelta {
            room_id,
            membership,
            state: Vec::new(),
            timeline: Vec::new(),
            invite_state: Vec::new(),
            account_data: Vec::new(),
            ephemeral: Vec::new(),
            unread: UnreadCounts::default(),
            heroes: None,
            joined_member_count: None,
            invited_member_count: None,
            prev_batch: None,
            limited: false,
        }
    }

    fn with_timeline(mut self, timeline: TimelineResponse, state: Vec<Value>) -> Self {
        self.state = parse_events(&self.room_id, state);
        self.timeline = parse_events(&self.room_id, timeline.events)
            .into_iter()
            .map(SyncEvent::new)
            .collect();
        self.prev_batch = timeline.prev_batch;
        self.limited = timeline.limited;
        self
    }

    fn with_summary(mut self, summary: RoomSummaryResponse) -> Self {
        self.heroes = summary.heroes;
        self.joined_member_count = summary.joined_member_count;
        self.invited_member_count = summary.invited_member_count;
        self
    }

    /// State events of the delta in order: state block, then timeline.
    pub fn state_events(&self) -> impl Iterator<Item = &RawEvent> {
        self.state
            .iter()
            .chain(self.timeline.iter().map(|e| &e.raw))
            .filter(|e| e.is_state())
    }

    /// Whether the delta declares the room as a space.
    pub fn is_space(&self) -> bool {
        let created_as_space = |event_type: &str, content: &Value| {
            event_type == "m.room.create" && content["type"] == SPACE_ROOM_TYPE
        };
        self.state_events()
            .any(|e| created_as_space(&e.event_type, &e.content))
            || self
                .invite_state
                .iter()
                .any(|e| created_as_space(&e.event_type, &e.content))
    }
}

/// A room key decryption completed after the event was delivered.
#[derive(Debug, Clone, PartialEq)]
pub struct LateDecryption {
    pub room_id: OwnedRoomId,
    pub event_id: OwnedEventId,
    /// An error here is final: the event will not be retried.
    pub result: Result<DecryptedEvent, DecryptionFailure>,
}

/// A change of membership carried by a delta.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipChange {
    pub room_id: OwnedRoomId,
    pub user_id: OwnedUserId,
    pub membership: Membership,
}

/// Everything one sync response changed.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncDelta {
    /// Cursor to resume from once this delta is applied.
    pub cursor: String,
    /// Cursor the delta was requested with.
    pub previous_cursor: Option<String>,
    pub rooms: Vec<RoomDelta>,
    pub to_device: Vec<ToDeviceEvent>,
    /// Users whose device list changed.
    pub device_lists_changed: Vec<OwnedUserId>,
    /// Users we no longer share an encrypted room with.
    pub device_lists_left: Vec<OwnedUserId>,
    pub one_time_key_counts: BTreeMap<String, u64>,
    /// Unused fallback key algorithms, `None` if the server does not report them.
    pub unused_fallback_keys: Option<Vec<String>>,
    /// Filled by the encryption coordinator.
    pub late_decryptions: Vec<LateDecryption>,
}

impl SyncDelta {
    /// Parses a raw sync response.
    ///
    /// Events that fail to parse are dropped one by one; only a response
    /// without a readable structure is refused.
    ///
    /// # Arguments
    ///
    /// * `raw` - The JSON body of `/sync`.
    /// * `previous_cursor` - The `since` token of the request.
    pub fn parse(raw: Value, previous_cursor: Option<String>) -> Result<Self, MalformedSync> {
        let next_batch = raw["next_batch"].as_str().map(str::to_owned);
        let Some(cursor) = next_batch.clone().filter(|c| !c.is_empty()) else {
            return Err(MalformedSync {
                next_batch: None,
                reason: "missing next_batch".to_owned(),
            });
        };

        let response: SyncResponse = serde_json::from_value(raw).map_err(|e| MalformedSync {
            next_batch,
            reason: e.to_string(),
        })?;

        let mut rooms = Vec::new();
        for (room_id, joined) in response.rooms.join {
            let mut delta = RoomDelta::new(room_id, RoomMembership::Joined)
                .with_timeline(joined.timeline, joined.state.events)
                .with_summary(joined.summary);
            delta.account_data = parse_events(&delta.room_id, joined.account_data.events);
            delta.ephemeral = parse_events(&delta.room_id, joined.ephemeral.events);
            delta.unread = UnreadCounts {
                notification_count: joined.unread_notifications.notification_count,
                highlight_count: joined.unread_notifications.highlight_count,
            };
            rooms.push(delta);
        }
        for (room_id, invited) in response.rooms.invite {
            let mut delta = RoomDelta::new(room_id, RoomMembership::Invited);
            delta.invite_state = parse_events(&delta.room_id, invited.invite_state.events);
            rooms.push(delta);
        }
        for (room_id, left) in response.rooms.leave {
            rooms.push(
                RoomDelta::new(room_id, RoomMembership::Left)
                    .with_timeline(left.timeline, left.state.events),
            );
        }

        let to_device = response
            .to_device
            .events
            .into_iter()
            .filter_map(|event| lenient("to-device", event))
            .collect();

        Ok(SyncDelta {
            cursor,
            previous_cursor,
            rooms,
            to_device,
            device_lists_changed: response.device_lists.changed,
            device_lists_left: response.device_lists.left,
            one_time_key_counts: response.device_one_time_keys_count,
            unused_fallback_keys: response.device_unused_fallback_key_types,
            late_decryptions: Vec::new(),
        })
    }

    /// Whether the delta carries nothing but a new cursor.
    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
            && self.to_device.is_empty()
            && self.device_lists_changed.is_empty()
            && self.device_lists_left.is_empty()
            && self.late_decryptions.is_empty()
    }

    /// Rooms declared as spaces by this delta.
    pub fn spaces(&self) -> Vec<&OwnedRoomId> {
        self.rooms
            .iter()
            .filter(|room| room.is_space())
            .map(|room| &room.room_id)
            .collect()
    }

    /// Membership changes of every room, in delta order.
    pub fn membership_changes(&self) -> Vec<MembershipChange> {
        let mut changes = Vec::new();
        for room in &self.rooms {
            for event in room.state_events() {
                if event.event_type != "m.room.member" {
                    continue;
                }
                let (Some(state_key), Some(membership)) =
                    (&event.state_key, Membership::from_content(&event.content))
                else {
                    continue;
                };
                let Ok(user_id) = OwnedUserId::try_from(state_key.as_str()) else {
                    continue;
                };
                changes.push(MembershipChange {
                    room_id: room.room_id.clone(),
                    user_id,
                    membership,
                });
            }
        }
        changes
    }

    pub fn room(&self, room_id: &OwnedRoomId) -> Option<&RoomDelta> {
        self.rooms.iter().find(|room| &room.room_id == room_id)
    }
}

fn lenient<T: DeserializeOwned>(what: &str, event: Value) -> Option<T> {
    match serde_json::from_value(event) {
        Ok(event) => Some(event),
        Err(e) => {
            warn!("skip malformed {} event: {}", what, e);
            None
        }
    }
}

pub(crate) fn parse_events<T: DeserializeOwned>(room_id: &OwnedRoomId, events: Vec<Value>) -> Vec<T> {
    let total = events.len();
    let parsed: Vec<T> = events
        .into_iter()
        .filter_map(|event| lenient("room", event))
        .collect();
    if parsed.len() != total {
        debug!("{} of {} events skipped in {}", total - parsed.len(), total, room_id);
    }
    parsed
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn response() -> Value {
        json!({
            "next_batch": "s2",
            "rooms": {
                "join": {
                    "!space:example.org": {
                        "state": { "events": [
                            {
                                "event_id": "$create:example.org",
                                "sender": "@alice:example.org",
                                "type": "m.room.create",
                                "state_key": "",
                                "content": { "type": "m.space" },
                                "origin_server_ts": 1
                            }
                        ] },
                        "timeline": {
                            "events": [
                                {
                                    "event_id": "$join:example.org",
                                    "sender": "@bob:example.org",
                                    "type": "m.room.member",
                                    "state_key": "@bob:example.org",
                                    "content": { "membership": "join" },
                                    "origin_server_ts": 2
                                },
                                { "event_id": "broken" },
                                {
                                    "event_id": "$msg:example.org",
                                    "sender": "@bob:example.org",
                                    "type": "m.room.message",
                                    "content": { "body": "hi" },
                                    "origin_server_ts": 3
                                }
                            ],
                            "limited": true,
                            "prev_batch": "p1"
                        },
                        "unread_notifications": { "notification_count": 1, "highlight_count": 0 },
                        "summary": { "m.heroes": ["@bob:example.org"], "m.joined_member_count": 2 }
                    }
                },
                "invite": {
                    "!invite:example.org": {
                        "invite_state": { "events": [
                            {
                                "sender": "@carol:example.org",
                                "type": "m.room.name",
                                "state_key": "",
                                "content": { "name": "Invite" }
                            }
                        ] }
                    }
                }
            },
            "to_device": { "events": [
                { "sender": "@bob:example.org", "type": "m.room.encrypted", "content": {} },
                { "type": "no sender" }
            ] },
            "device_lists": { "changed": ["@bob:example.org"] },
            "device_one_time_keys_count": { "signed_curve25519": 20 },
            "device_unused_fallback_key_types": ["signed_curve25519"]
        })
    }

    #[test]
    fn test_parse_full_response() {
        let delta = SyncDelta::parse(response(), Some("s1".to_owned())).unwrap();

        assert_eq!(delta.cursor, "s2");
        assert_eq!(delta.previous_cursor.as_deref(), Some("s1"));
        assert_eq!(delta.rooms.len(), 2);
        assert_eq!(delta.to_device.len(), 1);
        assert_eq!(delta.device_lists_changed.len(), 1);
        assert_eq!(delta.one_time_key_counts["signed_curve25519"], 20);
        assert_eq!(
            delta.unused_fallback_keys,
            Some(vec!["signed_curve25519".to_owned()])
        );

        let space: OwnedRoomId = "!space:example.org".try_into().unwrap();
        let room = delta.room(&space).unwrap();
        assert_eq!(room.membership, RoomMembership::Joined);
        assert_eq!(room.timeline.len(), 2);
        assert!(room.limited);
        assert_eq!(room.prev_batch.as_deref(), Some("p1"));
        assert_eq!(room.unread.notification_count, Some(1));
        assert_eq!(room.joined_member_count, Some(2));
        assert_eq!(room.heroes.as_ref().map(Vec::len), Some(1));

        let invite: OwnedRoomId = "!invite:example.org".try_into().unwrap();
        assert_eq!(delta.room(&invite).unwrap().invite_state.len(), 1);
    }

    #[test]
    fn test_spaces_and_membership_changes() {
        let delta = SyncDelta::parse(response(), None).unwrap();

        let spaces = delta.spaces();
        assert_eq!(spaces.len(), 1);
        assert_eq!(spaces[0].as_str(), "!space:example.org");

        let changes = delta.membership_changes();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].user_id, "@bob:example.org");
        assert_eq!(changes[0].membership, Membership::Join);
    }

    #[test]
    fn test_empty_response_still_advances() {
        let delta = SyncDelta::parse(json!({ "next_batch": "s9" }), Some("s8".to_owned())).unwrap();
        assert!(delta.is_empty());
        assert_eq!(delta.cursor, "s9");
    }

    #[test]
    fn test_malformed_structure_keeps_cursor() {
        let error = SyncDelta::parse(json!({ "next_batch": "s3", "rooms": [] }), None).unwrap_err();
        assert_eq!(error.next_batch.as_deref(), Some("s3"));
    }

    #[test]
    fn test_missing_cursor() {
        let error = SyncDelta::parse(json!({ "rooms": {} }), None).unwrap_err();
        assert_eq!(error.next_batch, None);
    }
}
