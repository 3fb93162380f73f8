//! A room as seen by the local model.

use std::collections::{BTreeMap, BTreeSet};

use log::debug;
use matrix_sdk::ruma::{OwnedDeviceId, OwnedEventId, OwnedMxcUri, OwnedRoomId, OwnedUserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    crypto::{DecryptedEvent, RotationPolicy},
    error::DecryptionFailure,
    matrix::events::{ENCRYPTED_EVENT_TYPE, Membership, RawEvent, Unsigned},
    sync::{RoomMembership, SyncEvent, delta::SPACE_ROOM_TYPE},
};

/// Position of an event in the timeline of its room.
///
/// Tokens grow along the timeline. Events fetched by back-pagination receive
/// negative tokens, lower than every event already known.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OrderingToken(pub i64);

/// Decryption state of a timeline event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecryptionStatus {
    NotEncrypted,
    Decrypted {
        verified: bool,
        sender_device: Option<OwnedDeviceId>,
    },
    /// Waiting for its room key.
    Pending(DecryptionFailure),
    Failed(DecryptionFailure),
}

impl DecryptionStatus {
    fn from_result(result: &Result<DecryptedEvent, DecryptionFailure>) -> Self {
        match result {
            Ok(decrypted) => DecryptionStatus::Decrypted {
                verified: decrypted.verified,
                sender_device: decrypted.sender_device.clone(),
            },
            Err(failure) if failure.is_recoverable() => DecryptionStatus::Pending(*failure),
            Err(failure) => DecryptionStatus::Failed(*failure),
        }
    }

    /// Whether a decrypted copy may still replace the event.
    ///
    /// A replayed event never becomes readable.
    pub fn is_placeholder(&self) -> bool {
        match self {
            DecryptionStatus::Pending(_) => true,
            DecryptionStatus::Failed(failure) => *failure != DecryptionFailure::ReplayDetected,
            _ => false,
        }
    }
}

/// An event of the timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEvent {
    pub event_id: OwnedEventId,
    pub sender: OwnedUserId,
    /// Type of the cleartext event, `m.room.encrypted` until decrypted.
    pub event_type: String,
    pub state_key: Option<String>,
    pub token: OrderingToken,
    pub origin_server_ts: u64,
    /// Cleartext content, or the ciphertext content until decrypted.
    pub content: Value,
    /// Ciphertext content of an encrypted event.
    pub encrypted: Option<Value>,
    pub status: DecryptionStatus,
}

impl TimelineEvent {
    pub(crate) fn from_sync(event: &SyncEvent, token: OrderingToken) -> Self {
        let raw = &event.raw;
        let mut timeline_event = TimelineEvent {
            event_id: raw.event_id.clone(),
            sender: raw.sender.clone(),
            event_type: raw.event_type.clone(),
            state_key: raw.state_key.clone(),
            token,
            origin_server_ts: raw.origin_server_ts,
            content: raw.content.clone(),
            encrypted: None,
            status: DecryptionStatus::NotEncrypted,
        };
        if raw.is_encrypted() {
            timeline_event.encrypted = Some(raw.content.clone());
            timeline_event.status = DecryptionStatus::Pending(DecryptionFailure::NoMatchingSession);
            if let Some(result) = &event.decrypted {
                timeline_event.set_decryption(result);
            }
        }
        timeline_event
    }

    /// The event as it was received, `None` unless it is encrypted.
    pub fn encrypted_event(&self) -> Option<RawEvent> {
        Some(RawEvent {
            event_id: self.event_id.clone(),
            sender: self.sender.clone(),
            event_type: ENCRYPTED_EVENT_TYPE.to_owned(),
            state_key: self.state_key.clone(),
            content: self.encrypted.clone()?,
            origin_server_ts: self.origin_server_ts,
            unsigned: Unsigned::default(),
        })
    }

    /// Replaces the placeholder content with the decryption outcome.
    pub(crate) fn set_decryption(&mut self, result: &Result<DecryptedEvent, DecryptionFailure>) {
        if let Ok(decrypted) = result {
            self.event_type = decrypted.event_type.clone();
            self.content = decrypted.content.clone();
        }
        self.status = DecryptionStatus::from_result(result);
    }

    /// Whether the event is a user message.
    pub fn is_message(&self) -> bool {
        self.event_type == "m.room.message" || self.event_type == ENCRYPTED_EVENT_TYPE
    }

    /// Body of a text message.
    pub fn body(&self) -> Option<&str> {
        self.content["body"].as_str()
    }
}

/// A room member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
    pub user_id: OwnedUserId,
    pub display_name: Option<String>,
    pub avatar_url: Option<OwnedMxcUri>,
    pub membership: Membership,
    pub power_level: i64,
}

impl Member {
    /// Display name, or the user id if none is set.
    pub fn name(&self) -> &str {
        self.display_name
            .as_deref()
            .filter(|name| !name.is_empty())
            .unwrap_or(self.user_id.as_str())
    }
}

/// Content of `m.room.power_levels` relevant to members.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PowerLevels {
    pub users: BTreeMap<OwnedUserId, i64>,
    pub users_default: i64,
}

impl PowerLevels {
    fn from_content(content: &Value) -> Self {
        PowerLevels {
            users: serde_json::from_value(content["users"].clone()).unwrap_or_default(),
            users_default: content["users_default"].as_i64().unwrap_or_default(),
        }
    }

    pub fn of(&self, user_id: &OwnedUserId) -> i64 {
        self.users.get(user_id).copied().unwrap_or(self.users_default)
    }
}

/// Encryption settings from `m.room.encryption`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomEncryption {
    pub algorithm: String,
    pub rotation_period_ms: Option<u64>,
    pub rotation_period_msgs: Option<u32>,
}

impl RoomEncryption {
    /// Rotation policy of the room, falling back to `default` for the
    /// parameters the room does not set.
    pub fn rotation(&self, default: RotationPolicy) -> RotationPolicy {
        RotationPolicy {
            max_messages: self.rotation_period_msgs.unwrap_or(default.max_messages),
            max_age_ms: self.rotation_period_ms.unwrap_or(default.max_age_ms),
        }
    }
}

/// Unread and notification counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnreadCounters {
    /// Messages of other users after the read marker, counted locally.
    pub messages: u64,
    /// Server computed notification count.
    pub notifications: u64,
    /// Server computed highlight count.
    pub highlights: u64,
}

/// Send state of a local echo.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EchoState {
    Sending,
    /// Acknowledged by the homeserver, waiting for the remote echo.
    Sent(OwnedEventId),
    Failed(String),
}

/// A message sent from this device that did not come back through sync yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalEcho {
    pub transaction_id: String,
    pub event_type: String,
    pub content: Value,
    pub timestamp: u64,
    pub state: EchoState,
}

/// Ordering tokens reserved for the events of a gap.
const GAP_TOKENS: i64 = 1 << 32;

/// Events skipped by a limited sync, between the events known before it and
/// the first event it delivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineGap {
    /// Oldest known event after the gap.
    pub before: OwnedEventId,
    /// Token to fetch the missing events, newest first.
    pub prev_batch: String,
    /// Token of the newest event before the gap.
    floor: OrderingToken,
    /// Token of the next event filled in, counting down.
    next: i64,
}

impl TimelineGap {
    /// Token for the next older event of the gap, `None` once every
    /// reserved token is used.
    pub(crate) fn take_token(&mut self) -> Option<OrderingToken> {
        if self.next <= self.floor.0 {
            return None;
        }
        let token = OrderingToken(self.next);
        self.next -= 1;
        Some(token)
    }
}

/// A room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Room {
    pub room_id: OwnedRoomId,
    pub membership: RoomMembership,
    pub name: Option<String>,
    pub canonical_alias: Option<String>,
    pub topic: Option<String>,
    pub avatar: Option<OwnedMxcUri>,
    /// Creation type, `m.space` for spaces.
    pub room_type: Option<String>,
    pub timeline: Vec<TimelineEvent>,
    pub members: BTreeMap<OwnedUserId, Member>,
    pub power_levels: PowerLevels,
    /// Never unset once set.
    pub encryption: Option<RoomEncryption>,
    pub unread: UnreadCounters,
    pub read_marker: Option<OwnedEventId>,
    pub pending: Vec<LocalEcho>,
    /// Token to fetch older events, `None` at the start of the room.
    pub prev_batch: Option<String>,
    /// Holes left by limited syncs, oldest first.
    #[serde(default)]
    pub gaps: Vec<TimelineGap>,
    pub heroes: Vec<OwnedUserId>,
    pub joined_member_count: Option<u64>,
    pub invited_member_count: Option<u64>,
    /// Token of the state applied for `type|state_key`
    state_tokens: BTreeMap<String, OrderingToken>,
    /// Ids of every state and timeline event applied
    seen: BTreeSet<OwnedEventId>,
    next_token: i64,
    next_backfill_token: i64,
}

impl Room {
    pub fn new(room_id: OwnedRoomId, membership: RoomMembership) -> Self {
        Room {
            room_id,
            membership,
            name: None,
            canonical_alias: None,
            topic: None,
            avatar: None,
            room_type: None,
            timeline: Vec::new(),
            members: BTreeMap::new(),
            power_levels: PowerLevels::default(),
            encryption: None,
            unread: UnreadCounters::default(),
            read_marker: None,
            pending: Vec::new(),
            prev_batch: None,
            gaps: Vec::new(),
            heroes: Vec::new(),
            joined_member_count: None,
            invited_member_count: None,
            state_tokens: BTreeMap::new(),
            seen: BTreeSet::new(),
            next_token: 0,
            next_backfill_token: -1,
        }
    }

    pub fn is_space(&self) -> bool {
        self.room_type.as_deref() == Some(SPACE_ROOM_TYPE)
    }

    pub fn is_encrypted(&self) -> bool {
        self.encryption.is_some()
    }

    /// Whether an event id was already applied.
    pub fn has_seen(&self, event_id: &OwnedEventId) -> bool {
        self.seen.contains(event_id)
    }

    pub fn event(&self, event_id: &OwnedEventId) -> Option<&TimelineEvent> {
        self.timeline.iter().find(|e| &e.event_id == event_id)
    }

    pub(crate) fn event_mut(&mut self, event_id: &OwnedEventId) -> Option<&mut TimelineEvent> {
        self.timeline.iter_mut().find(|e| &e.event_id == event_id)
    }

    /// Joined and invited members: the recipients of room keys.
    pub fn active_members(&self) -> BTreeSet<OwnedUserId> {
        self.members
            .values()
            .filter(|m| m.membership.is_member())
            .map(|m| m.user_id.clone())
            .collect()
    }

    /// Name shown for the room.
    ///
    /// The first available of: the room name, its canonical alias, the names
    /// of its heroes, its id.
    pub fn display_name(&self, own_user_id: &OwnedUserId) -> String {
        if let Some(name) = self.name.as_deref().filter(|n| !n.trim().is_empty()) {
            return name.to_owned();
        }
        if let Some(alias) = self.canonical_alias.as_deref().filter(|a| !a.is_empty()) {
            return alias.to_owned();
        }

        let heroes: Vec<&OwnedUserId> = if self.heroes.is_empty() {
            self.members
                .values()
                .filter(|m| m.membership.is_member() && m.user_id != *own_user_id)
                .map(|m| &m.user_id)
                .take(5)
                .collect()
        } else {
            self.heroes.iter().filter(|h| *h != own_user_id).collect()
        };
        let names: Vec<&str> = heroes
            .iter()
            .map(|user_id| {
                self.members
                    .get(*user_id)
                    .map(Member::name)
                    .unwrap_or(user_id.as_str())
            })
            .collect();

        let total = self.joined_member_count.unwrap_or_default()
            + self.invited_member_count.unwrap_or_default();
        let others = total.saturating_sub(1).saturating_sub(names.len() as u64);
        match names.as_slice() {
            [] => self.room_id.to_string(),
            [only] if others == 0 => (*only).to_owned(),
            names if others > 0 => format!("{} and {} others", names.join(", "), others),
            [init @ .., last] => format!("{} and {}", init.join(", "), last),
        }
    }

    /// Token for the next event appended to the timeline.
    pub(crate) fn take_token(&mut self) -> OrderingToken {
        let token = OrderingToken(self.next_token);
        self.next_token += 1;
        token
    }

    /// Token for the next event inserted before the timeline.
    pub(crate) fn take_backfill_token(&mut self) -> OrderingToken {
        let token = OrderingToken(self.next_backfill_token);
        self.next_backfill_token -= 1;
        token
    }

    /// Records a gap before `before`, the first event of a limited sync,
    /// and reserves the ordering tokens of its events.
    ///
    /// Must be called before `before` takes its token.
    pub(crate) fn open_gap(&mut self, before: OwnedEventId, prev_batch: String) {
        let floor = self.current_token();
        self.next_token += GAP_TOKENS;
        debug!("gap before {} in {}", before, self.room_id);
        self.gaps.push(TimelineGap {
            before,
            prev_batch,
            floor,
            next: self.next_token - 1,
        });
    }

    /// Token of the latest event, used for state without an event.
    pub(crate) fn current_token(&self) -> OrderingToken {
        OrderingToken(self.next_token - 1)
    }

    pub(crate) fn mark_seen(&mut self, event_id: OwnedEventId) -> bool {
        self.seen.insert(event_id)
    }

    /// Applies a state event unless newer state was applied for its key.
    ///
    /// Returns whether the state changed.
    pub(crate) fn apply_state(
        &mut self,
        event_type: &str,
        state_key: &str,
        content: &Value,
        token: OrderingToken,
    ) -> bool {
        let key = format!("{}|{}", event_type, state_key);
        if let Some(applied) = self.state_tokens.get(&key) {
            if *applied > token {
                debug!("ignore older {} state in {}", key, self.room_id);
                return false;
            }
        }
        self.state_tokens.insert(key, token);

        let text = |field: &str| content[field].as_str().map(str::to_owned);
        match event_type {
            "m.room.name" => self.name = text("name"),
            "m.room.canonical_alias" => self.canonical_alias = text("alias"),
            "m.room.topic" => self.topic = text("topic"),
            "m.room.avatar" => self.avatar = content["url"].as_str().map(OwnedMxcUri::from),
            "m.room.create" => self.room_type = text("type"),
            "m.room.encryption" => {
                let Some(algorithm) = text("algorithm") else {
                    debug!("ignore encryption event without algorithm in {}", self.room_id);
                    return false;
                };
                self.encryption = Some(RoomEncryption {
                    algorithm,
                    rotation_period_ms: content["rotation_period_ms"].as_u64(),
                    rotation_period_msgs: content["rotation_period_msgs"]
                        .as_u64()
                        .and_then(|n| u32::try_from(n).ok()),
                });
            }
            "m.room.power_levels" => {
                self.power_levels = PowerLevels::from_content(content);
                for member in self.members.values_mut() {
                    member.power_level = self.power_levels.of(&member.user_id);
                }
            }
            "m.room.member" => {
                let (Ok(user_id), Some(membership)) = (
                    OwnedUserId::try_from(state_key),
                    Membership::from_content(content),
                ) else {
                    debug!("ignore invalid member event in {}", self.room_id);
                    return false;
                };
                let member = Member {
                    power_level: self.power_levels.of(&user_id),
                    user_id: user_id.clone(),
                    display_name: text("displayname"),
                    avatar_url: content["avatar_url"].as_str().map(OwnedMxcUri::from),
                    membership,
                };
                self.members.insert(user_id, member);
            }
            _ => {}
        }
        true
    }

    /// Moves the read marker forward.
    pub(crate) fn set_read_marker(&mut self, event_id: OwnedEventId) {
        let new = self.event(&event_id).map(|e| e.token);
        let current = self
            .read_marker
            .as_ref()
            .and_then(|marker| self.event(marker))
            .map(|e| e.token);
        match (current, new) {
            (Some(current), Some(new)) if new <= current => {}
            (Some(_), None) => {}
            _ => self.read_marker = Some(event_id),
        }
    }

    /// Recounts the messages of other users after the read marker.
    pub(crate) fn recount_unread(&mut self, own_user_id: &OwnedUserId) {
        let after = self
            .read_marker
            .as_ref()
            .and_then(|marker| self.event(marker))
            .map(|e| e.token);
        self.unread.messages = self
            .timeline
            .iter()
            .filter(|e| after.is_none_or(|marker| e.token > marker))
            .filter(|e| e.is_message() && e.sender != *own_user_id)
            .count() as u64;
    }
}
