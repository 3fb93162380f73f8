//! The single-writer room model.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use log::{debug, info, warn};
use matrix_sdk::ruma::{OwnedEventId, OwnedRoomId, OwnedUserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    crypto::buffer::PendingEvent,
    error::{DecryptionFailure, EngineError},
    matrix::events::Membership,
    model::{
        DecryptionStatus, EchoState, LocalEcho, ModelSnapshot, OrderingToken, Room, SpaceIndex,
        TimelineEvent,
    },
    sync::{
        RoomDelta, RoomMembership, SyncDelta, SyncEvent,
        delta::{LateDecryption, MembershipChange},
    },
};

/// What an update changed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    pub rooms: BTreeSet<OwnedRoomId>,
    /// Spaces whose state or children changed.
    pub spaces: BTreeSet<OwnedRoomId>,
    /// Events appended to timelines, in order.
    pub new_events: Vec<(OwnedRoomId, TimelineEvent)>,
    pub membership_changes: Vec<MembershipChange>,
    /// Placeholders replaced by their decrypted event.
    pub replaced: Vec<(OwnedRoomId, TimelineEvent)>,
    /// Events that will stay unreadable.
    pub failed_decryptions: Vec<(OwnedRoomId, OwnedEventId, DecryptionFailure)>,
    /// Local echoes matched by their remote echo, by transaction id.
    pub resolved_echoes: Vec<(OwnedRoomId, String)>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }

    /// Merges the changes of a later update.
    pub fn extend(&mut self, other: ChangeSet) {
        self.rooms.extend(other.rooms);
        self.spaces.extend(other.spaces);
        self.new_events.extend(other.new_events);
        self.membership_changes.extend(other.membership_changes);
        self.replaced.extend(other.replaced);
        self.failed_decryptions.extend(other.failed_decryptions);
        self.resolved_echoes.extend(other.resolved_echoes);
    }
}

/// A change originating from this device.
#[derive(Debug, Clone, PartialEq)]
pub enum LocalChange {
    /// A message is being sent.
    Echo {
        room_id: OwnedRoomId,
        transaction_id: String,
        event_type: String,
        content: Value,
        timestamp: u64,
    },
    /// The homeserver accepted a message.
    Sent {
        room_id: OwnedRoomId,
        transaction_id: String,
        event_id: OwnedEventId,
    },
    SendFailed {
        room_id: OwnedRoomId,
        transaction_id: String,
        error: String,
    },
    /// Older events, newest first.
    Backfill {
        room_id: OwnedRoomId,
        events: Vec<SyncEvent>,
        /// Token to continue from, `None` at the start of the room.
        end: Option<String>,
        /// The gap the events were fetched for, by its `before` event, or
        /// `None` for the start of the timeline.
        gap: Option<OwnedEventId>,
    },
    LateDecryption(LateDecryption),
}

impl LocalChange {
    fn room_id(&self) -> &OwnedRoomId {
        match self {
            LocalChange::Echo { room_id, .. }
            | LocalChange::Sent { room_id, .. }
            | LocalChange::SendFailed { room_id, .. }
            | LocalChange::Backfill { room_id, .. } => room_id,
            LocalChange::LateDecryption(late) => &late.room_id,
        }
    }
}

/// Durable form of the model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedModel {
    pub rooms: BTreeMap<OwnedRoomId, Room>,
    pub spaces: SpaceIndex,
}

/// The room and space model.
///
/// Only one task owns the model: every update goes through
/// [`RoomModel::apply_delta`] or [`RoomModel::apply_local`], and readers work
/// on a [`ModelSnapshot`].
///
/// Applying a delta twice has the same effect as applying it once, so a delta
/// redelivered after a crash does not duplicate anything.
///
/// # Examples
///
/// ```ignore
/// let mut model = RoomModel::new(user_id);
/// let changes = model.apply_delta(&delta);
/// for (room_id, event) in &changes.new_events {
///     println!("{}: {:?}", room_id, event.body());
/// }
/// snapshot_tx.send_replace(Arc::new(model.snapshot()));
/// ```
#[derive(Debug, Clone)]
pub struct RoomModel {
    own_user_id: OwnedUserId,
    rooms: BTreeMap<OwnedRoomId, Arc<Room>>,
    spaces: Arc<SpaceIndex>,
}

impl RoomModel {
    pub fn new(own_user_id: OwnedUserId) -> Self {
        RoomModel {
            own_user_id,
            rooms: BTreeMap::new(),
            spaces: Arc::new(SpaceIndex::default()),
        }
    }

    /// Rebuilds the model saved before a restart.
    ///
    /// Messages still sending when the process stopped are marked failed.
    pub fn restore(own_user_id: OwnedUserId, persisted: PersistedModel) -> Self {
        let mut interrupted = 0;
        let rooms = persisted
            .rooms
            .into_iter()
            .map(|(room_id, mut room)| {
                for echo in room.pending.iter_mut().filter(|e| e.state == EchoState::Sending) {
                    echo.state = EchoState::Failed("interrupted before acknowledgement".to_owned());
                    interrupted += 1;
                }
                (room_id, Arc::new(room))
            })
            .collect::<BTreeMap<_, _>>();
        info!(
            "restored {} rooms, {} interrupted messages",
            rooms.len(),
            interrupted
        );

        RoomModel {
            own_user_id,
            rooms,
            spaces: Arc::new(persisted.spaces),
        }
    }

    pub fn persisted(&self) -> PersistedModel {
        PersistedModel {
            rooms: self
                .rooms
                .iter()
                .map(|(room_id, room)| (room_id.clone(), Room::clone(room)))
                .collect(),
            spaces: SpaceIndex::clone(&self.spaces),
        }
    }

    pub fn room_ids(&self) -> impl Iterator<Item = &OwnedRoomId> {
        self.rooms.keys()
    }

    pub fn spaces(&self) -> &SpaceIndex {
        &self.spaces
    }

    /// Encrypted events still waiting for their room key, oldest first per
    /// room.
    pub fn undecryptable(&self) -> Vec<PendingEvent> {
        self.rooms
            .values()
            .flat_map(|room| {
                room.timeline
                    .iter()
                    .filter(|e| e.status == DecryptionStatus::Pending(DecryptionFailure::NoMatchingSession))
                    .filter_map(|e| e.encrypted_event())
                    .map(|raw| PendingEvent::new(room.room_id.clone(), raw))
            })
            .collect()
    }

    pub fn own_user_id(&self) -> &OwnedUserId {
        &self.own_user_id
    }

    pub fn room(&self, room_id: &OwnedRoomId) -> Option<&Room> {
        self.rooms.get(room_id).map(Arc::as_ref)
    }

    pub fn snapshot(&self) -> ModelSnapshot {
        ModelSnapshot {
            own_user_id: Some(self.own_user_id.clone()),
            rooms: self.rooms.clone(),
            spaces: self.spaces.clone(),
        }
    }

    /// Merges a sync delta.
    ///
    /// Rooms are merged in delta order: state first, then the timeline, each
    /// event taking the next ordering token of its room. Decryptions completed
    /// late replace their placeholder.
    pub fn apply_delta(&mut self, delta: &SyncDelta) -> ChangeSet {
        let mut changes = ChangeSet::default();

        for room_delta in &delta.rooms {
            self.merge_room(room_delta, &mut changes);
        }
        for late in &delta.late_decryptions {
            self.apply_late_decryption(late, &mut changes);
        }

        debug!(
            "applied delta {}: {} rooms changed, {} new events",
            delta.cursor,
            changes.rooms.len(),
            changes.new_events.len()
        );
        changes
    }

    fn merge_room(&mut self, delta: &RoomDelta, changes: &mut ChangeSet) {
        let room_id = &delta.room_id;
        let is_new = !self.rooms.contains_key(room_id);
        let own_user_id = &self.own_user_id;
        let spaces = &mut self.spaces;
        let room = Arc::make_mut(
            self.rooms
                .entry(room_id.clone())
                .or_insert_with(|| Arc::new(Room::new(room_id.clone(), delta.membership))),
        );
        let mut changed = is_new;

        if is_new || room.membership != delta.membership {
            info!("membership of {} is now {:?}", room_id, delta.membership);
            room.membership = delta.membership;
            changed = true;
            if delta.membership == RoomMembership::Invited {
                changes.membership_changes.push(MembershipChange {
                    room_id: room_id.clone(),
                    user_id: own_user_id.clone(),
                    membership: Membership::Invite,
                });
            }
        }

        for event in &delta.invite_state {
            let token = room.current_token();
            changed |= apply_state(room, spaces, &event.event_type, &event.state_key, &event.content, token, changes);
        }

        if delta.limited && !room.timeline.is_empty() {
            let first_new = delta
                .timeline
                .iter()
                .find(|event| !room.has_seen(&event.raw.event_id));
            if let (Some(first), Some(prev_batch)) = (first_new, &delta.prev_batch) {
                room.open_gap(first.raw.event_id.clone(), prev_batch.clone());
                changed = true;
            }
        }

        for event in &delta.state {
            if !room.mark_seen(event.event_id.clone()) {
                continue;
            }
            let token = room.take_token();
            if let Some(state_key) = &event.state_key {
                apply_state(room, spaces, &event.event_type, state_key, &event.content, token, changes);
            }
            changed = true;
        }

        let timeline_was_empty = room.timeline.is_empty();
        let summary_before = (
            room.read_marker.clone(),
            room.heroes.clone(),
            room.joined_member_count,
            room.invited_member_count,
            room.prev_batch.clone(),
            room.unread,
        );
        for event in &delta.timeline {
            changed |= merge_timeline_event(room, spaces, own_user_id, event, changes);
        }

        for data in &delta.account_data {
            if data.event_type != "m.fully_read" {
                continue;
            }
            if let Some(Ok(event_id)) = data.content["event_id"].as_str().map(OwnedEventId::try_from) {
                room.set_read_marker(event_id);
            }
        }
        for ephemeral in &delta.ephemeral {
            if ephemeral.event_type != "m.receipt" {
                continue;
            }
            for event_id in own_receipts(&ephemeral.content, own_user_id) {
                room.set_read_marker(event_id);
            }
        }

        if let Some(count) = delta.unread.notification_count {
            room.unread.notifications = count;
        }
        if let Some(count) = delta.unread.highlight_count {
            room.unread.highlights = count;
        }
        if let Some(heroes) = &delta.heroes {
            room.heroes = heroes.clone();
        }
        if delta.joined_member_count.is_some() {
            room.joined_member_count = delta.joined_member_count;
        }
        if delta.invited_member_count.is_some() {
            room.invited_member_count = delta.invited_member_count;
        }
        if timeline_was_empty && delta.prev_batch.is_some() && room.prev_batch.is_none() {
            room.prev_batch = delta.prev_batch.clone();
        }

        room.recount_unread(own_user_id);
        changed |= summary_before
            != (
                room.read_marker.clone(),
                room.heroes.clone(),
                room.joined_member_count,
                room.invited_member_count,
                room.prev_batch.clone(),
                room.unread,
            );

        if changed {
            changes.rooms.insert(room_id.clone());
            if room.is_space() {
                changes.spaces.insert(room_id.clone());
            }
        }
    }

    fn apply_late_decryption(&mut self, late: &LateDecryption, changes: &mut ChangeSet) {
        let Some(room) = self.rooms.get_mut(&late.room_id) else {
            warn!("late decryption for unknown room {}", late.room_id);
            return;
        };
        let is_placeholder = room
            .event(&late.event_id)
            .is_some_and(|e| e.status.is_placeholder());
        if !is_placeholder {
            debug!("no placeholder for {} in {}", late.event_id, late.room_id);
            return;
        }

        let room = Arc::make_mut(room);
        let Some(event) = room.event_mut(&late.event_id) else {
            return;
        };
        event.set_decryption(&late.result);
        let event = event.clone();
        match &late.result {
            Ok(_) => changes.replaced.push((late.room_id.clone(), event)),
            Err(failure) => {
                if let DecryptionStatus::Pending(_) = event.status {
                    // An evicted event is not retried anymore.
                    if let Some(event) = room.event_mut(&late.event_id) {
                        event.status = DecryptionStatus::Failed(*failure);
                    }
                }
                changes
                    .failed_decryptions
                    .push((late.room_id.clone(), late.event_id.clone(), *failure));
            }
        }
        room.recount_unread(&self.own_user_id);
        changes.rooms.insert(late.room_id.clone());
    }

    /// Applies a change made on this device.
    ///
    /// # Errors
    ///
    /// [`EngineError::UnknownRoom`] if the room is not in the model.
    pub fn apply_local(&mut self, change: LocalChange) -> Result<ChangeSet, EngineError> {
        let room_id = change.room_id().clone();
        if !self.rooms.contains_key(&room_id) {
            return Err(EngineError::UnknownRoom(room_id));
        }

        let mut changes = ChangeSet::default();
        if let LocalChange::LateDecryption(late) = &change {
            self.apply_late_decryption(late, &mut changes);
            return Ok(changes);
        }

        let own_user_id = &self.own_user_id;
        let spaces = &mut self.spaces;
        let Some(room) = self.rooms.get_mut(&room_id).map(Arc::make_mut) else {
            return Err(EngineError::UnknownRoom(room_id));
        };

        match change {
            LocalChange::Echo {
                transaction_id,
                event_type,
                content,
                timestamp,
                ..
            } => {
                if room.pending.iter().any(|e| e.transaction_id == transaction_id) {
                    return Ok(changes);
                }
                room.pending.push(LocalEcho {
                    transaction_id,
                    event_type,
                    content,
                    timestamp,
                    state: EchoState::Sending,
                });
            }
            LocalChange::Sent {
                transaction_id,
                event_id,
                ..
            } => {
                if room.has_seen(&event_id) {
                    room.pending.retain(|e| e.transaction_id != transaction_id);
                    changes.resolved_echoes.push((room_id.clone(), transaction_id));
                } else if let Some(echo) = room
                    .pending
                    .iter_mut()
                    .find(|e| e.transaction_id == transaction_id)
                {
                    echo.state = EchoState::Sent(event_id);
                }
            }
            LocalChange::SendFailed {
                transaction_id,
                error,
                ..
            } => {
                if let Some(echo) = room
                    .pending
                    .iter_mut()
                    .find(|e| e.transaction_id == transaction_id)
                {
                    echo.state = EchoState::Failed(error);
                }
            }
            LocalChange::Backfill {
                events,
                end,
                gap: Some(before),
                ..
            } => {
                let added = fill_gap(room, spaces, &before, &events, end, &mut changes);
                room.recount_unread(own_user_id);
                debug!("filled {} events of the gap before {} in {}", added, before, room_id);
            }
            LocalChange::Backfill {
                events,
                end,
                gap: None,
                ..
            } => {
                let mut added = 0;
                for event in &events {
                    if !room.mark_seen(event.raw.event_id.clone()) {
                        continue;
                    }
                    let token = room.take_backfill_token();
                    if let Some(state_key) = &event.raw.state_key {
                        apply_state(room, spaces, &event.raw.event_type, state_key, &event.raw.content, token, &mut changes);
                    }
                    room.timeline.insert(0, TimelineEvent::from_sync(event, token));
                    added += 1;
                }
                room.prev_batch = end;
                room.recount_unread(own_user_id);
                debug!("backfilled {} events in {}", added, room_id);
            }
            LocalChange::LateDecryption(_) => {}
        }

        changes.rooms.insert(room_id.clone());
        if room.is_space() {
            changes.spaces.insert(room_id);
        }
        Ok(changes)
    }
}

/// Inserts the events fetched for the gap before `before`, newest first.
///
/// The gap is closed when the start of the room or an already known event
/// is reached, otherwise it continues from `end`. Returns the number of
/// events inserted.
fn fill_gap(
    room: &mut Room,
    spaces: &mut Arc<SpaceIndex>,
    before: &OwnedEventId,
    events: &[SyncEvent],
    end: Option<String>,
    changes: &mut ChangeSet,
) -> usize {
    let Some(position) = room.gaps.iter().position(|gap| gap.before == *before) else {
        debug!("no gap before {} in {}", before, room.room_id);
        return 0;
    };
    let mut gap = room.gaps.remove(position);
    let mut closed = end.is_none();
    let mut added = 0;

    for event in events {
        if room.has_seen(&event.raw.event_id) {
            closed = true;
            break;
        }
        let Some(token) = gap.take_token() else {
            warn!("gap before {} in {} is too large, leaving it", gap.before, room.room_id);
            closed = true;
            break;
        };
        room.mark_seen(event.raw.event_id.clone());
        if let Some(state_key) = &event.raw.state_key {
            apply_state(room, spaces, &event.raw.event_type, state_key, &event.raw.content, token, changes);
        }
        let index = room.timeline.partition_point(|e| e.token < token);
        room.timeline.insert(index, TimelineEvent::from_sync(event, token));
        gap.before = event.raw.event_id.clone();
        added += 1;
    }

    if let (false, Some(end)) = (closed, end) {
        gap.prev_batch = end;
        room.gaps.insert(position, gap);
    }
    added
}

/// Appends a timeline event unless it is known, in which case a decrypted
/// copy may still replace its placeholder.
///
/// Returns whether the room changed.
fn merge_timeline_event(
    room: &mut Room,
    spaces: &mut Arc<SpaceIndex>,
    own_user_id: &OwnedUserId,
    event: &SyncEvent,
    changes: &mut ChangeSet,
) -> bool {
    let event_id = &event.raw.event_id;
    if room.has_seen(event_id) {
        let Some(Ok(decrypted)) = &event.decrypted else {
            return false;
        };
        let room_id = room.room_id.clone();
        let Some(known) = room.event_mut(event_id) else {
            return false;
        };
        if !known.status.is_placeholder() {
            return false;
        }
        known.set_decryption(&Ok(decrypted.clone()));
        changes.replaced.push((room_id, known.clone()));
        return true;
    }

    room.mark_seen(event_id.clone());
    let token = room.take_token();
    let timeline_event = TimelineEvent::from_sync(event, token);
    if let Some(state_key) = &event.raw.state_key {
        apply_state(room, spaces, &event.raw.event_type, state_key, &event.raw.content, token, changes);
    }

    if event.raw.sender == *own_user_id {
        let transaction_id = event.raw.unsigned.transaction_id.as_deref();
        let before = room.pending.len();
        let mut resolved = Vec::new();
        room.pending.retain(|echo| {
            let matches = Some(echo.transaction_id.as_str()) == transaction_id
                || echo.state == EchoState::Sent(event_id.clone());
            if matches {
                resolved.push(echo.transaction_id.clone());
            }
            !matches
        });
        if room.pending.len() != before {
            debug!("remote echo {} replaces {} local echo", event_id, before - room.pending.len());
        }
        changes
            .resolved_echoes
            .extend(resolved.into_iter().map(|txn| (room.room_id.clone(), txn)));
    }

    if let DecryptionStatus::Failed(failure) = timeline_event.status {
        changes
            .failed_decryptions
            .push((room.room_id.clone(), event_id.clone(), failure));
    }
    changes.new_events.push((room.room_id.clone(), timeline_event.clone()));
    room.timeline.push(timeline_event);
    true
}

/// Applies a state event to the room and the space index.
fn apply_state(
    room: &mut Room,
    spaces: &mut Arc<SpaceIndex>,
    event_type: &str,
    state_key: &str,
    content: &Value,
    token: OrderingToken,
    changes: &mut ChangeSet,
) -> bool {
    let previous_membership = (event_type == "m.room.member")
        .then(|| OwnedUserId::try_from(state_key).ok())
        .flatten()
        .and_then(|user_id| room.members.get(&user_id).map(|m| m.membership));

    if !room.apply_state(event_type, state_key, content, token) {
        return false;
    }

    match event_type {
        "m.room.member" => {
            let member = OwnedUserId::try_from(state_key)
                .ok()
                .and_then(|user_id| room.members.get(&user_id));
            if let Some(member) = member {
                if previous_membership != Some(member.membership) {
                    changes.membership_changes.push(MembershipChange {
                        room_id: room.room_id.clone(),
                        user_id: member.user_id.clone(),
                        membership: member.membership,
                    });
                }
            }
        }
        "m.space.child" | "m.space.parent" => {
            let Ok(other) = OwnedRoomId::try_from(state_key) else {
                debug!("ignore space relation to invalid id {}", state_key);
                return true;
            };
            let present = content.as_object().is_some_and(|c| !c.is_empty());
            let index = Arc::make_mut(spaces);
            let updated = if event_type == "m.space.child" {
                index.set_child(&room.room_id, other.clone(), present)
            } else {
                index.set_parent(&room.room_id, other.clone(), present)
            };
            if updated {
                let space = if event_type == "m.space.child" { room.room_id.clone() } else { other };
                changes.spaces.insert(space);
            }
        }
        _ => {}
    }
    true
}

/// Events read by `own_user_id` according to an `m.receipt` content.
fn own_receipts(content: &Value, own_user_id: &OwnedUserId) -> Vec<OwnedEventId> {
    let Some(receipts) = content.as_object() else {
        return Vec::new();
    };
    receipts
        .iter()
        .filter(|(_, receipt)| {
            ["m.read", "m.read.private"]
                .iter()
                .any(|kind| receipt[*kind].get(own_user_id.as_str()).is_some())
        })
        .filter_map(|(event_id, _)| OwnedEventId::try_from(event_id.as_str()).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use serde_json::json;

    use super::*;
    use crate::crypto::DecryptedEvent;

    fn own() -> OwnedUserId {
        "@me:example.org".try_into().unwrap()
    }

    fn room_id(id: &str) -> OwnedRoomId {
        id.try_into().unwrap()
    }

    fn event_id(id: &str) -> OwnedEventId {
        id.try_into().unwrap()
    }

    fn message(id: &str, sender: &str, body: &str) -> Value {
        json!({
            "event_id": id,
            "sender": sender,
            "type": "m.room.message",
            "content": { "msgtype": "m.text", "body": body },
            "origin_server_ts": 1,
        })
    }

    fn state(id: &str, event_type: &str, state_key: &str, content: Value) -> Value {
        json!({
            "event_id": id,
            "sender": "@bob:example.org",
            "type": event_type,
            "state_key": state_key,
            "content": content,
            "origin_server_ts": 1,
        })
    }

    fn delta(cursor: &str, join: Value) -> SyncDelta {
        SyncDelta::parse(json!({ "next_batch": cursor, "rooms": { "join": join } }), None).unwrap()
    }

    fn joined(state_events: Vec<Value>, timeline: Vec<Value>) -> Value {
        json!({
            "state": { "events": state_events },
            "timeline": { "events": timeline, "prev_batch": "p0" },
        })
    }

    fn decrypted(body: &str) -> DecryptedEvent {
        DecryptedEvent {
            event_type: "m.room.message".to_owned(),
            content: json!({ "body": body }),
            sender_key: "key".to_owned(),
            sender_device: None,
            session_id: "session".to_owned(),
            message_index: 0,
            verified: false,
        }
    }

    fn encrypted(id: &str) -> Value {
        json!({
            "event_id": id,
            "sender": "@bob:example.org",
            "type": "m.room.encrypted",
            "content": { "algorithm": "m.megolm.v1.aes-sha2", "session_id": "session" },
            "origin_server_ts": 1,
        })
    }

    #[test]
    fn test_state_then_timeline() {
        let mut model = RoomModel::new(own());
        let changes = model.apply_delta(&delta(
            "s1",
            json!({
                "!a:example.org": joined(
                    vec![
                        state("$name:x", "m.room.name", "", json!({ "name": "Alpha" })),
                        state("$bob:x", "m.room.member", "@bob:example.org", json!({ "membership": "join", "displayname": "Bob" })),
                    ],
                    vec![message("$m1:x", "@bob:example.org", "hello"), message("$m2:x", "@me:example.org", "hi")],
                ),
            }),
        ));

        let room = model.room(&room_id("!a:example.org")).unwrap();
        assert_eq!(room.name.as_deref(), Some("Alpha"));
        assert_eq!(room.timeline.len(), 2);
        assert!(room.timeline[0].token < room.timeline[1].token);
        assert_eq!(room.unread.messages, 1);
        assert_eq!(room.prev_batch.as_deref(), Some("p0"));
        assert_eq!(changes.new_events.len(), 2);
        assert_eq!(changes.membership_changes.len(), 1);
        assert_eq!(changes.membership_changes[0].membership, Membership::Join);
    }

    #[test]
    fn test_duplicate_delta_is_a_no_op() {
        let mut model = RoomModel::new(own());
        let first = delta(
            "s1",
            json!({ "!a:example.org": joined(vec![], vec![message("$m1:x", "@bob:example.org", "hello")]) }),
        );
        model.apply_delta(&first);
        let before = model.persisted();

        let changes = model.apply_delta(&first);
        assert!(changes.is_empty());
        assert!(changes.new_events.is_empty());
        assert_eq!(model.persisted(), before);
    }

    #[test]
    fn test_read_marker_limits_unread() {
        let mut model = RoomModel::new(own());
        let mut room = joined(
            vec![],
            vec![
                message("$m1:x", "@bob:example.org", "one"),
                message("$m2:x", "@bob:example.org", "two"),
                message("$m3:x", "@bob:example.org", "three"),
            ],
        );
        room["ephemeral"] = json!({ "events": [{
            "type": "m.receipt",
            "content": { "$m2:x": { "m.read": { "@me:example.org": { "ts": 1 } } } },
        }] });
        model.apply_delta(&delta("s1", json!({ "!a:example.org": room })));
        assert_eq!(model.room(&room_id("!a:example.org")).unwrap().unread.messages, 1);

        // An older marker does not move the read position back.
        let mut older = joined(vec![], vec![]);
        older["account_data"] = json!({ "events": [{ "type": "m.fully_read", "content": { "event_id": "$m1:x" } }] });
        model.apply_delta(&delta("s2", json!({ "!a:example.org": older })));
        let room = model.room(&room_id("!a:example.org")).unwrap();
        assert_eq!(room.read_marker, Some(event_id("$m2:x")));
        assert_eq!(room.unread.messages, 1);
    }

    #[test]
    fn test_encryption_flag_is_never_unset() {
        let mut model = RoomModel::new(own());
        model.apply_delta(&delta(
            "s1",
            json!({ "!a:example.org": joined(vec![
                state("$enc:x", "m.room.encryption", "", json!({ "algorithm": "m.megolm.v1.aes-sha2", "rotation_period_msgs": 10 })),
            ], vec![]) }),
        ));
        model.apply_delta(&delta(
            "s2",
            json!({ "!a:example.org": joined(vec![], vec![
                state("$enc2:x", "m.room.encryption", "", json!({})),
            ]) }),
        ));

        let room = model.room(&room_id("!a:example.org")).unwrap();
        let encryption = room.encryption.as_ref().unwrap();
        assert_eq!(encryption.rotation_period_msgs, Some(10));
    }

    #[test]
    fn test_placeholder_replaced_by_late_decryption() {
        let mut model = RoomModel::new(own());
        let mut first = delta("s1", json!({ "!a:example.org": joined(vec![], vec![encrypted("$e1:x")]) }));
        first.rooms[0].timeline[0].decrypted = Some(Err(DecryptionFailure::NoMatchingSession));
        model.apply_delta(&first);
        let room = model.room(&room_id("!a:example.org")).unwrap();
        assert_eq!(
            room.timeline[0].status,
            DecryptionStatus::Pending(DecryptionFailure::NoMatchingSession)
        );
        let token = room.timeline[0].token;

        let mut second = delta("s2", json!({}));
        second.late_decryptions.push(LateDecryption {
            room_id: room_id("!a:example.org"),
            event_id: event_id("$e1:x"),
            result: Ok(decrypted("secret")),
        });
        let changes = model.apply_delta(&second);

        let room = model.room(&room_id("!a:example.org")).unwrap();
        assert_eq!(room.timeline.len(), 1);
        assert_eq!(room.timeline[0].token, token);
        assert_eq!(room.timeline[0].body(), Some("secret"));
        assert_eq!(room.timeline[0].event_type, "m.room.message");
        assert_eq!(changes.replaced.len(), 1);
    }

    #[test]
    fn test_evicted_event_becomes_failed() {
        let mut model = RoomModel::new(own());
        model.apply_delta(&delta("s1", json!({ "!a:example.org": joined(vec![], vec![encrypted("$e1:x")]) })));

        let changes = model
            .apply_local(LocalChange::LateDecryption(LateDecryption {
                room_id: room_id("!a:example.org"),
                event_id: event_id("$e1:x"),
                result: Err(DecryptionFailure::NoMatchingSession),
            }))
            .unwrap();

        assert_eq!(changes.failed_decryptions.len(), 1);
        assert_eq!(
            model.room(&room_id("!a:example.org")).unwrap().timeline[0].status,
            DecryptionStatus::Failed(DecryptionFailure::NoMatchingSession)
        );
    }

    #[test]
    fn test_local_echo_lifecycle() {
        let mut model = RoomModel::new(own());
        model.apply_delta(&delta("s1", json!({ "!a:example.org": joined(vec![], vec![]) })));
        let room = room_id("!a:example.org");

        model
            .apply_local(LocalChange::Echo {
                room_id: room.clone(),
                transaction_id: "txn1".to_owned(),
                event_type: "m.room.message".to_owned(),
                content: json!({ "body": "hello" }),
                timestamp: 1,
            })
            .unwrap();
        model
            .apply_local(LocalChange::Sent {
                room_id: room.clone(),
                transaction_id: "txn1".to_owned(),
                event_id: event_id("$sent:x"),
            })
            .unwrap();
        assert_eq!(
            model.room(&room).unwrap().pending[0].state,
            EchoState::Sent(event_id("$sent:x"))
        );

        let changes = model.apply_delta(&delta(
            "s2",
            json!({ "!a:example.org": joined(vec![], vec![message("$sent:x", "@me:example.org", "hello")]) }),
        ));
        assert!(model.room(&room).unwrap().pending.is_empty());
        assert_eq!(changes.resolved_echoes, vec![(room.clone(), "txn1".to_owned())]);
    }

    #[test]
    fn test_remote_echo_by_transaction_id() {
        let mut model = RoomModel::new(own());
        model.apply_delta(&delta("s1", json!({ "!a:example.org": joined(vec![], vec![]) })));
        let room = room_id("!a:example.org");
        model
            .apply_local(LocalChange::Echo {
                room_id: room.clone(),
                transaction_id: "txn1".to_owned(),
                event_type: "m.room.message".to_owned(),
                content: json!({ "body": "hello" }),
                timestamp: 1,
            })
            .unwrap();

        let mut echo = message("$sent:x", "@me:example.org", "hello");
        echo["unsigned"] = json!({ "transaction_id": "txn1" });
        model.apply_delta(&delta("s2", json!({ "!a:example.org": joined(vec![], vec![echo]) })));
        assert!(model.room(&room).unwrap().pending.is_empty());
    }

    #[test]
    fn test_unknown_room_is_an_error() {
        let mut model = RoomModel::new(own());
        let result = model.apply_local(LocalChange::SendFailed {
            room_id: room_id("!nowhere:example.org"),
            transaction_id: "txn".to_owned(),
            error: "boom".to_owned(),
        });
        assert!(matches!(result, Err(EngineError::UnknownRoom(_))));
    }

    #[test]
    fn test_backfill_keeps_tokens_increasing_and_newer_state() {
        let mut model = RoomModel::new(own());
        model.apply_delta(&delta(
            "s1",
            json!({ "!a:example.org": joined(vec![], vec![
                state("$topic2:x", "m.room.topic", "", json!({ "topic": "new" })),
                message("$m3:x", "@bob:example.org", "three"),
            ]) }),
        ));

        let older: Vec<SyncEvent> = [
            message("$m2:x", "@bob:example.org", "two"),
            state("$topic1:x", "m.room.topic", "", json!({ "topic": "old" })),
            message("$m1:x", "@bob:example.org", "one"),
        ]
        .into_iter()
        .map(|raw| SyncEvent::new(serde_json::from_value(raw).unwrap()))
        .collect();
        let room = room_id("!a:example.org");
        model
            .apply_local(LocalChange::Backfill {
                room_id: room.clone(),
                events: older.clone(),
                end: None,
                gap: None,
            })
            .unwrap();
        // Backfilling the same page again adds nothing.
        model
            .apply_local(LocalChange::Backfill {
                room_id: room.clone(),
                events: older,
                end: None,
                gap: None,
            })
            .unwrap();

        let room = model.room(&room).unwrap();
        let bodies: Vec<_> = room.timeline.iter().filter_map(TimelineEvent::body).collect();
        assert_eq!(bodies, vec!["one", "two", "three"]);
        assert!(room.timeline.windows(2).all(|w| w[0].token < w[1].token));
        assert_eq!(room.topic.as_deref(), Some("new"));
        assert_eq!(room.prev_batch, None);
    }

    fn limited(timeline: Vec<Value>, prev_batch: &str) -> Value {
        json!({ "timeline": { "events": timeline, "prev_batch": prev_batch, "limited": true } })
    }

    fn sync_events(events: Vec<Value>) -> Vec<SyncEvent> {
        events
            .into_iter()
            .map(|raw| SyncEvent::new(serde_json::from_value(raw).unwrap()))
            .collect()
    }

    #[test]
    fn test_limited_sync_records_gap_then_backfill_fills_it() {
        let mut model = RoomModel::new(own());
        let room = room_id("!a:example.org");
        model.apply_delta(&delta(
            "s1",
            json!({ "!a:example.org": joined(vec![], vec![message("$m1:x", "@bob:example.org", "one")]) }),
        ));
        let limited_delta = delta(
            "s2",
            json!({ "!a:example.org": limited(vec![message("$m4:x", "@bob:example.org", "four")], "p3") }),
        );
        model.apply_delta(&limited_delta);
        // Redelivery does not open a second gap.
        model.apply_delta(&limited_delta);

        let gaps = &model.room(&room).unwrap().gaps;
        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0].before, event_id("$m4:x"));
        assert_eq!(gaps[0].prev_batch, "p3");
        assert_eq!(model.room(&room).unwrap().prev_batch.as_deref(), Some("p0"));

        model
            .apply_local(LocalChange::Backfill {
                room_id: room.clone(),
                events: sync_events(vec![message("$m3:x", "@bob:example.org", "three")]),
                end: Some("p2".to_owned()),
                gap: Some(event_id("$m4:x")),
            })
            .unwrap();
        let gaps = &model.room(&room).unwrap().gaps;
        assert_eq!(gaps[0].before, event_id("$m3:x"));
        assert_eq!(gaps[0].prev_batch, "p2");

        // Reaching a known event closes the gap.
        model
            .apply_local(LocalChange::Backfill {
                room_id: room.clone(),
                events: sync_events(vec![
                    message("$m2:x", "@bob:example.org", "two"),
                    message("$m1:x", "@bob:example.org", "one"),
                ]),
                end: Some("p0".to_owned()),
                gap: Some(event_id("$m3:x")),
            })
            .unwrap();

        let room = model.room(&room).unwrap();
        assert!(room.gaps.is_empty());
        let bodies: Vec<_> = room.timeline.iter().filter_map(TimelineEvent::body).collect();
        assert_eq!(bodies, vec!["one", "two", "three", "four"]);
        assert!(room.timeline.windows(2).all(|w| w[0].token < w[1].token));
        assert_eq!(room.unread.messages, 4);
    }

    #[test]
    fn test_limited_first_sync_has_no_gap() {
        let mut model = RoomModel::new(own());
        model.apply_delta(&delta(
            "s1",
            json!({ "!a:example.org": limited(vec![message("$m1:x", "@bob:example.org", "one")], "p0") }),
        ));
        let room = model.room(&room_id("!a:example.org")).unwrap();
        assert!(room.gaps.is_empty());
        assert_eq!(room.prev_batch.as_deref(), Some("p0"));
    }

    #[test]
    fn test_undecryptable_lists_pending_events() {
        let mut model = RoomModel::new(own());
        let mut first = delta(
            "s1",
            json!({ "!a:example.org": joined(vec![], vec![encrypted("$e1:x"), encrypted("$e2:x")]) }),
        );
        first.rooms[0].timeline[0].decrypted = Some(Err(DecryptionFailure::NoMatchingSession));
        first.rooms[0].timeline[1].decrypted = Some(Err(DecryptionFailure::ReplayDetected));
        model.apply_delta(&first);

        let restored = RoomModel::restore(own(), model.persisted());
        let pending = restored.undecryptable();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].event.event_id, event_id("$e1:x"));
        assert_eq!(pending[0].session_id, "session");
        assert!(pending[0].event.is_encrypted());
    }

    #[test]
    fn test_spaces_and_hierarchy() {
        let mut model = RoomModel::new(own());
        let changes = model.apply_delta(&delta(
            "s1",
            json!({
                "!space:example.org": joined(vec![
                    state("$create:x", "m.room.create", "", json!({ "type": "m.space" })),
                    state("$name:x", "m.room.name", "", json!({ "name": "Work" })),
                    state("$c1:x", "m.space.child", "!b:example.org", json!({ "via": ["example.org"] })),
                    state("$c2:x", "m.space.child", "!missing:example.org", json!({ "via": ["example.org"] })),
                ], vec![]),
                "!b:example.org": joined(vec![state("$nb:x", "m.room.name", "", json!({ "name": "beta" }))], vec![]),
                "!a:example.org": joined(vec![
                    state("$na:x", "m.room.name", "", json!({ "name": "Alpha" })),
                    state("$p:x", "m.space.parent", "!space:example.org", json!({ "via": ["example.org"] })),
                ], vec![]),
                "!c:example.org": joined(vec![state("$nc:x", "m.room.name", "", json!({ "name": "charlie" }))], vec![]),
            }),
        ));
        assert!(changes.spaces.contains(&room_id("!space:example.org")));

        let snapshot = model.snapshot();
        let space = room_id("!space:example.org");
        assert_eq!(
            snapshot.children_of(&space),
            vec![room_id("!a:example.org"), room_id("!b:example.org")]
        );
        assert_eq!(snapshot.dangling_children_of(&space), vec![room_id("!missing:example.org")]);
        assert_eq!(snapshot.parents_of(&room_id("!a:example.org")), vec![space.clone()]);

        let hierarchy = snapshot.hierarchy();
        assert_eq!(hierarchy.top_level_spaces, vec![space.clone()]);
        assert_eq!(hierarchy.orphans, vec![room_id("!c:example.org")]);
        assert_eq!(
            hierarchy.children[&space],
            vec![room_id("!a:example.org"), room_id("!b:example.org")]
        );

        // Removing the child relation turns the room into an orphan.
        model.apply_delta(&delta(
            "s2",
            json!({ "!space:example.org": joined(vec![], vec![
                state("$c3:x", "m.space.child", "!b:example.org", json!({})),
            ]) }),
        ));
        let hierarchy = model.snapshot().hierarchy();
        assert_eq!(hierarchy.orphans, vec![room_id("!b:example.org"), room_id("!c:example.org")]);
    }

    #[test]
    fn test_snapshot_is_isolated_from_later_changes() {
        let mut model = RoomModel::new(own());
        model.apply_delta(&delta(
            "s1",
            json!({ "!a:example.org": joined(vec![], vec![message("$m1:x", "@bob:example.org", "one")]) }),
        ));
        let snapshot = model.snapshot();
        model.apply_delta(&delta(
            "s2",
            json!({ "!a:example.org": joined(vec![], vec![message("$m2:x", "@bob:example.org", "two")]) }),
        ));

        let room = room_id("!a:example.org");
        assert_eq!(snapshot.room(&room).unwrap().timeline.len(), 1);
        assert_eq!(model.room(&room).unwrap().timeline.len(), 2);
    }

    #[test]
    fn test_restore_fails_interrupted_echoes() {
        let mut model = RoomModel::new(own());
        model.apply_delta(&delta("s1", json!({ "!a:example.org": joined(vec![], vec![]) })));
        let room = room_id("!a:example.org");
        model
            .apply_local(LocalChange::Echo {
                room_id: room.clone(),
                transaction_id: "txn1".to_owned(),
                event_type: "m.room.message".to_owned(),
                content: json!({ "body": "hello" }),
                timestamp: 1,
            })
            .unwrap();

        let restored = RoomModel::restore(own(), model.persisted());
        assert!(matches!(
            restored.room(&room).unwrap().pending[0].state,
            EchoState::Failed(_)
        ));
    }

    /// One event of a generated delta.
    #[derive(Debug, Clone)]
    enum Step {
        Message { from_me: bool },
        Topic,
        Member { join: bool },
    }

    fn step() -> impl Strategy<Value = Step> {
        prop_oneof![
            any::<bool>().prop_map(|from_me| Step::Message { from_me }),
            Just(Step::Topic),
            any::<bool>().prop_map(|join| Step::Member { join }),
        ]
    }

    fn generated_delta(index: usize, steps: &[(bool, Step)]) -> SyncDelta {
        let mut rooms: BTreeMap<&str, Vec<Value>> = BTreeMap::new();
        for (position, (second_room, step)) in steps.iter().enumerate() {
            let room = if *second_room { "!b:example.org" } else { "!a:example.org" };
            let id = format!("$d{}e{}:x", index, position);
            let event = match step {
                Step::Message { from_me } => {
                    let sender = if *from_me { "@me:example.org" } else { "@bob:example.org" };
                    message(&id, sender, &id)
                }
                Step::Topic => state(&id, "m.room.topic", "", json!({ "topic": id })),
                Step::Member { join } => state(
                    &id,
                    "m.room.member",
                    "@carol:example.org",
                    json!({ "membership": if *join { "join" } else { "leave" } }),
                ),
            };
            rooms.entry(room).or_default().push(event);
        }
        let join: serde_json::Map<String, Value> = rooms
            .into_iter()
            .map(|(room, events)| (room.to_owned(), joined(vec![], events)))
            .collect();
        delta(&format!("s{}", index), Value::Object(join))
    }

    proptest! {
        #[test]
        fn prop_redelivery_does_not_change_the_result(
            deltas in prop::collection::vec(prop::collection::vec((any::<bool>(), step()), 0..6), 1..6),
            redeliver in prop::collection::vec(any::<bool>(), 6),
        ) {
            let deltas: Vec<SyncDelta> = deltas
                .iter()
                .enumerate()
                .map(|(index, steps)| generated_delta(index, steps))
                .collect();

            let mut once = RoomModel::new(own());
            let mut at_least_once = RoomModel::new(own());
            for (index, delta) in deltas.iter().enumerate() {
                once.apply_delta(delta);
                at_least_once.apply_delta(delta);
                if redeliver[index] {
                    // Crash before the cursor was persisted: restart and replay.
                    at_least_once = RoomModel::restore(own(), at_least_once.persisted());
                    at_least_once.apply_delta(delta);
                }
            }

            prop_assert_eq!(once.persisted(), at_least_once.persisted());
            for room in once.persisted().rooms.values() {
                prop_assert!(room.timeline.windows(2).all(|w| w[0].token < w[1].token));
            }
        }
    }
}
