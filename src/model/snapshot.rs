//! Read-only views of the model for presentation code.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use matrix_sdk::ruma::{OwnedRoomId, OwnedUserId};

use crate::{model::Room, model::space::SpaceIndex, sync::RoomMembership};

/// Joined rooms arranged under their spaces.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Hierarchy {
    /// Spaces without a joined parent.
    pub top_level_spaces: Vec<OwnedRoomId>,
    /// Rooms that are neither spaces nor children of a joined space.
    pub orphans: Vec<OwnedRoomId>,
    /// Joined children of each joined space.
    pub children: BTreeMap<OwnedRoomId, Vec<OwnedRoomId>>,
}

/// Immutable copy of the model at one point in time.
///
/// Rooms are shared with the model until it modifies them, so taking a
/// snapshot is cheap.
#[derive(Debug, Clone, Default)]
pub struct ModelSnapshot {
    pub(crate) own_user_id: Option<OwnedUserId>,
    pub(crate) rooms: BTreeMap<OwnedRoomId, Arc<Room>>,
    pub(crate) spaces: Arc<SpaceIndex>,
}

impl ModelSnapshot {
    pub fn room(&self, room_id: &OwnedRoomId) -> Option<Arc<Room>> {
        self.rooms.get(room_id).cloned()
    }

    pub fn rooms(&self) -> impl Iterator<Item = &Arc<Room>> {
        self.rooms.values()
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }

    /// Display name of a room, its id if unknown.
    pub fn display_name(&self, room_id: &OwnedRoomId) -> String {
        match (self.rooms.get(room_id), &self.own_user_id) {
            (Some(room), Some(own)) => room.display_name(own),
            _ => room_id.to_string(),
        }
    }

    /// Known children of a space. Children not synced yet are left out.
    pub fn children_of(&self, space: &OwnedRoomId) -> Vec<OwnedRoomId> {
        self.spaces
            .children_of(space)
            .into_iter()
            .filter(|child| self.rooms.contains_key(child))
            .collect()
    }

    /// Children of a space that are not known locally.
    pub fn dangling_children_of(&self, space: &OwnedRoomId) -> Vec<OwnedRoomId> {
        self.spaces
            .children_of(space)
            .into_iter()
            .filter(|child| !self.rooms.contains_key(child))
            .collect()
    }

    /// Known parents of a room.
    pub fn parents_of(&self, room_id: &OwnedRoomId) -> Vec<OwnedRoomId> {
        self.spaces
            .parents_of(room_id)
            .into_iter()
            .filter(|parent| self.rooms.contains_key(parent))
            .collect()
    }

    fn is_joined(&self, room_id: &OwnedRoomId) -> bool {
        self.rooms
            .get(room_id)
            .is_some_and(|room| room.membership == RoomMembership::Joined)
    }

    fn sort_by_name(&self, ids: &mut [OwnedRoomId]) {
        ids.sort_by_cached_key(|id| (self.display_name(id).to_lowercase(), id.clone()));
    }

    /// Arranges the joined rooms under their joined spaces.
    ///
    /// Lists are sorted by display name, ignoring case.
    pub fn hierarchy(&self) -> Hierarchy {
        let joined: Vec<&Arc<Room>> = self
            .rooms
            .values()
            .filter(|room| room.membership == RoomMembership::Joined)
            .collect();

        let mut children = BTreeMap::new();
        let mut has_parent = BTreeSet::new();
        for space in joined.iter().filter(|room| room.is_space()) {
            let mut space_children: Vec<OwnedRoomId> = self
                .spaces
                .children_of(&space.room_id)
                .into_iter()
                .filter(|child| *child != space.room_id && self.is_joined(child))
                .collect();
            if space_children.is_empty() {
                continue;
            }
            self.sort_by_name(&mut space_children);
            has_parent.extend(space_children.iter().cloned());
            children.insert(space.room_id.clone(), space_children);
        }

        let (mut top_level_spaces, mut orphans): (Vec<OwnedRoomId>, Vec<OwnedRoomId>) = joined
            .iter()
            .filter(|room| !has_parent.contains(&room.room_id))
            .map(|room| room.room_id.clone())
            .partition(|id| self.rooms.get(id).is_some_and(|room| room.is_space()));
        self.sort_by_name(&mut top_level_spaces);
        self.sort_by_name(&mut orphans);

        Hierarchy {
            top_level_spaces,
            orphans,
            children,
        }
    }
}
