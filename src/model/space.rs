//! Parent/child relations between spaces and rooms.

use std::collections::{BTreeMap, BTreeSet};

use matrix_sdk::ruma::OwnedRoomId;
use serde::{Deserialize, Serialize};

/// Index of space relations, kept apart from the rooms it links.
///
/// A relation is declared either by the space (`m.space.child`) or by the
/// child (`m.space.parent`). Both ends are plain ids: a child may not be
/// known locally yet.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceIndex {
    /// Children declared by each space
    declared_children: BTreeMap<OwnedRoomId, BTreeSet<OwnedRoomId>>,
    /// Parents declared by each room
    declared_parents: BTreeMap<OwnedRoomId, BTreeSet<OwnedRoomId>>,
}

fn set_edge(
    map: &mut BTreeMap<OwnedRoomId, BTreeSet<OwnedRoomId>>,
    from: &OwnedRoomId,
    to: OwnedRoomId,
    present: bool,
) -> bool {
    if present {
        return map.entry(from.clone()).or_default().insert(to);
    }
    let Some(edges) = map.get_mut(from) else {
        return false;
    };
    let removed = edges.remove(&to);
    if edges.is_empty() {
        map.remove(from);
    }
    removed
}

impl SpaceIndex {
    /// Records an `m.space.child` event of `space`.
    ///
    /// Returns whether the index changed.
    pub fn set_child(&mut self, space: &OwnedRoomId, child: OwnedRoomId, present: bool) -> bool {
        set_edge(&mut self.declared_children, space, child, present)
    }

    /// Records an `m.space.parent` event of `room`.
    pub fn set_parent(&mut self, room: &OwnedRoomId, parent: OwnedRoomId, present: bool) -> bool {
        set_edge(&mut self.declared_parents, room, parent, present)
    }

    /// Children of a space, from both declarations.
    pub fn children_of(&self, space: &OwnedRoomId) -> BTreeSet<OwnedRoomId> {
        let mut children = self
            .declared_children
            .get(space)
            .cloned()
            .unwrap_or_default();
        children.extend(
            self.declared_parents
                .iter()
                .filter(|(_, parents)| parents.contains(space))
                .map(|(room, _)| room.clone()),
        );
        children
    }

    /// Parents of a room, from both declarations.
    pub fn parents_of(&self, room: &OwnedRoomId) -> BTreeSet<OwnedRoomId> {
        let mut parents = self.declared_parents.get(room).cloned().unwrap_or_default();
        parents.extend(
            self.declared_children
                .iter()
                .filter(|(_, children)| children.contains(room))
                .map(|(space, _)| space.clone()),
        );
        parents
    }
}
