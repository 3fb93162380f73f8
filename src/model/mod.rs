//! Local model of rooms and spaces.
//!
//! The [`RoomModel`] merges sync deltas and local changes. Everything else
//! reads immutable [`ModelSnapshot`]s.

pub mod room;
pub mod room_model;
pub mod snapshot;
pub mod space;

pub use crate::model::{
    room::{
        DecryptionStatus, EchoState, LocalEcho, Member, OrderingToken, PowerLevels, Room,
        RoomEncryption, TimelineEvent, TimelineGap, UnreadCounters,
    },
    room_model::{ChangeSet, LocalChange, PersistedModel, RoomModel},
    snapshot::{Hierarchy, ModelSnapshot},
    space::SpaceIndex,
};
