//! Bounded buffer of events waiting for their room key.

use std::collections::VecDeque;

use log::debug;
use matrix_sdk::ruma::OwnedRoomId;

use crate::matrix::events::RawEvent;

/// Encrypted event kept until its session arrives.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingEvent {
    pub room_id: OwnedRoomId,
    pub session_id: String,
    pub event: RawEvent,
}

impl PendingEvent {
    /// Pending event waiting for the session named in its content.
    pub fn new(room_id: OwnedRoomId, event: RawEvent) -> Self {
        let session_id = event.content["session_id"]
            .as_str()
            .unwrap_or_default()
            .to_owned();
        PendingEvent {
            room_id,
            session_id,
            event,
        }
    }
}

/// FIFO of undecryptable events.
///
/// When full, the oldest event is evicted and handed back to the caller so
/// it can be reported as permanently undecryptable.
#[derive(Debug)]
pub struct UndecryptableBuffer {
    capacity: usize,
    events: VecDeque<PendingEvent>,
}

impl UndecryptableBuffer {
    pub fn new(capacity: usize) -> Self {
        UndecryptableBuffer {
            capacity: capacity.max(1),
            events: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Buffers an event, returning the evicted one if the buffer was full.
    ///
    /// An event already buffered is not added twice.
    pub fn push(&mut self, pending: PendingEvent) -> Option<PendingEvent> {
        if self
            .events
            .iter()
            .any(|e| e.event.event_id == pending.event.event_id)
        {
            return None;
        }

        let evicted = if self.events.len() >= self.capacity {
            self.events.pop_front()
        } else {
            None
        };
        if let Some(evicted) = &evicted {
            debug!(
                "undecryptable buffer full, dropping event {}",
                evicted.event.event_id
            );
        }
        self.events.push_back(pending);
        evicted
    }

    /// Removes and returns the events of a session, oldest first.
    pub fn take_for_session(&mut self, session_id: &str) -> Vec<PendingEvent> {
        let (matching, rest): (VecDeque<_>, VecDeque<_>) = self
            .events
            .drain(..)
            .partition(|e| e.session_id == session_id);
        self.events = rest;
        matching.into()
    }
}
