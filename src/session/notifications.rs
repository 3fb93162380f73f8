//! The notification feed.
//!
//! Every subscriber owns an unbounded queue. Publishing only pushes to the
//! queues, so a slow subscriber never holds up the sync loop.

use std::sync::{Arc, Mutex};

use log::{debug, trace};
use matrix_sdk::ruma::{OwnedEventId, OwnedRoomId};
use tokio::sync::mpsc;

use crate::{
    crypto::{SecurityWarning, WithheldDevice},
    error::DecryptionFailure,
    model::{ChangeSet, TimelineEvent},
    session::SessionState,
    sync::delta::MembershipChange,
};

/// Something the presentation layer may want to react to.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// The session state changed, including connectivity.
    StateChanged(SessionState),
    /// Rooms were updated; read them from a fresh snapshot.
    RoomsChanged {
        rooms: Vec<OwnedRoomId>,
        spaces: Vec<OwnedRoomId>,
    },
    NewEvent {
        room_id: OwnedRoomId,
        event: TimelineEvent,
    },
    /// A placeholder became readable.
    EventDecrypted {
        room_id: OwnedRoomId,
        event: TimelineEvent,
    },
    MembershipChanged(MembershipChange),
    MessageSent {
        room_id: OwnedRoomId,
        transaction_id: String,
        event_id: OwnedEventId,
    },
    MessageSendFailed {
        room_id: OwnedRoomId,
        transaction_id: String,
        error: String,
    },
    /// An event will stay unreadable.
    DecryptionFailed {
        room_id: OwnedRoomId,
        event_id: OwnedEventId,
        reason: DecryptionFailure,
    },
    /// Devices of room members did not receive the room key.
    KeysWithheld {
        room_id: OwnedRoomId,
        devices: Vec<WithheldDevice>,
    },
    SecurityWarning(SecurityWarning),
}

impl Notification {
    /// Notifications describing a model update, in order.
    pub fn from_changes(changes: &ChangeSet) -> Vec<Notification> {
        let mut notifications = Vec::new();
        if changes.is_empty() && changes.spaces.is_empty() {
            return notifications;
        }

        notifications.extend(
            changes
                .membership_changes
                .iter()
                .cloned()
                .map(Notification::MembershipChanged),
        );
        notifications.extend(changes.new_events.iter().map(|(room_id, event)| {
            Notification::NewEvent {
                room_id: room_id.clone(),
                event: event.clone(),
            }
        }));
        notifications.extend(changes.replaced.iter().map(|(room_id, event)| {
            Notification::EventDecrypted {
                room_id: room_id.clone(),
                event: event.clone(),
            }
        }));
        notifications.extend(changes.failed_decryptions.iter().map(
            |(room_id, event_id, reason)| Notification::DecryptionFailed {
                room_id: room_id.clone(),
                event_id: event_id.clone(),
                reason: *reason,
            },
        ));
        notifications.push(Notification::RoomsChanged {
            rooms: changes.rooms.iter().cloned().collect(),
            spaces: changes.spaces.iter().cloned().collect(),
        });
        notifications
    }
}

/// Receives notifications on a task of its own.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Fan-out of notifications to every subscriber.
///
/// Clones share the subscribers.
#[derive(Clone, Default)]
pub struct NotificationHub {
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<Notification>>>>,
}

impl NotificationHub {
    pub fn new() -> Self {
        NotificationHub::default()
    }

    /// Queues a notification for every subscriber.
    pub fn publish(&self, notification: Notification) {
        trace!("publish {:?}", notification);
        let Ok(mut subscribers) = self.subscribers.lock() else {
            return;
        };
        subscribers.retain(|subscriber| subscriber.send(notification.clone()).is_ok());
    }

    pub fn publish_all(&self, notifications: impl IntoIterator<Item = Notification>) {
        for notification in notifications {
            self.publish(notification);
        }
    }

    /// Opens a new queue of notifications.
    ///
    /// Only notifications published after this call are received.
    pub fn receiver(&self) -> mpsc::UnboundedReceiver<Notification> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.push(tx);
        }
        rx
    }

    /// Drains a new queue into `sink` until the hub is dropped.
    pub fn subscribe(&self, sink: Arc<dyn NotificationSink>) {
        let mut receiver = self.receiver();
        tokio::spawn(async move {
            while let Some(notification) = receiver.recv().await {
                sink.notify(notification);
            }
            debug!("notification sink detached");
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().map(|s| s.len()).unwrap_or_default()
    }
}
