//! The session facade used by presentation code.
//!
//! A [`SessionManager`] owns the stores, the sync loop, the task applying
//! deltas to the room model and the worker pool. Presentation code reads
//! model snapshots and listens to the notification feed; every call returns
//! without waiting for the network longer than the call itself needs.

mod applier;
pub mod manager;
pub mod notifications;
pub mod workers;

pub use crate::session::{
    manager::SessionManager,
    notifications::{Notification, NotificationHub, NotificationSink},
    workers::WorkerPool,
};

/// Lifecycle of a session.
///
/// ```text
/// LoggedOut -> Authenticating -> Syncing <-> Reconnecting
///                    |              |  \
///                    v              v   -> Fatal
///                AuthFailed <-------
/// ```
///
/// `logout` returns to `LoggedOut` from every state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    LoggedOut,
    Authenticating,
    Syncing,
    /// Sync requests fail and are being retried.
    Reconnecting { attempt: u32, error: String },
    /// The credentials were refused or expired. Log in again.
    AuthFailed(String),
    /// Local storage is unusable or the homeserver stayed unreachable.
    Fatal(String),
}

impl SessionState {
    /// Whether the sync loop is running.
    pub fn is_active(&self) -> bool {
        matches!(self, SessionState::Syncing | SessionState::Reconnecting { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_states() {
        assert!(SessionState::Syncing.is_active());
        assert!(
            SessionState::Reconnecting {
                attempt: 2,
                error: "timeout".to_owned()
            }
            .is_active()
        );
        assert!(!SessionState::Authenticating.is_active());
        assert!(!SessionState::AuthFailed("M_UNKNOWN_TOKEN".to_owned()).is_active());
        assert!(!SessionState::LoggedOut.is_active());
    }
}
