//! Incremental synchronization with the homeserver.
//!
//! This module provides the [`SyncEngine`], which long-polls `/sync` in its own
//! task and hands every response, parsed into a [`SyncDelta`], to a single
//! consumer. The cursor only advances once the consumer acknowledged the delta.
//!
//! # Example
//!
//! ```ignore
//! let engine = SyncEngine::new(client, settings);
//! let (handle, mut deltas) = engine.start(status_tx);
//!
//! while let Some(pending) = deltas.recv().await {
//!     model.apply_delta(&pending.delta);
//!     pending.ack.send(Ok(())).ok();
//! }
//! handle.stop().await;
//! ```

pub mod backoff;
pub mod delta;
pub mod engine;

use std::time::Duration;

pub use crate::sync::{
    backoff::Backoff,
    delta::{MalformedSync, RoomDelta, RoomMembership, SyncDelta, SyncEvent},
    engine::{DeltaStream, PendingDelta, SyncEngine, SyncHandle, SyncStatus},
};

/// Reconnection delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffSettings {
    /// Delay cap of the first retry.
    pub initial: Duration,
    /// Upper bound of any single delay.
    pub max: Duration,
    /// Give up after failing for this long, `None` retries forever.
    pub max_elapsed: Option<Duration>,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        BackoffSettings {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(60),
            max_elapsed: Some(Duration::from_secs(15 * 60)),
        }
    }
}

/// Settings of the sync loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSettings {
    /// Long-poll timeout requested from the homeserver.
    pub timeout: Duration,
    /// Extra time granted to the HTTP request before it counts as failed.
    pub client_margin: Duration,
    pub backoff: BackoffSettings,
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            timeout: Duration::from_secs(30),
            client_margin: Duration::from_secs(10),
            backoff: BackoffSettings::default(),
        }
    }
}
