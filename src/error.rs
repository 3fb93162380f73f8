//! Error taxonomy of the session engine.
//!
//! Every component reports failures with its own error type (`RequestError`,
//! `StoreError`, ...). They all funnel into [`EngineError`], whose variants map
//! one-to-one onto the propagation policy of the engine:
//!
//! - [`EngineError::Transport`] is retryable and triggers backoff,
//! - [`EngineError::AuthExpired`] is fatal and requires a new login,
//! - [`EngineError::Decryption`] is local and never stops the sync loop,
//! - [`EngineError::StorageCorruption`] is fatal and surfaced to the user,
//! - [`EngineError::Protocol`] is logged and the offending delta is skipped.

use std::{fmt, time::Duration};

use matrix_sdk::ruma::OwnedRoomId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Reason why an encrypted event could not be decrypted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DecryptionFailure {
    /// No inbound session matches the event yet; the event is buffered.
    NoMatchingSession,
    /// The session cannot ratchet to the requested message index.
    RatchetExhausted,
    /// The message index was already used by another event.
    ReplayDetected,
    /// The ciphertext, its signature or its envelope is invalid.
    MalformedCiphertext,
    /// The sending device is blacklisted: its keys are not trusted.
    BlacklistedSender,
}

impl DecryptionFailure {
    /// Whether a later key arrival may still make the event readable.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, DecryptionFailure::NoMatchingSession)
    }
}

impl fmt::Display for DecryptionFailure {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let reason = match self {
            DecryptionFailure::NoMatchingSession => "no matching session",
            DecryptionFailure::RatchetExhausted => "ratchet exhausted",
            DecryptionFailure::ReplayDetected => "replay detected",
            DecryptionFailure::MalformedCiphertext => "malformed ciphertext",
            DecryptionFailure::BlacklistedSender => "sender device is blacklisted",
        };
        f.write_str(reason)
    }
}

/// Top-level error of the session engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Network failure, timeout or transient server error.
    #[error("transport error: {0}")]
    Transport(String),

    /// The access token was rejected and could not be refreshed.
    #[error("access token expired or revoked")]
    AuthExpired,

    /// The homeserver refused the login attempt.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// An event could not be decrypted.
    #[error("decryption failed: {0}")]
    Decryption(DecryptionFailure),

    /// Local persisted state cannot be read back.
    #[error("local storage is corrupted: {0}; reset the local state and log in again")]
    StorageCorruption(String),

    /// The homeserver answered with something we cannot interpret.
    #[error("malformed server response: {0}")]
    Protocol(String),

    /// The homeserver stayed unreachable for longer than allowed.
    #[error("homeserver unreachable for {0:?}")]
    ConnectivityLost(Duration),

    /// The operation needs an active session.
    #[error("not logged in")]
    NotLoggedIn,

    /// The room is not known locally.
    #[error("unknown room {0}")]
    UnknownRoom(OwnedRoomId),

    /// The caller passed an unusable argument.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl EngineError {
    /// Whether the sync loop should back off and retry after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Transport(_) | EngineError::Protocol(_))
    }

    /// Whether the error ends the session and must reach the state machine.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::AuthExpired
                | EngineError::StorageCorruption(_)
                | EngineError::ConnectivityLost(_)
        )
    }
}

impl From<DecryptionFailure> for EngineError {
    fn from(reason: DecryptionFailure) -> Self {
        EngineError::Decryption(reason)
    }
}
