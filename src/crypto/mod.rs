//! End-to-end encryption.
//!
//! Olm and Megolm are provided by the [`matrix_sdk_crypto::OlmMachine`] kept
//! in the [`KeyStore`](crate::store::KeyStore). This module connects it to
//! the rest of the engine:
//!
//! - [`transport`] sends the requests of the state machine through the
//!   [`MatrixClient`](crate::matrix::MatrixClient) and feeds the responses
//!   back,
//! - [`buffer::UndecryptableBuffer`] keeps events whose key has not arrived,
//! - [`coordinator::EncryptionCoordinator`] decrypts sync deltas, encrypts
//!   outgoing events and raises security warnings.

pub mod buffer;
pub mod coordinator;
pub mod device;
pub mod transport;

use matrix_sdk::ruma::{OwnedDeviceId, OwnedEventId, OwnedRoomId, OwnedUserId};
use serde::{Deserialize, Serialize};

pub use crate::crypto::{
    buffer::UndecryptableBuffer,
    coordinator::{
        DecryptedEvent, EncryptedMessage, EncryptionCoordinator, WithheldDevice, WithheldReason,
    },
    device::{DeviceKey, DeviceTrust},
};

/// Algorithm of encrypted room events.
pub const MEGOLM_ALGORITHM: &str = "m.megolm.v1.aes-sha2";
/// To-device event type telling a device it will not receive a room key.
pub const ROOM_KEY_WITHHELD_TYPE: &str = "m.room_key.withheld";
/// Decrypted to-device event types carrying a room key.
pub const ROOM_KEY_TYPES: [&str; 2] = ["m.room_key", "m.forwarded_room_key"];

/// When an outbound group session must be replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationPolicy {
    /// Messages encrypted before rotating.
    pub max_messages: u32,
    /// Session lifetime in milliseconds.
    pub max_age_ms: u64,
}

impl Default for RotationPolicy {
    fn default() -> Self {
        RotationPolicy {
            max_messages: 100,
            max_age_ms: 7 * 24 * 60 * 60 * 1000,
        }
    }
}

/// Security-relevant event surfaced to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecurityWarning {
    /// A message index was reused by another event.
    ReplayDetected {
        room_id: OwnedRoomId,
        event_id: OwnedEventId,
        session_id: String,
        message_index: u32,
    },
    /// A known device published a different identity key.
    DeviceKeyChanged {
        user_id: OwnedUserId,
        device_id: OwnedDeviceId,
    },
    /// A room key was offered by a device we refuse keys from, or its
    /// to-device message could not be opened.
    RoomKeyRejected {
        user_id: OwnedUserId,
        device_id: Option<OwnedDeviceId>,
        reason: String,
    },
}
