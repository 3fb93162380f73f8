//! Durable, encrypted local state.
//!
//! The store is made of independent record files sealed by the same
//! [`StoreCipher`]:
//!
//! - [`CredentialStore`] holds the logged-in session and the sync cursor,
//! - [`KeyStore`] holds the Olm account, peer devices, Megolm sessions and
//!   the replay index in an encrypted SQLite database,
//! - [`RoomStore`] holds the room model so a restart does not need a full
//!   initial sync.
//!
//! Every record carries a schema version. Older records are migrated on load
//! and newer ones are refused.

pub mod cipher;
pub mod credentials;
pub mod keys;
mod record;
pub mod rooms;

use matrix_sdk::ruma::{OwnedDeviceId, OwnedUserId};
use matrix_sdk_crypto::CryptoStoreError;
use thiserror::Error;

use crate::error::EngineError;

pub use crate::store::{
    cipher::StoreCipher,
    credentials::{CredentialStore, Session},
    keys::KeyStore,
    rooms::RoomStore,
};

/// Argon2 cost parameters of the store key derivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfParams {
    /// Memory cost in KiB.
    pub memory_kib: u32,
    /// Number of passes.
    pub iterations: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        KdfParams {
            memory_kib: 19 * 1024,
            iterations: 2,
        }
    }
}

/// Failure of a store operation.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Nothing was stored yet.
    #[error("record not found")]
    NotFound,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The record cannot be decrypted or parsed.
    #[error("corrupted record: {0}")]
    Corrupted(String),

    /// The record was written by a newer version of the engine.
    #[error("record schema {found} is newer than the supported schema {supported}")]
    UnsupportedSchema { found: u32, supported: u32 },

    /// The store is passphrase protected and no passphrase was configured.
    #[error("the store is protected by a passphrase but none was configured")]
    PassphraseRequired,

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The encryption database failed.
    #[error("crypto store error: {0}")]
    Crypto(String),

    /// The device is not known locally.
    #[error("unknown device {device_id} of {user_id}")]
    UnknownDevice {
        user_id: OwnedUserId,
        device_id: OwnedDeviceId,
    },
}

impl From<CryptoStoreError> for StoreError {
    fn from(error: CryptoStoreError) -> Self {
        StoreError::Crypto(error.to_string())
    }
}

impl From<StoreError> for EngineError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::NotFound => EngineError::NotLoggedIn,
            StoreError::PassphraseRequired | StoreError::UnknownDevice { .. } => {
                EngineError::InvalidInput(error.to_string())
            }
            error => EngineError::StorageCorruption(error.to_string()),
        }
    }
}

/// Cipher with a fixed key, skipping the key derivation.
#[cfg(test)]
pub(crate) fn test_cipher() -> StoreCipher {
    StoreCipher::from_key([7u8; 32])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_error_mapping() {
        assert!(matches!(
            EngineError::from(StoreError::NotFound),
            EngineError::NotLoggedIn
        ));
        assert!(matches!(
            EngineError::from(StoreError::Corrupted("tag".to_owned())),
            EngineError::StorageCorruption(_)
        ));
        assert!(matches!(
            EngineError::from(StoreError::UnsupportedSchema {
                found: 9,
                supported: 2
            }),
            EngineError::StorageCorruption(_)
        ));
        assert!(matches!(
            EngineError::from(StoreError::Crypto("database is locked".to_owned())),
            EngineError::StorageCorruption(_)
        ));
        assert!(matches!(
            EngineError::from(StoreError::PassphraseRequired),
            EngineError::InvalidInput(_)
        ));
    }
}
