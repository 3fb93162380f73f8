//! Persistence of the end-to-end encryption state.
//!
//! The Olm account, the Olm and Megolm sessions, the devices of peers and
//! their local trust live in an encrypted SQLite crypto store driven by an
//! [`OlmMachine`]. The passphrase of the database is derived from the store
//! key, so the crypto store is protected like every other record.
//!
//! The replay index is kept in the same database, one value per message
//! index, so recording an index never rewrites the others.

use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use matrix_sdk::{
    SqliteCryptoStore,
    ruma::{DeviceId, EventId, OwnedEventId, RoomId, UserId},
};
use matrix_sdk_crypto::OlmMachine;
use tokio::fs;

use crate::{
    crypto::{DeviceKey, DeviceTrust},
    store::{StoreCipher, StoreError},
    utils::get_path,
};

const CRYPTO_DIR: &str = "crypto";

fn replay_key(room_id: &RoomId, session_id: &str, message_index: u32) -> String {
    format!("omomatrix.replay|{}|{}|{}", room_id, session_id, message_index)
}

/// Key store.
///
/// # Examples
///
/// ```ignore
/// let keys = KeyStore::open(data_dir, &cipher, &user_id, &device_id).await?;
/// let identity = keys.machine().identity_keys();
/// ```
pub struct KeyStore {
    path: PathBuf,
    machine: OlmMachine,
}

impl KeyStore {
    /// Opens the crypto store of a device in `dir`, creating the Olm account
    /// on first use.
    ///
    /// # Errors
    ///
    /// [`StoreError::Crypto`] if the database cannot be opened with the
    /// derived passphrase or belongs to another device.
    pub async fn open(
        dir: &Path,
        cipher: &StoreCipher,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<Self, StoreError> {
        let path = get_path(dir, CRYPTO_DIR);
        fs::create_dir_all(&path).await?;

        let passphrase = cipher.passphrase_for(CRYPTO_DIR);
        let store = SqliteCryptoStore::open(&path, Some(passphrase.as_str()))
            .await
            .map_err(|e| StoreError::Crypto(format!("cannot open {}: {}", path.display(), e)))?;
        let machine = OlmMachine::with_store(user_id, device_id, store, None)
            .await
            .map_err(|e| StoreError::Crypto(e.to_string()))?;

        debug!(
            "opened crypto store of {} {}, identity key {}",
            user_id,
            device_id,
            machine.identity_keys().curve25519.to_base64()
        );
        Ok(KeyStore { path, machine })
    }

    /// The state machine of the logged-in device.
    pub fn machine(&self) -> &OlmMachine {
        &self.machine
    }

    pub async fn device(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<Option<DeviceKey>, StoreError> {
        Ok(self
            .machine
            .get_device(user_id, device_id, None)
            .await?
            .map(|device| DeviceKey::from_device(&device)))
    }

    /// Known devices of a user.
    pub async fn devices_of(&self, user_id: &UserId) -> Result<Vec<DeviceKey>, StoreError> {
        let devices = self.machine.get_user_devices(user_id, None).await?;
        Ok(devices
            .devices()
            .filter(|device| !device.is_deleted())
            .map(|device| DeviceKey::from_device(&device))
            .collect())
    }

    /// Changes the local trust of a device.
    pub async fn set_trust(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        trust: DeviceTrust,
    ) -> Result<(), StoreError> {
        let device = self
            .machine
            .get_device(user_id, device_id, None)
            .await?
            .ok_or_else(|| StoreError::UnknownDevice {
                user_id: user_id.to_owned(),
                device_id: device_id.to_owned(),
            })?;

        if device.local_trust_state() == trust.local_trust() {
            return Ok(());
        }
        info!("device {} of {} is now {}", device_id, user_id, trust);
        device.set_local_trust(trust.local_trust()).await?;
        Ok(())
    }

    /// Records that `event_id` used a message index.
    ///
    /// Returns `false` if another event already used the same index of the
    /// same session: the event is a replay. Recording the same event twice
    /// is accepted.
    pub async fn check_and_record_index(
        &self,
        room_id: &RoomId,
        session_id: &str,
        message_index: u32,
        event_id: &EventId,
    ) -> Result<bool, StoreError> {
        let key = replay_key(room_id, session_id, message_index);
        let store = self.machine.store();

        match store.get_value::<OwnedEventId>(&key).await? {
            Some(known) if known.as_str() == event_id.as_str() => Ok(true),
            Some(known) => {
                warn!(
                    "message index {} of session {} reused by {} (first used by {})",
                    message_index, session_id, event_id, known
                );
                Ok(false)
            }
            None => {
                store.set_value(&key, &event_id.to_owned()).await?;
                Ok(true)
            }
        }
    }

    /// Deletes the crypto store of `dir`, typically on logout or before a
    /// fresh login creates a new device.
    pub async fn remove(dir: &Path) -> Result<(), StoreError> {
        let path = get_path(dir, CRYPTO_DIR);
        match fs::remove_dir_all(&path).await {
            Ok(()) => {
                info!("cleared key store");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
