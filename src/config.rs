//! Configuration of the session engine.
//!
//! The configuration is read from a YAML file and can be overridden with
//! environment variables prefixed with `OMOMATRIX_`. Nested keys are separated
//! by a double underscore. Every field has a default, so an empty file or no
//! file at all yields a working configuration.
//!
//! # Configuration File Format
//!
//! ```yaml
//! # Homeserver used by the headless runner when no session is stored
//! homeserver: "https://matrix.org"
//!
//! # Display name of the device created at login
//! device_name: "OMOMatrix"
//!
//! sync:
//!   # Long-poll timeout sent to the homeserver
//!   timeout_ms: 30000
//!   # Extra time given to the HTTP request on top of the long-poll timeout
//!   client_timeout_margin_ms: 10000
//!   backoff_initial_ms: 500
//!   backoff_max_ms: 60000
//!   # Give up reconnecting after this many seconds, 0 retries forever
//!   max_elapsed_secs: 900
//!
//! encryption:
//!   rotation_message_count: 100
//!   rotation_period_secs: 604800
//!   undecryptable_buffer_size: 1024
//!   only_verified_devices: false
//!   # Ask our other devices for keys we are missing
//!   room_key_requests: true
//!   # Answer key requests of our own verified devices
//!   room_key_forwarding: true
//!
//! store:
//!   # Derive the store key from a passphrase instead of a local secret file
//!   passphrase: "correct horse battery staple"
//!
//! workers:
//!   max_concurrent: 8
//!
//! media:
//!   avatar_size: 64
//!   request_timeout_secs: 30
//!   profile_ttl_secs: 3600
//! ```
//!
//! # Environment Variable Overrides
//!
//! ```bash
//! export OMOMATRIX_HOMESERVER="https://example.org"
//! export OMOMATRIX_SYNC__TIMEOUT_MS=10000
//! export OMOMATRIX_STORE__PASSPHRASE="secret-from-env"
//! ```

use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::{
    crypto::{RotationPolicy, coordinator::EncryptionSettings},
    store::KdfParams,
    sync::{BackoffSettings, SyncSettings},
};

/// Root configuration structure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Homeserver used by the headless runner for a fresh login.
    pub homeserver: Option<String>,
    /// Display name given to the device created at login.
    pub device_name: String,
    /// Long-poll and reconnection settings.
    pub sync: SyncConfig,
    /// Group session rotation and device trust settings.
    pub encryption: EncryptionConfig,
    /// Encryption at rest settings.
    pub store: StoreConfig,
    /// Background worker pool settings.
    pub workers: WorkersConfig,
    /// Media download settings.
    pub media: MediaConfig,
}

/// Sync loop configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Long-poll timeout sent to the homeserver, in milliseconds.
    pub timeout_ms: u64,
    /// Client side margin added to the long-poll timeout, in milliseconds.
    pub client_timeout_margin_ms: u64,
    /// First reconnection delay, in milliseconds.
    pub backoff_initial_ms: u64,
    /// Upper bound of a single reconnection delay, in milliseconds.
    pub backoff_max_ms: u64,
    /// Maximum time spent reconnecting before giving up, `0` means forever.
    pub max_elapsed_secs: u64,
}

/// Encryption configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncryptionConfig {
    /// Messages encrypted with one outbound session before rotating it.
    pub rotation_message_count: u32,
    /// Lifetime of an outbound session, in seconds.
    pub rotation_period_secs: u64,
    /// Capacity of the buffer of events waiting for their session key.
    pub undecryptable_buffer_size: usize,
    /// Share room keys with verified devices only.
    pub only_verified_devices: bool,
    /// Request missing room keys from our other devices.
    pub room_key_requests: bool,
    /// Forward room keys to our own verified devices asking for them.
    pub room_key_forwarding: bool,
}

/// Store configuration.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Passphrase protecting the store. A random local secret is used if unset.
    pub passphrase: Option<String>,
    /// Argon2 memory cost, in KiB.
    pub kdf_memory_kib: u32,
    /// Argon2 iterations.
    pub kdf_iterations: u32,
}

/// Worker pool configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkersConfig {
    /// Maximum number of background jobs running at once.
    pub max_concurrent: usize,
}

/// Media configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    /// Edge of the requested avatar thumbnails, in pixels.
    pub avatar_size: u32,
    /// Timeout of a single non-sync request, in seconds.
    pub request_timeout_secs: u64,
    /// Time a fetched user profile is served from the cache, in seconds.
    pub profile_ttl_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            homeserver: None,
            device_name: "OMOMatrix".to_owned(),
            sync: SyncConfig::default(),
            encryption: EncryptionConfig::default(),
            store: StoreConfig::default(),
            workers: WorkersConfig::default(),
            media: MediaConfig::default(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            timeout_ms: 30_000,
            client_timeout_margin_ms: 10_000,
            backoff_initial_ms: 500,
            backoff_max_ms: 60_000,
            max_elapsed_secs: 900,
        }
    }
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        EncryptionConfig {
            rotation_message_count: 100,
            rotation_period_secs: 7 * 24 * 60 * 60,
            undecryptable_buffer_size: 1024,
            only_verified_devices: false,
            room_key_requests: true,
            room_key_forwarding: true,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            passphrase: None,
            kdf_memory_kib: 19 * 1024,
            kdf_iterations: 2,
        }
    }
}

// The passphrase must never reach the logs.
impl std::fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreConfig")
            .field("passphrase", &self.passphrase.as_ref().map(|_| "<redacted>"))
            .field("kdf_memory_kib", &self.kdf_memory_kib)
            .field("kdf_iterations", &self.kdf_iterations)
            .finish()
    }
}

impl Default for WorkersConfig {
    fn default() -> Self {
        WorkersConfig { max_concurrent: 8 }
    }
}

impl Default for MediaConfig {
    fn default() -> Self {
        MediaConfig {
            avatar_size: 64,
            request_timeout_secs: 30,
            profile_ttl_secs: 3600,
        }
    }
}

impl Config {
    /// Loads the configuration.
    ///
    /// Defaults are overridden by the YAML file, which is overridden by the
    /// `OMOMATRIX_` environment variables. A missing file is not an error.
    ///
    /// # Arguments
    ///
    /// * `path` - Path of the YAML configuration file.
    ///
    /// # Examples
    ///
    /// ```ignore
    /// let config = Config::load("config.yaml")?;
    /// println!("sync timeout: {}ms", config.sync.timeout_ms);
    /// ```
    pub fn load(path: &str) -> Result<Config, figment::Error> {
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Yaml::file(path))
            .merge(Env::prefixed("OMOMATRIX_").split("__"))
            .extract()
    }

    /// Settings of the sync loop derived from the `sync` section.
    pub fn sync_settings(&self) -> SyncSettings {
        let max_elapsed = match self.sync.max_elapsed_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };

        SyncSettings {
            timeout: Duration::from_millis(self.sync.timeout_ms),
            client_margin: Duration::from_millis(self.sync.client_timeout_margin_ms),
            backoff: BackoffSettings {
                initial: Duration::from_millis(self.sync.backoff_initial_ms),
                max: Duration::from_millis(self.sync.backoff_max_ms),
                max_elapsed,
            },
        }
    }

    /// Default rotation policy of outbound group sessions.
    pub fn rotation_policy(&self) -> RotationPolicy {
        RotationPolicy {
            max_messages: self.encryption.rotation_message_count,
            max_age_ms: self.encryption.rotation_period_secs * 1000,
        }
    }

    /// Settings of the encryption coordinator.
    pub fn encryption_settings(&self) -> EncryptionSettings {
        EncryptionSettings {
            rotation: self.rotation_policy(),
            only_verified_devices: self.encryption.only_verified_devices,
            room_key_requests: self.encryption.room_key_requests,
            room_key_forwarding: self.encryption.room_key_forwarding,
            buffer_size: self.encryption.undecryptable_buffer_size,
        }
    }

    /// Key derivation parameters of the store.
    pub fn kdf_params(&self) -> KdfParams {
        KdfParams {
            memory_kib: self.store.kdf_memory_kib,
            iterations: self.store.kdf_iterations,
        }
    }

    /// Timeout of non-sync requests.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.media.request_timeout_secs)
    }

    pub fn profile_ttl(&self) -> Duration {
        Duration::from_secs(self.media.profile_ttl_secs)
    }
}
