//! Device keys of peers and their local trust level.

use std::fmt;

use matrix_sdk::ruma::{OwnedDeviceId, OwnedUserId};
use matrix_sdk_crypto::{Device, LocalTrust};
use serde::{Deserialize, Serialize};

/// Local trust decision about a device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceTrust {
    /// Never verified: receives room keys unless verified-only sharing is on.
    #[default]
    Unverified,
    /// Verified by the user or through cross-signing.
    Verified,
    /// Never receives room keys.
    Blacklisted,
}

impl DeviceTrust {
    /// Local trust stored in the crypto store for this decision.
    pub fn local_trust(self) -> LocalTrust {
        match self {
            DeviceTrust::Unverified => LocalTrust::Unset,
            DeviceTrust::Verified => LocalTrust::Verified,
            DeviceTrust::Blacklisted => LocalTrust::BlackListed,
        }
    }
}

impl fmt::Display for DeviceTrust {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let trust = match self {
            DeviceTrust::Unverified => "unverified",
            DeviceTrust::Verified => "verified",
            DeviceTrust::Blacklisted => "blacklisted",
        };
        f.write_str(trust)
    }
}

/// Public keys of a peer device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceKey {
    pub user_id: OwnedUserId,
    pub device_id: OwnedDeviceId,
    /// Curve25519 identity key, unpadded base64.
    pub curve25519: String,
    /// Ed25519 signing key, unpadded base64.
    pub ed25519: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default)]
    pub trust: DeviceTrust,
}

impl DeviceKey {
    /// Snapshot of a device known to the crypto store.
    pub fn from_device(device: &Device) -> Self {
        let trust = if device.is_blacklisted() {
            DeviceTrust::Blacklisted
        } else if device.is_verified() {
            DeviceTrust::Verified
        } else {
            DeviceTrust::Unverified
        };

        DeviceKey {
            user_id: device.user_id().to_owned(),
            device_id: device.device_id().to_owned(),
            curve25519: device
                .curve25519_key()
                .map(|key| key.to_base64())
                .unwrap_or_default(),
            ed25519: device
                .ed25519_key()
                .map(|key| key.to_base64())
                .unwrap_or_default(),
            display_name: device.display_name().map(str::to_owned),
            trust,
        }
    }

    /// Whether room keys may be shared with this device.
    pub fn is_trusted_recipient(&self, only_verified: bool) -> bool {
        match self.trust {
            DeviceTrust::Blacklisted => false,
            DeviceTrust::Verified => true,
            DeviceTrust::Unverified => !only_verified,
        }
    }
}
