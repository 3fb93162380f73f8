//! Encryption at rest of every store file.
//!
//! The store key is derived once per process with Argon2id from either the
//! configured passphrase or a random local secret kept next to the store with
//! owner-only permissions. The salt and the protection mode live in
//! `store.meta`.
//!
//! Each record is sealed with AES-256-GCM under a fresh random nonce:
//!
//! ```text
//! [magic "OMOS" (4)][format version (1)][nonce (12)][ciphertext + tag]
//! ```
//!
//! The header is authenticated as associated data, so a record written by
//! another format version or tampered with fails to open.
//!
//! Stores managed by other libraries, such as the SQLite crypto store, get a
//! passphrase derived from the store key with HKDF-SHA256.

use std::{path::Path, sync::Arc};

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit, Payload},
};
use argon2::{Algorithm, Argon2, Params, Version};
use base64::{Engine, engine::general_purpose::STANDARD_NO_PAD};
use hkdf::Hkdf;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio::{fs, io::AsyncWriteExt};
use zeroize::Zeroizing;

use crate::{
    store::{KdfParams, StoreError},
    utils::{get_path, random_bytes},
};

/// Magic bytes opening every encrypted record.
pub const STORE_MAGIC: &[u8; 4] = b"OMOS";
/// Version of the record envelope.
pub const STORE_FORMAT_VERSION: u8 = 1;

const HEADER_LEN: usize = STORE_MAGIC.len() + 1;
const NONCE_LEN: usize = 12;
const SALT_LEN: usize = 16;
const KEY_LEN: usize = 32;
const SECRET_LEN: usize = 32;

const META_FILE: &str = "store.meta";
const SECRET_FILE: &str = "local.secret";

/// How the store key is protected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Protection {
    Passphrase,
    LocalSecret,
}

/// Plaintext description of the store key derivation.
#[derive(Debug, Serialize, Deserialize)]
struct StoreMeta {
    version: u8,
    salt: String,
    protection: Protection,
}

/// Symmetric cipher sealing store records.
#[derive(Clone)]
pub struct StoreCipher {
    key: Arc<Zeroizing<[u8; KEY_LEN]>>,
}

impl StoreCipher {
    /// Opens the cipher of the store in `dir`, creating the store metadata
    /// on first use.
    ///
    /// # Arguments
    ///
    /// * `dir` - Data directory of the store.
    /// * `passphrase` - Configured passphrase, if any.
    /// * `params` - Argon2 cost parameters.
    ///
    /// # Errors
    ///
    /// - [`StoreError::PassphraseRequired`] if the store was created with a
    ///   passphrase and none is given,
    /// - [`StoreError::Corrupted`] if the metadata or the local secret cannot
    ///   be read back.
    pub async fn open(
        dir: &Path,
        passphrase: Option<&str>,
        params: KdfParams,
    ) -> Result<Self, StoreError> {
        fs::create_dir_all(dir).await?;
        let meta_path = get_path(dir, META_FILE);
        let secret_path = get_path(dir, SECRET_FILE);

        let meta = if fs::try_exists(&meta_path).await? {
            let raw = fs::read(&meta_path).await?;
            let meta: StoreMeta = serde_json::from_slice(&raw)
                .map_err(|e| StoreError::Corrupted(format!("invalid store metadata: {}", e)))?;
            if meta.version != STORE_FORMAT_VERSION {
                return Err(StoreError::Corrupted(format!(
                    "unsupported store format {}",
                    meta.version
                )));
            }
            meta
        } else {
            info!("create new store in {}", dir.display());
            let protection = match passphrase {
                Some(_) => Protection::Passphrase,
                None => {
                    let secret: Zeroizing<[u8; SECRET_LEN]> = Zeroizing::new(random_bytes());
                    write_private(&secret_path, secret.as_slice()).await?;
                    Protection::LocalSecret
                }
            };
            let salt: [u8; SALT_LEN] = random_bytes();
            let meta = StoreMeta {
                version: STORE_FORMAT_VERSION,
                salt: STANDARD_NO_PAD.encode(salt),
                protection,
            };
            write_atomic(&meta_path, &serde_json::to_vec(&meta)?).await?;
            meta
        };

        let salt = STANDARD_NO_PAD
            .decode(&meta.salt)
            .map_err(|e| StoreError::Corrupted(format!("invalid store salt: {}", e)))?;

        let secret: Zeroizing<Vec<u8>> = match meta.protection {
            Protection::Passphrase => {
                let passphrase = passphrase.ok_or(StoreError::PassphraseRequired)?;
                Zeroizing::new(passphrase.as_bytes().to_vec())
            }
            Protection::LocalSecret => {
                if passphrase.is_some() {
                    warn!("store is protected by a local secret, ignoring the configured passphrase");
                }
                match fs::read(&secret_path).await {
                    Ok(secret) => Zeroizing::new(secret),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        return Err(StoreError::Corrupted("local secret is missing".to_owned()));
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        };

        debug!("derive store key ({:?})", meta.protection);
        tokio::task::spawn_blocking(move || Self::derive(&secret, &salt, params))
            .await
            .map_err(|e| StoreError::Corrupted(format!("key derivation aborted: {}", e)))?
    }

    /// Derives the store key from a secret with Argon2id.
    pub fn derive(secret: &[u8], salt: &[u8], params: KdfParams) -> Result<Self, StoreError> {
        let params = Params::new(params.memory_kib, params.iterations, 1, Some(KEY_LEN))
            .map_err(|e| StoreError::Corrupted(format!("invalid key derivation parameters: {}", e)))?;
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        argon2
            .hash_password_into(secret, salt, key.as_mut_slice())
            .map_err(|e| StoreError::Corrupted(format!("key derivation failed: {}", e)))?;

        Ok(StoreCipher { key: Arc::new(key) })
    }

    /// Derives a 32 byte subkey bound to `info`.
    pub(crate) fn derive_key(&self, info: &[u8]) -> Zeroizing<[u8; KEY_LEN]> {
        let hkdf = Hkdf::<Sha256>::new(None, self.key.as_slice());
        let mut okm = Zeroizing::new([0u8; KEY_LEN]);
        // 32 bytes is always a valid HKDF-SHA256 output length.
        let _ = hkdf.expand(info, okm.as_mut_slice());
        okm
    }

    /// Hex passphrase of a store kept by another library.
    pub(crate) fn passphrase_for(&self, store: &str) -> Zeroizing<String> {
        Zeroizing::new(hex::encode(self.derive_key(store.as_bytes()).as_slice()))
    }

    #[cfg(test)]
    pub(crate) fn from_key(key: [u8; KEY_LEN]) -> Self {
        StoreCipher {
            key: Arc::new(Zeroizing::new(key)),
        }
    }

    fn aead(&self) -> Result<Aes256Gcm, StoreError> {
        Aes256Gcm::new_from_slice(self.key.as_slice())
            .map_err(|_| StoreError::Corrupted("invalid store key length".to_owned()))
    }

    fn header() -> [u8; HEADER_LEN] {
        let mut header = [0u8; HEADER_LEN];
        header[..STORE_MAGIC.len()].copy_from_slice(STORE_MAGIC);
        header[STORE_MAGIC.len()] = STORE_FORMAT_VERSION;
        header
    }

    /// Seals a record.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, StoreError> {
        let header = Self::header();
        let nonce: [u8; NONCE_LEN] = random_bytes();
        let ciphertext = self
            .aead()?
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: &header,
                },
            )
            .map_err(|_| StoreError::Corrupted("record encryption failed".to_owned()))?;

        let mut sealed = Vec::with_capacity(HEADER_LEN + NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&header);
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Opens a sealed record.
    ///
    /// # Errors
    ///
    /// [`StoreError::Corrupted`] on a wrong header, a truncated record or an
    /// authentication tag mismatch.
    pub fn decrypt(&self, sealed: &[u8]) -> Result<Vec<u8>, StoreError> {
        if sealed.len() < HEADER_LEN + NONCE_LEN {
            return Err(StoreError::Corrupted("record is truncated".to_owned()));
        }

        let (header, rest) = sealed.split_at(HEADER_LEN);
        if &header[..STORE_MAGIC.len()] != STORE_MAGIC {
            return Err(StoreError::Corrupted("record has no store header".to_owned()));
        }
        if header[STORE_MAGIC.len()] != STORE_FORMAT_VERSION {
            return Err(StoreError::Corrupted(format!(
                "unsupported record format {}",
                header[STORE_MAGIC.len()]
            )));
        }

        let (nonce, ciphertext) = rest.split_at(NONCE_LEN);
        self.aead()?
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: header,
                },
            )
            .map_err(|_| StoreError::Corrupted("authentication tag mismatch".to_owned()))
    }
}

/// Replaces a file through a synced temporary file, so a crash leaves
/// either the old or the new content.
async fn write_atomic(path: &Path, content: &[u8]) -> Result<(), StoreError> {
    let tmp_path = path.with_extension("tmp");
    let mut file = fs::File::create(&tmp_path).await?;
    file.write_all(content).await?;
    file.sync_all().await?;
    drop(file);
    fs::rename(&tmp_path, path).await?;
    Ok(())
}

/// Writes a file readable by its owner only.
async fn write_private(path: &Path, content: &[u8]) -> Result<(), StoreError> {
    fs::write(path, content).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn fast() -> KdfParams {
        KdfParams {
            memory_kib: 64,
            iterations: 1,
        }
    }

    #[test]
    fn test_encrypt_decrypt() {
        let cipher = StoreCipher::from_key([1u8; 32]);
        let sealed = cipher.encrypt(b"hello").unwrap();
        assert_eq!(&sealed[..4], STORE_MAGIC);
        assert_eq!(cipher.decrypt(&sealed).unwrap(), b"hello");
    }

    #[test]
    fn test_nonces_are_fresh() {
        let cipher = StoreCipher::from_key([1u8; 32]);
        assert_ne!(cipher.encrypt(b"same").unwrap(), cipher.encrypt(b"same").unwrap());
    }

    #[test]
    fn test_flipped_byte_is_corruption() {
        let cipher = StoreCipher::from_key([1u8; 32]);
        let mut sealed = cipher.encrypt(b"hello").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(matches!(cipher.decrypt(&sealed), Err(StoreError::Corrupted(_))));
    }

    #[test]
    fn test_wrong_key_is_corruption() {
        let sealed = StoreCipher::from_key([1u8; 32]).encrypt(b"hello").unwrap();
        let other = StoreCipher::from_key([2u8; 32]);
        assert!(matches!(other.decrypt(&sealed), Err(StoreError::Corrupted(_))));
    }

    #[test]
    fn test_truncated_and_foreign_records() {
        let cipher = StoreCipher::from_key([1u8; 32]);
        assert!(matches!(cipher.decrypt(b"OMOS"), Err(StoreError::Corrupted(_))));
        assert!(matches!(
            cipher.decrypt(b"{\"plain\": \"json file from an old version\"}"),
            Err(StoreError::Corrupted(_))
        ));
    }

    #[tokio::test]
    async fn test_open_with_local_secret_is_stable() {
        let dir = TempDir::new().unwrap();
        let first = StoreCipher::open(dir.path(), None, fast()).await.unwrap();
        let sealed = first.encrypt(b"persisted").unwrap();

        let second = StoreCipher::open(dir.path(), None, fast()).await.unwrap();
        assert_eq!(second.decrypt(&sealed).unwrap(), b"persisted");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(dir.path().join(SECRET_FILE))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[tokio::test]
    async fn test_open_with_passphrase() {
        let dir = TempDir::new().unwrap();
        let first = StoreCipher::open(dir.path(), Some("hunter2"), fast())
            .await
            .unwrap();
        let sealed = first.encrypt(b"persisted").unwrap();
        assert!(!dir.path().join(SECRET_FILE).exists());

        let wrong = StoreCipher::open(dir.path(), Some("hunter3"), fast())
            .await
            .unwrap();
        assert!(wrong.decrypt(&sealed).is_err());

        let missing = StoreCipher::open(dir.path(), None, fast()).await;
        assert!(matches!(missing, Err(StoreError::PassphraseRequired)));
    }

    #[test]
    fn test_derived_keys_depend_on_info() {
        let cipher = StoreCipher::from_key([1u8; 32]);
        assert_ne!(*cipher.derive_key(b"one"), *cipher.derive_key(b"two"));
        assert_eq!(*cipher.derive_key(b"one"), *cipher.derive_key(b"one"));

        let other = StoreCipher::from_key([2u8; 32]);
        assert_ne!(*cipher.passphrase_for("crypto"), *other.passphrase_for("crypto"));
        assert_eq!(cipher.passphrase_for("crypto").len(), 64);
    }

    #[tokio::test]
    async fn test_meta_is_written_without_leftovers() {
        let dir = TempDir::new().unwrap();
        StoreCipher::open(dir.path(), Some("hunter2"), fast())
            .await
            .unwrap();

        let raw = std::fs::read(dir.path().join(META_FILE)).unwrap();
        let meta: StoreMeta = serde_json::from_slice(&raw).unwrap();
        assert_eq!(meta.protection, Protection::Passphrase);
        assert!(!dir.path().join("store.tmp").exists());
    }

    #[tokio::test]
    async fn test_leftover_temporary_meta_is_ignored() {
        let dir = TempDir::new().unwrap();
        let first = StoreCipher::open(dir.path(), None, fast()).await.unwrap();
        let sealed = first.encrypt(b"persisted").unwrap();
        // A crash while replacing the metadata leaves a partial temporary file.
        std::fs::write(dir.path().join("store.tmp"), b"{\"vers").unwrap();

        let second = StoreCipher::open(dir.path(), None, fast()).await.unwrap();
        assert_eq!(second.decrypt(&sealed).unwrap(), b"persisted");
    }

    #[tokio::test]
    async fn test_missing_local_secret_is_corruption() {
        let dir = TempDir::new().unwrap();
        StoreCipher::open(dir.path(), None, fast()).await.unwrap();
        std::fs::remove_file(dir.path().join(SECRET_FILE)).unwrap();

        let result = StoreCipher::open(dir.path(), None, fast()).await;
        assert!(matches!(result, Err(StoreError::Corrupted(_))));
    }
}
