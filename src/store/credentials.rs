//! Persistence of the logged-in session.
//!
//! The session holds the homeserver, the user and device ids, the tokens and
//! the sync cursor. It lives in memory for the token lookups of every request
//! and is written through to `session.enc` on every change.

use std::path::Path;

use log::{debug, info};
use matrix_sdk::ruma::{OwnedDeviceId, OwnedUserId, UserId};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::store::{StoreCipher, StoreError, record::RecordFile};

const CREDENTIALS_FILE: &str = "session.enc";

/// Current schema of the credentials record.
pub const CREDENTIALS_SCHEMA: u32 = 2;

/// A logged-in session.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Homeserver URL the session was created on.
    pub homeserver: String,
    pub user_id: OwnedUserId,
    pub device_id: OwnedDeviceId,
    pub access_token: String,
    /// Omitted from serialization when `None` to keep the record small.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Cursor of the last fully applied sync delta.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_token: Option<String>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("homeserver", &self.homeserver)
            .field("user_id", &self.user_id)
            .field("device_id", &self.device_id)
            .field("sync_token", &self.sync_token)
            .finish_non_exhaustive()
    }
}

/// First schema: flat string fields as typed in by hand, possibly padded.
#[derive(Deserialize)]
struct SessionV1 {
    homeserver: String,
    user_id: String,
    device_id: String,
    access_token: String,
}

impl SessionV1 {
    fn migrate(self) -> Result<Session, StoreError> {
        let user_id = UserId::parse(self.user_id.trim())
            .map_err(|e| StoreError::Corrupted(format!("invalid user id: {}", e)))?;

        Ok(Session {
            homeserver: self.homeserver.trim().trim_end_matches('/').to_owned(),
            user_id,
            device_id: self.device_id.trim().into(),
            access_token: self.access_token.trim().to_owned(),
            refresh_token: None,
            sync_token: None,
        })
    }
}

/// Credential store.
///
/// # Examples
///
/// ```ignore
/// let credentials = CredentialStore::new(data_dir, cipher);
/// match credentials.load().await {
///     Ok(session) => println!("resume {}", session.user_id),
///     Err(StoreError::NotFound) => println!("log in first"),
///     Err(e) => return Err(e.into()),
/// }
/// ```
pub struct CredentialStore {
    file: RecordFile,
    /// Write-through cache of the record
    current: RwLock<Option<Session>>,
}

impl CredentialStore {
    /// Creates a credential store in `dir`. Nothing is read until [`Self::load`].
    pub fn new(dir: &Path, cipher: StoreCipher) -> Self {
        CredentialStore {
            file: RecordFile::new(dir, CREDENTIALS_FILE, cipher),
            current: RwLock::new(None),
        }
    }

    /// Loads the stored session, migrating older schemas.
    ///
    /// # Errors
    ///
    /// - [`StoreError::NotFound`] if no session was saved,
    /// - [`StoreError::Corrupted`] if the record cannot be opened,
    /// - [`StoreError::UnsupportedSchema`] if a newer engine wrote it.
    pub async fn load(&self) -> Result<Session, StoreError> {
        let Some((schema, data)) = self.file.read().await? else {
            debug!("no stored session");
            return Err(StoreError::NotFound);
        };

        let session = match schema {
            1 => {
                let legacy: SessionV1 = serde_json::from_value(data)
                    .map_err(|e| StoreError::Corrupted(format!("invalid session: {}", e)))?;
                let session = legacy.migrate()?;
                info!("migrate stored session from schema 1");
                self.file.write(CREDENTIALS_SCHEMA, &session).await?;
                session
            }
            CREDENTIALS_SCHEMA => serde_json::from_value(data)
                .map_err(|e| StoreError::Corrupted(format!("invalid session: {}", e)))?,
            found => {
                return Err(StoreError::UnsupportedSchema {
                    found,
                    supported: CREDENTIALS_SCHEMA,
                });
            }
        };

        debug!("loaded session {:?}", session);
        *self.current.write().await = Some(session.clone());
        Ok(session)
    }

    /// Atomically replaces the stored session.
    pub async fn save(&self, session: &Session) -> Result<(), StoreError> {
        let mut current = self.current.write().await;
        self.file.write(CREDENTIALS_SCHEMA, session).await?;
        *current = Some(session.clone());
        debug!("saved session {:?}", session);
        Ok(())
    }

    /// Session currently in use, if any.
    pub async fn session(&self) -> Option<Session> {
        self.current.read().await.clone()
    }

    /// Persists the cursor of the last applied sync delta.
    pub async fn persist_sync_token(&self, sync_token: &str) -> Result<(), StoreError> {
        self.modify(|session| session.sync_token = Some(sync_token.to_owned()))
            .await
            .map(|_| ())
    }

    /// Persists refreshed tokens and returns the updated session.
    pub async fn update_tokens(
        &self,
        access_token: String,
        refresh_token: Option<String>,
    ) -> Result<Session, StoreError> {
        self.modify(|session| {
            session.access_token = access_token;
            session.refresh_token = refresh_token;
        })
        .await
    }

    async fn modify(&self, change: impl FnOnce(&mut Session)) -> Result<Session, StoreError> {
        let mut current = self.current.write().await;
        let mut session = current.clone().ok_or(StoreError::NotFound)?;
        change(&mut session);
        self.file.write(CREDENTIALS_SCHEMA, &session).await?;
        *current = Some(session.clone());
        Ok(session)
    }

    /// Deletes the stored session.
    pub async fn clear(&self) -> Result<(), StoreError> {
        let mut current = self.current.write().await;
        self.file.remove().await?;
        *current = None;
        info!("cleared stored session");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tempfile::TempDir;

    use super::*;
    use crate::store::test_cipher;

    fn session() -> Session {
        Session {
            homeserver: "https://example.org".to_owned(),
            user_id: "@alice:example.org".try_into().unwrap(),
            device_id: "ALICEDEV".into(),
            access_token: "token".to_owned(),
            refresh_token: None,
            sync_token: None,
        }
    }

    #[tokio::test]
    async fn test_load_without_session() {
        let dir = TempDir::new().unwrap();
        let store = CredentialStore::new(dir.path(), test_cipher());
        assert!(matches!(store.load().await, Err(StoreError::NotFound)));
        assert!(store.session().await.is_none());
    }

    #[tokio::test]
    async fn test_save_then_load_in_new_store() {
        let dir = TempDir::new().unwrap();
        let store = CredentialStore::new(dir.path(), test_cipher());
        store.save(&session()).await.unwrap();
        store.persist_sync_token("s72").await.unwrap();

        let reopened = CredentialStore::new(dir.path(), test_cipher());
        let loaded = reopened.load().await.unwrap();
        assert_eq!(loaded.user_id, "@alice:example.org");
        assert_eq!(loaded.sync_token.as_deref(), Some("s72"));
        assert_eq!(reopened.session().await, Some(loaded));
    }

    #[tokio::test]
    async fn test_persist_sync_token_needs_session() {
        let dir = TempDir::new().unwrap();
        let store = CredentialStore::new(dir.path(), test_cipher());
        assert!(matches!(
            store.persist_sync_token("s1").await,
            Err(StoreError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_update_tokens_keeps_cursor() {
        let dir = TempDir::new().unwrap();
        let store = CredentialStore::new(dir.path(), test_cipher());
        store.save(&session()).await.unwrap();
        store.persist_sync_token("s9").await.unwrap();

        let updated = store
            .update_tokens("fresh".to_owned(), Some("refresh".to_owned()))
            .await
            .unwrap();
        assert_eq!(updated.access_token, "fresh");
        assert_eq!(updated.refresh_token.as_deref(), Some("refresh"));
        assert_eq!(updated.sync_token.as_deref(), Some("s9"));
    }

    #[tokio::test]
    async fn test_clear() {
        let dir = TempDir::new().unwrap();
        let store = CredentialStore::new(dir.path(), test_cipher());
        store.save(&session()).await.unwrap();
        store.clear().await.unwrap();

        assert!(store.session().await.is_none());
        assert!(matches!(store.load().await, Err(StoreError::NotFound)));
    }

    #[tokio::test]
    async fn test_migrates_schema_one() {
        let dir = TempDir::new().unwrap();
        let legacy = RecordFile::new(dir.path(), CREDENTIALS_FILE, test_cipher());
        legacy
            .write(
                1,
                &json!({
                    "homeserver": " https://example.org/ ",
                    "user_id": "@alice:example.org\n",
                    "device_id": " ALICEDEV",
                    "access_token": "token ",
                }),
            )
            .await
            .unwrap();

        let store = CredentialStore::new(dir.path(), test_cipher());
        let loaded = store.load().await.unwrap();
        assert_eq!(loaded, session());

        let (schema, _) = legacy.read().await.unwrap().unwrap();
        assert_eq!(schema, CREDENTIALS_SCHEMA);
    }

    #[tokio::test]
    async fn test_refuses_newer_schema() {
        let dir = TempDir::new().unwrap();
        let future = RecordFile::new(dir.path(), CREDENTIALS_FILE, test_cipher());
        future.write(CREDENTIALS_SCHEMA + 1, &json!({})).await.unwrap();

        let store = CredentialStore::new(dir.path(), test_cipher());
        assert!(matches!(
            store.load().await,
            Err(StoreError::UnsupportedSchema { found: 3, .. })
        ));
    }

    #[tokio::test]
    async fn test_corrupted_record() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(CREDENTIALS_FILE), b"garbage").unwrap();

        let store = CredentialStore::new(dir.path(), test_cipher());
        assert!(matches!(store.load().await, Err(StoreError::Corrupted(_))));
    }
}
