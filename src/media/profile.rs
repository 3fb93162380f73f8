//! Cache of user profiles.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use log::{debug, warn};
use matrix_sdk::ruma::{OwnedMxcUri, OwnedUserId, UserId};
use mockall::automock;
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::{
    error::EngineError,
    matrix::{MatrixClient, response_structs::ProfileResponse, structs::ProfileRequest},
    media::MediaError,
    utils::{get_path, now_millis},
};

const PROFILES_FILE: &str = "profiles.json";

/// Display name and avatar of a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: OwnedUserId,
    pub display_name: Option<String>,
    pub avatar_url: Option<OwnedMxcUri>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedProfile {
    profile: UserProfile,
    fetched_at: u64,
}

type Lookup = Shared<BoxFuture<'static, Result<UserProfile, MediaError>>>;

/// Where profiles come from.
#[automock]
#[async_trait]
pub trait ProfileSource: Send + Sync {
    async fn profile(&self, request: &ProfileRequest) -> Result<ProfileResponse, EngineError>;
}

#[async_trait]
impl ProfileSource for MatrixClient {
    async fn profile(&self, request: &ProfileRequest) -> Result<ProfileResponse, EngineError> {
        self.get_profile(request).await
    }
}

async fn lookup(source: Arc<dyn ProfileSource>, user_id: OwnedUserId) -> Result<UserProfile, MediaError> {
    let request = ProfileRequest {
        user_id: user_id.clone(),
    };
    let response = source
        .profile(&request)
        .await
        .map_err(|e| MediaError::Request(e.to_string()))?;
    Ok(UserProfile {
        user_id,
        display_name: response.displayname,
        avatar_url: response.avatar_url,
    })
}

/// Profile cache.
///
/// Profiles are kept in memory and in `<cache>/profiles.json` for `ttl`.
/// Concurrent lookups of the same user share one request.
pub struct ProfileCache {
    path: PathBuf,
    ttl: Duration,
    source: Arc<dyn ProfileSource>,
    entries: Mutex<HashMap<OwnedUserId, CachedProfile>>,
    in_flight: Mutex<HashMap<OwnedUserId, Lookup>>,
}

impl ProfileCache {
    /// Creates a cache in `cache_dir`, loading the profiles saved there.
    pub async fn open(cache_dir: &Path, ttl: Duration, source: Arc<dyn ProfileSource>) -> Self {
        let path = get_path(cache_dir, PROFILES_FILE);
        let entries = match fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!("ignore unreadable profile cache: {}", e);
                HashMap::new()
            }),
            Err(_) => HashMap::new(),
        };
        ProfileCache {
            path,
            ttl,
            source,
            entries: Mutex::new(entries),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    fn cached(&self, user_id: &UserId) -> Option<UserProfile> {
        let entries = self.entries.lock().ok()?;
        let entry = entries.get(user_id)?;
        let age = now_millis().saturating_sub(entry.fetched_at);
        (u128::from(age) < self.ttl.as_millis()).then(|| entry.profile.clone())
    }

    /// Profile of `user_id`, fetched from the homeserver when the cached one
    /// is missing or stale.
    pub async fn get(&self, user_id: &UserId) -> Result<UserProfile, MediaError> {
        if let Some(profile) = self.cached(user_id) {
            return Ok(profile);
        }

        let pending = {
            let mut in_flight = self
                .in_flight
                .lock()
                .map_err(|_| MediaError::Io("profile cache lock poisoned".to_owned()))?;
            in_flight
                .entry(user_id.to_owned())
                .or_insert_with(|| lookup(self.source.clone(), user_id.to_owned()).boxed().shared())
                .clone()
        };

        let result = pending.await;
        let saved = match &result {
            Ok(profile) => self.remember(profile.clone()),
            Err(_) => Ok(Vec::new()),
        };
        if let Ok(mut in_flight) = self.in_flight.lock() {
            in_flight.remove(user_id);
        }
        match saved {
            Ok(bytes) if !bytes.is_empty() => {
                if let Err(e) = self.persist(&bytes).await {
                    warn!("cannot save the profile of {}: {}", user_id, e);
                }
            }
            Ok(_) => {}
            Err(e) => warn!("cannot cache the profile of {}: {}", user_id, e),
        }
        result
    }

    /// Adds a profile to the memory cache and returns the serialized cache.
    fn remember(&self, profile: UserProfile) -> Result<Vec<u8>, MediaError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| MediaError::Io("profile cache lock poisoned".to_owned()))?;
        entries.insert(
            profile.user_id.clone(),
            CachedProfile {
                profile,
                fetched_at: now_millis(),
            },
        );
        serde_json::to_vec(&*entries).map_err(|e| MediaError::Io(e.to_string()))
    }

    async fn persist(&self, bytes: &[u8]) -> Result<(), MediaError> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).await?;
        }
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, bytes).await?;
        fs::rename(&tmp, &self.path).await?;
        debug!("saved profile cache");
        Ok(())
    }

    /// Forgets every profile.
    pub async fn clear(&self) -> Result<(), MediaError> {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tempfile::TempDir;

    use super::*;

    fn bob() -> OwnedUserId {
        "@bob:example.org".try_into().unwrap()
    }

    fn response() -> ProfileResponse {
        ProfileResponse {
            displayname: Some("Bob".to_owned()),
            avatar_url: Some(OwnedMxcUri::from("mxc://example.org/bob")),
        }
    }

    /// Source answering after a delay, counting the lookups.
    struct SlowSource {
        lookups: AtomicUsize,
    }

    #[async_trait]
    impl ProfileSource for SlowSource {
        async fn profile(&self, _request: &ProfileRequest) -> Result<ProfileResponse, EngineError> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(response())
        }
    }

    #[tokio::test]
    async fn test_profile_is_fetched_once_and_survives_restart() {
        let dir = TempDir::new().unwrap();
        let mut source = MockProfileSource::new();
        source
            .expect_profile()
            .withf(|request| request.user_id.as_str() == "@bob:example.org")
            .times(1)
            .returning(|_| Ok(response()));
        let cache = ProfileCache::open(dir.path(), Duration::from_secs(60), Arc::new(source)).await;

        let profile = cache.get(&bob()).await.unwrap();
        assert_eq!(profile.display_name.as_deref(), Some("Bob"));
        assert_eq!(cache.get(&bob()).await.unwrap(), profile);

        let reopened =
            ProfileCache::open(dir.path(), Duration::from_secs(60), Arc::new(MockProfileSource::new())).await;
        assert_eq!(reopened.get(&bob()).await.unwrap(), profile);
    }

    #[tokio::test]
    async fn test_concurrent_lookups_share_one_request() {
        let dir = TempDir::new().unwrap();
        let source = Arc::new(SlowSource {
            lookups: AtomicUsize::new(0),
        });
        let cache = ProfileCache::open(dir.path(), Duration::from_secs(60), source.clone()).await;

        let user_id = bob();
        let (a, b, c) = tokio::join!(cache.get(&user_id), cache.get(&user_id), cache.get(&user_id));
        assert!(a.is_ok() && b.is_ok() && c.is_ok());
        assert_eq!(source.lookups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stale_profile_is_fetched_again() {
        let dir = TempDir::new().unwrap();
        let mut source = MockProfileSource::new();
        source.expect_profile().times(2).returning(|_| Ok(response()));
        let cache = ProfileCache::open(dir.path(), Duration::ZERO, Arc::new(source)).await;

        cache.get(&bob()).await.unwrap();
        cache.get(&bob()).await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_lookup_is_not_cached() {
        let dir = TempDir::new().unwrap();
        let mut source = MockProfileSource::new();
        source
            .expect_profile()
            .times(1)
            .returning(|_| Err(EngineError::Transport("offline".to_owned())));
        source.expect_profile().times(1).returning(|_| Ok(response()));
        let cache = ProfileCache::open(dir.path(), Duration::from_secs(60), Arc::new(source)).await;

        assert!(matches!(cache.get(&bob()).await, Err(MediaError::Request(_))));
        assert!(cache.get(&bob()).await.is_ok());

        cache.clear().await.unwrap();
        assert!(!dir.path().join(PROFILES_FILE).exists());
    }
}
