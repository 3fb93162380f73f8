//! Disk cache of avatar thumbnails.

use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use futures::future::{BoxFuture, FutureExt, Shared};
use log::{debug, info, warn};
use matrix_sdk::ruma::MxcUri;
use sha2::{Digest, Sha256};
use tokio::fs;

use crate::{
    matrix::{response_structs::MediaResponse, structs::MediaRequest},
    media::{MediaError, MediaSource},
    utils::get_path,
};

type Download = Shared<BoxFuture<'static, Result<Arc<Vec<u8>>, MediaError>>>;

/// Name of the cache entry of a media at a thumbnail size.
fn cache_key(mxc: &str, size: u32) -> String {
    hex::encode(Sha256::digest(format!("{}_{}", mxc, size).as_bytes()))
}

fn check_image(response: &MediaResponse) -> Result<(), MediaError> {
    let mime = response
        .content_type
        .as_deref()
        .and_then(|content_type| content_type.parse::<mime::Mime>().ok());
    match mime {
        Some(mime) if mime.type_() == mime::IMAGE => Ok(()),
        _ => Err(MediaError::UnsupportedType(response.content_type.clone())),
    }
}

/// Downloads the thumbnail, or the full media if the homeserver cannot
/// produce one, and stores it at `path`.
async fn download(
    source: Arc<dyn MediaSource>,
    server_name: String,
    media_id: String,
    size: u32,
    path: PathBuf,
) -> Result<Arc<Vec<u8>>, MediaError> {
    let thumbnail = MediaRequest {
        server_name: server_name.clone(),
        media_id: media_id.clone(),
        thumbnail: Some(size),
    };
    let response = match source.download(&thumbnail).await {
        Ok(response) => response,
        Err(e) => {
            debug!("no thumbnail of mxc://{}/{}: {}", server_name, media_id, e);
            let full = MediaRequest {
                server_name,
                media_id,
                thumbnail: None,
            };
            source
                .download(&full)
                .await
                .map_err(|e| MediaError::Request(e.to_string()))?
        }
    };
    check_image(&response)?;

    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).await?;
    }
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, &response.bytes).await?;
    fs::rename(&tmp, &path).await?;
    debug!("cached {} bytes in {}", response.bytes.len(), path.display());
    Ok(Arc::new(response.bytes))
}

/// Avatar cache.
///
/// Entries live in `<cache>/avatars/<sha256 of uri and size>.bin`. Concurrent
/// requests of the same avatar share one download, and a media that failed
/// is not requested again until [`AvatarCache::clear`].
///
/// # Examples
///
/// ```ignore
/// let avatars = AvatarCache::new(cache_dir, 64, Arc::new(client));
/// let bytes = avatars.fetch(&member.avatar_url.unwrap()).await?;
/// ```
pub struct AvatarCache {
    dir: PathBuf,
    size: u32,
    source: Arc<dyn MediaSource>,
    in_flight: Mutex<HashMap<String, Download>>,
    failed: Mutex<HashSet<String>>,
}

impl AvatarCache {
    /// Creates a cache in `cache_dir`.
    ///
    /// # Arguments
    ///
    /// * `cache_dir` - Cache directory of the application.
    /// * `size` - Edge of the requested thumbnails, in pixels.
    /// * `source` - Where missing avatars are downloaded from.
    pub fn new(cache_dir: &Path, size: u32, source: Arc<dyn MediaSource>) -> Self {
        AvatarCache {
            dir: get_path(cache_dir, "avatars"),
            size,
            source,
            in_flight: Mutex::new(HashMap::new()),
            failed: Mutex::new(HashSet::new()),
        }
    }

    /// File holding the avatar once fetched.
    pub fn path_of(&self, mxc: &MxcUri) -> PathBuf {
        get_path(&self.dir, &format!("{}.bin", cache_key(mxc.as_str(), self.size)))
    }

    /// Returns the bytes of an avatar, downloading it if it is not cached.
    ///
    /// # Errors
    ///
    /// - [`MediaError::InvalidUri`] if `mxc` is not a valid content uri,
    /// - [`MediaError::Unavailable`] if an earlier download failed,
    /// - the error of the download otherwise.
    pub async fn fetch(&self, mxc: &MxcUri) -> Result<Arc<Vec<u8>>, MediaError> {
        let (server_name, media_id) = mxc
            .parts()
            .map_err(|e| MediaError::InvalidUri(format!("{}: {}", mxc, e)))?;
        let key = cache_key(mxc.as_str(), self.size);
        if self.failed.lock().is_ok_and(|failed| failed.contains(&key)) {
            return Err(MediaError::Unavailable);
        }

        let path = self.path_of(mxc);
        match fs::read(&path).await {
            Ok(bytes) => return Ok(Arc::new(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let pending = {
            let mut in_flight = self
                .in_flight
                .lock()
                .map_err(|_| MediaError::Io("avatar cache lock poisoned".to_owned()))?;
            in_flight
                .entry(key.clone())
                .or_insert_with(|| {
                    download(
                        self.source.clone(),
                        server_name.to_string(),
                        media_id.to_owned(),
                        self.size,
                        path,
                    )
                    .boxed()
                    .shared()
                })
                .clone()
        };

        let result = pending.await;
        if let Ok(mut in_flight) = self.in_flight.lock() {
            in_flight.remove(&key);
        }
        if let Err(e) = &result {
            warn!("avatar {} unavailable: {}", mxc, e);
            if !matches!(e, MediaError::Io(_)) {
                if let Ok(mut failed) = self.failed.lock() {
                    failed.insert(key);
                }
            }
        }
        result
    }

    /// Removes every cached avatar and forgets failed downloads.
    pub async fn clear(&self) -> Result<(), MediaError> {
        if let Ok(mut failed) = self.failed.lock() {
            failed.clear();
        }
        match fs::remove_dir_all(&self.dir).await {
            Ok(()) => {
                info!("cleared avatar cache");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use async_trait::async_trait;
    use matrix_sdk::ruma::OwnedMxcUri;
    use tempfile::TempDir;

    use super::*;
    use crate::{error::EngineError, media::MockMediaSource};

    fn png() -> MediaResponse {
        MediaResponse {
            content_type: Some("image/png".to_owned()),
            bytes: vec![0x89, b'P', b'N', b'G'],
        }
    }

    fn mxc() -> OwnedMxcUri {
        OwnedMxcUri::from("mxc://example.org/avatar")
    }

    /// Source answering after a delay, counting the downloads.
    struct SlowSource {
        downloads: AtomicUsize,
    }

    #[async_trait]
    impl MediaSource for SlowSource {
        async fn download(&self, _request: &MediaRequest) -> Result<MediaResponse, EngineError> {
            self.downloads.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(png())
        }
    }

    #[tokio::test]
    async fn test_thumbnail_is_downloaded_once() {
        let dir = TempDir::new().unwrap();
        let mut source = MockMediaSource::new();
        source
            .expect_download()
            .withf(|request| {
                request.thumbnail == Some(64)
                    && request.server_name == "example.org"
                    && request.media_id == "avatar"
            })
            .times(1)
            .returning(|_| Ok(png()));
        let cache = AvatarCache::new(dir.path(), 64, Arc::new(source));

        let first = cache.fetch(&mxc()).await.unwrap();
        let second = cache.fetch(&mxc()).await.unwrap();
        assert_eq!(first, second);

        let path = cache.path_of(&mxc());
        assert!(path.starts_with(dir.path().join("avatars")));
        assert_eq!(path.file_stem().unwrap().len(), 64);
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_full_media_when_no_thumbnail() {
        let dir = TempDir::new().unwrap();
        let mut source = MockMediaSource::new();
        source
            .expect_download()
            .withf(|request| request.thumbnail.is_some())
            .times(1)
            .returning(|_| Err(EngineError::Protocol("M_NOT_FOUND".to_owned())));
        source
            .expect_download()
            .withf(|request| request.thumbnail.is_none())
            .times(1)
            .returning(|_| Ok(png()));
        let cache = AvatarCache::new(dir.path(), 64, Arc::new(source));

        assert_eq!(*cache.fetch(&mxc()).await.unwrap(), png().bytes);
    }

    #[tokio::test]
    async fn test_non_image_is_refused_and_remembered() {
        let dir = TempDir::new().unwrap();
        let mut source = MockMediaSource::new();
        source.expect_download().times(1).returning(|_| {
            Ok(MediaResponse {
                content_type: Some("text/html".to_owned()),
                bytes: b"<html>".to_vec(),
            })
        });
        let cache = AvatarCache::new(dir.path(), 64, Arc::new(source));

        assert_eq!(
            cache.fetch(&mxc()).await,
            Err(MediaError::UnsupportedType(Some("text/html".to_owned())))
        );
        assert_eq!(cache.fetch(&mxc()).await, Err(MediaError::Unavailable));
        assert!(!cache.path_of(&mxc()).exists());
    }

    #[tokio::test]
    async fn test_concurrent_fetches_share_one_download() {
        let dir = TempDir::new().unwrap();
        let source = Arc::new(SlowSource {
            downloads: AtomicUsize::new(0),
        });
        let cache = AvatarCache::new(dir.path(), 32, source.clone());

        let uri = mxc();
        let (a, b, c) = tokio::join!(cache.fetch(&uri), cache.fetch(&uri), cache.fetch(&uri));
        assert!(a.is_ok() && b.is_ok() && c.is_ok());
        assert_eq!(source.downloads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalid_uri() {
        let dir = TempDir::new().unwrap();
        let cache = AvatarCache::new(dir.path(), 64, Arc::new(MockMediaSource::new()));
        let uri = OwnedMxcUri::from("https://example.org/avatar");
        assert!(matches!(cache.fetch(&uri).await, Err(MediaError::InvalidUri(_))));
    }

    #[tokio::test]
    async fn test_clear() {
        let dir = TempDir::new().unwrap();
        let mut source = MockMediaSource::new();
        source.expect_download().times(2).returning(|_| Ok(png()));
        let cache = AvatarCache::new(dir.path(), 64, Arc::new(source));

        cache.fetch(&mxc()).await.unwrap();
        cache.clear().await.unwrap();
        assert!(!cache.path_of(&mxc()).exists());
        cache.fetch(&mxc()).await.unwrap();
    }
}
