//! Media downloads and user profiles.

pub mod avatar;
pub mod profile;

use async_trait::async_trait;
use mockall::automock;
use thiserror::Error;

use crate::{
    error::EngineError,
    matrix::{
        MatrixClient, response_structs::MediaResponse, structs::MediaRequest,
    },
};

pub use crate::media::{
    avatar::AvatarCache,
    profile::{ProfileCache, UserProfile},
};

/// Failure of a media fetch.
///
/// Cloneable so concurrent waiters of one download share its outcome.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MediaError {
    #[error("invalid media uri: {0}")]
    InvalidUri(String),

    /// The homeserver answered with something that is not an image.
    #[error("unsupported content type {0:?}")]
    UnsupportedType(Option<String>),

    #[error("media request failed: {0}")]
    Request(String),

    #[error("media cache i/o error: {0}")]
    Io(String),

    /// A previous download of this media already failed.
    #[error("media unavailable")]
    Unavailable,
}

impl From<std::io::Error> for MediaError {
    fn from(error: std::io::Error) -> Self {
        MediaError::Io(error.to_string())
    }
}

impl From<MediaError> for EngineError {
    fn from(error: MediaError) -> Self {
        match error {
            MediaError::InvalidUri(_) => EngineError::InvalidInput(error.to_string()),
            MediaError::UnsupportedType(_) => EngineError::Protocol(error.to_string()),
            error => EngineError::Transport(error.to_string()),
        }
    }
}

/// Where media bytes come from.
#[automock]
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn download(&self, request: &MediaRequest) -> Result<MediaResponse, EngineError>;
}

#[async_trait]
impl MediaSource for MatrixClient {
    async fn download(&self, request: &MediaRequest) -> Result<MediaResponse, EngineError> {
        self.download_media(request).await
    }
}
