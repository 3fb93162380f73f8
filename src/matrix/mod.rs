//! Matrix client-server API plumbing.
//!
//! - [`requester`] talks HTTP to the homeserver behind the mockable
//!   [`Homeserver`] trait,
//! - [`client::MatrixClient`] adds the access token of the stored session to
//!   every call and refreshes it when the homeserver rejects it,
//! - [`events`], [`structs`] and [`response_structs`] hold the wire formats.
//!
//! # Examples
//!
//! ```ignore
//! let homeserver = Arc::new(HomeserverClient::new("matrix.org", Duration::from_secs(30))?);
//! let client = MatrixClient::new(homeserver, credentials);
//! let raw = client.sync(&SyncRequest { since: None, timeout_ms: 30_000, full_state: false }).await?;
//! ```

pub mod client;
pub mod events;
pub mod requester;
pub mod response_structs;
pub mod structs;

use thiserror::Error;

use crate::error::EngineError;

pub use crate::matrix::{
    client::MatrixClient,
    requester::{Homeserver, HomeserverClient, MockHomeserver},
};

/// Failure of a single homeserver request.
#[derive(Debug, Error)]
pub enum RequestError {
    /// The homeserver URL cannot be used.
    #[error("invalid homeserver url: {0}")]
    InvalidUrl(String),

    /// The request did not reach the homeserver or the connection broke.
    #[error("request failed: {0}")]
    Transport(String),

    /// The homeserver did not answer in time.
    #[error("request timed out")]
    Timeout,

    /// The access token is unknown, expired or revoked.
    #[error("access token rejected (soft logout: {soft_logout})")]
    UnknownToken { soft_logout: bool },

    /// The homeserver answered with a Matrix error.
    #[error("homeserver answered {status} {errcode}: {message}")]
    Api {
        status: u16,
        errcode: String,
        message: String,
    },

    /// The response body does not have the expected shape.
    #[error("unexpected response body: {0}")]
    Decode(String),
}

impl RequestError {
    /// Whether the homeserver is temporarily unable to serve the request.
    pub fn is_transient(&self) -> bool {
        match self {
            RequestError::Transport(_) | RequestError::Timeout => true,
            RequestError::Api { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for RequestError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            RequestError::Timeout
        } else if error.is_decode() {
            RequestError::Decode(error.to_string())
        } else {
            RequestError::Transport(error.to_string())
        }
    }
}

impl From<RequestError> for EngineError {
    fn from(error: RequestError) -> Self {
        match error {
            RequestError::UnknownToken { .. } => EngineError::AuthExpired,
            RequestError::InvalidUrl(url) => EngineError::InvalidInput(url),
            error if error.is_transient() => EngineError::Transport(error.to_string()),
            error => EngineError::Protocol(error.to_string()),
        }
    }
}
