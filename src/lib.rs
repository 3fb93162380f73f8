//! OMOMatrix - protocol session engine of a desktop Matrix client.
//!
//! The engine keeps an authenticated session against a homeserver, runs the
//! incremental sync loop, maintains end-to-end encryption state and merges
//! everything into a local room model that presentation code reads through
//! snapshots.
//!
//! # Architecture
//!
//! - [`store`] - Encrypted credential, key and room stores
//! - [`matrix`] - Homeserver transport and wire formats
//! - [`sync`] - Long-poll sync loop producing [`sync::SyncDelta`]s
//! - [`crypto`] - Olm machine transport, undecryptable buffer and the encryption
//!   coordinator
//! - [`model`] - Room and space model with idempotent merge
//! - [`media`] - Avatar and user profile caches
//! - [`session`] - The [`session::SessionManager`] facade, notification feed
//!   and worker pool
//! - [`config`] - YAML and environment configuration
//! - [`utils`] - Path, clock and random helpers
//!
//! # Examples
//!
//! ```ignore
//! let config = Config::load("omomatrix.yaml")?;
//! let manager = SessionManager::new(config, &data_dir, &cache_dir);
//! manager.resume().await?;
//!
//! let mut feed = manager.notifications();
//! while let Some(notification) = feed.recv().await {
//!     println!("{:?}", notification);
//! }
//! ```

pub mod config;
pub mod crypto;
pub mod error;
pub mod matrix;
pub mod media;
pub mod model;
pub mod session;
pub mod store;
pub mod sync;
pub mod utils;

pub use crate::{
    config::Config,
    error::EngineError,
    session::{Notification, SessionManager, SessionState},
};
