//! Utility functions shared across the engine.
//!
//! Path helpers for the data and cache directories, wall-clock helpers and
//! random material generation.

use std::{
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use rand::RngCore;

/// Constructs a file system path by joining a directory path with a file name.
///
/// # Examples
///
/// ```
/// # use omomatrix::utils::get_path;
/// let path = get_path("/home/user/.local/share/omomatrix", "session.enc");
/// # #[cfg(unix)]
/// assert_eq!(path.to_str(), Some("/home/user/.local/share/omomatrix/session.enc"));
/// ```
pub fn get_path(dir_path: impl AsRef<Path>, file_name: &str) -> PathBuf {
    dir_path.as_ref().join(file_name)
}

/// Milliseconds since the unix epoch, `0` if the clock is before it.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}

/// Fills an array with cryptographically secure random bytes.
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

/// Creates a new transaction id for client-originated requests.
pub fn transaction_id() -> String {
    format!("omo{}", uuid::Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_path_simple() {
        let path = get_path("/home/user", "session.enc");
        #[cfg(unix)]
        assert_eq!(path.to_str(), Some("/home/user/session.enc"));
        #[cfg(windows)]
        assert_eq!(path.to_str(), Some("/home/user\\session.enc"));
    }

    #[test]
    fn test_get_path_relative_paths() {
        let path = get_path(".", "keys.enc");
        #[cfg(unix)]
        assert_eq!(path.to_str(), Some("./keys.enc"));
    }

    #[test]
    fn test_get_path_with_spaces() {
        let path = get_path("/home/my folder", "my file.enc");
        #[cfg(unix)]
        assert_eq!(path.to_str(), Some("/home/my folder/my file.enc"));
    }

    #[test]
    fn test_now_millis_is_after_2020() {
        assert!(now_millis() > 1_577_836_800_000);
    }

    #[test]
    fn test_random_bytes_differ() {
        let a: [u8; 32] = random_bytes();
        let b: [u8; 32] = random_bytes();
        assert_ne!(a, b);
    }

    #[test]
    fn test_transaction_ids_are_unique() {
        let a = transaction_id();
        let b = transaction_id();
        assert!(a.starts_with("omo"));
        assert_ne!(a, b);
    }
}
