//! Encrypted, versioned, atomically replaced record files.

use std::path::{Path, PathBuf};

use log::trace;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::{fs, io::AsyncWriteExt};

use crate::{
    store::{StoreCipher, StoreError},
    utils::get_path,
};

#[derive(Serialize)]
struct EnvelopeRef<'a, T: Serialize> {
    schema: u32,
    data: &'a T,
}

#[derive(Deserialize)]
struct Envelope {
    schema: u32,
    data: Value,
}

/// One encrypted file of the store.
///
/// Writes go to a temporary file which is flushed to disk and renamed over
/// the previous version, so a crash leaves either the old or the new record.
pub(crate) struct RecordFile {
    path: PathBuf,
    cipher: StoreCipher,
}

impl RecordFile {
    pub(crate) fn new(dir: &Path, name: &str, cipher: StoreCipher) -> Self {
        RecordFile {
            path: get_path(dir, name),
            cipher,
        }
    }

    /// Reads the record, `None` if it was never written.
    ///
    /// Returns the schema version the record was written with and its data.
    pub(crate) async fn read(&self) -> Result<Option<(u32, Value)>, StoreError> {
        let sealed = match fs::read(&self.path).await {
            Ok(sealed) => sealed,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let plaintext = self.cipher.decrypt(&sealed).map_err(|e| match e {
            StoreError::Corrupted(reason) => {
                StoreError::Corrupted(format!("{}: {}", self.path.display(), reason))
            }
            other => other,
        })?;
        let envelope: Envelope = serde_json::from_slice(&plaintext).map_err(|e| {
            StoreError::Corrupted(format!("{}: invalid record: {}", self.path.display(), e))
        })?;

        trace!("read {} (schema {})", self.path.display(), envelope.schema);
        Ok(Some((envelope.schema, envelope.data)))
    }

    /// Replaces the record.
    pub(crate) async fn write<T: Serialize>(&self, schema: u32, data: &T) -> Result<(), StoreError> {
        let plaintext = serde_json::to_vec(&EnvelopeRef { schema, data })?;
        let sealed = self.cipher.encrypt(&plaintext)?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let tmp_path = self.path.with_extension("tmp");
        let mut file = fs::File::create(&tmp_path).await?;
        file.write_all(&sealed).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp_path, &self.path).await?;

        trace!("wrote {} ({} bytes)", self.path.display(), sealed.len());
        Ok(())
    }

    /// Deletes the record, a missing record is not an error.
    pub(crate) async fn remove(&self) -> Result<(), StoreError> {
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tempfile::TempDir;

    use super::*;
    use crate::store::test_cipher;

    #[tokio::test]
    async fn test_missing_record() {
        let dir = TempDir::new().unwrap();
        let record = RecordFile::new(dir.path(), "missing.enc", test_cipher());
        assert!(record.read().await.unwrap().is_none());
        assert!(record.remove().await.is_ok());
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let dir = TempDir::new().unwrap();
        let record = RecordFile::new(dir.path(), "record.enc", test_cipher());
        record.write(3, &json!({ "a": 1 })).await.unwrap();

        let (schema, data) = record.read().await.unwrap().unwrap();
        assert_eq!(schema, 3);
        assert_eq!(data, json!({ "a": 1 }));
        assert!(!record.path().with_extension("tmp").exists());

        let raw = std::fs::read(record.path()).unwrap();
        assert!(!String::from_utf8_lossy(&raw).contains("\"a\""));
    }

    #[tokio::test]
    async fn test_tampered_record_is_corruption() {
        let dir = TempDir::new().unwrap();
        let record = RecordFile::new(dir.path(), "record.enc", test_cipher());
        record.write(1, &json!("secret")).await.unwrap();

        let mut raw = std::fs::read(record.path()).unwrap();
        raw[20] ^= 0xff;
        std::fs::write(record.path(), raw).unwrap();

        let error = record.read().await.unwrap_err();
        match error {
            StoreError::Corrupted(reason) => assert!(reason.contains("record.enc")),
            other => panic!("unexpected error {:?}", other),
        }
    }
}
