//! File-backed secure storage for local development
//!
//! Each record is one file named after the hex-encoded account. Files are
//! opened with owner-only permissions on Unix and overwritten with zeros
//! before removal. The records hold ciphertext only; confidentiality comes
//! from the key-share encryption, not from the filesystem.

use super::{Protection, SecureStorage, StorageStatus};
use crate::{Error, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::debug;

const RECORD_EXTENSION: &str = "record";

/// Directory of record files
#[derive(Debug, Clone)]
pub struct FileSecureStorage {
    base_path: PathBuf,
}

impl FileSecureStorage {
    /// Open a record directory, creating it if needed
    pub fn new(base_path: impl Into<PathBuf>) -> Result<Self> {
        let base_path = base_path.into();

        if !base_path.exists() {
            std::fs::create_dir_all(&base_path)?;
        }

        Ok(Self { base_path })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn record_path(&self, account: &str) -> Result<PathBuf> {
        if account.is_empty() {
            return Err(Error::storage(
                StorageStatus::ParameterError,
                "empty account name",
            ));
        }
        // Hex keeps arbitrary account names out of path syntax
        Ok(self
            .base_path
            .join(format!("{}.{}", hex::encode(account), RECORD_EXTENSION)))
    }
}

#[async_trait]
impl SecureStorage for FileSecureStorage {
    async fn read(&self, account: &str) -> Result<Option<Vec<u8>>> {
        let path = self.record_path(account)?;

        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, account: &str, data: &[u8], protection: Protection) -> Result<()> {
        let path = self.record_path(account)?;
        let tmp_path = path.with_extension("tmp");

        // A leftover temp file would keep its old permissions
        match tokio::fs::remove_file(&tmp_path).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e.into()),
            _ => {}
        }

        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        options.mode(0o600);

        let mut file = options.open(&tmp_path).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&tmp_path, &path).await?;
        debug!(account, ?protection, "Wrote record file");
        Ok(())
    }

    async fn remove(&self, account: &str) -> Result<()> {
        let path = self.record_path(account)?;

        if path.exists() {
            // Overwrite with zeros before deleting
            let size = tokio::fs::metadata(&path).await?.len() as usize;
            tokio::fs::write(&path, vec![0u8; size]).await?;
            tokio::fs::remove_file(&path).await?;
        }

        Ok(())
    }

    async fn contains(&self, account: &str) -> Result<bool> {
        Ok(self.record_path(account)?.exists())
    }
}
