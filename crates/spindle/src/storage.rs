//! Storage sink for plain downloads.

use std::path::Path;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use crate::config::WriteMode;
use crate::error::DownloadError;

#[async_trait]
pub trait StorageSink: Send + Sync {
    /// Persist `bytes` at `path`, creating parent directories. Returns bytes written.
    async fn persist(&self, path: &Path, bytes: &[u8]) -> Result<u64, DownloadError>;
}

/// Writes to the local filesystem honoring a [`WriteMode`].
#[derive(Debug, Clone, Copy, Default)]
pub struct FileSink {
    mode: WriteMode,
}

impl FileSink {
    pub fn new(mode: WriteMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> WriteMode {
        self.mode
    }
}

/// Create `path`'s parent directory chain if it does not exist.
pub async fn ensure_parent_dir(path: &Path) -> Result<(), DownloadError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| DownloadError::persistence(parent, e))?;
    }
    Ok(())
}

#[async_trait]
impl StorageSink for FileSink {
    async fn persist(&self, path: &Path, bytes: &[u8]) -> Result<u64, DownloadError> {
        ensure_parent_dir(path).await?;

        let mut options = tokio::fs::OpenOptions::new();
        options.create(true);
        match self.mode {
            WriteMode::Append => options.append(true),
            WriteMode::Overwrite => options.write(true).truncate(true),
        };

        let mut file = options
            .open(path)
            .await
            .map_err(|e| DownloadError::persistence(path, e))?;
        file.write_all(bytes)
            .await
            .map_err(|e| DownloadError::persistence(path, e))?;
        file.flush()
            .await
            .map_err(|e| DownloadError::persistence(path, e))?;

        Ok(bytes.len() as u64)
    }
}
