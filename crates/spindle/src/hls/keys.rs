// Per-download key cache. Each distinct key URI is fetched at most once, even
// when many segments ask for it concurrently.

use std::sync::atomic::{AtomicUsize, Ordering};

use moka::future::Cache;
use tracing::{debug, instrument};

use crate::error::DownloadError;
use crate::retry::Fetcher;

pub struct KeyCache {
    keys: Cache<String, [u8; 16]>,
    fetches: AtomicUsize,
}

impl Default for KeyCache {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyCache {
    pub fn new() -> Self {
        Self {
            keys: Cache::builder().build(),
            fetches: AtomicUsize::new(0),
        }
    }

    /// Key for `key_uri`, fetching it through `fetcher` on first use.
    ///
    /// Concurrent first callers share one fetch. A failed fetch is not cached,
    /// so a later caller may try again.
    #[instrument(skip(self, fetcher), level = "debug")]
    pub async fn get_or_fetch(
        &self,
        key_uri: &str,
        fetcher: &Fetcher,
    ) -> Result<[u8; 16], DownloadError> {
        self.keys
            .try_get_with(key_uri.to_string(), async {
                self.fetches.fetch_add(1, Ordering::AcqRel);
                let bytes = fetcher.fetch_url(key_uri, None).await?;
                let key: [u8; 16] = bytes[..].try_into().map_err(|_| {
                    DownloadError::decryption(format!(
                        "key from {key_uri} is {} bytes, expected 16",
                        bytes.len()
                    ))
                })?;
                debug!(key_uri, "Fetched decryption key");
                Ok::<_, DownloadError>(key)
            })
            .await
            .map_err(|err| {
                if err.is_cancelled() {
                    DownloadError::Cancelled
                } else {
                    DownloadError::decryption(format!("key {key_uri} unavailable: {err}"))
                }
            })
    }

    /// Number of key fetches started so far.
    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::Acquire)
    }

    pub fn contains(&self, key_uri: &str) -> bool {
        self.keys.contains_key(key_uri)
    }
}
