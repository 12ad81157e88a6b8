// Segment Fetch & Decrypt Pipeline: one unit of work per segment.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, instrument, trace};

use crate::config::IvDerivation;
use crate::error::DownloadError;
use crate::hls::cipher::{Aes128Cbc, SegmentCipher, decrypt_offloaded, derive_iv};
use crate::hls::keys::KeyCache;
use crate::hls::playlist::{InitSection, Segment};
use crate::retry::Fetcher;

/// Terminal result of one segment, tagged with its ordinal.
#[derive(Debug)]
pub struct SegmentResult {
    pub ordinal: u64,
    pub outcome: Result<Bytes, DownloadError>,
}

impl SegmentResult {
    pub fn ok(ordinal: u64, bytes: Bytes) -> Self {
        Self {
            ordinal,
            outcome: Ok(bytes),
        }
    }

    pub fn failed(ordinal: u64, err: DownloadError) -> Self {
        Self {
            ordinal,
            outcome: Err(err),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }
}

#[derive(Clone)]
pub struct SegmentPipeline {
    fetcher: Fetcher,
    cipher: Arc<dyn SegmentCipher>,
    iv_derivation: IvDerivation,
}

impl SegmentPipeline {
    pub fn new(fetcher: Fetcher) -> Self {
        let iv_derivation = fetcher.config().iv_derivation;
        Self {
            fetcher,
            cipher: Arc::new(Aes128Cbc),
            iv_derivation,
        }
    }

    pub fn with_cipher(mut self, cipher: Arc<dyn SegmentCipher>) -> Self {
        self.cipher = cipher;
        self
    }

    pub fn fetcher(&self) -> &Fetcher {
        &self.fetcher
    }

    /// Fetch one segment, decrypting it when it carries a key.
    ///
    /// Never panics and never aborts siblings: every failure ends up in the
    /// returned [`SegmentResult`].
    #[instrument(skip_all, fields(ordinal = segment.ordinal))]
    pub async fn fetch_segment(&self, segment: &Segment, keys: &KeyCache) -> SegmentResult {
        let outcome = self.fetch_and_decrypt(segment, keys).await;
        match &outcome {
            Ok(bytes) => debug!(url = %segment.url, bytes = bytes.len(), "Segment ready"),
            Err(err) => debug!(url = %segment.url, error = %err, "Segment failed"),
        }
        SegmentResult {
            ordinal: segment.ordinal,
            outcome,
        }
    }

    async fn fetch_and_decrypt(
        &self,
        segment: &Segment,
        keys: &KeyCache,
    ) -> Result<Bytes, DownloadError> {
        let key = match segment.key_uri.as_deref() {
            Some(key_uri) => Some(keys.get_or_fetch(key_uri, &self.fetcher).await?),
            None => None,
        };

        let data = self.fetcher.fetch_url(&segment.url, segment.range).await?;

        let Some(key) = key else {
            return Ok(data);
        };
        let iv = derive_iv(segment.iv, self.iv_derivation, segment.sequence);
        trace!(sequence = segment.sequence, explicit_iv = segment.iv.is_some(), "Decrypting segment");
        decrypt_offloaded(Arc::clone(&self.cipher), data, key, iv).await
    }

    /// Fetch the initialization section. It is never encrypted.
    pub async fn fetch_init(&self, init: &InitSection) -> Result<Bytes, DownloadError> {
        self.fetcher.fetch_url(&init.url, init.range).await
    }
}
