use std::path::PathBuf;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue};

use crate::retry::RetryPolicy;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/142.0.0.0 Safari/537.36";

/// What to do when a destination file already exists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WriteMode {
    /// Append the fetched bytes to the existing file (default)
    #[default]
    Append,
    /// Truncate and replace the existing file
    Overwrite,
}

/// IV used for an AES-128 segment whose key directive carries no `IV` attribute.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IvDerivation {
    /// Media sequence number as a big-endian 128-bit integer (RFC 8216 section 5.2)
    #[default]
    MediaSequence,
    /// All-zero IV, used by some non-conforming packagers
    Zero,
}

/// Which variant of a master playlist gets downloaded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum VariantSelection {
    #[default]
    HighestBandwidth,
    LowestBandwidth,
    /// Variant whose declared bandwidth is closest to the given value
    ClosestTo(u64),
}

/// Engine-wide configuration.
///
/// This is the "process config" layer: a [`ConfigOverrides`] supplied at the call
/// site takes precedence over it, and [`EngineConfig::default`] fills everything else.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum number of fetches in flight per job (plain files, segments and keys alike)
    pub concurrency: usize,

    /// Timeout for a single fetch attempt, including the body read
    pub timeout: Duration,

    /// Time allowed to establish a connection
    pub connect_timeout: Duration,

    /// Retry ceiling and backoff parameters
    pub retry: RetryPolicy,

    /// User agent string
    pub user_agent: String,

    /// Headers sent with every request, passed through unmodified
    pub default_headers: HeaderMap,

    /// Existing-file policy for plain downloads
    pub write_mode: WriteMode,

    pub iv_derivation: IvDerivation,

    pub variant_selection: VariantSelection,

    /// Maximum number of playlist documents followed while resolving a master playlist
    pub max_playlist_depth: usize,

    /// Directory for the assembled raw stream. Defaults to the output file's directory.
    pub staging_dir: Option<PathBuf>,

    /// Keep the assembled raw stream after successful processing
    pub keep_staging: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            default_headers: EngineConfig::get_default_headers(),
            write_mode: WriteMode::default(),
            iv_derivation: IvDerivation::default(),
            variant_selection: VariantSelection::default(),
            max_playlist_depth: 5,
            staging_dir: None,
            keep_staging: false,
        }
    }
}

impl EngineConfig {
    pub fn get_default_headers() -> HeaderMap {
        let mut default_headers = HeaderMap::new();

        default_headers.insert(
            reqwest::header::ACCEPT,
            HeaderValue::from_static("*/*"),
        );

        default_headers.insert(
            reqwest::header::ACCEPT_LANGUAGE,
            HeaderValue::from_static("en-US,en;q=0.5,zh-CN;q=0.3,zh;q=0.2"),
        );
        default_headers
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_write_mode(mut self, write_mode: WriteMode) -> Self {
        self.write_mode = write_mode;
        self
    }

    pub fn with_iv_derivation(mut self, iv_derivation: IvDerivation) -> Self {
        self.iv_derivation = iv_derivation;
        self
    }

    pub fn with_variant_selection(mut self, variant_selection: VariantSelection) -> Self {
        self.variant_selection = variant_selection;
        self
    }

    pub fn with_staging_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.staging_dir = Some(dir.into());
        self
    }

    pub fn with_keep_staging(mut self, keep: bool) -> Self {
        self.keep_staging = keep;
        self
    }

    pub fn with_max_playlist_depth(mut self, depth: usize) -> Self {
        self.max_playlist_depth = depth;
        self
    }

    /// Add or replace a default header. Invalid header names or values are rejected.
    pub fn with_header(
        mut self,
        name: &str,
        value: &str,
    ) -> Result<Self, crate::DownloadError> {
        let (name, value) = parse_header(name, value)?;
        self.default_headers.insert(name, value);
        Ok(self)
    }

    /// Capacity actually used by a job. Zero is treated as one.
    pub fn effective_concurrency(&self) -> usize {
        self.concurrency.max(1)
    }

    /// Apply call-site overrides on top of this configuration.
    ///
    /// Scalar options are replaced when the override is set. Headers merge
    /// key by key, with override values winning.
    pub fn resolve(&self, overrides: &ConfigOverrides) -> EngineConfig {
        let mut resolved = self.clone();

        if let Some(concurrency) = overrides.concurrency {
            resolved.concurrency = concurrency;
        }
        if let Some(timeout) = overrides.timeout {
            resolved.timeout = timeout;
        }
        if let Some(max_attempts) = overrides.max_attempts {
            resolved.retry.max_attempts = max_attempts;
        }
        if let Some(base) = overrides.backoff_base {
            resolved.retry.base_delay = base;
        }
        if let Some(cap) = overrides.backoff_cap {
            resolved.retry.max_delay = cap;
        }
        if let Some(write_mode) = overrides.write_mode {
            resolved.write_mode = write_mode;
        }
        for (name, value) in overrides.headers.iter() {
            resolved.default_headers.insert(name.clone(), value.clone());
        }

        resolved
    }
}

/// Call-site configuration. Unset fields fall back to the engine's [`EngineConfig`].
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub concurrency: Option<usize>,
    pub timeout: Option<Duration>,
    pub max_attempts: Option<u32>,
    pub backoff_base: Option<Duration>,
    pub backoff_cap: Option<Duration>,
    pub write_mode: Option<WriteMode>,
    pub headers: HeaderMap,
}

impl ConfigOverrides {
    pub fn header(mut self, name: &str, value: &str) -> Result<Self, crate::DownloadError> {
        let (name, value) = parse_header(name, value)?;
        self.headers.insert(name, value);
        Ok(self)
    }
}

fn parse_header(
    name: &str,
    value: &str,
) -> Result<(reqwest::header::HeaderName, HeaderValue), crate::DownloadError> {
    let name = reqwest::header::HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
        crate::DownloadError::Configuration {
            reason: format!("invalid header name `{name}`: {e}"),
        }
    })?;
    let value = HeaderValue::from_str(value).map_err(|e| crate::DownloadError::Configuration {
        reason: format!("invalid value for header `{name}`: {e}"),
    })?;
    Ok((name, value))
}
