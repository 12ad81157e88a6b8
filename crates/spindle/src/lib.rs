//! Concurrent download engine for plain files and HLS playlists.
//!
//! Two kinds of jobs share one fetch stack (transport, retry, concurrency limit):
//!
//! - [`DownloadManager`] fetches a batch of independent `(destination, URL)` jobs.
//!   Every job gets an outcome; one failing job never stops the others.
//! - [`PlaylistDownloader`] downloads every segment of an HLS playlist concurrently,
//!   decrypts AES-128 segments, writes them in playlist order and hands the result
//!   to a media processor. Any segment failure fails the whole job.
//!
//! ## Component Overview
//!
//! - `transport`: single fetch attempts over HTTP
//! - `retry`: bounded exponential backoff around the transport
//! - `limiter`: per-job cap on in-flight fetches
//! - `storage`: filesystem persistence for plain downloads
//! - `batch`: the plain download manager
//! - `hls`: playlist parsing, key cache, decryption, ordered assembly, processing

pub mod batch;
pub mod config;
pub mod error;
pub mod hls;
pub mod limiter;
pub mod retry;
pub mod storage;
pub mod transport;

#[cfg(test)]
mod test_support;

pub use batch::{BatchReport, DownloadJob, DownloadManager, JobOutcome, JobStatus};
pub use config::{
    ConfigOverrides, DEFAULT_USER_AGENT, EngineConfig, IvDerivation, VariantSelection, WriteMode,
};
pub use error::{DownloadError, ErrorKind, FailureKind, FetchFailure, ParseError, ProcessingError};
pub use hls::{AssemblyReport, PlaylistDownloader};
pub use limiter::{ConcurrencyLimiter, LimiterPermit};
pub use retry::{Fetcher, RetryPolicy, fetch_with_retry};
pub use storage::{FileSink, StorageSink};
pub use transport::{ByteRange, FetchRequest, FetchResult, HttpTransport, Transport};
