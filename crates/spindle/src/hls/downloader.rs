// Playlist download: resolve the playlist, fetch segments under the job's limiter,
// assemble them in order into a staging file, then hand that file to the processor.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use tokio::io::BufWriter;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use url::Url;

use crate::config::{ConfigOverrides, EngineConfig};
use crate::error::{DownloadError, ParseError};
use crate::hls::assembler::OrderedAssembler;
use crate::hls::cipher::{Aes128Cbc, SegmentCipher};
use crate::hls::keys::KeyCache;
use crate::hls::pipeline::SegmentPipeline;
use crate::hls::playlist::{self, Playlist, select_variant};
use crate::hls::processor::{FfmpegRemuxer, MediaProcessor, ProcessOptions};
use crate::limiter::ConcurrencyLimiter;
use crate::retry::Fetcher;
use crate::storage::ensure_parent_dir;
use crate::transport::{HttpTransport, Transport};

/// A media playlist reached from the requested URL.
#[derive(Debug, Clone)]
pub struct ResolvedPlaylist {
    pub playlist: Playlist,
    /// URL of the media playlist document
    pub url: String,
    /// Variant URL picked from a master playlist, if one was followed
    pub variant_url: Option<String>,
}

/// Summary of a successful playlist download.
#[derive(Debug, Clone)]
pub struct AssemblyReport {
    pub output: PathBuf,
    pub playlist_url: String,
    pub variant_url: Option<String>,
    pub segments: u64,
    /// Bytes of the assembled raw stream, init section included
    pub bytes_written: u64,
    pub duration: f64,
    /// Most completed segments waiting for an earlier one at any time
    pub peak_buffered: usize,
    pub processor: &'static str,
}

/// Fetch `url` and follow master playlists until a media playlist is found.
///
/// At most `max_playlist_depth` documents are fetched.
#[instrument(skip(fetcher), level = "debug")]
pub async fn resolve_playlist(fetcher: &Fetcher, url: &str) -> Result<ResolvedPlaylist, DownloadError> {
    let config = fetcher.config();
    let max_depth = config.max_playlist_depth.max(1);
    let mut current = url.to_string();
    let mut variant_url = None;

    for depth in 0..max_depth {
        let base = Url::parse(&current)
            .map_err(|e| DownloadError::invalid_url(current.as_str(), e.to_string()))?;
        let body = fetcher.fetch_url(&current, None).await?;
        let document = std::str::from_utf8(&body).map_err(|e| {
            let line = body[..e.valid_up_to()].iter().filter(|&&b| b == b'\n').count() + 1;
            ParseError::new(line, format!("playlist is not valid UTF-8: {e}"))
        })?;
        let parsed = playlist::parse(document, &base)?;

        if !parsed.is_master {
            debug!(url = %current, depth, segments = parsed.segments.len(), "Resolved media playlist");
            return Ok(ResolvedPlaylist {
                playlist: parsed,
                url: current,
                variant_url,
            });
        }

        let variant = select_variant(&parsed.variants, config.variant_selection).ok_or_else(|| {
            ParseError::new(1, "master playlist has no selectable variant")
        })?;
        info!(
            bandwidth = variant.bandwidth,
            url = %variant.url,
            depth,
            "Selected variant stream"
        );
        current = variant.url.clone();
        variant_url = Some(current.clone());
    }

    Err(ParseError::new(
        1,
        format!("master playlists nested deeper than {max_depth} levels"),
    )
    .into())
}

pub struct PlaylistDownloader {
    config: Arc<EngineConfig>,
    transport: Arc<dyn Transport>,
    processor: Arc<dyn MediaProcessor>,
    cipher: Arc<dyn SegmentCipher>,
}

impl PlaylistDownloader {
    /// Downloader using HTTP and `ffmpeg`.
    pub fn new(config: EngineConfig) -> Result<Self, DownloadError> {
        let transport = Arc::new(HttpTransport::new(&config)?);
        Ok(Self::with_transport(config, transport))
    }

    pub fn with_transport(config: EngineConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            config: Arc::new(config),
            transport,
            processor: Arc::new(FfmpegRemuxer::default()),
            cipher: Arc::new(Aes128Cbc),
        }
    }

    pub fn with_processor(mut self, processor: Arc<dyn MediaProcessor>) -> Self {
        self.processor = processor;
        self
    }

    pub fn with_cipher(mut self, cipher: Arc<dyn SegmentCipher>) -> Self {
        self.cipher = cipher;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub async fn download(
        &self,
        url: &str,
        output: &Path,
        token: &CancellationToken,
    ) -> Result<AssemblyReport, DownloadError> {
        self.download_with(url, output, &ConfigOverrides::default(), token)
            .await
    }

    /// Download the playlist at `url` into `output`.
    ///
    /// On any failure or cancellation nothing is left at `output` or in staging.
    #[instrument(skip(self, overrides, token), fields(output = %output.display()))]
    pub async fn download_with(
        &self,
        url: &str,
        output: &Path,
        overrides: &ConfigOverrides,
        token: &CancellationToken,
    ) -> Result<AssemblyReport, DownloadError> {
        let config = Arc::new(self.config.resolve(overrides));
        let limiter = ConcurrencyLimiter::new(config.effective_concurrency());
        let fetcher = Fetcher::new(
            Arc::clone(&self.transport),
            limiter,
            Arc::clone(&config),
            token.clone(),
        );

        let resolved = resolve_playlist(&fetcher, url).await.inspect_err(|e| {
            error!(url, error = %e, "Playlist resolution failed");
        })?;
        let staging = staging_path(&config, output)?;

        info!(
            url = %resolved.url,
            segments = resolved.playlist.segments.len(),
            encrypted = resolved.playlist.key_uris().len(),
            concurrency = fetcher.limiter().capacity(),
            "Starting playlist download"
        );

        let pipeline = SegmentPipeline::new(fetcher).with_cipher(Arc::clone(&self.cipher));
        let assembled = match self
            .assemble(&pipeline, &resolved.playlist, &staging, token)
            .await
        {
            Ok(assembled) => assembled,
            Err(err) => {
                error!(error = %err, ordinal = err.failed_ordinal(), "Playlist download failed");
                remove_if_exists(&staging).await;
                return Err(err);
            }
        };

        let (bytes_written, peak_buffered) = assembled;
        self.run_processor(&config, &staging, output, token).await?;

        let report = AssemblyReport {
            output: output.to_path_buf(),
            playlist_url: resolved.url,
            variant_url: resolved.variant_url,
            segments: resolved.playlist.segments.len() as u64,
            bytes_written,
            duration: resolved.playlist.total_duration(),
            peak_buffered,
            processor: self.processor.name(),
        };
        info!(
            segments = report.segments,
            bytes = report.bytes_written,
            peak_buffered = report.peak_buffered,
            "Playlist download complete"
        );
        Ok(report)
    }

    /// Fetch every segment and write them in order to `staging`.
    /// Returns (bytes written, peak buffered segments).
    async fn assemble(
        &self,
        pipeline: &SegmentPipeline,
        playlist: &Playlist,
        staging: &Path,
        token: &CancellationToken,
    ) -> Result<(u64, usize), DownloadError> {
        ensure_parent_dir(staging).await?;
        let file = tokio::fs::File::create(staging)
            .await
            .map_err(|e| DownloadError::persistence(staging, e))?;

        let segments = &playlist.segments;
        let window = pipeline.fetcher().limiter().capacity();
        let mut assembler =
            OrderedAssembler::new(BufWriter::new(file), staging, segments.len() as u64, window);

        if let Some(init) = &playlist.init_section {
            let header = pipeline.fetch_init(init).await?;
            assembler.write_header(&header).await?;
            debug!(bytes = header.len(), "Initialization section written");
        }

        let keys = KeyCache::new();
        let mut in_flight = FuturesUnordered::new();
        let mut next_dispatch = 0usize;

        loop {
            // Dispatch only within `window` of the write cursor, so the assembler
            // never has to hold more than `window` completed segments.
            while next_dispatch < segments.len()
                && (next_dispatch as u64) < assembler.next_ordinal() + window as u64
                && !token.is_cancelled()
            {
                in_flight.push(pipeline.fetch_segment(&segments[next_dispatch], &keys));
                next_dispatch += 1;
            }

            let result = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(DownloadError::Cancelled),
                result = in_flight.next() => result,
            };
            let Some(result) = result else {
                break;
            };
            assembler.accept(result).await?;
        }

        debug!(key_fetches = keys.fetches(), "All segments received");
        let peak = assembler.peak_buffered();
        let (_, bytes_written) = assembler.finish().await?;
        Ok((bytes_written, peak))
    }

    async fn run_processor(
        &self,
        config: &EngineConfig,
        staging: &Path,
        output: &Path,
        token: &CancellationToken,
    ) -> Result<(), DownloadError> {
        let options = ProcessOptions::new(staging, output).keep_input(config.keep_staging);

        let result = async {
            ensure_parent_dir(output).await?;
            tokio::select! {
                biased;
                _ = token.cancelled() => Err(DownloadError::Cancelled),
                result = self.processor.process(&options) => result.map_err(DownloadError::from),
            }
        }
        .await;

        if let Err(err) = result {
            error!(processor = self.processor.name(), error = %err, "Processing failed");
            remove_if_exists(output).await;
            remove_if_exists(staging).await;
            return Err(err);
        }

        if !config.keep_staging {
            remove_if_exists(staging).await;
        }
        Ok(())
    }
}

/// `<output file name>.part`, in the staging directory or next to the output.
fn staging_path(config: &EngineConfig, output: &Path) -> Result<PathBuf, DownloadError> {
    let Some(file_name) = output.file_name() else {
        return Err(DownloadError::Configuration {
            reason: format!("output path `{}` has no file name", output.display()),
        });
    };
    let mut name = file_name.to_os_string();
    name.push(".part");

    let dir = match &config.staging_dir {
        Some(dir) => dir.clone(),
        None => output.parent().map(Path::to_path_buf).unwrap_or_default(),
    };
    Ok(dir.join(name))
}

async fn remove_if_exists(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "Removed file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove file"),
    }
}
