//! HLS playlist downloading.
//!
//! A playlist job flows through these stages:
//!
//! 1. [`downloader::resolve_playlist`] fetches the document and follows master
//!    playlists down to a media playlist ([`playlist::parse`]).
//! 2. [`pipeline::SegmentPipeline`] fetches each segment under the job's limiter,
//!    pulling keys through a per-download [`keys::KeyCache`] and decrypting with a
//!    [`cipher::SegmentCipher`].
//! 3. [`assembler::OrderedAssembler`] writes results to a staging file by ordinal.
//! 4. A [`processor::MediaProcessor`] turns the staging file into the final output.

pub mod assembler;
pub mod cipher;
pub mod downloader;
pub mod keys;
pub mod pipeline;
pub mod playlist;
pub mod processor;

pub use assembler::{AssemblyBuffer, OrderedAssembler};
pub use cipher::{Aes128Cbc, SegmentCipher, derive_iv};
pub use downloader::{AssemblyReport, PlaylistDownloader, ResolvedPlaylist, resolve_playlist};
pub use keys::KeyCache;
pub use pipeline::{SegmentPipeline, SegmentResult};
pub use playlist::{InitSection, Playlist, Segment, Variant, select_variant};
pub use processor::{FfmpegRemuxer, MediaProcessor, PassthroughProcessor, ProcessOptions};
