// Ordered Assembler: writes segment results to the output strictly by ordinal,
// whatever order they complete in.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use crate::error::DownloadError;
use crate::hls::pipeline::SegmentResult;

/// Completed-but-unwritten segments keyed by ordinal.
///
/// Entries leave the buffer the moment they are handed out by [`pop_ready`](Self::pop_ready).
#[derive(Debug)]
pub struct AssemblyBuffer {
    pending: BTreeMap<u64, Bytes>,
    next_ordinal: u64,
    capacity: usize,
    buffered_bytes: usize,
    peak_len: usize,
}

impl AssemblyBuffer {
    /// A buffer that refuses to hold more than `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            pending: BTreeMap::new(),
            next_ordinal: 0,
            capacity: capacity.max(1),
            buffered_bytes: 0,
            peak_len: 0,
        }
    }

    pub fn insert(&mut self, ordinal: u64, bytes: Bytes) -> Result<(), DownloadError> {
        if ordinal < self.next_ordinal || self.pending.contains_key(&ordinal) {
            return Err(DownloadError::internal(format!(
                "segment {ordinal} delivered twice"
            )));
        }
        if self.pending.len() >= self.capacity {
            return Err(DownloadError::internal(format!(
                "assembly buffer full ({} entries) while waiting for segment {}",
                self.pending.len(),
                self.next_ordinal
            )));
        }
        self.buffered_bytes += bytes.len();
        self.pending.insert(ordinal, bytes);
        self.peak_len = self.peak_len.max(self.pending.len());
        Ok(())
    }

    /// Remove and return the next ordinal to write, if it has arrived.
    pub fn pop_ready(&mut self) -> Option<(u64, Bytes)> {
        let entry = self.pending.first_entry()?;
        if *entry.key() != self.next_ordinal {
            return None;
        }
        let (ordinal, bytes) = entry.remove_entry();
        self.buffered_bytes = self.buffered_bytes.saturating_sub(bytes.len());
        self.next_ordinal += 1;
        Some((ordinal, bytes))
    }

    /// Lowest ordinal not yet handed out.
    pub fn next_ordinal(&self) -> u64 {
        self.next_ordinal
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn buffered_bytes(&self) -> usize {
        self.buffered_bytes
    }

    /// Most entries held at once.
    pub fn peak_len(&self) -> usize {
        self.peak_len
    }
}

/// Drains [`SegmentResult`]s into `writer` in ordinal order.
///
/// The first failed result ends assembly: it is returned as
/// [`DownloadError::SegmentFailed`] naming that ordinal, and the caller is
/// expected to discard whatever was written.
pub struct OrderedAssembler<W> {
    writer: W,
    destination: PathBuf,
    buffer: AssemblyBuffer,
    total: u64,
    bytes_written: u64,
}

impl<W: AsyncWrite + Unpin> OrderedAssembler<W> {
    /// `concurrency` is the number of segments that may be in flight at once;
    /// the buffer holds at most one more than that.
    pub fn new(writer: W, destination: impl Into<PathBuf>, total: u64, concurrency: usize) -> Self {
        Self {
            writer,
            destination: destination.into(),
            buffer: AssemblyBuffer::new(concurrency.max(1) + 1),
            total,
            bytes_written: 0,
        }
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    /// Write a header (the initialization section) ahead of ordinal 0.
    pub async fn write_header(&mut self, bytes: &[u8]) -> Result<(), DownloadError> {
        if self.buffer.next_ordinal() > 0 {
            return Err(DownloadError::internal(
                "header written after segment data",
            ));
        }
        self.write(bytes).await
    }

    /// Take one result. Returns the number of segments written by this call.
    pub async fn accept(&mut self, result: SegmentResult) -> Result<usize, DownloadError> {
        let SegmentResult { ordinal, outcome } = result;
        if ordinal >= self.total {
            return Err(DownloadError::internal(format!(
                "segment {ordinal} is outside a playlist of {} segments",
                self.total
            )));
        }

        let bytes = match outcome {
            Ok(bytes) => bytes,
            Err(err) if err.is_cancelled() => return Err(DownloadError::Cancelled),
            Err(err) => return Err(DownloadError::segment(ordinal, err)),
        };

        self.buffer.insert(ordinal, bytes)?;
        trace!(ordinal, buffered = self.buffer.len(), "Segment buffered");

        let mut drained = 0;
        while let Some((ordinal, bytes)) = self.buffer.pop_ready() {
            self.write(&bytes).await?;
            trace!(ordinal, bytes = bytes.len(), "Segment written");
            drained += 1;
        }
        Ok(drained)
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<(), DownloadError> {
        self.writer
            .write_all(bytes)
            .await
            .map_err(|e| DownloadError::persistence(&self.destination, e))?;
        self.bytes_written += bytes.len() as u64;
        Ok(())
    }

    /// Ordinal the assembler is waiting for.
    pub fn next_ordinal(&self) -> u64 {
        self.buffer.next_ordinal()
    }

    pub fn is_complete(&self) -> bool {
        self.buffer.next_ordinal() == self.total
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn peak_buffered(&self) -> usize {
        self.buffer.peak_len()
    }

    /// Flush and hand back the writer once every segment has been written.
    pub async fn finish(mut self) -> Result<(W, u64), DownloadError> {
        if !self.is_complete() {
            return Err(DownloadError::internal(format!(
                "assembly finished at segment {} of {}",
                self.buffer.next_ordinal(),
                self.total
            )));
        }
        self.writer
            .flush()
            .await
            .map_err(|e| DownloadError::persistence(&self.destination, e))?;
        debug!(
            path = %self.destination.display(),
            segments = self.total,
            bytes = self.bytes_written,
            "Assembly complete"
        );
        Ok((self.writer, self.bytes_written))
    }
}
