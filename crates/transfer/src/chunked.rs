use std::future::Future;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::TransferError;

// ---------------------------------------------------------------------------
// Checksum helpers
// ---------------------------------------------------------------------------

/// Computes SHA-256 of `data` and returns the hex-encoded digest.
pub fn checksum_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Computes SHA-256 over the whole source, reading it chunk by chunk.
pub async fn checksum_source<S: ChunkSource>(
    source: &mut S,
    chunk_size: usize,
) -> Result<String, TransferError> {
    let mut hasher = Sha256::new();
    for span in ChunkPlan::new(source.size(), chunk_size) {
        let data = source.read_chunk(span).await?;
        hasher.update(&data);
    }
    Ok(hex::encode(hasher.finalize()))
}

// ---------------------------------------------------------------------------
// ChunkPlan
// ---------------------------------------------------------------------------

/// One chunk's position in the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSpan {
    pub offset: u64,
    pub len: usize,
}

impl ChunkSpan {
    /// Offset one past the last byte of the chunk.
    pub fn end(&self) -> u64 {
        self.offset + self.len as u64
    }
}

/// Lazy sequence of chunk spans covering `[0, total)` in ascending order.
///
/// Every span is `chunk_size` long except possibly the last one.
#[derive(Debug, Clone)]
pub struct ChunkPlan {
    total: u64,
    chunk_size: usize,
    next: u64,
}

impl ChunkPlan {
    /// Plans `total` bytes in chunks of `chunk_size` (0 means [`crate::CHUNK_SIZE`]).
    pub fn new(total: u64, chunk_size: usize) -> Self {
        let chunk_size = if chunk_size == 0 {
            crate::CHUNK_SIZE
        } else {
            chunk_size
        };
        Self {
            total,
            chunk_size,
            next: 0,
        }
    }
}

impl Iterator for ChunkPlan {
    type Item = ChunkSpan;

    fn next(&mut self) -> Option<ChunkSpan> {
        let remaining = self.total - self.next;
        if remaining == 0 {
            return None;
        }
        let len = remaining.min(self.chunk_size as u64) as usize;
        let span = ChunkSpan {
            offset: self.next,
            len,
        };
        self.next += len as u64;
        Some(span)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = (self.total - self.next).div_ceil(self.chunk_size as u64);
        let left = usize::try_from(left).unwrap_or(usize::MAX);
        (left, Some(left))
    }
}

impl ExactSizeIterator for ChunkPlan {}

// ---------------------------------------------------------------------------
// ChunkSource
// ---------------------------------------------------------------------------

/// Read-only payload the sender slices into chunks.
pub trait ChunkSource: Send {
    /// Total payload size in bytes.
    fn size(&self) -> u64;

    /// Reads exactly the bytes of `span`.
    fn read_chunk(
        &mut self,
        span: ChunkSpan,
    ) -> impl Future<Output = Result<Bytes, TransferError>> + Send;
}

impl ChunkSource for Bytes {
    fn size(&self) -> u64 {
        self.len() as u64
    }

    async fn read_chunk(&mut self, span: ChunkSpan) -> Result<Bytes, TransferError> {
        let start = span.offset as usize;
        let end = start + span.len;
        if end > self.len() {
            return Err(TransferError::ShortRead {
                offset: span.offset,
                expected: span.len,
                actual: self.len().saturating_sub(start),
            });
        }
        Ok(self.slice(start..end))
    }
}

/// File on disk read one chunk at a time.
pub struct FileSource {
    file: tokio::fs::File,
    path: PathBuf,
    size: u64,
}

impl FileSource {
    /// Opens `path` for chunked reading.
    pub async fn open(path: &Path) -> Result<Self, TransferError> {
        let file = tokio::fs::File::open(path).await?;
        let size = file.metadata().await?.len();
        Ok(Self {
            file,
            path: path.to_path_buf(),
            size,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File name component, used as the suggested name for the receiver.
    pub fn file_name(&self) -> Option<String> {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
    }
}

impl ChunkSource for FileSource {
    fn size(&self) -> u64 {
        self.size
    }

    async fn read_chunk(&mut self, span: ChunkSpan) -> Result<Bytes, TransferError> {
        self.file.seek(SeekFrom::Start(span.offset)).await?;
        let mut buf = vec![0u8; span.len];
        let mut filled = 0;
        while filled < span.len {
            let n = self.file.read(&mut buf[filled..]).await?;
            if n == 0 {
                return Err(TransferError::ShortRead {
                    offset: span.offset,
                    expected: span.len,
                    actual: filled,
                });
            }
            filled += n;
        }
        Ok(Bytes::from(buf))
    }
}
