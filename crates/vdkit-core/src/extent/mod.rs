//! Extents: the pieces a composed stream is assembled from.
//!
//! Every extent owns a fixed range `[start, start + length)` of the composed
//! stream and knows how to produce the bytes inside it. Offsets passed to
//! [`Extent::read`] are absolute offsets in the whole stream; the extent
//! translates them to its own local offset.
//!
//! Reads never cross the end of the extent. A read asking for more bytes than
//! remain returns the shorter count, and the caller continues with the next
//! extent.

pub mod buffer;
pub mod deflate;
pub mod passthrough;
pub mod zero;

use async_trait::async_trait;

use crate::error::{Error, Result};

pub use buffer::{BufferExtent, BufferSource};
pub use deflate::DeflatedContent;
pub use passthrough::{MappedFileExtent, PassThroughExtent};
pub use zero::ZeroExtent;

/// The read contract shared by every extent kind.
///
/// Methods take `&self`; extents with transient state keep it behind interior
/// mutability. The owner of the extent serializes `prepare_for_read` against
/// the first read, after which reads may run concurrently.
#[async_trait]
pub trait Extent: Send + Sync {
    /// First byte of the extent in the composed stream.
    fn start(&self) -> u64;

    /// Number of bytes the extent covers.
    fn length(&self) -> u64;

    /// One past the last byte of the extent.
    fn end(&self) -> u64 {
        self.start().saturating_add(self.length())
    }

    /// Short name used in logs and layout listings.
    fn kind(&self) -> &'static str {
        "custom"
    }

    /// Acquires whatever transient state reads need. Idempotent.
    fn prepare_for_read(&self) -> Result<()>;

    /// Copies bytes starting at the absolute `disk_offset` into `buf`.
    ///
    /// Returns `min(end - disk_offset, buf.len())`.
    fn read(&self, disk_offset: u64, buf: &mut [u8]) -> Result<usize>;

    /// Non-blocking form of [`Extent::read`]; same bytes, same count.
    async fn read_async(&self, disk_offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.read(disk_offset, buf)
    }

    /// Releases transient state. Never fails and may be called repeatedly,
    /// including before any `prepare_for_read`.
    fn dispose_read_state(&self);
}

/// The immutable byte range owned by an extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtentRange {
    pub start: u64,
    pub length: u64,
}

impl ExtentRange {
    pub fn new(start: u64, length: u64) -> Self {
        Self { start, length }
    }

    /// One past the last byte. Saturates; the index rejects overflowing ranges.
    pub fn end(&self) -> u64 {
        self.start.saturating_add(self.length)
    }

    pub fn contains(&self, offset: u64) -> bool {
        offset >= self.start && offset < self.end()
    }

    /// Translates a disk read into `(local_offset, byte_count)`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfRange`] if `disk_offset` is not inside the range.
    pub fn local_span(&self, disk_offset: u64, requested: usize) -> Result<(u64, usize)> {
        if !self.contains(disk_offset) {
            return Err(Error::OutOfRange {
                offset: disk_offset,
                count: requested as u64,
                total_length: self.end(),
            });
        }
        let local = disk_offset - self.start;
        let remaining = self.length - local;
        let n = std::cmp::min(remaining, requested as u64) as usize;
        Ok((local, n))
    }
}
