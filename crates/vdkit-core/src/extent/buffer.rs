//! In-memory buffer extents.
//!
//! A buffer extent either holds its bytes for its whole lifetime (fixed) or
//! asks a [`BufferSource`] for them when prepared and drops them again when
//! disposed (computed). Computed extents are how encoders emit metadata that
//! is derived from other parts of the image, such as allocation tables.

use std::sync::{PoisonError, RwLock};

use crate::error::{Error, Result};
use crate::extent::{Extent, ExtentRange};

/// Producer of the content of a computed [`BufferExtent`].
///
/// Implementations must be deterministic: the bytes returned after a
/// dispose/prepare cycle must match the previous ones. Other extents of the
/// same stream may not be prepared when `get_buffer` runs.
pub trait BufferSource: Send + Sync {
    /// Produces the full content of the extent.
    fn get_buffer(&self) -> Result<Vec<u8>>;
}

impl<F> BufferSource for F
where
    F: Fn() -> Result<Vec<u8>> + Send + Sync,
{
    fn get_buffer(&self) -> Result<Vec<u8>> {
        self()
    }
}

enum Content {
    Fixed(Vec<u8>),
    Computed {
        source: Box<dyn BufferSource>,
        buffer: RwLock<Option<Vec<u8>>>,
    },
}

/// An extent backed by a byte buffer.
pub struct BufferExtent {
    range: ExtentRange,
    content: Content,
}

impl BufferExtent {
    /// Creates an extent that serves `data` for its whole lifetime.
    pub fn fixed(start: u64, data: impl Into<Vec<u8>>) -> Self {
        let data = data.into();
        Self {
            range: ExtentRange::new(start, data.len() as u64),
            content: Content::Fixed(data),
        }
    }

    /// Creates an extent whose `length` bytes are produced by `source` on
    /// each prepare that follows a dispose.
    pub fn computed(start: u64, length: u64, source: impl BufferSource + 'static) -> Self {
        Self {
            range: ExtentRange::new(start, length),
            content: Content::Computed {
                source: Box::new(source),
                buffer: RwLock::new(None),
            },
        }
    }

    /// [`BufferExtent::computed`] with a closure as the source.
    pub fn from_fn<F>(start: u64, length: u64, f: F) -> Self
    where
        F: Fn() -> Result<Vec<u8>> + Send + Sync + 'static,
    {
        Self::computed(start, length, f)
    }

    /// True when the content is held for the extent's whole lifetime.
    pub fn is_fixed(&self) -> bool {
        matches!(self.content, Content::Fixed(_))
    }

    /// True when the extent's bytes are currently materialized.
    pub fn is_materialized(&self) -> bool {
        match &self.content {
            Content::Fixed(_) => true,
            Content::Computed { buffer, .. } => buffer
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .is_some(),
        }
    }

    fn copy_out(&self, data: &[u8], disk_offset: u64, buf: &mut [u8]) -> Result<usize> {
        let (local, n) = self.range.local_span(disk_offset, buf.len())?;
        let local = local as usize;
        buf[..n].copy_from_slice(&data[local..local + n]);
        Ok(n)
    }
}

impl Extent for BufferExtent {
    fn start(&self) -> u64 {
        self.range.start
    }

    fn length(&self) -> u64 {
        self.range.length
    }

    fn kind(&self) -> &'static str {
        match self.content {
            Content::Fixed(_) => "buffer",
            Content::Computed { .. } => "computed",
        }
    }

    fn prepare_for_read(&self) -> Result<()> {
        let Content::Computed { source, buffer } = &self.content else {
            return Ok(());
        };

        let mut slot = buffer.write().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return Ok(());
        }

        let data = source.get_buffer().map_err(|e| match e {
            Error::Preparation { .. } => e,
            other => Error::preparation(self.range.start, other.to_string()),
        })?;
        if data.len() as u64 != self.range.length {
            return Err(Error::preparation(
                self.range.start,
                format!(
                    "buffer source produced {} bytes, extent length is {}",
                    data.len(),
                    self.range.length
                ),
            ));
        }

        *slot = Some(data);
        Ok(())
    }

    fn read(&self, disk_offset: u64, buf: &mut [u8]) -> Result<usize> {
        match &self.content {
            Content::Fixed(data) => self.copy_out(data, disk_offset, buf),
            Content::Computed { buffer, .. } => {
                let slot = buffer.read().unwrap_or_else(PoisonError::into_inner);
                let data = slot.as_deref().ok_or(Error::NotPrepared {
                    start: self.range.start,
                })?;
                self.copy_out(data, disk_offset, buf)
            }
        }
    }

    fn dispose_read_state(&self) {
        if let Content::Computed { buffer, .. } = &self.content {
            *buffer.write().unwrap_or_else(PoisonError::into_inner) = None;
        }
    }
}
