//! Compressed payloads that are inflated only while prepared.

use std::io::Read;
use std::sync::Arc;

use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;

use crate::error::{Error, Result};
use crate::extent::{BufferExtent, BufferSource};

/// A raw-DEFLATE payload used as the content of a computed buffer extent.
///
/// Only the compressed bytes are held between read sessions; the inflated
/// buffer lives from `prepare_for_read` to `dispose_read_state`.
#[derive(Debug, Clone)]
pub struct DeflatedContent {
    compressed: Arc<[u8]>,
    inflated_len: usize,
}

impl DeflatedContent {
    /// Wraps an already compressed payload that inflates to `inflated_len` bytes.
    pub fn new(compressed: impl Into<Arc<[u8]>>, inflated_len: usize) -> Self {
        Self {
            compressed: compressed.into(),
            inflated_len,
        }
    }

    /// Compresses `data` at `level` (0-9).
    pub fn compress(data: &[u8], level: u32) -> Result<Self> {
        use std::io::Write;

        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::new(level));
        encoder.write_all(data)?;
        let compressed = encoder.finish()?;
        Ok(Self::new(compressed, data.len()))
    }

    pub fn compressed_len(&self) -> usize {
        self.compressed.len()
    }

    pub fn inflated_len(&self) -> usize {
        self.inflated_len
    }

    /// Builds a computed extent at `start` serving the inflated payload.
    pub fn into_extent(self, start: u64) -> BufferExtent {
        let length = self.inflated_len as u64;
        BufferExtent::computed(start, length, self)
    }
}

impl BufferSource for DeflatedContent {
    fn get_buffer(&self) -> Result<Vec<u8>> {
        let mut decoder = DeflateDecoder::new(&self.compressed[..]);
        let mut inflated = vec![0u8; self.inflated_len];
        decoder
            .read_exact(&mut inflated)
            .map_err(Error::io_simple)?;
        Ok(inflated)
    }
}
