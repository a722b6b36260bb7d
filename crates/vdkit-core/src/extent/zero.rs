//! Sparse regions that read as zero.

use crate::error::Result;
use crate::extent::{Extent, ExtentRange};

/// A run of zero bytes with no backing storage.
#[derive(Debug, Clone, Copy)]
pub struct ZeroExtent {
    range: ExtentRange,
}

impl ZeroExtent {
    pub fn new(start: u64, length: u64) -> Self {
        Self {
            range: ExtentRange::new(start, length),
        }
    }
}

impl Extent for ZeroExtent {
    fn start(&self) -> u64 {
        self.range.start
    }

    fn length(&self) -> u64 {
        self.range.length
    }

    fn kind(&self) -> &'static str {
        "zero"
    }

    fn prepare_for_read(&self) -> Result<()> {
        Ok(())
    }

    fn read(&self, disk_offset: u64, buf: &mut [u8]) -> Result<usize> {
        let (_, n) = self.range.local_span(disk_offset, buf.len())?;
        buf[..n].fill(0);
        Ok(n)
    }

    fn dispose_read_state(&self) {}
}
