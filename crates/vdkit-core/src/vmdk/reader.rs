//! Sparse VMDK reader.
//!
//! Reads hosted sparse VMDKs (monolithicSparse, twoGbMaxExtentSparse) through
//! any [`ReadAt`] and exposes the virtual disk as another [`ReadAt`], so an
//! image can be inspected, verified, or fed back into a [`StreamBuilder`].
//!
//! [`StreamBuilder`]: crate::builder::StreamBuilder

use std::io::{self, Read};
use std::sync::Arc;

use flate2::read::DeflateDecoder;

use crate::error::{Error, Result};
use crate::source::ReadAt;

use super::descriptor::{parse_descriptor, VmdkDescriptor};
use super::header::{SparseExtentHeader, MAX_SUPPORTED_VERSION, SECTOR_SIZE};

/// Bytes preceding the data of a compressed grain: LBA (8) + size (4).
const COMPRESSED_GRAIN_HEADER: usize = 12;

/// Descriptors larger than this are rejected rather than allocated.
const MAX_DESCRIPTOR_BYTES: u64 = 1024 * 1024;

/// Room a DEFLATE stream may need beyond the grain it encodes.
const COMPRESSED_GRAIN_SLACK: usize = 4096;

/// Byte offset of `sector`, failing instead of wrapping.
fn sector_offset(sector: u64, what: &str) -> Result<u64> {
    sector.checked_mul(SECTOR_SIZE).ok_or_else(|| {
        Error::vmdk(format!("{} at sector {} is beyond any addressable offset", what, sector))
    })
}

/// Reads exactly `buf.len()` bytes or fails with a truncation error.
fn read_exact_at(source: &dyn ReadAt, offset: u64, buf: &mut [u8], what: &str) -> Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        let at = offset + filled as u64;
        let n = source
            .read_at(at, &mut buf[filled..])
            .map_err(|e| Error::source_read(at, e))?;
        if n == 0 {
            return Err(Error::vmdk(format!(
                "{} at offset {} extends beyond end of image",
                what, offset
            )));
        }
        filled += n;
    }
    Ok(())
}

fn le_u32(bytes: &[u8]) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(b)
}

/// Checks whether `source` starts with a sparse extent header.
pub fn is_sparse_vmdk(source: &dyn ReadAt) -> Result<bool> {
    if source.size() < SECTOR_SIZE {
        return Ok(false);
    }
    let mut sector = vec![0u8; SECTOR_SIZE as usize];
    read_exact_at(source, 0, &mut sector, "header")?;
    Ok(SparseExtentHeader::from_bytes(&sector).is_ok())
}

/// A sparse VMDK opened for reading.
pub struct SparseVmdkReader {
    source: Arc<dyn ReadAt>,
    header: SparseExtentHeader,
    descriptor: Option<VmdkDescriptor>,
    /// Grain table locations in sectors; 0 means the table is absent.
    grain_directory: Vec<u32>,
}

impl SparseVmdkReader {
    /// Parses the header, embedded descriptor and grain directory.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Vmdk`] for a bad magic, an unsupported version,
    /// stream markers, or metadata that runs past the end of the image.
    pub fn open(source: Arc<dyn ReadAt>) -> Result<Self> {
        let mut sector = vec![0u8; SECTOR_SIZE as usize];
        read_exact_at(source.as_ref(), 0, &mut sector, "header")?;
        let header = SparseExtentHeader::from_bytes(&sector)?;

        if header.version > MAX_SUPPORTED_VERSION {
            return Err(Error::vmdk(format!(
                "unsupported sparse VMDK version: {}",
                header.version
            )));
        }
        if header.has_markers() {
            return Err(Error::vmdk(
                "streamOptimized VMDKs with markers are not supported for reading",
            ));
        }

        let descriptor = Self::read_descriptor(source.as_ref(), &header)?;

        let num_gd_entries = header.num_gd_entries() as usize;
        let mut gd_bytes = vec![0u8; num_gd_entries * 4];
        read_exact_at(
            source.as_ref(),
            sector_offset(header.gd_offset, "grain directory")?,
            &mut gd_bytes,
            "grain directory",
        )?;
        let grain_directory = gd_bytes.chunks_exact(4).map(le_u32).collect();

        tracing::debug!(
            capacity_sectors = header.capacity,
            grain_size = header.grain_size,
            gd_entries = num_gd_entries,
            compressed = header.is_compressed(),
            "opened sparse VMDK"
        );

        Ok(Self {
            source,
            header,
            descriptor,
            grain_directory,
        })
    }

    fn read_descriptor(
        source: &dyn ReadAt,
        header: &SparseExtentHeader,
    ) -> Result<Option<VmdkDescriptor>> {
        if header.descriptor_offset == 0 || header.descriptor_size == 0 {
            return Ok(None);
        }
        if header.descriptor_size > MAX_DESCRIPTOR_BYTES / SECTOR_SIZE {
            return Err(Error::vmdk(format!(
                "descriptor of {} sectors is too large",
                header.descriptor_size
            )));
        }
        let len = header.descriptor_size * SECTOR_SIZE;

        let mut text = vec![0u8; len as usize];
        read_exact_at(
            source,
            sector_offset(header.descriptor_offset, "descriptor")?,
            &mut text,
            "descriptor",
        )?;
        let text = String::from_utf8_lossy(&text);
        parse_descriptor(&text).map(Some)
    }

    pub fn header(&self) -> &SparseExtentHeader {
        &self.header
    }

    /// The embedded descriptor, if the image has one.
    pub fn descriptor(&self) -> Option<&VmdkDescriptor> {
        self.descriptor.as_ref()
    }

    /// Virtual disk capacity in bytes.
    pub fn capacity(&self) -> u64 {
        self.header.capacity_bytes()
    }

    pub fn grain_size_bytes(&self) -> u64 {
        self.header.grain_size_bytes()
    }

    /// Sector of the grain holding `grain_index`, or `None` if unallocated.
    pub fn grain_location(&self, grain_index: u64) -> Result<Option<u64>> {
        let per_table = self.header.num_gtes_per_gt as u64;
        let table = grain_index / per_table;
        let entry = grain_index % per_table;

        let Some(&gt_sector) = self.grain_directory.get(table as usize) else {
            return Ok(None);
        };
        if gt_sector == 0 {
            return Ok(None);
        }

        let mut bytes = [0u8; 4];
        read_exact_at(
            self.source.as_ref(),
            gt_sector as u64 * SECTOR_SIZE + entry * 4,
            &mut bytes,
            "grain table entry",
        )?;
        match u32::from_le_bytes(bytes) {
            0 => Ok(None),
            sector => Ok(Some(sector as u64)),
        }
    }

    /// Counts allocated grains by walking every grain table.
    pub fn allocated_grains(&self) -> Result<u64> {
        let mut count = 0u64;
        let per_table = self.header.num_gtes_per_gt as usize;
        let mut table = vec![0u8; per_table * 4];
        for &gt_sector in self.grain_directory.iter().filter(|&&s| s != 0) {
            read_exact_at(
                self.source.as_ref(),
                gt_sector as u64 * SECTOR_SIZE,
                &mut table,
                "grain table",
            )?;
            count += table.chunks_exact(4).filter(|e| le_u32(e) != 0).count() as u64;
        }
        Ok(count)
    }

    /// Reads a whole grain; unallocated grains read as zeros.
    fn read_grain(&self, grain_index: u64) -> Result<Vec<u8>> {
        let grain_bytes = self.grain_size_bytes() as usize;
        let Some(sector) = self.grain_location(grain_index)? else {
            return Ok(vec![0u8; grain_bytes]);
        };
        let offset = sector * SECTOR_SIZE;

        if !self.header.is_compressed() {
            let mut grain = vec![0u8; grain_bytes];
            read_exact_at(self.source.as_ref(), offset, &mut grain, "grain")?;
            return Ok(grain);
        }

        let mut prefix = [0u8; COMPRESSED_GRAIN_HEADER];
        read_exact_at(self.source.as_ref(), offset, &mut prefix, "compressed grain header")?;
        let compressed_len = le_u32(&prefix[8..]) as usize;
        if compressed_len > grain_bytes + COMPRESSED_GRAIN_SLACK {
            return Err(Error::vmdk(format!(
                "compressed grain {} claims {} bytes for a {} byte grain",
                grain_index, compressed_len, grain_bytes
            )));
        }

        let mut compressed = vec![0u8; compressed_len];
        read_exact_at(
            self.source.as_ref(),
            offset + COMPRESSED_GRAIN_HEADER as u64,
            &mut compressed,
            "compressed grain",
        )?;

        let mut grain = vec![0u8; grain_bytes];
        DeflateDecoder::new(compressed.as_slice())
            .read_exact(&mut grain)
            .map_err(|e| Error::vmdk(format!("failed to decompress grain {}: {}", grain_index, e)))?;
        Ok(grain)
    }

    /// Reads virtual disk bytes at `offset`, clamped to the capacity.
    pub fn read_virtual(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let capacity = self.capacity();
        if offset >= capacity {
            return Ok(0);
        }
        let len = std::cmp::min(buf.len() as u64, capacity - offset) as usize;
        let grain_bytes = self.grain_size_bytes();

        let mut done = 0usize;
        while done < len {
            let pos = offset + done as u64;
            let grain_index = pos / grain_bytes;
            let within = (pos % grain_bytes) as usize;
            let n = std::cmp::min(len - done, grain_bytes as usize - within);

            match self.grain_location(grain_index)? {
                None => buf[done..done + n].fill(0),
                Some(sector) if !self.header.is_compressed() => {
                    read_exact_at(
                        self.source.as_ref(),
                        sector * SECTOR_SIZE + within as u64,
                        &mut buf[done..done + n],
                        "grain",
                    )?;
                }
                Some(_) => {
                    let grain = self.read_grain(grain_index)?;
                    buf[done..done + n].copy_from_slice(&grain[within..within + n]);
                }
            }
            done += n;
        }
        Ok(len)
    }
}

impl ReadAt for SparseVmdkReader {
    fn size(&self) -> u64 {
        self.capacity()
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        self.read_virtual(offset, buf).map_err(io::Error::from)
    }
}
