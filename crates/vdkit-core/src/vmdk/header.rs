//! Hosted sparse extent header.
//!
//! The header is a 512-byte little-endian structure at sector 0 of a hosted
//! sparse VMDK (monolithicSparse, twoGbMaxExtentSparse, streamOptimized).

use crate::error::{Error, Result};

/// VMDK magic number ("VMDK" as little-endian u32).
pub const VMDK_MAGIC: u32 = 0x564D444B;

/// Size of a sector in bytes.
pub const SECTOR_SIZE: u64 = 512;

/// Default grain size in sectors (128 sectors = 64KB).
pub const DEFAULT_GRAIN_SIZE: u64 = 128;

/// Number of grain table entries per grain table.
pub const GT_ENTRIES_PER_GT: u32 = 512;

/// Flag bit 0: newline detection characters are valid.
pub const FLAG_VALID_NEWLINE: u32 = 1 << 0;
/// Flag bit 1: a redundant grain directory is present.
pub const FLAG_REDUNDANT_GRAIN_TABLE: u32 = 1 << 1;
/// Flag bit 16: grains are compressed.
pub const FLAG_COMPRESSED: u32 = 1 << 16;
/// Flag bit 17: the image contains stream markers.
pub const FLAG_MARKERS: u32 = 1 << 17;

/// Highest header version this crate understands.
pub const MAX_SUPPORTED_VERSION: u32 = 3;

/// Largest grain accepted from an image header (16 MiB).
pub const MAX_GRAIN_BYTES: u64 = 16 * 1024 * 1024;

/// Largest grain table accepted from an image header.
pub const MAX_GTES_PER_GT: u32 = 64 * 1024;

/// Largest grain directory accepted from an image header (64 MiB of entries).
pub const MAX_GD_ENTRIES: u64 = 16 * 1024 * 1024;

fn le_u16(data: &[u8], at: usize) -> u16 {
    let mut bytes = [0u8; 2];
    bytes.copy_from_slice(&data[at..at + 2]);
    u16::from_le_bytes(bytes)
}

fn le_u32(data: &[u8], at: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&data[at..at + 4]);
    u32::from_le_bytes(bytes)
}

fn le_u64(data: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[at..at + 8]);
    u64::from_le_bytes(bytes)
}

/// Sparse extent header. Offsets and sizes are in sectors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SparseExtentHeader {
    pub version: u32,
    pub flags: u32,
    /// Capacity of the virtual disk.
    pub capacity: u64,
    pub grain_size: u64,
    /// Location of the embedded descriptor.
    pub descriptor_offset: u64,
    pub descriptor_size: u64,
    pub num_gtes_per_gt: u32,
    /// Redundant grain directory; 0 when absent.
    pub rgd_offset: u64,
    pub gd_offset: u64,
    /// Sectors occupied by metadata before the first grain.
    pub overhead: u64,
    pub unclean_shutdown: u8,
    pub compress_algorithm: u16,
}

impl SparseExtentHeader {
    /// A version 1 monolithicSparse header with no metadata placed yet.
    pub fn monolithic_sparse(capacity_sectors: u64, grain_size: u64) -> Self {
        Self {
            version: 1,
            flags: FLAG_VALID_NEWLINE,
            capacity: capacity_sectors,
            grain_size,
            descriptor_offset: 0,
            descriptor_size: 0,
            num_gtes_per_gt: GT_ENTRIES_PER_GT,
            rgd_offset: 0,
            gd_offset: 0,
            overhead: 0,
            unclean_shutdown: 0,
            compress_algorithm: 0,
        }
    }

    /// Serializes the header to exactly 512 bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; SECTOR_SIZE as usize];

        buf[0..4].copy_from_slice(&VMDK_MAGIC.to_le_bytes());
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..12].copy_from_slice(&self.flags.to_le_bytes());
        buf[12..20].copy_from_slice(&self.capacity.to_le_bytes());
        buf[20..28].copy_from_slice(&self.grain_size.to_le_bytes());
        buf[28..36].copy_from_slice(&self.descriptor_offset.to_le_bytes());
        buf[36..44].copy_from_slice(&self.descriptor_size.to_le_bytes());
        buf[44..48].copy_from_slice(&self.num_gtes_per_gt.to_le_bytes());
        buf[48..56].copy_from_slice(&self.rgd_offset.to_le_bytes());
        buf[56..64].copy_from_slice(&self.gd_offset.to_le_bytes());
        buf[64..72].copy_from_slice(&self.overhead.to_le_bytes());
        buf[72] = self.unclean_shutdown;

        // Newline detection: single end, non-end, double end pair.
        buf[73..77].copy_from_slice(b"\n \r\n");

        buf[77..79].copy_from_slice(&self.compress_algorithm.to_le_bytes());
        buf
    }

    /// Parses a header from at least 512 bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < SECTOR_SIZE as usize {
            return Err(Error::vmdk("sparse header too short"));
        }

        let magic = le_u32(data, 0);
        if magic != VMDK_MAGIC {
            return Err(Error::vmdk(format!(
                "invalid VMDK magic: expected 0x{:X}, got 0x{:X}",
                VMDK_MAGIC, magic
            )));
        }

        let header = Self {
            version: le_u32(data, 4),
            flags: le_u32(data, 8),
            capacity: le_u64(data, 12),
            grain_size: le_u64(data, 20),
            descriptor_offset: le_u64(data, 28),
            descriptor_size: le_u64(data, 36),
            num_gtes_per_gt: le_u32(data, 44),
            rgd_offset: le_u64(data, 48),
            gd_offset: le_u64(data, 56),
            overhead: le_u64(data, 64),
            unclean_shutdown: data[72],
            compress_algorithm: le_u16(data, 77),
        };

        header.validate()?;
        Ok(header)
    }

    /// Rejects sizes that would overflow byte arithmetic or force
    /// unbounded allocations when the image is read.
    fn validate(&self) -> Result<()> {
        if self.grain_size == 0 || self.num_gtes_per_gt == 0 {
            return Err(Error::vmdk("grain size and grain table size must be non-zero"));
        }
        if self.grain_size > MAX_GRAIN_BYTES / SECTOR_SIZE {
            return Err(Error::vmdk(format!(
                "grain size of {} sectors exceeds the {} byte limit",
                self.grain_size, MAX_GRAIN_BYTES
            )));
        }
        if self.num_gtes_per_gt > MAX_GTES_PER_GT {
            return Err(Error::vmdk(format!(
                "{} entries per grain table exceeds the limit of {}",
                self.num_gtes_per_gt, MAX_GTES_PER_GT
            )));
        }
        if self.capacity.checked_mul(SECTOR_SIZE).is_none() {
            return Err(Error::vmdk(format!(
                "capacity of {} sectors overflows a byte offset",
                self.capacity
            )));
        }
        if self.num_gd_entries() > MAX_GD_ENTRIES {
            return Err(Error::vmdk(format!(
                "grain directory of {} entries exceeds the limit of {}",
                self.num_gd_entries(),
                MAX_GD_ENTRIES
            )));
        }
        Ok(())
    }

    /// Check if grains are compressed.
    pub fn is_compressed(&self) -> bool {
        (self.flags & FLAG_COMPRESSED) != 0
    }

    /// Check if this is a streamOptimized image with markers.
    pub fn has_markers(&self) -> bool {
        (self.flags & FLAG_MARKERS) != 0
    }

    pub fn grain_size_bytes(&self) -> u64 {
        self.grain_size * SECTOR_SIZE
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.capacity * SECTOR_SIZE
    }

    /// Number of grains needed to cover the capacity.
    pub fn total_grains(&self) -> u64 {
        self.capacity.div_ceil(self.grain_size)
    }

    /// Number of grain directory entries (one per grain table).
    pub fn num_gd_entries(&self) -> u64 {
        self.total_grains().div_ceil(self.num_gtes_per_gt as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vmdk_magic_value() {
        assert_eq!(&VMDK_MAGIC.to_le_bytes(), b"KDMV");
    }

    #[test]
    fn test_header_serializes_to_one_sector() {
        let mut header = SparseExtentHeader::monolithic_sparse(2048, DEFAULT_GRAIN_SIZE);
        header.descriptor_offset = 1;
        header.descriptor_size = 20;
        header.gd_offset = 21;
        header.overhead = 128;

        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), SECTOR_SIZE as usize);
        assert_eq!(&bytes[0..4], b"KDMV");
        assert_eq!(&bytes[73..77], b"\n \r\n");

        let parsed = SparseExtentHeader::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn test_invalid_magic() {
        let bytes = vec![0u8; 512];
        assert!(SparseExtentHeader::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_short_header() {
        assert!(SparseExtentHeader::from_bytes(&[0u8; 100]).is_err());
    }

    #[test]
    fn test_grain_counts() {
        // 1000 sectors / 128 per grain -> 8 grains -> 1 grain table
        let header = SparseExtentHeader::monolithic_sparse(1000, 128);
        assert_eq!(header.total_grains(), 8);
        assert_eq!(header.num_gd_entries(), 1);
        assert_eq!(header.grain_size_bytes(), 65536);

        // 513 grains need 2 tables
        let header = SparseExtentHeader::monolithic_sparse(513 * 8, 8);
        assert_eq!(header.num_gd_entries(), 2);
    }

    fn encoded(header: &SparseExtentHeader) -> Vec<u8> {
        header.to_bytes()
    }

    #[test]
    fn test_rejects_capacity_overflowing_bytes() {
        let header = SparseExtentHeader::monolithic_sparse(1 << 60, 8);
        let err = SparseExtentHeader::from_bytes(&encoded(&header)).unwrap_err();
        assert!(err.to_string().contains("overflows"));
    }

    #[test]
    fn test_rejects_oversized_grain() {
        let header = SparseExtentHeader::monolithic_sparse(1 << 20, 1 << 40);
        assert!(matches!(
            SparseExtentHeader::from_bytes(&encoded(&header)),
            Err(Error::Vmdk { .. })
        ));

        let largest = MAX_GRAIN_BYTES / SECTOR_SIZE;
        let header = SparseExtentHeader::monolithic_sparse(largest * 4, largest);
        assert!(SparseExtentHeader::from_bytes(&encoded(&header)).is_ok());
    }

    #[test]
    fn test_rejects_oversized_grain_tables_and_directory() {
        let mut header = SparseExtentHeader::monolithic_sparse(2048, 8);
        header.num_gtes_per_gt = u32::MAX;
        assert!(matches!(
            SparseExtentHeader::from_bytes(&encoded(&header)),
            Err(Error::Vmdk { .. })
        ));

        // 2^52 sectors of 1-sector grains with 512 entries per table.
        let header = SparseExtentHeader::monolithic_sparse(1 << 52, 1);
        assert!(matches!(
            SparseExtentHeader::from_bytes(&encoded(&header)),
            Err(Error::Vmdk { .. })
        ));
    }

    #[test]
    fn test_flag_checks() {
        let mut header = SparseExtentHeader::monolithic_sparse(8, 8);
        assert!(!header.is_compressed());
        assert!(!header.has_markers());
        header.flags |= FLAG_COMPRESSED | FLAG_MARKERS;
        assert!(header.is_compressed());
        assert!(header.has_markers());
    }
}
