//! monolithicSparse VMDK composition.
//!
//! A raw disk image is never copied into a new file. Instead the sparse VMDK
//! is described as a [`BuiltStream`] of extents:
//!
//! ```text
//! sector 0            header                 fixed buffer
//! sector 1..21        embedded descriptor    fixed buffer
//! gd_offset           grain directory        computed buffer
//! gt_offset + 4*i     grain table i          computed buffer, one per table
//! ..overhead          padding                zero extent
//! overhead..          allocated grains       pass-through runs over the source
//! ```
//!
//! Grains that are entirely zero in the source are left unallocated, so the
//! image only carries data that is actually present.

use std::sync::Arc;

use rayon::prelude::*;
use sha2::{Digest, Sha256};

use crate::builder::{BuilderOptions, BuiltStream, StreamBuilder};
use crate::error::{Error, Result};
use crate::extent::{BufferExtent, BufferSource, PassThroughExtent, ZeroExtent};
use crate::source::ReadAt;

use super::descriptor::VmdkDescriptor;
use super::header::{
    SparseExtentHeader, DEFAULT_GRAIN_SIZE, GT_ENTRIES_PER_GT, MAX_GRAIN_BYTES, SECTOR_SIZE,
};

/// Sectors reserved for the embedded descriptor.
pub const DEFAULT_DESCRIPTOR_SECTORS: u64 = 20;

/// Bytes in one grain table (512 entries of 4 bytes).
const GRAIN_TABLE_BYTES: u64 = GT_ENTRIES_PER_GT as u64 * 4;

/// Options for composing a sparse image.
#[derive(Debug, Clone)]
pub struct SparseOptions {
    /// Grain size in sectors. Must be a power of two of at least 8.
    pub grain_size: u64,
    /// Value of `ddb.adapterType`.
    pub adapter_type: String,
    /// Value of `ddb.virtualHWVersion`.
    pub hw_version: u32,
    /// Filename written into the descriptor's extent line.
    pub filename: String,
}

impl Default for SparseOptions {
    fn default() -> Self {
        Self {
            grain_size: DEFAULT_GRAIN_SIZE,
            adapter_type: "ide".to_string(),
            hw_version: 4,
            filename: "disk.vmdk".to_string(),
        }
    }
}

impl SparseOptions {
    pub fn with_grain_size(mut self, grain_size: u64) -> Self {
        self.grain_size = grain_size;
        self
    }

    pub fn with_adapter_type(mut self, adapter_type: impl Into<String>) -> Self {
        self.adapter_type = adapter_type.into();
        self
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = filename.into();
        self
    }

    fn validate(&self) -> Result<()> {
        if self.grain_size < 8 || !self.grain_size.is_power_of_two() {
            return Err(Error::config(format!(
                "grain size must be a power of two of at least 8 sectors, got {}",
                self.grain_size
            )));
        }
        if self.grain_size > MAX_GRAIN_BYTES / SECTOR_SIZE {
            return Err(Error::config(format!(
                "grain size of {} sectors exceeds the {} byte limit",
                self.grain_size, MAX_GRAIN_BYTES
            )));
        }
        Ok(())
    }
}

/// Placement of the metadata and grains. Offsets and sizes are in sectors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SparseLayout {
    pub capacity: u64,
    pub grain_size: u64,
    pub total_grains: u64,
    pub allocated_grains: u64,
    pub num_grain_tables: u64,
    pub descriptor_offset: u64,
    pub descriptor_size: u64,
    pub gd_offset: u64,
    pub gd_sectors: u64,
    pub gt_offset: u64,
    /// First sector after all metadata, before padding.
    pub metadata_end: u64,
    /// First grain sector; `metadata_end` rounded up to a grain boundary.
    pub overhead: u64,
}

impl SparseLayout {
    fn new(capacity: u64, grain_size: u64, allocated_grains: u64) -> Self {
        let total_grains = capacity.div_ceil(grain_size);
        let num_grain_tables = total_grains.div_ceil(GT_ENTRIES_PER_GT as u64);
        let descriptor_offset = 1;
        let descriptor_size = DEFAULT_DESCRIPTOR_SECTORS;
        let gd_offset = descriptor_offset + descriptor_size;
        let gd_sectors = (num_grain_tables * 4).div_ceil(SECTOR_SIZE);
        let gt_offset = gd_offset + gd_sectors;
        let metadata_end = gt_offset + num_grain_tables * (GRAIN_TABLE_BYTES / SECTOR_SIZE);
        let overhead = metadata_end.div_ceil(grain_size) * grain_size;

        Self {
            capacity,
            grain_size,
            total_grains,
            allocated_grains,
            num_grain_tables,
            descriptor_offset,
            descriptor_size,
            gd_offset,
            gd_sectors,
            gt_offset,
            metadata_end,
            overhead,
        }
    }

    /// Sector at which the grain with allocation rank `rank` is stored.
    pub fn grain_sector(&self, rank: u64) -> u64 {
        self.overhead + rank * self.grain_size
    }

    /// Total size of the image in bytes.
    pub fn image_length(&self) -> u64 {
        self.grain_sector(self.allocated_grains) * SECTOR_SIZE
    }
}

/// Which grains of the source carry data, plus the allocation rank of the
/// first grain of each table.
struct GrainAllocation {
    allocated: Vec<bool>,
    table_ranks: Vec<u64>,
}

impl GrainAllocation {
    fn new(allocated: Vec<bool>) -> Self {
        let mut table_ranks = Vec::with_capacity(allocated.len().div_ceil(GT_ENTRIES_PER_GT as usize));
        let mut rank = 0u64;
        for table in allocated.chunks(GT_ENTRIES_PER_GT as usize) {
            table_ranks.push(rank);
            rank += table.iter().filter(|&&a| a).count() as u64;
        }
        Self {
            allocated,
            table_ranks,
        }
    }

    fn allocated_count(&self) -> u64 {
        self.allocated.iter().filter(|&&a| a).count() as u64
    }

    /// Content ID derived from the allocation pattern.
    fn content_id(&self, capacity: u64) -> u32 {
        let mut hasher = Sha256::new();
        hasher.update(capacity.to_le_bytes());
        for table in self.allocated.chunks(8) {
            let byte = table
                .iter()
                .enumerate()
                .fold(0u8, |acc, (bit, &a)| acc | ((a as u8) << bit));
            hasher.update([byte]);
        }
        let digest = hasher.finalize();
        u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]])
    }
}

/// Grain directory contents, built on first read.
struct GrainDirectorySource {
    gt_offset: u64,
    num_grain_tables: u64,
    length: usize,
}

impl BufferSource for GrainDirectorySource {
    fn get_buffer(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.length);
        for table in 0..self.num_grain_tables {
            let sector = self.gt_offset + table * (GRAIN_TABLE_BYTES / SECTOR_SIZE);
            buf.extend_from_slice(&sector_entry(sector)?.to_le_bytes());
        }
        buf.resize(self.length, 0);
        Ok(buf)
    }
}

/// One grain table, built on first read from the shared allocation map.
struct GrainTableSource {
    allocation: Arc<GrainAllocation>,
    layout: Arc<SparseLayout>,
    table: usize,
}

impl BufferSource for GrainTableSource {
    fn get_buffer(&self) -> Result<Vec<u8>> {
        let per_table = GT_ENTRIES_PER_GT as usize;
        let first = self.table * per_table;
        let last = (first + per_table).min(self.allocation.allocated.len());

        let mut buf = Vec::with_capacity(GRAIN_TABLE_BYTES as usize);
        let mut rank = self.allocation.table_ranks[self.table];
        for &allocated in &self.allocation.allocated[first..last] {
            let entry = if allocated {
                let sector = sector_entry(self.layout.grain_sector(rank))?;
                rank += 1;
                sector
            } else {
                0
            };
            buf.extend_from_slice(&entry.to_le_bytes());
        }
        buf.resize(GRAIN_TABLE_BYTES as usize, 0);
        Ok(buf)
    }
}

/// Grain directory and table entries are 32-bit sector numbers.
fn sector_entry(sector: u64) -> Result<u32> {
    u32::try_from(sector)
        .map_err(|_| Error::vmdk(format!("sector {} does not fit a 32-bit table entry", sector)))
}

/// Fills `buf` from `source` at `offset`, stopping early at end of source.
fn read_span(source: &dyn ReadAt, offset: u64, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let at = offset + filled as u64;
        let n = source
            .read_at(at, &mut buf[filled..])
            .map_err(|e| Error::source_read(at, e))?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Scans the source for grains containing any non-zero byte.
fn scan_allocation(source: &dyn ReadAt, grain_bytes: u64, total_grains: u64) -> Result<Vec<bool>> {
    (0..total_grains)
        .into_par_iter()
        .map_init(
            || vec![0u8; grain_bytes as usize],
            |buf, grain| -> Result<bool> {
                let n = read_span(source, grain * grain_bytes, buf)?;
                Ok(buf[..n].iter().any(|&b| b != 0))
            },
        )
        .collect()
}

/// A composed sparse image: the readable stream and where everything is.
pub struct SparseVmdkImage {
    pub stream: BuiltStream,
    pub layout: SparseLayout,
    pub header: SparseExtentHeader,
    pub descriptor: VmdkDescriptor,
}

/// Composes a monolithicSparse VMDK over a raw disk source.
pub struct SparseVmdkBuilder {
    source: Arc<dyn ReadAt>,
    options: SparseOptions,
}

impl SparseVmdkBuilder {
    pub fn new(source: Arc<dyn ReadAt>, options: SparseOptions) -> Self {
        Self { source, options }
    }

    /// Scans the source and lays out the image.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] for an empty source or an invalid grain size.
    /// - [`Error::SourceRead`] if the scan cannot read the source.
    /// - [`Error::Vmdk`] if the image would exceed 32-bit sector addressing.
    pub fn build(self) -> Result<SparseVmdkImage> {
        self.options.validate()?;

        let source_size = self.source.size();
        if source_size == 0 {
            return Err(Error::config("cannot build a sparse image from an empty source"));
        }

        let grain_size = self.options.grain_size;
        let grain_bytes = grain_size * SECTOR_SIZE;
        let capacity = source_size.div_ceil(SECTOR_SIZE);
        let total_grains = capacity.div_ceil(grain_size);

        let allocation = Arc::new(GrainAllocation::new(scan_allocation(
            self.source.as_ref(),
            grain_bytes,
            total_grains,
        )?));
        let layout = Arc::new(SparseLayout::new(
            capacity,
            grain_size,
            allocation.allocated_count(),
        ));
        sector_entry(layout.grain_sector(layout.allocated_grains))?;

        let mut header = SparseExtentHeader::monolithic_sparse(capacity, grain_size);
        header.descriptor_offset = layout.descriptor_offset;
        header.descriptor_size = layout.descriptor_size;
        header.gd_offset = layout.gd_offset;
        header.overhead = layout.overhead;

        let descriptor = VmdkDescriptor::monolithic_sparse(
            capacity,
            &self.options.filename,
            allocation.content_id(capacity),
            &self.options.adapter_type,
            self.options.hw_version,
        );
        let mut descriptor_bytes = descriptor.to_string().into_bytes();
        let descriptor_len = (layout.descriptor_size * SECTOR_SIZE) as usize;
        if descriptor_bytes.len() > descriptor_len {
            return Err(Error::config(format!(
                "descriptor is {} bytes, only {} reserved",
                descriptor_bytes.len(),
                descriptor_len
            )));
        }
        descriptor_bytes.resize(descriptor_len, 0);

        let mut builder = StreamBuilder::with_options(
            BuilderOptions::strict().with_total_length(layout.image_length()),
        );
        builder
            .add(BufferExtent::fixed(0, header.to_bytes()))
            .add(BufferExtent::fixed(
                layout.descriptor_offset * SECTOR_SIZE,
                descriptor_bytes,
            ))
            .add(BufferExtent::computed(
                layout.gd_offset * SECTOR_SIZE,
                layout.gd_sectors * SECTOR_SIZE,
                GrainDirectorySource {
                    gt_offset: layout.gt_offset,
                    num_grain_tables: layout.num_grain_tables,
                    length: (layout.gd_sectors * SECTOR_SIZE) as usize,
                },
            ));

        for table in 0..layout.num_grain_tables {
            builder.add(BufferExtent::computed(
                layout.gt_offset * SECTOR_SIZE + table * GRAIN_TABLE_BYTES,
                GRAIN_TABLE_BYTES,
                GrainTableSource {
                    allocation: Arc::clone(&allocation),
                    layout: Arc::clone(&layout),
                    table: table as usize,
                },
            ));
        }

        if layout.overhead > layout.metadata_end {
            builder.add(ZeroExtent::new(
                layout.metadata_end * SECTOR_SIZE,
                (layout.overhead - layout.metadata_end) * SECTOR_SIZE,
            ));
        }

        let mut rank = 0u64;
        let mut grain = 0usize;
        while grain < allocation.allocated.len() {
            if !allocation.allocated[grain] {
                grain += 1;
                continue;
            }
            let run_start = grain;
            while grain < allocation.allocated.len() && allocation.allocated[grain] {
                grain += 1;
            }
            let run_len = (grain - run_start) as u64;
            builder.add(PassThroughExtent::new(
                layout.grain_sector(rank) * SECTOR_SIZE,
                run_len * grain_bytes,
                Arc::clone(&self.source),
                run_start as u64 * grain_bytes,
            ));
            rank += run_len;
        }

        let stream = builder.seal()?;

        tracing::debug!(
            capacity_sectors = layout.capacity,
            grains = layout.total_grains,
            allocated = layout.allocated_grains,
            tables = layout.num_grain_tables,
            extents = stream.extent_count(),
            image_length = layout.image_length(),
            "composed sparse image"
        );

        Ok(SparseVmdkImage {
            stream,
            layout: SparseLayout::clone(&layout),
            header,
            descriptor,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemorySource;

    const GRAIN: u64 = 8;
    const GRAIN_BYTES: usize = (GRAIN * SECTOR_SIZE) as usize;

    /// Disk of `grains` grains where the listed grains are filled with their
    /// index + 1.
    fn disk_with(grains: usize, filled: &[usize]) -> Arc<dyn ReadAt> {
        let mut data = vec![0u8; grains * GRAIN_BYTES];
        for &g in filled {
            data[g * GRAIN_BYTES..(g + 1) * GRAIN_BYTES].fill(g as u8 + 1);
        }
        Arc::new(MemorySource::new(data))
    }

    fn options() -> SparseOptions {
        SparseOptions::default().with_grain_size(GRAIN)
    }

    #[test]
    fn test_layout_offsets() {
        let layout = SparseLayout::new(2048, 128, 3);
        assert_eq!(layout.total_grains, 16);
        assert_eq!(layout.num_grain_tables, 1);
        assert_eq!(layout.gd_offset, 21);
        assert_eq!(layout.gd_sectors, 1);
        assert_eq!(layout.gt_offset, 22);
        assert_eq!(layout.metadata_end, 26);
        assert_eq!(layout.overhead, 128);
        assert_eq!(layout.image_length(), (128 + 3 * 128) * 512);
    }

    #[test]
    fn test_invalid_grain_size() {
        let result = SparseVmdkBuilder::new(disk_with(1, &[]), options().with_grain_size(12)).build();
        assert!(matches!(result, Err(Error::Config { .. })));

        let too_large = MAX_GRAIN_BYTES / SECTOR_SIZE * 2;
        let result =
            SparseVmdkBuilder::new(disk_with(1, &[]), options().with_grain_size(too_large)).build();
        assert!(matches!(result, Err(Error::Config { .. })));
    }

    #[test]
    fn test_empty_source_rejected() {
        let source: Arc<dyn ReadAt> = Arc::new(MemorySource::new(Vec::new()));
        let result = SparseVmdkBuilder::new(source, options()).build();
        assert!(matches!(result, Err(Error::Config { .. })));
    }

    #[test]
    fn test_zero_grains_left_unallocated() {
        let image = SparseVmdkBuilder::new(disk_with(6, &[1, 2, 4]), options())
            .build()
            .unwrap();
        assert_eq!(image.layout.total_grains, 6);
        assert_eq!(image.layout.allocated_grains, 3);
        assert_eq!(image.stream.total_length(), image.layout.image_length());

        // Grains 1 and 2 are one pass-through run, grain 4 another.
        let runs: Vec<_> = image
            .stream
            .extents()
            .filter(|e| e.kind() == "pass-through")
            .map(|e| (e.start(), e.length()))
            .collect();
        let first = image.layout.overhead * SECTOR_SIZE;
        assert_eq!(
            runs,
            vec![
                (first, 2 * GRAIN_BYTES as u64),
                (first + 2 * GRAIN_BYTES as u64, GRAIN_BYTES as u64)
            ]
        );
    }

    #[test]
    fn test_grain_table_entries() {
        let image = SparseVmdkBuilder::new(disk_with(4, &[0, 3]), options())
            .build()
            .unwrap();
        let layout = &image.layout;

        let gd = image
            .stream
            .read_vec(layout.gd_offset * SECTOR_SIZE, 4)
            .unwrap();
        assert_eq!(u32::from_le_bytes([gd[0], gd[1], gd[2], gd[3]]) as u64, layout.gt_offset);

        let gt = image
            .stream
            .read_vec(layout.gt_offset * SECTOR_SIZE, 16)
            .unwrap();
        let entries: Vec<u32> = gt
            .chunks(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        assert_eq!(
            entries,
            vec![
                layout.overhead as u32,
                0,
                0,
                (layout.overhead + GRAIN) as u32
            ]
        );
    }

    #[test]
    fn test_grain_data_passes_through() {
        let image = SparseVmdkBuilder::new(disk_with(3, &[2]), options())
            .build()
            .unwrap();
        let grain = image
            .stream
            .read_vec(image.layout.overhead * SECTOR_SIZE, GRAIN_BYTES)
            .unwrap();
        assert!(grain.iter().all(|&b| b == 3));
    }

    #[test]
    fn test_content_id_tracks_allocation() {
        let a = SparseVmdkBuilder::new(disk_with(4, &[0]), options()).build().unwrap();
        let b = SparseVmdkBuilder::new(disk_with(4, &[0]), options()).build().unwrap();
        let c = SparseVmdkBuilder::new(disk_with(4, &[1]), options()).build().unwrap();
        assert_eq!(a.descriptor.cid, b.descriptor.cid);
        assert_ne!(a.descriptor.cid, c.descriptor.cid);
    }

    #[test]
    fn test_partial_last_grain() {
        // 1.5 grains of non-zero data: the last grain is padded with zeros.
        let data = vec![0xAAu8; GRAIN_BYTES + GRAIN_BYTES / 2];
        let image = SparseVmdkBuilder::new(Arc::new(MemorySource::new(data)), options())
            .build()
            .unwrap();
        assert_eq!(image.layout.allocated_grains, 2);

        let start = image.layout.grain_sector(1) * SECTOR_SIZE;
        let tail = image.stream.read_vec(start, GRAIN_BYTES).unwrap();
        assert!(tail[..GRAIN_BYTES / 2].iter().all(|&b| b == 0xAA));
        assert!(tail[GRAIN_BYTES / 2..].iter().all(|&b| b == 0));
    }
}
