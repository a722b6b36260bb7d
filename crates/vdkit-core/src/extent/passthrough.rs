//! Extents that forward reads to an existing byte source.

use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::extent::{Extent, ExtentRange};
use crate::source::{MmapSource, ReadAt};

/// Forwards reads to a shared source at a fixed offset mapping.
///
/// Disk offset `start + n` maps to source offset `source_offset + n`. When the
/// source runs out before the extent does, the rest of the extent reads as
/// zero.
pub struct PassThroughExtent {
    range: ExtentRange,
    source: Arc<dyn ReadAt>,
    source_offset: u64,
}

impl PassThroughExtent {
    pub fn new(start: u64, length: u64, source: Arc<dyn ReadAt>, source_offset: u64) -> Self {
        Self {
            range: ExtentRange::new(start, length),
            source,
            source_offset,
        }
    }

    /// Covers the whole of `source`, starting at disk offset `start`.
    pub fn whole(start: u64, source: Arc<dyn ReadAt>) -> Self {
        let length = source.size();
        Self::new(start, length, source, 0)
    }

    pub fn source_offset(&self) -> u64 {
        self.source_offset
    }
}

/// Fills `buf[..n]` from `source`, zero-filling past the end of the source.
fn fill_from(source: &dyn ReadAt, source_pos: u64, disk_offset: u64, buf: &mut [u8]) -> Result<()> {
    let mut done = 0;
    while done < buf.len() {
        let read = source
            .read_at(source_pos + done as u64, &mut buf[done..])
            .map_err(|e| Error::source_read(disk_offset + done as u64, e))?;
        if read == 0 {
            buf[done..].fill(0);
            break;
        }
        done += read;
    }
    Ok(())
}

async fn fill_from_async(
    source: &dyn ReadAt,
    source_pos: u64,
    disk_offset: u64,
    buf: &mut [u8],
) -> Result<()> {
    let mut done = 0;
    while done < buf.len() {
        let read = source
            .read_at_async(source_pos + done as u64, &mut buf[done..])
            .await
            .map_err(|e| Error::source_read(disk_offset + done as u64, e))?;
        if read == 0 {
            buf[done..].fill(0);
            break;
        }
        done += read;
    }
    Ok(())
}

#[async_trait]
impl Extent for PassThroughExtent {
    fn start(&self) -> u64 {
        self.range.start
    }

    fn length(&self) -> u64 {
        self.range.length
    }

    fn kind(&self) -> &'static str {
        "pass-through"
    }

    fn prepare_for_read(&self) -> Result<()> {
        Ok(())
    }

    fn read(&self, disk_offset: u64, buf: &mut [u8]) -> Result<usize> {
        let (local, n) = self.range.local_span(disk_offset, buf.len())?;
        fill_from(
            self.source.as_ref(),
            self.source_offset + local,
            disk_offset,
            &mut buf[..n],
        )?;
        Ok(n)
    }

    async fn read_async(&self, disk_offset: u64, buf: &mut [u8]) -> Result<usize> {
        let (local, n) = self.range.local_span(disk_offset, buf.len())?;
        fill_from_async(
            self.source.as_ref(),
            self.source_offset + local,
            disk_offset,
            &mut buf[..n],
        )
        .await?;
        Ok(n)
    }

    fn dispose_read_state(&self) {}
}

/// A pass-through extent that exclusively owns its file.
///
/// The file is mapped when the extent is prepared and unmapped when it is
/// disposed, so an image assembled from many files only holds mappings for
/// the extents currently being read.
pub struct MappedFileExtent {
    range: ExtentRange,
    path: PathBuf,
    file_offset: u64,
    mapping: RwLock<Option<MmapSource>>,
}

impl MappedFileExtent {
    pub fn new(start: u64, length: u64, path: impl Into<PathBuf>, file_offset: u64) -> Self {
        Self {
            range: ExtentRange::new(start, length),
            path: path.into(),
            file_offset,
            mapping: RwLock::new(None),
        }
    }

    /// Covers the whole file at `path`, starting at disk offset `start`.
    pub fn whole(start: u64, path: &Path) -> Result<Self> {
        let length = std::fs::metadata(path)
            .map_err(|e| Error::io(e, path))?
            .len();
        Ok(Self::new(start, length, path, 0))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True while the file is mapped.
    pub fn is_mapped(&self) -> bool {
        self.mapping
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

impl Extent for MappedFileExtent {
    fn start(&self) -> u64 {
        self.range.start
    }

    fn length(&self) -> u64 {
        self.range.length
    }

    fn kind(&self) -> &'static str {
        "mapped-file"
    }

    fn prepare_for_read(&self) -> Result<()> {
        let mut slot = self.mapping.write().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(MmapSource::open(&self.path)?);
        }
        Ok(())
    }

    fn read(&self, disk_offset: u64, buf: &mut [u8]) -> Result<usize> {
        let (local, n) = self.range.local_span(disk_offset, buf.len())?;
        let slot = self.mapping.read().unwrap_or_else(PoisonError::into_inner);
        let source = slot.as_ref().ok_or(Error::NotPrepared {
            start: self.range.start,
        })?;
        fill_from(source, self.file_offset + local, disk_offset, &mut buf[..n])?;
        Ok(n)
    }

    fn dispose_read_state(&self) {
        *self.mapping.write().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemorySource;
    use std::io::Write;
    use tempfile::NamedTempFile;

    struct FailingSource;

    impl ReadAt for FailingSource {
        fn size(&self) -> u64 {
            1024
        }

        fn read_at(&self, _offset: u64, _buf: &mut [u8]) -> std::io::Result<usize> {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "device gone"))
        }
    }

    #[test]
    fn test_pass_through_maps_offsets() {
        let source: Arc<dyn ReadAt> = Arc::new(MemorySource::new((0u8..100).collect::<Vec<_>>()));
        let extent = PassThroughExtent::new(1000, 10, source, 50);

        let mut buf = [0u8; 4];
        assert_eq!(extent.read(1002, &mut buf).unwrap(), 4);
        assert_eq!(buf, [52, 53, 54, 55]);

        let mut buf = [0u8; 32];
        assert_eq!(extent.read(1008, &mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], &[58, 59]);
    }

    #[test]
    fn test_pass_through_zero_fills_past_source_end() {
        let source: Arc<dyn ReadAt> = Arc::new(MemorySource::new(vec![7u8; 4]));
        let extent = PassThroughExtent::new(0, 8, source, 2);

        let mut buf = [0xFFu8; 8];
        assert_eq!(extent.read(0, &mut buf).unwrap(), 8);
        assert_eq!(buf, [7, 7, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_pass_through_propagates_source_errors() {
        let extent = PassThroughExtent::new(512, 512, Arc::new(FailingSource), 0);
        let mut buf = [0u8; 16];
        let err = extent.read(600, &mut buf).unwrap_err();
        assert!(matches!(err, Error::SourceRead { offset: 600, .. }));
    }

    #[tokio::test]
    async fn test_pass_through_async_matches_sync() {
        let source: Arc<dyn ReadAt> = Arc::new(MemorySource::new((0u8..=255).collect::<Vec<_>>()));
        let extent = PassThroughExtent::whole(4096, source);
        assert_eq!(extent.length(), 256);

        let mut sync_buf = [0u8; 64];
        let mut async_buf = [0u8; 64];
        let n_sync = extent.read(4096 + 200, &mut sync_buf).unwrap();
        let n_async = extent.read_async(4096 + 200, &mut async_buf).await.unwrap();
        assert_eq!(n_sync, 56);
        assert_eq!(n_sync, n_async);
        assert_eq!(sync_buf, async_buf);
    }

    #[test]
    fn test_mapped_file_extent_lifecycle() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"hello, extent").unwrap();
        file.flush().unwrap();

        let extent = MappedFileExtent::whole(100, file.path()).unwrap();
        assert_eq!(extent.length(), 13);
        assert!(!extent.is_mapped());

        let mut buf = [0u8; 6];
        assert!(matches!(
            extent.read(100, &mut buf),
            Err(Error::NotPrepared { start: 100 })
        ));

        extent.prepare_for_read().unwrap();
        assert!(extent.is_mapped());
        assert_eq!(extent.read(107, &mut buf).unwrap(), 6);
        assert_eq!(&buf, b"extent");

        extent.dispose_read_state();
        extent.dispose_read_state();
        assert!(!extent.is_mapped());
    }
}
