//! Random-access byte sources backing pass-through extents.
//!
//! A source answers positioned reads. A read returns at most the requested
//! number of bytes, and returning 0 means there is no more data at that
//! position. Errors are only ever reported through `Err`.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use memmap2::Mmap;

use crate::error::{Error, Result};

/// A positioned-read byte source.
///
/// `read_at_async` defaults to the blocking path, which is correct for
/// sources that never suspend (memory, mappings). Sources backed by
/// non-blocking I/O override it.
#[async_trait]
pub trait ReadAt: Send + Sync {
    /// Total size of the source in bytes.
    fn size(&self) -> u64;

    /// Reads up to `buf.len()` bytes starting at `offset`.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> std::io::Result<usize>;

    /// Non-blocking form of [`ReadAt::read_at`] with identical results.
    async fn read_at_async(&self, offset: u64, buf: &mut [u8]) -> std::io::Result<usize> {
        self.read_at(offset, buf)
    }
}

/// Copies from `data` at `offset` into `buf`, returning 0 past the end.
fn copy_from_slice_at(data: &[u8], offset: u64, buf: &mut [u8]) -> usize {
    let len = data.len() as u64;
    if offset >= len {
        return 0;
    }
    let start = offset as usize;
    let n = std::cmp::min(buf.len(), data.len() - start);
    buf[..n].copy_from_slice(&data[start..start + n]);
    n
}

/// Shared in-memory bytes.
#[derive(Debug, Clone)]
pub struct MemorySource {
    data: Arc<[u8]>,
}

impl MemorySource {
    pub fn new(data: impl Into<Arc<[u8]>>) -> Self {
        Self { data: data.into() }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

impl ReadAt for MemorySource {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> std::io::Result<usize> {
        Ok(copy_from_slice_at(&self.data, offset, buf))
    }
}

/// A read-only memory-mapped file.
///
/// The operating system manages caching and paging, so a multi-gigabyte raw
/// disk can back pass-through extents without being loaded.
pub struct MmapSource {
    /// `None` for empty files, which cannot be mapped on every platform.
    mmap: Option<Mmap>,
    path: PathBuf,
}

impl MmapSource {
    /// Opens and maps `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened, stat'ed or mapped.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| Error::io(e, path))?;
        let size = file.metadata().map_err(|e| Error::io(e, path))?.len();

        if size == 0 {
            return Ok(Self {
                mmap: None,
                path: path.to_path_buf(),
            });
        }

        // Safety: the mapping is read-only and the file handle stays valid for
        // the lifetime of the Mmap. Concurrent truncation by another process is
        // outside what this tool supports.
        let mmap = unsafe { Mmap::map(&file).map_err(|e| Error::io(e, path))? };

        Ok(Self {
            mmap: Some(mmap),
            path: path.to_path_buf(),
        })
    }

    /// Returns the mapped bytes.
    #[inline]
    pub fn data(&self) -> &[u8] {
        self.mmap.as_deref().unwrap_or(&[])
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ReadAt for MmapSource {
    fn size(&self) -> u64 {
        self.data().len() as u64
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> std::io::Result<usize> {
        Ok(copy_from_slice_at(self.data(), offset, buf))
    }
}

/// A plain file read with positioned reads.
///
/// Both paths issue `pread`-style reads on one shared handle, so no file
/// cursor is involved and concurrent readers never observe each other's
/// position. The non-blocking path runs the read on tokio's blocking pool and
/// must be called inside a tokio runtime.
pub struct FileSource {
    file: Arc<File>,
    size: u64,
    path: PathBuf,
}

impl FileSource {
    /// Opens `path` for positioned reads.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| Error::io(e, path))?;
        let size = file.metadata().map_err(|e| Error::io(e, path))?.len();

        Ok(Self {
            file: Arc::new(file),
            size,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(unix)]
fn read_file_at(file: &File, offset: u64, buf: &mut [u8]) -> std::io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.read_at(buf, offset)
}

#[cfg(windows)]
fn read_file_at(file: &File, offset: u64, buf: &mut [u8]) -> std::io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_read(buf, offset)
}

#[async_trait]
impl ReadAt for FileSource {
    fn size(&self) -> u64 {
        self.size
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> std::io::Result<usize> {
        read_file_at(&self.file, offset, buf)
    }

    async fn read_at_async(&self, offset: u64, buf: &mut [u8]) -> std::io::Result<usize> {
        let file = Arc::clone(&self.file);
        let len = buf.len();
        let (n, data) = tokio::task::spawn_blocking(move || {
            let mut data = vec![0u8; len];
            read_file_at(&file, offset, &mut data).map(|n| (n, data))
        })
        .await
        .map_err(std::io::Error::other)??;
        buf[..n].copy_from_slice(&data[..n]);
        Ok(n)
    }
}
