//! Composition of extents into one addressable stream.
//!
//! A [`StreamBuilder`] collects extents in any order. Sealing it validates and
//! indexes them and yields a [`BuiltStream`], which serves offset-based reads
//! across extent boundaries:
//!
//! ```text
//! Assembling --seal--> Validated --read--> Reading --finalize--> Finalized
//!      ^                                                            |
//!      +------------------------- into_builder ----------------------+
//! ```
//!
//! Every read is resolved into a plan of segments (pieces of extents and
//! pieces of gaps) before any byte is copied. The blocking and non-blocking
//! read paths execute the same plan, so they agree byte for byte, and a read
//! that is rejected by the gap policy never touches the caller's buffer.
//!
//! # Example
//!
//! ```
//! use vdkit_core::builder::StreamBuilder;
//! use vdkit_core::extent::{BufferExtent, ZeroExtent};
//!
//! let mut builder = StreamBuilder::new();
//! builder
//!     .add(BufferExtent::fixed(0, vec![0x41; 4]))
//!     .add(ZeroExtent::new(4, 4))
//!     .add(BufferExtent::fixed(8, vec![0x42; 2]));
//!
//! let stream = builder.seal().unwrap();
//! assert_eq!(stream.total_length(), 10);
//! assert_eq!(
//!     stream.read_vec(2, 8).unwrap(),
//!     vec![0x41, 0x41, 0, 0, 0, 0, 0x42, 0x42]
//! );
//! ```

use std::fmt;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};

use rayon::prelude::*;
use tokio_util::sync::CancellationToken;

use crate::cursor::StreamCursor;
use crate::error::{Error, Result};
use crate::extent::Extent;
use crate::index::{ExtentIndex, ExtentSlot};

/// Default chunk size used when exporting a stream sequentially (1 MB).
pub const DEFAULT_COPY_CHUNK_SIZE: usize = 1024 * 1024;

/// How reads treat bytes that no extent covers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum GapPolicy {
    /// Gaps read as zero bytes.
    #[default]
    ZeroFill,
    /// Reading a gap fails with [`Error::OutOfRange`].
    Strict,
}

/// Options controlling how a stream is sealed and read.
#[derive(Debug, Clone, Default)]
pub struct BuilderOptions {
    /// Treatment of uncovered bytes.
    pub gap_policy: GapPolicy,
    /// Explicit stream length. `None` uses the end of the last extent.
    pub total_length: Option<u64>,
}

impl BuilderOptions {
    /// Create options with the given settings.
    pub fn new(gap_policy: GapPolicy, total_length: Option<u64>) -> Self {
        Self {
            gap_policy,
            total_length,
        }
    }

    /// Options for callers that expect the extents to cover the whole stream.
    pub fn strict() -> Self {
        Self {
            gap_policy: GapPolicy::Strict,
            total_length: None,
        }
    }

    /// Pads the stream to `length` bytes.
    pub fn with_total_length(mut self, length: u64) -> Self {
        self.total_length = Some(length);
        self
    }

    pub fn with_gap_policy(mut self, gap_policy: GapPolicy) -> Self {
        self.gap_policy = gap_policy;
        self
    }
}

/// Lifecycle state of a composed stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildState {
    /// Extents are being collected; no reads are possible.
    Assembling,
    /// The extent index is built and checked; nothing has been read yet.
    Validated,
    /// At least one read or preparation has happened.
    Reading,
    /// Transient state is released; the stream no longer serves reads.
    Finalized,
}

impl fmt::Display for BuildState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildState::Assembling => write!(f, "Assembling"),
            BuildState::Validated => write!(f, "Validated"),
            BuildState::Reading => write!(f, "Reading"),
            BuildState::Finalized => write!(f, "Finalized"),
        }
    }
}

/// Collects extents for one logical stream.
#[derive(Default)]
pub struct StreamBuilder {
    extents: Vec<Box<dyn Extent>>,
    options: BuilderOptions,
}

impl StreamBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: BuilderOptions) -> Self {
        Self {
            extents: Vec::new(),
            options,
        }
    }

    pub fn options(&self) -> &BuilderOptions {
        &self.options
    }

    pub fn state(&self) -> BuildState {
        BuildState::Assembling
    }

    /// Adds an extent. Order does not matter.
    pub fn add(&mut self, extent: impl Extent + 'static) -> &mut Self {
        self.extents.push(Box::new(extent));
        self
    }

    /// Adds an already boxed extent.
    pub fn add_boxed(&mut self, extent: Box<dyn Extent>) -> &mut Self {
        self.extents.push(extent);
        self
    }

    pub fn len(&self) -> usize {
        self.extents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.extents.is_empty()
    }

    /// Validates the extents and builds the stream.
    ///
    /// # Errors
    ///
    /// - [`Error::Overlap`] if two extents intersect.
    /// - [`Error::InvalidExtent`] for empty or overflowing extents.
    /// - [`Error::Config`] if an explicit length is shorter than the extents.
    pub fn seal(self) -> Result<BuiltStream> {
        let index = ExtentIndex::build(self.extents)?;
        let covered = index.end();

        let total_length = match self.options.total_length {
            Some(length) if length < covered => {
                return Err(Error::config(format!(
                    "stream length {} is shorter than the extents, which end at {}",
                    length, covered
                )));
            }
            Some(length) => length,
            None => covered,
        };

        tracing::debug!(
            extents = index.len(),
            total_length,
            gap_policy = ?self.options.gap_policy,
            "sealed stream"
        );

        Ok(BuiltStream {
            index,
            options: self.options,
            total_length,
            touched: AtomicBool::new(false),
            finalized: false,
        })
    }
}

impl Extend<Box<dyn Extent>> for StreamBuilder {
    fn extend<I: IntoIterator<Item = Box<dyn Extent>>>(&mut self, iter: I) {
        self.extents.extend(iter);
    }
}

/// One step of a read plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Segment {
    /// `len` bytes from the extent at `slot`, starting at `disk_offset`.
    Extent {
        slot: usize,
        disk_offset: u64,
        len: usize,
    },
    /// `len` uncovered bytes, zero-filled.
    Gap { len: usize },
}

impl Segment {
    fn len(&self) -> usize {
        match *self {
            Segment::Extent { len, .. } | Segment::Gap { len } => len,
        }
    }
}

/// Reads until `buf` is full; extents must not come up short inside their range.
fn read_fully(extent: &dyn Extent, disk_offset: u64, buf: &mut [u8]) -> Result<()> {
    let mut done = 0;
    while done < buf.len() {
        let n = extent.read(disk_offset + done as u64, &mut buf[done..])?;
        if n == 0 {
            return Err(short_extent(extent));
        }
        done += n;
    }
    Ok(())
}

async fn read_fully_async(extent: &dyn Extent, disk_offset: u64, buf: &mut [u8]) -> Result<()> {
    let mut done = 0;
    while done < buf.len() {
        let n = extent.read_async(disk_offset + done as u64, &mut buf[done..]).await?;
        if n == 0 {
            return Err(short_extent(extent));
        }
        done += n;
    }
    Ok(())
}

fn short_extent(extent: &dyn Extent) -> Error {
    Error::invalid_extent(
        extent.start(),
        extent.length(),
        "extent returned no data inside its own range",
    )
}

/// A sealed, readable composition of extents.
///
/// Reads take `&self` and may run concurrently. The first read touching an
/// extent prepares it; concurrent first touches of the same extent wait for
/// one preparation. Operations that dispose extents take `&mut self`.
pub struct BuiltStream {
    index: ExtentIndex,
    options: BuilderOptions,
    total_length: u64,
    touched: AtomicBool,
    finalized: bool,
}

impl BuiltStream {
    /// Length of the composed stream in bytes.
    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    pub fn options(&self) -> &BuilderOptions {
        &self.options
    }

    pub fn state(&self) -> BuildState {
        if self.finalized {
            BuildState::Finalized
        } else if self.touched.load(Ordering::Acquire) {
            BuildState::Reading
        } else {
            BuildState::Validated
        }
    }

    pub fn extent_count(&self) -> usize {
        self.index.len()
    }

    /// Extents in ascending start order.
    pub fn extents(&self) -> impl Iterator<Item = &dyn Extent> + '_ {
        self.index.iter()
    }

    pub fn index(&self) -> &ExtentIndex {
        &self.index
    }

    /// The extent owning `offset`, or `None` for a gap.
    pub fn find(&self, offset: u64) -> Option<&dyn Extent> {
        self.index.find(offset).and_then(|i| self.index.get(i))
    }

    /// Number of extents currently holding prepared state.
    pub fn prepared_count(&self) -> usize {
        self.index.slots().iter().filter(|s| s.is_prepared()).count()
    }

    fn check_readable(&self) -> Result<()> {
        if self.finalized {
            return Err(Error::invalid_state("stream has been finalized"));
        }
        Ok(())
    }

    /// Resolves a read of `count` bytes at `offset` into segments.
    fn plan(&self, offset: u64, count: usize) -> Result<Vec<Segment>> {
        self.check_readable()?;

        if offset > self.total_length {
            return Err(Error::OutOfRange {
                offset,
                count: count as u64,
                total_length: self.total_length,
            });
        }
        let end = offset + std::cmp::min(count as u64, self.total_length - offset);

        let mut segments = Vec::new();
        let mut pos = offset;
        for slot in self.index.range(offset, end) {
            let extent = self.index.slot(slot).extent();
            if extent.start() > pos {
                segments.push(self.gap(pos, extent.start() - pos)?);
                pos = extent.start();
            }
            let piece_end = std::cmp::min(extent.end(), end);
            segments.push(Segment::Extent {
                slot,
                disk_offset: pos,
                len: (piece_end - pos) as usize,
            });
            pos = piece_end;
        }
        if pos < end {
            segments.push(self.gap(pos, end - pos)?);
        }

        Ok(segments)
    }

    fn gap(&self, offset: u64, len: u64) -> Result<Segment> {
        match self.options.gap_policy {
            GapPolicy::ZeroFill => Ok(Segment::Gap { len: len as usize }),
            GapPolicy::Strict => Err(Error::OutOfRange {
                offset,
                count: len,
                total_length: self.total_length,
            }),
        }
    }

    /// Reads up to `buf.len()` bytes at `offset`.
    ///
    /// Returns `min(buf.len(), total_length - offset)`; reading at
    /// `total_length` returns 0.
    ///
    /// # Errors
    ///
    /// - [`Error::OutOfRange`] if `offset > total_length`, or the read touches
    ///   a gap under [`GapPolicy::Strict`]. Nothing is written to `buf`.
    /// - [`Error::Preparation`] if an extent cannot materialize its content.
    /// - [`Error::SourceRead`] if a pass-through source fails.
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let plan = self.plan(offset, buf.len())?;
        self.touched.store(true, Ordering::Release);

        let mut done = 0;
        for segment in plan {
            let len = segment.len();
            let dest = &mut buf[done..done + len];
            match segment {
                Segment::Gap { .. } => dest.fill(0),
                Segment::Extent {
                    slot, disk_offset, ..
                } => {
                    let slot = self.index.slot(slot);
                    slot.ensure_prepared()?;
                    read_fully(slot.extent(), disk_offset, dest)?;
                }
            }
            done += len;
        }
        Ok(done)
    }

    /// Reads up to `count` bytes at `offset` into a new vector.
    pub fn read_vec(&self, offset: u64, count: usize) -> Result<Vec<u8>> {
        let available = self.total_length.saturating_sub(offset);
        let mut buf = vec![0u8; std::cmp::min(count as u64, available) as usize];
        let n = self.read(offset, &mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }

    /// Non-blocking form of [`BuiltStream::read`]; same bytes, same count.
    ///
    /// Extent preparation runs inline on the calling task.
    pub async fn read_async(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let plan = self.plan(offset, buf.len())?;
        self.execute_async(plan, buf, None).await
    }

    /// Like [`BuiltStream::read_async`], aborting when `token` is cancelled.
    ///
    /// Extent data is staged and copied into `buf` only once each extent read
    /// completes, so on cancellation exactly the first `bytes_written` bytes
    /// reported by [`Error::Cancelled`] have been written.
    pub async fn read_async_cancellable(
        &self,
        offset: u64,
        buf: &mut [u8],
        token: &CancellationToken,
    ) -> Result<usize> {
        let plan = self.plan(offset, buf.len())?;
        self.execute_async(plan, buf, Some(token)).await
    }

    /// Non-blocking form of [`BuiltStream::read_vec`].
    pub async fn read_vec_async(&self, offset: u64, count: usize) -> Result<Vec<u8>> {
        let available = self.total_length.saturating_sub(offset);
        let mut buf = vec![0u8; std::cmp::min(count as u64, available) as usize];
        let n = self.read_async(offset, &mut buf).await?;
        buf.truncate(n);
        Ok(buf)
    }

    async fn execute_async(
        &self,
        plan: Vec<Segment>,
        buf: &mut [u8],
        cancel: Option<&CancellationToken>,
    ) -> Result<usize> {
        self.touched.store(true, Ordering::Release);

        // Extent reads race the token in one scratch buffer, reused per segment.
        let staging_len = match cancel {
            Some(_) => plan
                .iter()
                .filter(|segment| matches!(segment, Segment::Extent { .. }))
                .map(Segment::len)
                .max()
                .unwrap_or(0),
            None => 0,
        };
        let mut staging = vec![0u8; staging_len];

        let mut done = 0;
        for segment in plan {
            if cancel.is_some_and(CancellationToken::is_cancelled) {
                return Err(Error::Cancelled {
                    bytes_written: done,
                });
            }

            let len = segment.len();
            let dest = &mut buf[done..done + len];
            match segment {
                Segment::Gap { .. } => dest.fill(0),
                Segment::Extent {
                    slot, disk_offset, ..
                } => {
                    let slot = self.index.slot(slot);
                    slot.ensure_prepared()?;
                    match cancel {
                        None => read_fully_async(slot.extent(), disk_offset, dest).await?,
                        Some(token) => {
                            let staged = &mut staging[..len];
                            tokio::select! {
                                biased;
                                _ = token.cancelled() => {
                                    return Err(Error::Cancelled { bytes_written: done });
                                }
                                result = read_fully_async(slot.extent(), disk_offset, staged) => result?,
                            }
                            dest.copy_from_slice(&staging[..len]);
                        }
                    }
                }
            }
            done += len;
        }
        Ok(done)
    }

    /// Prepares every extent up front, in parallel.
    ///
    /// After this returns, concurrent reads never wait on a first-touch
    /// preparation.
    pub fn prepare_all(&self) -> Result<()> {
        self.check_readable()?;
        self.touched.store(true, Ordering::Release);
        self.index
            .slots()
            .par_iter()
            .try_for_each(ExtentSlot::ensure_prepared)
    }

    /// Writes the whole stream to `writer` in chunks of `chunk_size` bytes.
    ///
    /// Extents that lie entirely behind the write head are disposed as the
    /// export advances, so at most the extents overlapping one chunk hold
    /// prepared state at a time. `progress` receives the number of bytes
    /// written so far after each chunk.
    ///
    /// Returns the number of bytes written.
    pub fn write_to<W: Write>(
        &mut self,
        writer: &mut W,
        chunk_size: usize,
        progress: Option<&dyn Fn(u64)>,
    ) -> Result<u64> {
        if chunk_size == 0 {
            return Err(Error::config("chunk size must be non-zero"));
        }
        self.check_readable()?;

        let buf_len = std::cmp::min(chunk_size as u64, self.total_length.max(1)) as usize;
        let mut buf = vec![0u8; buf_len];
        let mut offset = 0u64;
        let mut released = 0usize;

        while offset < self.total_length {
            let want = std::cmp::min(buf.len() as u64, self.total_length - offset) as usize;
            let n = self.read(offset, &mut buf[..want])?;
            writer.write_all(&buf[..n])?;
            offset += n as u64;

            while released < self.index.len() && self.index.slot(released).extent().end() <= offset
            {
                self.index.slot(released).dispose();
                released += 1;
            }

            if let Some(callback) = progress {
                callback(offset);
            }
        }

        writer.flush()?;
        Ok(offset)
    }

    /// A `Read + Seek` view of the stream starting at offset 0.
    pub fn cursor(&self) -> StreamCursor<'_> {
        StreamCursor::new(self)
    }

    fn dispose_all(&self) -> usize {
        self.index
            .slots()
            .iter()
            .filter(|slot| slot.dispose())
            .count()
    }

    /// Releases the transient state of every prepared extent.
    ///
    /// The stream moves to [`BuildState::Finalized`] and rejects further
    /// reads. Returns the number of extents that were disposed.
    pub fn finalize(&mut self) -> usize {
        let disposed = self.dispose_all();
        self.finalized = true;
        tracing::debug!(disposed, "finalized stream");
        disposed
    }

    /// Finalizes the stream and returns an empty builder with the same options.
    pub fn into_builder(mut self) -> StreamBuilder {
        self.finalize();
        StreamBuilder::with_options(self.options.clone())
    }
}

impl Drop for BuiltStream {
    fn drop(&mut self) {
        self.dispose_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extent::{BufferExtent, ZeroExtent};

    fn scenario_stream(options: BuilderOptions) -> BuiltStream {
        let mut builder = StreamBuilder::with_options(options);
        builder
            .add(BufferExtent::fixed(8, vec![0x42; 2]))
            .add(ZeroExtent::new(4, 4))
            .add(BufferExtent::fixed(0, vec![0x41; 4]));
        builder.seal().unwrap()
    }

    #[test]
    fn test_builder_options_default() {
        let options = BuilderOptions::default();
        assert_eq!(options.gap_policy, GapPolicy::ZeroFill);
        assert_eq!(options.total_length, None);
    }

    #[test]
    fn test_builder_options_strict() {
        let options = BuilderOptions::strict().with_total_length(100);
        assert_eq!(options.gap_policy, GapPolicy::Strict);
        assert_eq!(options.total_length, Some(100));
    }

    #[test]
    fn test_build_state_display() {
        assert_eq!(format!("{}", BuildState::Assembling), "Assembling");
        assert_eq!(format!("{}", BuildState::Validated), "Validated");
        assert_eq!(format!("{}", BuildState::Reading), "Reading");
        assert_eq!(format!("{}", BuildState::Finalized), "Finalized");
    }

    #[test]
    fn test_plan_splits_at_extent_boundaries() {
        let stream = scenario_stream(BuilderOptions::default());
        let plan = stream.plan(2, 8).unwrap();
        assert_eq!(
            plan,
            vec![
                Segment::Extent {
                    slot: 0,
                    disk_offset: 2,
                    len: 2
                },
                Segment::Extent {
                    slot: 1,
                    disk_offset: 4,
                    len: 4
                },
                Segment::Extent {
                    slot: 2,
                    disk_offset: 8,
                    len: 2
                },
            ]
        );
    }

    #[test]
    fn test_plan_emits_gaps() {
        let mut builder = StreamBuilder::with_options(BuilderOptions::default().with_total_length(12));
        builder
            .add(BufferExtent::fixed(2, vec![1u8; 2]))
            .add(BufferExtent::fixed(6, vec![2u8; 2]));
        let stream = builder.seal().unwrap();

        let plan = stream.plan(0, 12).unwrap();
        let lens: Vec<usize> = plan.iter().map(Segment::len).collect();
        assert_eq!(lens, vec![2, 2, 2, 2, 4]);
        assert!(matches!(plan[0], Segment::Gap { len: 2 }));
        assert!(matches!(plan[4], Segment::Gap { len: 4 }));
    }

    #[test]
    fn test_state_transitions() {
        let builder = StreamBuilder::new();
        assert_eq!(builder.state(), BuildState::Assembling);

        let mut stream = scenario_stream(BuilderOptions::default());
        assert_eq!(stream.state(), BuildState::Validated);

        stream.read_vec(0, 1).unwrap();
        assert_eq!(stream.state(), BuildState::Reading);

        stream.finalize();
        assert_eq!(stream.state(), BuildState::Finalized);
        assert!(matches!(
            stream.read_vec(0, 1),
            Err(Error::InvalidState { .. })
        ));

        let builder = stream.into_builder();
        assert!(builder.is_empty());
        assert_eq!(builder.state(), BuildState::Assembling);
    }

    #[test]
    fn test_explicit_length_shorter_than_extents() {
        let mut builder = StreamBuilder::with_options(BuilderOptions::default().with_total_length(5));
        builder.add(ZeroExtent::new(0, 10));
        assert!(matches!(builder.seal(), Err(Error::Config { .. })));
    }

    #[test]
    fn test_empty_stream() {
        let stream = StreamBuilder::new().seal().unwrap();
        assert_eq!(stream.total_length(), 0);
        assert_eq!(stream.read_vec(0, 10).unwrap(), Vec::<u8>::new());
        assert!(matches!(
            stream.read_vec(1, 10),
            Err(Error::OutOfRange { offset: 1, .. })
        ));
    }
}
