//! Sorted, non-overlapping extent index.
//!
//! Invariants once built:
//! - Extents are stored in ascending `start` order.
//! - `extents[i].end() <= extents[i + 1].start()` for every `i`.
//! - Every extent has a non-zero length and an end that fits in a `u64`.

use std::ops::Range;
use std::sync::{Mutex, PoisonError};

use crate::error::{Error, Result};
use crate::extent::Extent;

/// An extent plus the first-touch barrier that serializes its preparation.
pub(crate) struct ExtentSlot {
    extent: Box<dyn Extent>,
    prepared: Mutex<bool>,
}

impl ExtentSlot {
    fn new(extent: Box<dyn Extent>) -> Self {
        Self {
            extent,
            prepared: Mutex::new(false),
        }
    }

    pub(crate) fn extent(&self) -> &dyn Extent {
        self.extent.as_ref()
    }

    /// Prepares the extent unless already prepared. Concurrent callers block
    /// until the first one finishes.
    pub(crate) fn ensure_prepared(&self) -> Result<()> {
        let mut prepared = self.prepared.lock().unwrap_or_else(PoisonError::into_inner);
        if !*prepared {
            self.extent.prepare_for_read()?;
            *prepared = true;
            tracing::trace!(
                start = self.extent.start(),
                length = self.extent.length(),
                kind = self.extent.kind(),
                "prepared extent"
            );
        }
        Ok(())
    }

    /// Disposes the extent if it was prepared. Returns whether it was.
    pub(crate) fn dispose(&self) -> bool {
        let mut prepared = self.prepared.lock().unwrap_or_else(PoisonError::into_inner);
        if !*prepared {
            return false;
        }
        self.extent.dispose_read_state();
        *prepared = false;
        tracing::trace!(start = self.extent.start(), "disposed extent");
        true
    }

    pub(crate) fn is_prepared(&self) -> bool {
        *self.prepared.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// An immutable, ordered set of non-overlapping extents.
pub struct ExtentIndex {
    slots: Vec<ExtentSlot>,
    /// Cached `start` of each slot, for binary search.
    starts: Vec<u64>,
}

impl ExtentIndex {
    /// Sorts `extents` by start and validates them.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidExtent`] for an empty extent or one whose end overflows.
    /// - [`Error::Overlap`] for the first pair of intersecting extents.
    pub fn build(mut extents: Vec<Box<dyn Extent>>) -> Result<Self> {
        for extent in &extents {
            if extent.length() == 0 {
                return Err(Error::invalid_extent(extent.start(), 0, "extent is empty"));
            }
            if extent.start().checked_add(extent.length()).is_none() {
                return Err(Error::invalid_extent(
                    extent.start(),
                    extent.length(),
                    "extent end overflows a 64-bit offset",
                ));
            }
        }

        extents.sort_by_key(|e| e.start());

        for pair in extents.windows(2) {
            let (first, second) = (&pair[0], &pair[1]);
            if first.end() > second.start() {
                return Err(Error::Overlap {
                    first_start: first.start(),
                    first_end: first.end(),
                    second_start: second.start(),
                    second_end: second.end(),
                });
            }
        }

        let starts = extents.iter().map(|e| e.start()).collect();
        let slots = extents.into_iter().map(ExtentSlot::new).collect();

        Ok(Self { slots, starts })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// End of the last extent, or 0 when empty.
    pub fn end(&self) -> u64 {
        self.slots.last().map(|s| s.extent.end()).unwrap_or(0)
    }

    pub fn get(&self, index: usize) -> Option<&dyn Extent> {
        self.slots.get(index).map(ExtentSlot::extent)
    }

    /// Extents in ascending start order.
    pub fn iter(&self) -> impl Iterator<Item = &dyn Extent> + '_ {
        self.slots.iter().map(ExtentSlot::extent)
    }

    /// Position of the extent that owns `offset`, or `None` if it falls in a gap.
    pub fn find(&self, offset: u64) -> Option<usize> {
        let after = self.starts.partition_point(|&s| s <= offset);
        if after == 0 {
            return None;
        }
        let candidate = after - 1;
        (self.slots[candidate].extent.end() > offset).then_some(candidate)
    }

    /// Positions of the extents intersecting `[start, end)`, in order.
    pub fn range(&self, start: u64, end: u64) -> Range<usize> {
        if start >= end {
            return 0..0;
        }
        let mut first = self.starts.partition_point(|&s| s <= start);
        if first > 0 && self.slots[first - 1].extent.end() > start {
            first -= 1;
        }
        let last = self.starts.partition_point(|&s| s < end);
        first..last.max(first)
    }

    pub(crate) fn slot(&self, index: usize) -> &ExtentSlot {
        &self.slots[index]
    }

    pub(crate) fn slots(&self) -> &[ExtentSlot] {
        &self.slots
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extent::{BufferExtent, ZeroExtent};

    fn zero(start: u64, length: u64) -> Box<dyn Extent> {
        Box::new(ZeroExtent::new(start, length))
    }

    fn sample_index() -> ExtentIndex {
        // [0,4) [4,8) gap [8,10) gap [20,30)
        ExtentIndex::build(vec![zero(20, 10), zero(4, 4), zero(0, 4), zero(8, 2)]).unwrap()
    }

    #[test]
    fn test_build_sorts_by_start() {
        let index = sample_index();
        let starts: Vec<u64> = index.iter().map(|e| e.start()).collect();
        assert_eq!(starts, vec![0, 4, 8, 20]);
        assert_eq!(index.end(), 30);
    }

    #[test]
    fn test_overlap_rejected() {
        let err = ExtentIndex::build(vec![zero(2, 4), zero(0, 4)]).err().unwrap();
        assert!(matches!(
            err,
            Error::Overlap {
                first_start: 0,
                first_end: 4,
                second_start: 2,
                second_end: 6
            }
        ));
    }

    #[test]
    fn test_identical_starts_rejected() {
        let result = ExtentIndex::build(vec![zero(8, 1), zero(8, 1)]);
        assert!(matches!(result, Err(Error::Overlap { .. })));
    }

    #[test]
    fn test_empty_extent_rejected() {
        let result = ExtentIndex::build(vec![Box::new(BufferExtent::fixed(5, Vec::new()))]);
        assert!(matches!(result, Err(Error::InvalidExtent { start: 5, .. })));
    }

    #[test]
    fn test_overflowing_extent_rejected() {
        let result = ExtentIndex::build(vec![zero(u64::MAX - 1, 4)]);
        assert!(matches!(result, Err(Error::InvalidExtent { .. })));
    }

    #[test]
    fn test_find_point_lookup() {
        let index = sample_index();
        assert_eq!(index.find(0), Some(0));
        assert_eq!(index.find(3), Some(0));
        assert_eq!(index.find(4), Some(1));
        assert_eq!(index.find(9), Some(2));
        assert_eq!(index.find(10), None);
        assert_eq!(index.find(19), None);
        assert_eq!(index.find(29), Some(3));
        assert_eq!(index.find(30), None);
    }

    #[test]
    fn test_range_lookup() {
        let index = sample_index();
        assert_eq!(index.range(2, 6), 0..2);
        assert_eq!(index.range(4, 8), 1..2);
        assert_eq!(index.range(10, 20), 3..3);
        assert_eq!(index.range(9, 21), 2..4);
        assert_eq!(index.range(0, 100), 0..4);
        assert_eq!(index.range(30, 40), 4..4);
        assert_eq!(index.range(5, 5), 0..0);
    }

    #[test]
    fn test_empty_index() {
        let index = ExtentIndex::build(Vec::new()).unwrap();
        assert!(index.is_empty());
        assert_eq!(index.end(), 0);
        assert_eq!(index.find(0), None);
        assert!(index.range(0, 10).is_empty());
    }

    #[test]
    fn test_slot_prepare_and_dispose_pairing() {
        let index = ExtentIndex::build(vec![Box::new(BufferExtent::from_fn(0, 2, || {
            Ok(vec![1u8, 2])
        }))])
        .unwrap();

        let slot = index.slot(0);
        assert!(!slot.dispose());
        slot.ensure_prepared().unwrap();
        assert!(slot.is_prepared());
        assert!(slot.dispose());
        assert!(!slot.is_prepared());
    }
}
