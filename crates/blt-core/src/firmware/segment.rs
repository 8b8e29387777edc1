//! In-memory firmware image as a sorted set of non-overlapping segments.
//!
//! Every mutating call keeps two invariants:
//! - segments are sorted ascending by base address
//! - no two segments overlap or touch (touching ranges are merged on insert)
//!
//! Views handed out by [`SegmentStore::segment`] borrow the store, so any
//! mutation ends their lifetime.

use std::ops::Range;

use super::FirmwareError;

/// Exclusive end of the 32-bit target address space.
const ADDRESS_SPACE_END: u64 = 1 << 32;

/// A contiguous run of firmware bytes starting at `base`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    base: u32,
    data: Vec<u8>,
}

impl Segment {
    fn new(base: u32, data: Vec<u8>) -> Self {
        debug_assert!(!data.is_empty());
        Self { base, data }
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    /// Number of bytes in the segment, always > 0.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Exclusive end address. Widened so a segment ending at 4 GiB fits.
    pub fn end(&self) -> u64 {
        self.base as u64 + self.data.len() as u64
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn range(&self) -> Range<u64> {
        self.base as u64..self.end()
    }

    /// Bytes of `[start, end)` that lie inside this segment.
    fn slice(&self, start: u64, end: u64) -> &[u8] {
        let from = (start - self.base as u64) as usize;
        let to = (end - self.base as u64) as usize;
        &self.data[from..to]
    }
}

/// Firmware image content: sorted, non-overlapping segments.
#[derive(Debug, Default, Clone)]
pub struct SegmentStore {
    segments: Vec<Segment>,
}

impl SegmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Borrowed view of segment `idx`, ascending by address.
    pub fn segment(&self, idx: usize) -> Result<&Segment, FirmwareError> {
        self.segments.get(idx).ok_or(FirmwareError::InvalidIndex {
            index: idx,
            count: self.segments.len(),
        })
    }

    pub fn segments(&self) -> impl Iterator<Item = &Segment> {
        self.segments.iter()
    }

    /// Total number of stored bytes over all segments.
    pub fn total_len(&self) -> usize {
        self.segments.iter().map(Segment::len).sum()
    }

    /// Lowest base and highest exclusive end, if anything is stored.
    pub fn address_range(&self) -> Option<Range<u64>> {
        let first = self.segments.first()?;
        let last = self.segments.last()?;
        Some(first.base as u64..last.end())
    }

    pub fn clear(&mut self) {
        self.segments.clear();
    }

    /// Store `data` as the content of `[address, address + data.len())`.
    ///
    /// New bytes replace any stored bytes in that range. Segments that overlap
    /// or touch the range are merged with it into a single segment, keeping
    /// their bytes outside the range.
    pub fn add_data(&mut self, address: u32, data: &[u8]) -> Result<(), FirmwareError> {
        let end = checked_end(address, data.len())?;
        let start = address as u64;

        // Segments in [first, last) overlap or touch the new range.
        let first = self.segments.partition_point(|s| s.end() < start);
        let last = self.segments.partition_point(|s| (s.base as u64) <= end);

        let merged_base = self.segments[first..last]
            .first()
            .map_or(start, |s| (s.base as u64).min(start));
        let merged_end = self.segments[first..last]
            .last()
            .map_or(end, |s| s.end().max(end));

        let mut merged = vec![0u8; (merged_end - merged_base) as usize];
        for seg in &self.segments[first..last] {
            let offset = (seg.base as u64 - merged_base) as usize;
            merged[offset..offset + seg.len()].copy_from_slice(&seg.data);
        }
        let offset = (start - merged_base) as usize;
        merged[offset..offset + data.len()].copy_from_slice(data);

        self.segments.splice(
            first..last,
            std::iter::once(Segment::new(merged_base as u32, merged)),
        );
        Ok(())
    }

    /// Delete stored bytes inside `[address, address + len)`.
    ///
    /// Covered segments disappear, partially covered ones are truncated, and a
    /// segment that strictly contains the range is split in two.
    pub fn remove_data(&mut self, address: u32, len: u32) -> Result<(), FirmwareError> {
        let end = checked_end(address, len as usize)?;
        let start = address as u64;

        // Segments in [first, last) overlap the removed range.
        let first = self.segments.partition_point(|s| s.end() <= start);
        let last = self.segments.partition_point(|s| (s.base as u64) < end);
        if first >= last {
            return Ok(());
        }

        let mut survivors = Vec::with_capacity(2);
        let head = &self.segments[first];
        if (head.base as u64) < start {
            survivors.push(Segment::new(
                head.base,
                head.slice(head.base as u64, start).to_vec(),
            ));
        }
        let tail = &self.segments[last - 1];
        if tail.end() > end {
            survivors.push(Segment::new(end as u32, tail.slice(end, tail.end()).to_vec()));
        }

        self.segments.splice(first..last, survivors);
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn assert_invariants(&self) {
        for seg in &self.segments {
            assert!(!seg.is_empty(), "empty segment at {:#x}", seg.base);
            assert!(seg.end() <= ADDRESS_SPACE_END);
        }
        for pair in self.segments.windows(2) {
            assert!(
                pair[0].end() < pair[1].base as u64,
                "segments {:#x} and {:#x} overlap or touch",
                pair[0].base,
                pair[1].base
            );
        }
    }
}

fn checked_end(address: u32, len: usize) -> Result<u64, FirmwareError> {
    if len == 0 {
        return Err(FirmwareError::InvalidArgument("length must be greater than zero"));
    }
    let end = address as u64 + len as u64;
    if end > ADDRESS_SPACE_END {
        return Err(FirmwareError::InvalidArgument(
            "range exceeds the 32-bit address space",
        ));
    }
    Ok(end)
}
