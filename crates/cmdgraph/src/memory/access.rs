//! Byte-range access records used for dependency inference.

use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Arena-assigned identity of one allocation; never reused within a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AllocationId(pub u64);

impl fmt::Display for AllocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccessMode {
    Read,
    Write,
    ReadWrite,
}

impl AccessMode {
    pub fn reads(self) -> bool {
        matches!(self, AccessMode::Read | AccessMode::ReadWrite)
    }

    pub fn writes(self) -> bool {
        matches!(self, AccessMode::Write | AccessMode::ReadWrite)
    }
}

/// Half-open byte interval `[start, end)` inside one allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, len: u64) -> Self {
        Self {
            start,
            end: start.saturating_add(len),
        }
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    pub fn overlaps(&self, other: &ByteRange) -> bool {
        !self.is_empty() && !other.is_empty() && self.start < other.end && other.start < self.end
    }

    /// Returns the parts of `self` not covered by `other` (zero, one or two pieces).
    pub fn subtract(&self, other: &ByteRange) -> SmallVec<[ByteRange; 2]> {
        let mut pieces = SmallVec::new();
        if !self.overlaps(other) {
            if !self.is_empty() {
                pieces.push(*self);
            }
            return pieces;
        }
        if self.start < other.start {
            pieces.push(ByteRange {
                start: self.start,
                end: other.start,
            });
        }
        if other.end < self.end {
            pieces.push(ByteRange {
                start: other.end,
                end: self.end,
            });
        }
        pieces
    }
}

/// Resolved `(allocation, byte range, mode)` triple compared by the dependency tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccessRecord {
    pub allocation: AllocationId,
    pub range: ByteRange,
    pub mode: AccessMode,
}

impl AccessRecord {
    /// Two records conflict when they touch overlapping bytes of the same allocation and at
    /// least one of them writes.
    pub fn conflicts_with(&self, other: &AccessRecord) -> bool {
        self.allocation == other.allocation
            && (self.mode.writes() || other.mode.writes())
            && self.range.overlaps(&other.range)
    }
}

/// Returns true when any record in `left` conflicts with any record in `right`.
pub fn any_conflict(left: &[AccessRecord], right: &[AccessRecord]) -> bool {
    left.iter()
        .any(|a| right.iter().any(|b| a.conflicts_with(b)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(allocation: u64, start: u64, len: u64, mode: AccessMode) -> AccessRecord {
        AccessRecord {
            allocation: AllocationId(allocation),
            range: ByteRange::new(start, len),
            mode,
        }
    }

    #[test]
    fn reads_never_conflict_with_reads() {
        let a = record(1, 0, 16, AccessMode::Read);
        let b = record(1, 8, 16, AccessMode::Read);
        assert!(!a.conflicts_with(&b));
    }

    #[test]
    fn overlapping_write_conflicts_only_within_same_allocation() {
        let write = record(1, 0, 16, AccessMode::Write);
        assert!(write.conflicts_with(&record(1, 15, 4, AccessMode::Read)));
        assert!(!write.conflicts_with(&record(1, 16, 4, AccessMode::Read)));
        assert!(!write.conflicts_with(&record(2, 0, 16, AccessMode::ReadWrite)));
    }

    #[test]
    fn empty_ranges_never_overlap() {
        let empty = ByteRange::new(4, 0);
        assert!(!empty.overlaps(&ByteRange::new(0, 16)));
    }

    #[test]
    fn subtract_splits_around_hole() {
        let pieces = ByteRange::new(0, 32).subtract(&ByteRange::new(8, 8));
        assert_eq!(
            pieces.as_slice(),
            &[ByteRange::new(0, 8), ByteRange::new(16, 16)]
        );
        assert!(ByteRange::new(8, 8)
            .subtract(&ByteRange::new(0, 32))
            .is_empty());
    }
}
