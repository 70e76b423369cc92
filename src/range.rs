use std::fmt;

/// A half-open interval `[lo, hi)` in either CSpace (compressed file offsets)
/// or DSpace (decompressed stream offsets).
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Range {
    pub lo: u64,
    pub hi: u64,
}

impl Range {
    pub const fn new(lo: u64, hi: u64) -> Self {
        Self { lo, hi }
    }

    pub fn is_empty(&self) -> bool {
        self.lo >= self.hi
    }

    /// Number of bytes covered; zero for empty or inverted ranges.
    pub fn size(&self) -> u64 {
        self.hi.saturating_sub(self.lo)
    }

    pub fn contains(&self, offset: u64) -> bool {
        self.lo <= offset && offset < self.hi
    }

    /// Intersection of two ranges. Disjoint inputs give an empty range.
    pub fn intersect(&self, other: Range) -> Range {
        let lo = self.lo.max(other.lo);
        let hi = self.hi.min(other.hi).max(lo);
        Range { lo, hi }
    }
}

impl fmt::Debug for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:#x}, {:#x})", self.lo, self.hi)
    }
}

impl From<std::ops::Range<u64>> for Range {
    fn from(value: std::ops::Range<u64>) -> Self {
        Range::new(value.start, value.end)
    }
}
