use std::fmt;

/// Inclusive span of bytes `[start, end]` within a file.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    /// Panics if `end < start`.
    pub fn new(start: u64, end: u64) -> Self {
        assert!(start <= end, "invalid byte range {}..={}", start, end);
        Self { start, end }
    }

    /// Number of bytes covered, saturating for `0..=u64::MAX`.
    pub fn len(&self) -> u64 {
        (self.end - self.start).saturating_add(1)
    }

    /// Consecutive sub-ranges of at most `chunk_size` bytes, in increasing offset order.
    pub fn chunks(&self, chunk_size: u64) -> Chunks {
        Chunks {
            next: Some(self.start),
            end: self.end,
            chunk_size: chunk_size.max(1),
        }
    }
}

impl fmt::Debug for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}..={}", self.start, self.end)
    }
}

pub struct Chunks {
    next: Option<u64>,
    end: u64,
    chunk_size: u64,
}

impl Iterator for Chunks {
    type Item = ByteRange;

    fn next(&mut self) -> Option<ByteRange> {
        let start = self.next?;
        let end = start.saturating_add(self.chunk_size - 1).min(self.end);

        self.next = if end == self.end { None } else { Some(end + 1) };

        Some(ByteRange { start, end })
    }
}
