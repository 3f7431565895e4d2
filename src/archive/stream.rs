use crate::error::{PakError, Result};
use std::ops::Range;

/// Write progress of one continuous (streamed) file update
///
/// Segments may arrive out of order through seek overrides and may overwrite
/// each other, so completion is tracked as the set of covered byte ranges
/// rather than a running byte count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamProgress {
    total: u64,
    cursor: u64,
    covered: Vec<Range<u64>>,
}

impl StreamProgress {
    pub fn new(total: u64) -> Self {
        Self {
            total,
            cursor: 0,
            covered: Vec::new(),
        }
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    /// Where the next sequential segment lands
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Distinct bytes written so far
    pub fn written(&self) -> u64 {
        self.covered.iter().map(|r| r.end - r.start).sum()
    }

    pub fn is_complete(&self) -> bool {
        self.written() == self.total
    }

    /// Resolve the target position of a segment and check it fits
    pub fn position_for(&self, seek: Option<u64>, len: u64) -> Result<u64> {
        let pos = seek.unwrap_or(self.cursor);
        let end = pos.checked_add(len).ok_or_else(|| {
            PakError::InvalidArgument(format!("Segment at {} overflows", pos))
        })?;
        if end > self.total {
            return Err(PakError::InvalidArgument(format!(
                "Segment {}..{} extends past reserved size {}",
                pos, end, self.total
            )));
        }
        Ok(pos)
    }

    /// Note a segment as written and advance the cursor past it
    pub fn record(&mut self, pos: u64, len: u64) {
        self.cursor = pos + len;
        if len == 0 {
            return;
        }

        let mut merged = pos..pos + len;
        let mut kept = Vec::with_capacity(self.covered.len() + 1);
        for range in self.covered.drain(..) {
            if range.end < merged.start || range.start > merged.end {
                kept.push(range);
            } else {
                merged = merged.start.min(range.start)..merged.end.max(range.end);
            }
        }
        kept.push(merged);
        kept.sort_by_key(|r| r.start);
        self.covered = kept;
    }
}
