//! Fixed-size page batching.
//!
//! Pages are analyzed in contiguous runs of `batch_size` so one request to the
//! vision service covers several pages. Larger batches mean fewer round trips
//! but a slower first result and a wider blast radius when a request fails.

use crate::model::PageIndex;
use std::ops::Range;

/// `page / batch_size` for every page in the batch.
pub type BatchId = usize;

pub const DEFAULT_BATCH_SIZE: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPartitioner {
    batch_size: usize,
    page_count: usize,
}

impl BatchPartitioner {
    pub fn new(batch_size: usize, page_count: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
            page_count,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn page_count(&self) -> usize {
        self.page_count
    }

    pub fn batch_of(&self, page: PageIndex) -> BatchId {
        page / self.batch_size
    }

    /// Pages covered by `batch`, truncated at the end of the document. Empty
    /// for batches past the last page.
    pub fn page_range(&self, batch: BatchId) -> Range<PageIndex> {
        let start = batch.saturating_mul(self.batch_size).min(self.page_count);
        let end = start.saturating_add(self.batch_size).min(self.page_count);
        start..end
    }

    /// The batch after `batch`, if it holds at least one page.
    pub fn next_batch(&self, batch: BatchId) -> Option<BatchId> {
        let next = batch.checked_add(1)?;
        (!self.page_range(next).is_empty()).then_some(next)
    }
}
