//! Per-page analysis store.
//!
//! The store lives for one reading session. [`CacheHandle`] is cloned into
//! every component that needs it, but only the coordinator calls the
//! crate-private write methods; everything else gets read access.

use crate::model::{Bubble, PageAnalysisEntry, PageIndex, PageStatus};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

/// Sparse map of page to analysis entry. Pages never requested have no entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnalysisCache {
    entries: BTreeMap<PageIndex, PageAnalysisEntry>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub loading: usize,
    pub complete: usize,
    pub error: usize,
}

impl AnalysisCache {
    pub fn entry(&self, page: PageIndex) -> Option<&PageAnalysisEntry> {
        self.entries.get(&page)
    }

    pub fn status(&self, page: PageIndex) -> PageStatus {
        self.entries
            .get(&page)
            .map_or(PageStatus::Pending, |entry| entry.status)
    }

    pub fn is_complete(&self, page: PageIndex) -> bool {
        self.status(page) == PageStatus::Complete
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn pages_with(&self, status: PageStatus) -> Vec<PageIndex> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.status == status)
            .map(|(page, _)| *page)
            .collect()
    }

    pub fn stats(&self) -> CacheStats {
        let mut stats = CacheStats::default();
        for entry in self.entries.values() {
            match entry.status {
                PageStatus::Loading => stats.loading += 1,
                PageStatus::Complete => stats.complete += 1,
                PageStatus::Error => stats.error += 1,
                PageStatus::Pending => {}
            }
        }
        stats
    }

    /// `pending | error | loading -> loading`. Returns false for complete pages.
    pub(crate) fn mark_loading(&mut self, page: PageIndex) -> bool {
        if self.is_complete(page) {
            return false;
        }
        self.entries.insert(page, PageAnalysisEntry::loading());
        true
    }

    /// Store the page's bubbles unless the page already completed earlier.
    pub(crate) fn mark_complete(&mut self, page: PageIndex, bubbles: Vec<Bubble>) -> bool {
        if self.is_complete(page) {
            debug!(page, "Keeping earlier analysis result for page");
            return false;
        }
        self.entries
            .insert(page, PageAnalysisEntry::complete(bubbles));
        true
    }

    pub(crate) fn mark_error(&mut self, page: PageIndex) -> bool {
        if self.is_complete(page) {
            return false;
        }
        self.entries.insert(page, PageAnalysisEntry::error());
        true
    }
}

/// Shared, cloneable handle to the session's [`AnalysisCache`].
#[derive(Debug, Clone, Default)]
pub struct CacheHandle {
    inner: Arc<RwLock<AnalysisCache>>,
}

impl CacheHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entry(&self, page: PageIndex) -> Option<PageAnalysisEntry> {
        self.read().entry(page).cloned()
    }

    pub fn status(&self, page: PageIndex) -> PageStatus {
        self.read().status(page)
    }

    pub fn stats(&self) -> CacheStats {
        self.read().stats()
    }

    pub fn snapshot(&self) -> AnalysisCache {
        self.read().clone()
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, AnalysisCache> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, AnalysisCache> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}
