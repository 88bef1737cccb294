//! Batch analysis coordinator.
//!
//! Owns writes to the [`CacheHandle`], keeps at most one request per batch in
//! flight, merges results back per page and runs the debounced prefetch of
//! the batch after the one being read.

use crate::analysis::{
    AnalysisError, AnalysisService, PageSource, RawBubble, build_page_bubbles,
};
use crate::analysis_cache::{AnalysisCache, CacheHandle};
use crate::batch::{BatchId, BatchPartitioner, DEFAULT_BATCH_SIZE};
use crate::deferred::DeferredSlot;
use crate::model::{PageAnalysisEntry, PageIndex, PageStatus};
use crate::reading_order::DEFAULT_ROW_TOLERANCE;
use std::collections::BTreeSet;
use std::ops::Range;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

const UPDATE_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineConfig {
    pub batch_size: usize,
    pub prefetch_delay: Duration,
    pub row_tolerance: u16,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            prefetch_delay: Duration::from_millis(500),
            row_tolerance: DEFAULT_ROW_TOLERANCE,
        }
    }
}

/// Published after every cache write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheUpdate {
    pub page: PageIndex,
    pub entry: PageAnalysisEntry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureOutcome {
    /// Another call already has a request out for this batch.
    AlreadyInFlight,
    /// Every page of the batch is complete (or the batch has no pages).
    AlreadyComplete,
    Completed,
    Failed,
}

pub struct AnalysisCoordinator {
    partitioner: BatchPartitioner,
    config: PipelineConfig,
    service: Arc<dyn AnalysisService>,
    pages: Arc<dyn PageSource>,
    cache: CacheHandle,
    in_flight: Mutex<BTreeSet<BatchId>>,
    updates: broadcast::Sender<CacheUpdate>,
    prefetch: DeferredSlot,
}

impl AnalysisCoordinator {
    pub fn new(
        config: PipelineConfig,
        service: Arc<dyn AnalysisService>,
        pages: Arc<dyn PageSource>,
        cache: CacheHandle,
    ) -> Self {
        let partitioner = BatchPartitioner::new(config.batch_size, pages.page_count());
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            partitioner,
            config,
            service,
            pages,
            cache,
            in_flight: Mutex::new(BTreeSet::new()),
            updates,
            prefetch: DeferredSlot::new(),
        }
    }

    pub fn partitioner(&self) -> BatchPartitioner {
        self.partitioner
    }

    pub fn cache(&self) -> &CacheHandle {
        &self.cache
    }

    pub fn entry(&self, page: PageIndex) -> Option<PageAnalysisEntry> {
        self.cache.entry(page)
    }

    pub fn status(&self, page: PageIndex) -> PageStatus {
        self.cache.status(page)
    }

    pub fn snapshot(&self) -> AnalysisCache {
        self.cache.snapshot()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheUpdate> {
        self.updates.subscribe()
    }

    pub fn in_flight(&self) -> Vec<BatchId> {
        self.lock_in_flight().iter().copied().collect()
    }

    pub fn is_prefetch_pending(&self) -> bool {
        self.prefetch.is_pending()
    }

    /// Make sure every page of `batch` is analyzed or being analyzed.
    ///
    /// Never fails: a failed request marks the batch's unfinished pages as
    /// errors and frees the batch for a later retry.
    pub async fn ensure_batch(&self, batch: BatchId) -> EnsureOutcome {
        let range = self.partitioner.page_range(batch);
        if let Err(outcome) = self.claim(batch, range.clone()) {
            return outcome;
        }
        let guard = InFlightGuard {
            coordinator: self,
            batch,
            range: range.clone(),
            armed: true,
        };

        info!(batch, pages = ?range, "Requesting batch analysis");
        let started = Instant::now();
        match self.request(range.clone()).await {
            Ok(results) => {
                info!(
                    batch,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Batch analysis finished"
                );
                guard.complete(results);
                EnsureOutcome::Completed
            }
            Err(err) => {
                warn!(batch, pages = ?range, "Batch analysis failed: {err}");
                guard.fail();
                EnsureOutcome::Failed
            }
        }
    }

    /// Fetch the batch holding `page` now and the following batch once the
    /// prefetch delay passes without another navigation.
    pub fn on_page_changed(self: &Arc<Self>, page: PageIndex) {
        if page >= self.partitioner.page_count() {
            warn!(page, "Ignoring navigation past the last page");
            return;
        }
        let current = self.partitioner.batch_of(page);
        self.spawn_ensure(current);

        match self.partitioner.next_batch(current) {
            Some(next) => {
                let this = Arc::clone(self);
                debug!(
                    batch = next,
                    delay_ms = self.config.prefetch_delay.as_millis() as u64,
                    "Scheduling prefetch"
                );
                self.prefetch
                    .schedule(self.config.prefetch_delay, async move {
                        debug!(batch = next, "Prefetching next batch");
                        this.ensure_batch(next).await;
                    });
            }
            None => self.prefetch.cancel(),
        }
    }

    /// Re-request the batch holding `page` right away. Complete pages in it
    /// are left alone.
    pub fn retry_page(self: &Arc<Self>, page: PageIndex) {
        if page < self.partitioner.page_count() {
            self.spawn_ensure(self.partitioner.batch_of(page));
        }
    }

    pub fn cancel_prefetch(&self) {
        self.prefetch.cancel();
    }

    fn spawn_ensure(self: &Arc<Self>, batch: BatchId) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.ensure_batch(batch).await;
        });
    }

    /// Apply both guards and, if the batch needs work, mark it in flight and
    /// its unfinished pages as loading.
    fn claim(&self, batch: BatchId, range: Range<PageIndex>) -> Result<(), EnsureOutcome> {
        let mut loading = Vec::new();
        {
            let mut in_flight = self.lock_in_flight();
            if in_flight.contains(&batch) {
                debug!(batch, "Batch already in flight");
                return Err(EnsureOutcome::AlreadyInFlight);
            }
            let mut cache = self.cache.write();
            if range.clone().all(|page| cache.is_complete(page)) {
                debug!(batch, "Batch already analyzed");
                return Err(EnsureOutcome::AlreadyComplete);
            }
            in_flight.insert(batch);
            for page in range {
                if cache.mark_loading(page) {
                    loading.push(page);
                }
            }
        }
        for page in loading {
            self.publish(page, PageAnalysisEntry::loading());
        }
        Ok(())
    }

    async fn request(&self, range: Range<PageIndex>) -> Result<Vec<Vec<RawBubble>>, AnalysisError> {
        let mut images = Vec::with_capacity(range.len());
        for page in range {
            images.push(self.pages.load(page).await?);
        }
        let results = self.service.analyze(&images).await?;
        if results.len() != images.len() {
            return Err(AnalysisError::LengthMismatch {
                expected: images.len(),
                actual: results.len(),
            });
        }
        Ok(results)
    }

    fn merge_success(&self, batch: BatchId, range: Range<PageIndex>, results: Vec<Vec<RawBubble>>) {
        let prepared: Vec<_> = range
            .zip(results)
            .map(|(page, raw)| (page, build_page_bubbles(page, raw, self.config.row_tolerance)))
            .collect();
        let mut updated = Vec::new();
        {
            let mut cache = self.cache.write();
            for (page, bubbles) in prepared {
                let count = bubbles.len();
                if cache.mark_complete(page, bubbles) {
                    debug!(page, bubbles = count, "Page analysis complete");
                    updated.push(page);
                }
            }
        }
        self.release(batch);
        self.publish_current(updated);
    }

    fn merge_failure(&self, batch: BatchId, range: Range<PageIndex>) {
        let mut updated = Vec::new();
        {
            let mut cache = self.cache.write();
            for page in range {
                if cache.mark_error(page) {
                    updated.push(page);
                }
            }
        }
        self.release(batch);
        self.publish_current(updated);
    }

    fn release(&self, batch: BatchId) {
        self.lock_in_flight().remove(&batch);
    }

    fn publish_current(&self, pages: Vec<PageIndex>) {
        for page in pages {
            if let Some(entry) = self.cache.entry(page) {
                self.publish(page, entry);
            }
        }
    }

    fn publish(&self, page: PageIndex, entry: PageAnalysisEntry) {
        // No subscribers is fine; the cache itself is the source of truth.
        let _ = self.updates.send(CacheUpdate { page, entry });
    }

    fn lock_in_flight(&self) -> MutexGuard<'_, BTreeSet<BatchId>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Releases the batch if the request future is dropped before it resolves,
/// marking its unfinished pages as errors so a revisit can retry.
struct InFlightGuard<'a> {
    coordinator: &'a AnalysisCoordinator,
    batch: BatchId,
    range: Range<PageIndex>,
    armed: bool,
}

impl InFlightGuard<'_> {
    fn complete(mut self, results: Vec<Vec<RawBubble>>) {
        self.armed = false;
        self.coordinator
            .merge_success(self.batch, self.range.clone(), results);
    }

    fn fail(mut self) {
        self.armed = false;
        self.coordinator.merge_failure(self.batch, self.range.clone());
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            warn!(batch = self.batch, "Batch request dropped before completion");
            self.coordinator.merge_failure(self.batch, self.range.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeAnalysis, FakePages, raw};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn coordinator(
        service: Arc<FakeAnalysis>,
        pages: Arc<FakePages>,
    ) -> Arc<AnalysisCoordinator> {
        Arc::new(AnalysisCoordinator::new(
            PipelineConfig::default(),
            service,
            pages,
            CacheHandle::new(),
        ))
    }

    fn texts(coord: &AnalysisCoordinator, page: PageIndex) -> Vec<String> {
        coord
            .entry(page)
            .map(|entry| entry.bubbles.into_iter().map(|b| b.text).collect())
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn concurrent_ensure_issues_one_request() {
        let service = FakeAnalysis::gated_one_bubble_per_page();
        let coord = coordinator(service.clone(), FakePages::new(8));

        let (first, second) = tokio::join!(coord.ensure_batch(0), async {
            service.next_call().await;
            let outcome = coord.ensure_batch(0).await;
            assert_eq!(coord.status(2), PageStatus::Loading);
            service.release_one();
            outcome
        });

        assert_eq!(first, EnsureOutcome::Completed);
        assert_eq!(second, EnsureOutcome::AlreadyInFlight);
        assert_eq!(service.calls(), vec![vec![0, 1, 2, 3]]);
        assert!(coord.in_flight().is_empty());
        assert_eq!(texts(&coord, 3), vec!["page 3"]);
    }

    #[tokio::test]
    async fn completed_batch_is_not_requested_again() {
        let service = FakeAnalysis::one_bubble_per_page();
        let coord = coordinator(service.clone(), FakePages::new(8));

        assert_eq!(coord.ensure_batch(1).await, EnsureOutcome::Completed);
        assert_eq!(coord.ensure_batch(1).await, EnsureOutcome::AlreadyComplete);
        assert_eq!(service.call_count(), 1);
    }

    #[tokio::test]
    async fn batch_past_the_end_is_a_no_op() {
        let service = FakeAnalysis::one_bubble_per_page();
        let coord = coordinator(service.clone(), FakePages::new(8));
        assert_eq!(coord.ensure_batch(5).await, EnsureOutcome::AlreadyComplete);
        assert_eq!(service.call_count(), 0);
    }

    #[tokio::test]
    async fn results_are_sorted_into_reading_order() {
        let service = FakeAnalysis::responding(|pages| {
            Ok(pages
                .iter()
                .map(|_| {
                    vec![
                        raw("third", 500.0, 50.0),
                        raw("second", 120.0, 10.0),
                        raw("first", 100.0, 300.0),
                    ]
                })
                .collect())
        });
        let coord = coordinator(service, FakePages::new(4));
        coord.ensure_batch(0).await;
        assert_eq!(texts(&coord, 0), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn malformed_bubble_is_dropped_but_page_completes() {
        let service = FakeAnalysis::responding(|pages| {
            Ok(pages
                .iter()
                .map(|_| {
                    vec![
                        raw("kept", 100.0, 100.0),
                        crate::analysis::RawBubble {
                            text: "inverted".to_string(),
                            box_2d: vec![900.0, 10.0, 100.0, 20.0],
                        },
                    ]
                })
                .collect())
        });
        let coord = coordinator(service, FakePages::new(4));
        coord.ensure_batch(0).await;
        assert_eq!(coord.status(1), PageStatus::Complete);
        assert_eq!(texts(&coord, 1), vec!["kept"]);
    }

    #[tokio::test]
    async fn failure_marks_pages_error_and_allows_retry() {
        let service = FakeAnalysis::failing();
        let coord = coordinator(service.clone(), FakePages::new(8));

        assert_eq!(coord.ensure_batch(0).await, EnsureOutcome::Failed);
        for page in 0..4 {
            let entry = coord.entry(page).unwrap();
            assert_eq!(entry.status, PageStatus::Error);
            assert!(entry.bubbles.is_empty());
        }
        assert!(coord.in_flight().is_empty());
        assert_eq!(
            coord.snapshot().pages_with(PageStatus::Error),
            vec![0, 1, 2, 3]
        );

        assert_eq!(coord.ensure_batch(0).await, EnsureOutcome::Failed);
        assert_eq!(service.call_count(), 2);
    }

    #[tokio::test]
    async fn short_response_fails_the_whole_batch() {
        let service = FakeAnalysis::responding(|pages| {
            Ok(pages.iter().skip(1).map(|_| Vec::new()).collect())
        });
        let coord = coordinator(service, FakePages::new(8));

        assert_eq!(coord.ensure_batch(1).await, EnsureOutcome::Failed);
        for page in 4..8 {
            assert_eq!(coord.status(page), PageStatus::Error);
        }
    }

    #[tokio::test]
    async fn unreadable_page_fails_batch_without_a_request() {
        let service = FakeAnalysis::one_bubble_per_page();
        let coord = coordinator(service.clone(), FakePages::with_broken_page(8, 2));

        assert_eq!(coord.ensure_batch(0).await, EnsureOutcome::Failed);
        assert_eq!(service.call_count(), 0);
        assert_eq!(coord.status(0), PageStatus::Error);
    }

    #[tokio::test]
    async fn complete_pages_survive_later_requests() {
        let service = FakeAnalysis::one_bubble_per_page();
        let coord = coordinator(service.clone(), FakePages::new(8));
        coord.cache().write().mark_complete(1, Vec::new());

        assert_eq!(coord.ensure_batch(0).await, EnsureOutcome::Completed);
        assert_eq!(service.calls(), vec![vec![0, 1, 2, 3]]);
        assert!(texts(&coord, 1).is_empty());
        assert_eq!(texts(&coord, 0), vec!["page 0"]);
    }

    #[tokio::test]
    async fn failure_never_regresses_complete_pages() {
        let coord = coordinator(FakeAnalysis::failing(), FakePages::new(8));
        coord.cache().write().mark_complete(2, Vec::new());

        coord.ensure_batch(0).await;
        assert_eq!(coord.status(2), PageStatus::Complete);
        assert_eq!(coord.status(3), PageStatus::Error);
    }

    #[tokio::test]
    async fn status_transitions_follow_the_page_state_machine() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let service = FakeAnalysis::responding({
            let attempts = Arc::clone(&attempts);
            move |pages| {
                if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    return Err(AnalysisError::Transport("timeout".to_string()));
                }
                Ok(pages.iter().map(|_| Vec::new()).collect())
            }
        });
        let coord = coordinator(service, FakePages::new(4));
        let mut updates = coord.subscribe();

        coord.ensure_batch(0).await;
        coord.ensure_batch(0).await;
        coord.ensure_batch(0).await;

        let mut page_zero = Vec::new();
        while let Ok(update) = updates.try_recv() {
            if update.page == 0 {
                page_zero.push(update.entry.status);
            }
        }
        assert_eq!(
            page_zero,
            vec![
                PageStatus::Loading,
                PageStatus::Error,
                PageStatus::Loading,
                PageStatus::Complete,
            ]
        );
    }

    #[tokio::test]
    async fn dropped_request_releases_the_batch() {
        let service = FakeAnalysis::gated_one_bubble_per_page();
        let coord = coordinator(service.clone(), FakePages::new(8));

        tokio::select! {
            _ = coord.ensure_batch(0) => panic!("gated request must not finish"),
            _ = service.next_call() => {}
        }

        assert!(coord.in_flight().is_empty());
        assert_eq!(coord.status(0), PageStatus::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn navigation_fetches_current_now_and_next_after_debounce() {
        let service = FakeAnalysis::one_bubble_per_page();
        let coord = coordinator(service.clone(), FakePages::new(8));

        coord.on_page_changed(2);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(service.calls(), vec![vec![0, 1, 2, 3]]);
        assert!(coord.is_prefetch_pending());

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(service.calls(), vec![vec![0, 1, 2, 3], vec![4, 5, 6, 7]]);
        assert_eq!(coord.status(6), PageStatus::Complete);
    }

    #[tokio::test(start_paused = true)]
    async fn navigating_before_debounce_cancels_stale_prefetch() {
        let service = FakeAnalysis::one_bubble_per_page();
        let coord = coordinator(service.clone(), FakePages::new(8));

        coord.on_page_changed(2);
        tokio::time::sleep(Duration::from_millis(100)).await;
        coord.on_page_changed(5);
        assert!(!coord.is_prefetch_pending());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(service.calls(), vec![vec![0, 1, 2, 3], vec![4, 5, 6, 7]]);
    }

    #[tokio::test(start_paused = true)]
    async fn rapid_navigation_prefetches_only_the_final_next_batch() {
        let service = FakeAnalysis::one_bubble_per_page();
        let coord = coordinator(service.clone(), FakePages::new(12));

        coord.on_page_changed(0);
        tokio::time::sleep(Duration::from_millis(100)).await;
        coord.on_page_changed(1);
        tokio::time::sleep(Duration::from_millis(100)).await;
        coord.on_page_changed(2);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(service.calls(), vec![vec![0, 1, 2, 3], vec![4, 5, 6, 7]]);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_results_are_cached_after_navigating_away() {
        let service = FakeAnalysis::gated_one_bubble_per_page();
        let coord = coordinator(service.clone(), FakePages::new(12));

        coord.on_page_changed(0);
        service.next_call().await;
        coord.on_page_changed(9);
        assert_eq!(service.next_call().await, vec![8, 9, 10, 11]);

        service.release_one();
        service.release_one();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(coord.status(0), PageStatus::Complete);
        assert_eq!(coord.status(9), PageStatus::Complete);
    }
}
