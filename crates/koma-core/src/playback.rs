//! Speech playback synchronizer.
//!
//! Watches the displayed page and the analysis cache, reads a page's bubbles
//! aloud once its analysis is complete and publishes which bubble is being
//! spoken. Every sequence carries a generation number; events from a sequence
//! that was torn down are dropped, so a stale utterance can never move the
//! highlight. All sequences share one [`Speaker`], so a new page is never
//! voiced while the previous page's utterance is still alive.

use crate::analysis_cache::CacheHandle;
use crate::model::{Bubble, PageAnalysisEntry, PageIndex};
use crate::normalizer::TextNormalizer;
use crate::sequence::{Speaker, UtteranceEvent, UtteranceSequence};
use crate::speech::SpeechEngine;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct PlaybackState {
    /// Position in the page's bubble list of the utterance being spoken.
    pub currently_spoken_bubble: Option<usize>,
    /// Page whose bubbles the current visit has started speaking.
    pub spoken_for_page: Option<PageIndex>,
}

struct SyncState {
    enabled: bool,
    current_page: Option<PageIndex>,
    generation: u64,
    active: Option<UtteranceSequence>,
    spoken_for_page: Option<PageIndex>,
}

struct Shared {
    state: Mutex<SyncState>,
    published: watch::Sender<PlaybackState>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, SyncState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct PlaybackSynchronizer {
    engine: Arc<dyn SpeechEngine>,
    normalizer: TextNormalizer,
    cache: CacheHandle,
    speaker: Speaker,
    shared: Arc<Shared>,
}

impl PlaybackSynchronizer {
    pub fn new(
        engine: Arc<dyn SpeechEngine>,
        normalizer: TextNormalizer,
        cache: CacheHandle,
        enabled: bool,
    ) -> Self {
        let (published, _) = watch::channel(PlaybackState::default());
        Self {
            engine,
            normalizer,
            cache,
            speaker: Speaker::default(),
            shared: Arc::new(Shared {
                state: Mutex::new(SyncState {
                    enabled,
                    current_page: None,
                    generation: 0,
                    active: None,
                    spoken_for_page: None,
                }),
                published,
            }),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<PlaybackState> {
        self.shared.published.subscribe()
    }

    pub fn state(&self) -> PlaybackState {
        *self.shared.published.borrow()
    }

    pub fn is_enabled(&self) -> bool {
        self.shared.lock().enabled
    }

    pub fn current_page(&self) -> Option<PageIndex> {
        self.shared.lock().current_page
    }

    /// True while a sequence still has utterances to go.
    pub fn is_speaking(&self) -> bool {
        self.shared
            .lock()
            .active
            .as_ref()
            .is_some_and(|sequence| !sequence.is_done())
    }

    /// A new navigation visit. Anything still being spoken is cut off and
    /// the new page is read from its first bubble once its analysis is in.
    pub fn on_page_changed(&self, page: PageIndex) {
        let mut state = self.shared.lock();
        state.current_page = Some(page);
        if !state.enabled {
            return;
        }
        self.stop_locked(&mut state);
        self.evaluate_locked(&mut state);
    }

    pub fn on_cache_updated(&self, page: PageIndex, entry: &PageAnalysisEntry) {
        let mut state = self.shared.lock();
        if !state.enabled || state.current_page != Some(page) || !entry.is_complete() {
            return;
        }
        if state.spoken_for_page == Some(page) {
            debug!(page, "Page already spoken this visit");
            return;
        }
        self.start_locked(&mut state, page, &entry.bubbles);
    }

    pub fn set_enabled(&self, enabled: bool) {
        let mut state = self.shared.lock();
        if state.enabled == enabled {
            return;
        }
        info!(enabled, "Speech playback toggled");
        state.enabled = enabled;
        if enabled {
            self.evaluate_locked(&mut state);
        } else {
            self.stop_locked(&mut state);
        }
    }

    /// Look at the current page in the cache again, e.g. after cache updates
    /// were missed.
    pub fn resync(&self) {
        let mut state = self.shared.lock();
        if state.enabled {
            self.evaluate_locked(&mut state);
        }
    }

    fn evaluate_locked(&self, state: &mut SyncState) {
        let Some(page) = state.current_page else {
            return;
        };
        if state.spoken_for_page == Some(page) {
            return;
        }
        if let Some(entry) = self.cache.entry(page).filter(PageAnalysisEntry::is_complete) {
            self.start_locked(state, page, &entry.bubbles);
        }
    }

    fn start_locked(&self, state: &mut SyncState, page: PageIndex, bubbles: &[Bubble]) {
        state.generation += 1;
        let generation = state.generation;
        state.spoken_for_page = Some(page);
        self.shared.published.send_replace(PlaybackState {
            currently_spoken_bubble: None,
            spoken_for_page: Some(page),
        });

        let utterances = self.normalizer.plan_utterances(bubbles);
        info!(page, bubbles = utterances.len(), "Starting page playback");
        let shared = Arc::clone(&self.shared);
        let sequence = UtteranceSequence::spawn(
            Arc::clone(&self.engine),
            &self.speaker,
            utterances,
            move |event| {
                let state = shared.lock();
                if state.generation != generation {
                    return;
                }
                match event {
                    UtteranceEvent::Started { index } => {
                        debug!(page, bubble_idx = index, "Speaking bubble");
                        shared
                            .published
                            .send_modify(|s| s.currently_spoken_bubble = Some(index));
                    }
                    UtteranceEvent::Finished {
                        index,
                        last,
                        failed,
                    } => {
                        if failed {
                            debug!(page, bubble_idx = index, "Bubble skipped after speech error");
                        }
                        if last {
                            debug!(page, "Page playback finished");
                            shared
                                .published
                                .send_modify(|s| s.currently_spoken_bubble = None);
                        }
                    }
                }
            },
        );
        state.active = Some(sequence);
    }

    fn stop_locked(&self, state: &mut SyncState) {
        state.generation += 1;
        if let Some(sequence) = state.active.take() {
            if !sequence.is_done() {
                debug!(page = ?state.spoken_for_page, "Cancelling page playback");
                sequence.cancel();
                self.engine.cancel();
            }
        }
        state.spoken_for_page = None;
        self.shared.published.send_replace(PlaybackState::default());
    }
}

impl Drop for PlaybackSynchronizer {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        self.stop_locked(&mut state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BoundingBox;
    use crate::testing::ScriptedSpeech;
    use std::time::Duration;

    fn bubbles(texts: &[&str]) -> Vec<Bubble> {
        texts
            .iter()
            .enumerate()
            .map(|(i, text)| Bubble {
                text: text.to_string(),
                bbox: BoundingBox::new(100 * i as u16, 0, 100 * i as u16 + 50, 50).unwrap(),
            })
            .collect()
    }

    fn cache_with(pages: &[(PageIndex, &[&str])]) -> CacheHandle {
        let cache = CacheHandle::new();
        for (page, texts) in pages {
            cache.write().mark_complete(*page, bubbles(texts));
        }
        cache
    }

    fn synchronizer(
        speech: &Arc<ScriptedSpeech>,
        cache: &CacheHandle,
        enabled: bool,
    ) -> PlaybackSynchronizer {
        PlaybackSynchronizer::new(
            speech.clone(),
            TextNormalizer::default(),
            cache.clone(),
            enabled,
        )
    }

    async fn wait_until_quiet(sync: &PlaybackSynchronizer) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while sync.is_speaking() || sync.state().currently_spoken_bubble.is_some() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("playback did not settle");
    }

    #[tokio::test]
    async fn speaks_complete_page_bubble_by_bubble() {
        let speech = ScriptedSpeech::gated();
        let cache = cache_with(&[(0, &["First one", "Second one", "Third one"])]);
        let sync = synchronizer(&speech, &cache, false);
        sync.on_page_changed(0);
        assert_eq!(sync.state().currently_spoken_bubble, None);

        sync.set_enabled(true);
        for (index, text) in ["First one", "Second one", "Third one"].iter().enumerate() {
            assert_eq!(speech.next_call().await, *text);
            assert_eq!(sync.state().currently_spoken_bubble, Some(index));
            speech.finish_current();
        }
        wait_until_quiet(&sync).await;

        assert_eq!(sync.state().currently_spoken_bubble, None);
        assert_eq!(sync.state().spoken_for_page, Some(0));
        assert_eq!(speech.spoken(), vec!["First one", "Second one", "Third one"]);
        assert_eq!(speech.max_concurrent(), 1);
    }

    #[tokio::test]
    async fn page_change_cancels_and_return_restarts_from_first_bubble() {
        let speech = ScriptedSpeech::gated();
        let cache = cache_with(&[(0, &["Zero a", "Zero b"]), (1, &["One a"])]);
        let sync = synchronizer(&speech, &cache, true);

        sync.on_page_changed(0);
        assert_eq!(speech.next_call().await, "Zero a");

        sync.on_page_changed(1);
        assert_eq!(speech.cancel_count(), 1);
        assert_eq!(speech.next_call().await, "One a");
        assert_eq!(sync.state().spoken_for_page, Some(1));
        assert_eq!(sync.state().currently_spoken_bubble, Some(0));

        sync.on_page_changed(0);
        assert_eq!(speech.next_call().await, "Zero a");
        assert_eq!(speech.spoken(), vec!["Zero a", "One a", "Zero a"]);
        assert_eq!(speech.max_concurrent(), 1);
    }

    #[tokio::test]
    async fn duplicate_cache_update_does_not_restart() {
        let speech = ScriptedSpeech::gated();
        let cache = cache_with(&[(0, &["Only line"])]);
        let sync = synchronizer(&speech, &cache, true);

        sync.on_page_changed(0);
        assert_eq!(speech.next_call().await, "Only line");
        let entry = cache.entry(0).unwrap();
        sync.on_cache_updated(0, &entry);
        sync.on_cache_updated(0, &entry);
        speech.finish_current();
        wait_until_quiet(&sync).await;

        sync.on_cache_updated(0, &entry);
        tokio::task::yield_now().await;
        assert_eq!(speech.spoken(), vec!["Only line"]);
        assert!(!sync.is_speaking());
    }

    #[tokio::test]
    async fn failed_utterance_moves_on_to_next_bubble() {
        let speech = ScriptedSpeech::instant();
        speech.fail_on("Broken");
        let cache = cache_with(&[(0, &["Broken", "Fine"])]);
        let sync = synchronizer(&speech, &cache, true);

        sync.on_page_changed(0);
        wait_until_quiet(&sync).await;
        assert_eq!(speech.spoken(), vec!["Broken", "Fine"]);
    }

    #[tokio::test]
    async fn disabling_clears_state_and_enabling_starts_over() {
        let speech = ScriptedSpeech::gated();
        let cache = cache_with(&[(0, &["Hello there", "Bye now"])]);
        let sync = synchronizer(&speech, &cache, true);

        sync.on_page_changed(0);
        assert_eq!(speech.next_call().await, "Hello there");
        speech.finish_current();
        assert_eq!(speech.next_call().await, "Bye now");

        sync.set_enabled(false);
        assert_eq!(sync.state(), PlaybackState::default());
        assert_eq!(speech.cancel_count(), 1);
        assert!(!sync.is_enabled());

        sync.set_enabled(true);
        assert_eq!(speech.next_call().await, "Hello there");
        assert_eq!(sync.state().currently_spoken_bubble, Some(0));
    }

    #[tokio::test]
    async fn waits_for_analysis_of_current_page() {
        let speech = ScriptedSpeech::instant();
        let cache = CacheHandle::new();
        let sync = synchronizer(&speech, &cache, true);

        sync.on_page_changed(3);
        assert!(!sync.is_speaking());
        sync.on_cache_updated(3, &PageAnalysisEntry::loading());

        cache.write().mark_complete(2, bubbles(&["Elsewhere"]));
        sync.on_cache_updated(2, &cache.entry(2).unwrap());

        cache.write().mark_complete(3, bubbles(&["Finally here"]));
        sync.on_cache_updated(3, &cache.entry(3).unwrap());
        wait_until_quiet(&sync).await;

        assert_eq!(speech.spoken(), vec!["Finally here"]);
    }

    #[tokio::test]
    async fn disabled_synchronizer_only_tracks_the_page() {
        let speech = ScriptedSpeech::instant();
        let cache = cache_with(&[(0, &["Quiet please"])]);
        let sync = synchronizer(&speech, &cache, false);

        sync.on_page_changed(0);
        sync.on_cache_updated(0, &cache.entry(0).unwrap());
        tokio::task::yield_now().await;

        assert_eq!(sync.current_page(), Some(0));
        assert!(speech.spoken().is_empty());
        assert_eq!(sync.state(), PlaybackState::default());
    }

    #[tokio::test]
    async fn unspeakable_bubble_is_reported_but_not_sent() {
        let speech = ScriptedSpeech::gated();
        let cache = cache_with(&[(0, &["!?", "Said aloud"])]);
        let sync = synchronizer(&speech, &cache, true);

        sync.on_page_changed(0);
        assert_eq!(speech.next_call().await, "Said aloud");
        assert_eq!(sync.state().currently_spoken_bubble, Some(1));
        speech.finish_current();
        wait_until_quiet(&sync).await;
        assert_eq!(speech.spoken(), vec!["Said aloud"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn rapid_page_flips_never_overlap_utterances_across_workers() {
        let speech = ScriptedSpeech::gated();
        let cache = cache_with(&[(0, &["Left page"]), (1, &["Right page"])]);
        let sync = synchronizer(&speech, &cache, true);

        for flip in 0..500 {
            sync.on_page_changed(flip % 2);
            tokio::time::sleep(Duration::from_micros(200)).await;
        }
        sync.on_page_changed(0);
        tokio::time::timeout(Duration::from_secs(10), async {
            while speech.spoken().last().map(String::as_str) != Some("Left page")
                || sync.state().currently_spoken_bubble != Some(0)
            {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("final page never started speaking");

        assert_eq!(sync.state().spoken_for_page, Some(0));
        assert_eq!(speech.max_concurrent(), 1);
    }
}
