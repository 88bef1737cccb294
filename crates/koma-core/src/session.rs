//! A reading session: the cache, the coordinator that fills it and the
//! synchronizer that reads from it, all living exactly as long as the session.

use crate::analysis::{AnalysisService, PageSource};
use crate::analysis_cache::{CacheHandle, CacheStats};
use crate::batch::BatchId;
use crate::coordinator::{AnalysisCoordinator, CacheUpdate, PipelineConfig};
use crate::model::{Bubble, PageIndex, PageStatus};
use crate::normalizer::TextNormalizer;
use crate::playback::{PlaybackState, PlaybackSynchronizer};
use crate::speech::SpeechEngine;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSettings {
    pub pipeline: PipelineConfig,
    pub analysis_enabled: bool,
    pub speech_enabled: bool,
    pub start_page: PageIndex,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            pipeline: PipelineConfig::default(),
            analysis_enabled: true,
            speech_enabled: false,
            start_page: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReaderSnapshot {
    pub current_page: usize,
    pub total_pages: usize,
    pub status: PageStatus,
    pub bubbles: Vec<Bubble>,
    pub highlighted_bubble: Option<usize>,
    pub analysis_enabled: bool,
    pub speech_enabled: bool,
    pub current_batch: BatchId,
    pub in_flight_batches: Vec<BatchId>,
    pub cache: CacheStats,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCommand {
    GetSnapshot,
    NextPage,
    PrevPage,
    SetPage { page: usize },
    ToggleAnalysis,
    SetAnalysisEnabled { enabled: bool },
    ToggleSpeech,
    SetSpeechEnabled { enabled: bool },
    RetryPage,
}

impl SessionCommand {
    pub fn action(&self) -> &'static str {
        match self {
            Self::GetSnapshot => "reader_get_snapshot",
            Self::NextPage => "reader_next_page",
            Self::PrevPage => "reader_prev_page",
            Self::SetPage { .. } => "reader_set_page",
            Self::ToggleAnalysis => "reader_toggle_analysis",
            Self::SetAnalysisEnabled { .. } => "reader_set_analysis_enabled",
            Self::ToggleSpeech => "reader_toggle_speech",
            Self::SetSpeechEnabled { .. } => "reader_set_speech_enabled",
            Self::RetryPage => "reader_retry_page",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionEvent {
    pub action: &'static str,
    pub snapshot: ReaderSnapshot,
}

pub struct ReaderSession {
    cache: CacheHandle,
    coordinator: Arc<AnalysisCoordinator>,
    playback: Arc<PlaybackSynchronizer>,
    page_count: usize,
    current_page: PageIndex,
    analysis_enabled: bool,
    pump: JoinHandle<()>,
}

impl ReaderSession {
    /// Build the pipeline for one document and enter `settings.start_page`.
    /// Must be called from inside a Tokio runtime.
    pub fn start(
        settings: SessionSettings,
        service: Arc<dyn AnalysisService>,
        pages: Arc<dyn PageSource>,
        engine: Arc<dyn SpeechEngine>,
        normalizer: TextNormalizer,
    ) -> Self {
        let page_count = pages.page_count();
        let cache = CacheHandle::new();
        let coordinator = Arc::new(AnalysisCoordinator::new(
            settings.pipeline,
            service,
            pages,
            cache.clone(),
        ));
        let playback = Arc::new(PlaybackSynchronizer::new(
            engine,
            normalizer,
            cache.clone(),
            settings.speech_enabled,
        ));
        let pump = tokio::spawn(forward_updates(
            coordinator.subscribe(),
            Arc::clone(&playback),
        ));

        info!(
            pages = page_count,
            batch_size = settings.pipeline.batch_size,
            analysis = settings.analysis_enabled,
            speech = settings.speech_enabled,
            "Reading session started"
        );

        let mut session = Self {
            cache,
            coordinator,
            playback,
            page_count,
            current_page: 0,
            analysis_enabled: settings.analysis_enabled,
            pump,
        };
        if page_count > 0 {
            session.enter_page(settings.start_page.min(page_count - 1));
        }
        session
    }

    pub fn current_page(&self) -> PageIndex {
        self.current_page
    }

    pub fn page_count(&self) -> usize {
        self.page_count
    }

    pub fn cache(&self) -> &CacheHandle {
        &self.cache
    }

    pub fn coordinator(&self) -> &Arc<AnalysisCoordinator> {
        &self.coordinator
    }

    pub fn playback(&self) -> &Arc<PlaybackSynchronizer> {
        &self.playback
    }

    pub fn subscribe_playback(&self) -> watch::Receiver<PlaybackState> {
        self.playback.subscribe()
    }

    pub fn subscribe_updates(&self) -> broadcast::Receiver<CacheUpdate> {
        self.coordinator.subscribe()
    }

    pub fn snapshot(&self) -> ReaderSnapshot {
        let entry = self.cache.entry(self.current_page);
        let playback = self.playback.state();
        let highlighted_bubble = playback
            .currently_spoken_bubble
            .filter(|_| playback.spoken_for_page == Some(self.current_page));
        ReaderSnapshot {
            current_page: self.current_page,
            total_pages: self.page_count,
            status: entry.as_ref().map(|e| e.status).unwrap_or_default(),
            bubbles: entry.map(|e| e.bubbles).unwrap_or_default(),
            highlighted_bubble,
            analysis_enabled: self.analysis_enabled,
            speech_enabled: self.playback.is_enabled(),
            current_batch: self.coordinator.partitioner().batch_of(self.current_page),
            in_flight_batches: self.coordinator.in_flight(),
            cache: self.cache.stats(),
        }
    }

    pub fn apply_command(&mut self, command: SessionCommand) -> SessionEvent {
        let action = command.action();
        debug!(action, "Applying session command");
        match command {
            SessionCommand::GetSnapshot => {}
            SessionCommand::NextPage => self.next_page(),
            SessionCommand::PrevPage => self.prev_page(),
            SessionCommand::SetPage { page } => self.set_page(page),
            SessionCommand::ToggleAnalysis => self.set_analysis_enabled(!self.analysis_enabled),
            SessionCommand::SetAnalysisEnabled { enabled } => self.set_analysis_enabled(enabled),
            SessionCommand::ToggleSpeech => {
                let enabled = !self.playback.is_enabled();
                self.set_speech_enabled(enabled);
            }
            SessionCommand::SetSpeechEnabled { enabled } => self.set_speech_enabled(enabled),
            SessionCommand::RetryPage => self.retry_page(),
        }
        SessionEvent {
            action,
            snapshot: self.snapshot(),
        }
    }

    pub fn next_page(&mut self) {
        if self.current_page + 1 >= self.page_count {
            return;
        }
        self.enter_page(self.current_page + 1);
    }

    pub fn prev_page(&mut self) {
        if self.current_page == 0 {
            return;
        }
        self.enter_page(self.current_page - 1);
    }

    pub fn set_page(&mut self, page: usize) {
        if self.page_count == 0 {
            return;
        }
        let page = page.min(self.page_count - 1);
        if page == self.current_page {
            return;
        }
        self.enter_page(page);
    }

    pub fn set_analysis_enabled(&mut self, enabled: bool) {
        if self.analysis_enabled == enabled {
            return;
        }
        info!(enabled, "Bubble analysis toggled");
        self.analysis_enabled = enabled;
        if self.wants_analysis() {
            self.request_current();
        } else {
            self.coordinator.cancel_prefetch();
        }
    }

    pub fn set_speech_enabled(&mut self, enabled: bool) {
        self.playback.set_enabled(enabled);
        if self.wants_analysis() {
            self.request_current();
        } else {
            self.coordinator.cancel_prefetch();
        }
    }

    /// Ask for the current page's batch again. Pages that already completed
    /// keep their result.
    pub fn retry_page(&mut self) {
        if self.page_count == 0 {
            return;
        }
        info!(page = self.current_page, "Retrying page analysis");
        self.coordinator.retry_page(self.current_page);
    }

    /// End the session. Consuming `self` runs the [`Drop`] teardown, which
    /// stops speech, clears any pending prefetch and aborts the update pump.
    /// Requests already sent finish in the background.
    pub fn close(self) {
        info!(page = self.current_page, "Closing reading session");
    }

    fn wants_analysis(&self) -> bool {
        self.analysis_enabled || self.playback.is_enabled()
    }

    fn enter_page(&mut self, page: PageIndex) {
        debug!(from = self.current_page, to = page, "Page changed");
        self.current_page = page;
        if self.wants_analysis() {
            self.request_current();
        } else {
            self.coordinator.cancel_prefetch();
        }
        self.playback.on_page_changed(page);
    }

    fn request_current(&self) {
        self.coordinator.on_page_changed(self.current_page);
    }
}

impl Drop for ReaderSession {
    fn drop(&mut self) {
        self.pump.abort();
        self.coordinator.cancel_prefetch();
        self.playback.set_enabled(false);
    }
}

async fn forward_updates(
    mut updates: broadcast::Receiver<CacheUpdate>,
    playback: Arc<PlaybackSynchronizer>,
) {
    loop {
        match updates.recv().await {
            Ok(update) => playback.on_cache_updated(update.page, &update.entry),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Cache update stream lagged; resyncing playback");
                playback.resync();
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
