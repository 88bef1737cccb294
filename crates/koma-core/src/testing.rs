//! Hand-written fakes for the service ports, shared by the unit tests.

use crate::analysis::{AnalysisError, AnalysisService, PageImage, PageSource, RawBubble};
use crate::model::PageIndex;
use crate::speech::{SpeechEngine, SpeechError};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, mpsc};

type Responder =
    Box<dyn Fn(&[PageIndex]) -> Result<Vec<Vec<RawBubble>>, AnalysisError> + Send + Sync>;

pub(crate) fn raw(text: &str, ymin: f64, xmin: f64) -> RawBubble {
    RawBubble {
        text: text.to_string(),
        box_2d: vec![ymin, xmin, ymin + 40.0, xmin + 40.0],
    }
}

/// Wait for a channel item without hanging the test forever.
async fn recv_within<T>(rx: &tokio::sync::Mutex<mpsc::UnboundedReceiver<T>>) -> T {
    let mut rx = rx.lock().await;
    tokio::time::timeout(Duration::from_secs(30), rx.recv())
        .await
        .expect("timed out waiting for fake call")
        .expect("fake call channel closed")
}

pub(crate) struct FakeAnalysis {
    respond: Responder,
    gated: bool,
    release: Notify,
    calls: Mutex<Vec<Vec<PageIndex>>>,
    calls_tx: mpsc::UnboundedSender<Vec<PageIndex>>,
    calls_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<PageIndex>>>,
}

impl FakeAnalysis {
    fn build(gated: bool, respond: Responder) -> Arc<Self> {
        let (calls_tx, calls_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            respond,
            gated,
            release: Notify::new(),
            calls: Mutex::new(Vec::new()),
            calls_tx,
            calls_rx: tokio::sync::Mutex::new(calls_rx),
        })
    }

    /// Every page gets a single bubble whose text is `page <n>`.
    pub(crate) fn one_bubble_per_page() -> Arc<Self> {
        Self::build(false, Box::new(one_bubble_each))
    }

    pub(crate) fn gated_one_bubble_per_page() -> Arc<Self> {
        Self::build(true, Box::new(one_bubble_each))
    }

    pub(crate) fn responding<F>(respond: F) -> Arc<Self>
    where
        F: Fn(&[PageIndex]) -> Result<Vec<Vec<RawBubble>>, AnalysisError> + Send + Sync + 'static,
    {
        Self::build(false, Box::new(respond))
    }

    pub(crate) fn failing() -> Arc<Self> {
        Self::build(
            false,
            Box::new(|_| Err(AnalysisError::Transport("connection reset".to_string()))),
        )
    }

    pub(crate) fn calls(&self) -> Vec<Vec<PageIndex>> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub(crate) async fn next_call(&self) -> Vec<PageIndex> {
        recv_within(&self.calls_rx).await
    }

    /// Let one gated request return.
    pub(crate) fn release_one(&self) {
        self.release.notify_one();
    }
}

fn one_bubble_each(pages: &[PageIndex]) -> Result<Vec<Vec<RawBubble>>, AnalysisError> {
    Ok(pages
        .iter()
        .map(|page| vec![raw(&format!("page {page}"), 100.0, 100.0)])
        .collect())
}

#[async_trait]
impl AnalysisService for FakeAnalysis {
    async fn analyze(&self, pages: &[PageImage]) -> Result<Vec<Vec<RawBubble>>, AnalysisError> {
        let indices: Vec<PageIndex> = pages.iter().map(|image| image.page).collect();
        self.calls.lock().unwrap().push(indices.clone());
        let _ = self.calls_tx.send(indices.clone());
        if self.gated {
            self.release.notified().await;
        } else {
            tokio::task::yield_now().await;
        }
        (self.respond)(&indices)
    }
}

pub(crate) struct FakePages {
    count: usize,
    broken: Option<PageIndex>,
}

impl FakePages {
    pub(crate) fn new(count: usize) -> Arc<Self> {
        Arc::new(Self {
            count,
            broken: None,
        })
    }

    pub(crate) fn with_broken_page(count: usize, broken: PageIndex) -> Arc<Self> {
        Arc::new(Self {
            count,
            broken: Some(broken),
        })
    }
}

#[async_trait]
impl PageSource for FakePages {
    fn page_count(&self) -> usize {
        self.count
    }

    async fn load(&self, page: PageIndex) -> Result<PageImage, AnalysisError> {
        if self.broken == Some(page) || page >= self.count {
            return Err(AnalysisError::PageLoad {
                page,
                reason: "unreadable image".to_string(),
            });
        }
        Ok(PageImage {
            page,
            mime_type: "image/png".to_string(),
            data: vec![page as u8],
        })
    }
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Speech engine that records every utterance. In gated mode each utterance
/// lasts until the test calls [`ScriptedSpeech::finish_current`].
pub(crate) struct ScriptedSpeech {
    gated: bool,
    spoken: Mutex<Vec<String>>,
    fail_on: Mutex<HashSet<String>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
    cancels: AtomicUsize,
    finish: Notify,
    cancel_notify: Notify,
    calls_tx: mpsc::UnboundedSender<String>,
    calls_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>,
}

impl ScriptedSpeech {
    fn build(gated: bool) -> Arc<Self> {
        let (calls_tx, calls_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            gated,
            spoken: Mutex::new(Vec::new()),
            fail_on: Mutex::new(HashSet::new()),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            cancels: AtomicUsize::new(0),
            finish: Notify::new(),
            cancel_notify: Notify::new(),
            calls_tx,
            calls_rx: tokio::sync::Mutex::new(calls_rx),
        })
    }

    pub(crate) fn instant() -> Arc<Self> {
        Self::build(false)
    }

    pub(crate) fn gated() -> Arc<Self> {
        Self::build(true)
    }

    pub(crate) fn fail_on(&self, text: &str) {
        self.fail_on.lock().unwrap().insert(text.to_string());
    }

    pub(crate) fn spoken(&self) -> Vec<String> {
        self.spoken.lock().unwrap().clone()
    }

    pub(crate) fn max_concurrent(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub(crate) fn cancel_count(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }

    pub(crate) async fn next_call(&self) -> String {
        recv_within(&self.calls_rx).await
    }

    pub(crate) fn finish_current(&self) {
        self.finish.notify_one();
    }
}

#[async_trait]
impl SpeechEngine for ScriptedSpeech {
    async fn speak(&self, text: &str) -> Result<(), SpeechError> {
        self.spoken.lock().unwrap().push(text.to_string());
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = ActiveGuard(&self.active);
        self.max_active.fetch_max(now_active, Ordering::SeqCst);
        let _ = self.calls_tx.send(text.to_string());

        if self.gated {
            tokio::select! {
                _ = self.finish.notified() => {}
                _ = self.cancel_notify.notified() => return Err(SpeechError::Cancelled),
            }
        } else {
            tokio::task::yield_now().await;
        }

        if self.fail_on.lock().unwrap().contains(text) {
            return Err(SpeechError::Engine("scripted failure".to_string()));
        }
        Ok(())
    }

    fn cancel(&self) {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        self.cancel_notify.notify_waiters();
    }
}
