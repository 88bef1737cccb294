//! Sequential utterance task.
//!
//! Runs a list of utterances through a [`SpeechEngine`] strictly one after
//! another and reports progress, so callers never deal with the engine's own
//! callback style. A failed utterance is logged and the sequence moves on.
//! Sequences that share a [`Speaker`] take turns: a new one dispatches nothing
//! until the previous task has returned and dropped its utterance.

use crate::cancellation::CancellationToken;
use crate::speech::{SpeechEngine, SpeechError};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UtteranceEvent {
    Started { index: usize },
    Finished { index: usize, last: bool, failed: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SequenceProgress {
    pub current: Option<usize>,
    pub completed: bool,
    pub cancelled: bool,
}

impl SequenceProgress {
    pub fn is_done(&self) -> bool {
        self.completed || self.cancelled
    }
}

/// Exclusive turn on the speech engine, shared by every sequence of one
/// synchronizer.
#[derive(Debug, Clone, Default)]
pub struct Speaker {
    turn: Arc<tokio::sync::Mutex<()>>,
}

pub struct UtteranceSequence {
    token: CancellationToken,
    progress: watch::Receiver<SequenceProgress>,
    handle: JoinHandle<()>,
}

impl UtteranceSequence {
    /// Start speaking `utterances` on a new task. `on_event` is called from
    /// that task for every start and end; it is never called again once
    /// [`cancel`](Self::cancel) has returned and the task observed it.
    ///
    /// Nothing is dispatched before `speaker` is free. Empty strings are
    /// reported like any other utterance but are not sent to the engine.
    pub fn spawn<F>(
        engine: Arc<dyn SpeechEngine>,
        speaker: &Speaker,
        utterances: Vec<String>,
        on_event: F,
    ) -> Self
    where
        F: Fn(UtteranceEvent) + Send + Sync + 'static,
    {
        let token = CancellationToken::new();
        let (tx, progress) = watch::channel(SequenceProgress::default());
        let handle = tokio::spawn(run_sequence(
            engine,
            speaker.clone(),
            utterances,
            token.clone(),
            tx,
            on_event,
        ));
        Self {
            token,
            progress,
            handle,
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn progress(&self) -> SequenceProgress {
        *self.progress.borrow()
    }

    pub fn is_done(&self) -> bool {
        self.progress().is_done() || self.handle.is_finished()
    }

    /// Wait until the sequence has completed or been cancelled.
    #[cfg(test)]
    pub(crate) async fn wait_done(&mut self) -> SequenceProgress {
        if let Ok(progress) = self.progress.wait_for(SequenceProgress::is_done).await {
            return *progress;
        }
        // Sender dropped: the task is gone either way.
        self.progress()
    }
}

impl Drop for UtteranceSequence {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

async fn run_sequence<F>(
    engine: Arc<dyn SpeechEngine>,
    speaker: Speaker,
    utterances: Vec<String>,
    token: CancellationToken,
    progress: watch::Sender<SequenceProgress>,
    on_event: F,
) where
    F: Fn(UtteranceEvent) + Send + Sync + 'static,
{
    // Held until return, after any in-progress utterance has been dropped.
    let _turn = tokio::select! {
        biased;
        _ = token.cancelled() => {
            mark_cancelled(&progress);
            return;
        }
        turn = speaker.turn.lock() => turn,
    };
    let total = utterances.len();
    for (index, text) in utterances.into_iter().enumerate() {
        if token.check_cancelled("dispatch").is_err() {
            mark_cancelled(&progress);
            return;
        }
        progress.send_modify(|p| p.current = Some(index));
        on_event(UtteranceEvent::Started { index });

        let failed = if text.is_empty() {
            debug!(index, "Skipping empty utterance");
            false
        } else {
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    mark_cancelled(&progress);
                    return;
                }
                result = engine.speak(&text) => match result {
                    Ok(()) => false,
                    Err(SpeechError::Cancelled) if token.is_cancelled() => {
                        mark_cancelled(&progress);
                        return;
                    }
                    Err(err) => {
                        warn!(index, "Utterance failed; continuing with next: {err}");
                        true
                    }
                },
            }
        };

        if token.check_cancelled("finish").is_err() {
            mark_cancelled(&progress);
            return;
        }
        let last = index + 1 == total;
        if last {
            progress.send_modify(|p| p.current = None);
        }
        on_event(UtteranceEvent::Finished {
            index,
            last,
            failed,
        });
    }
    progress.send_modify(|p| {
        p.current = None;
        p.completed = true;
    });
}

fn mark_cancelled(progress: &watch::Sender<SequenceProgress>) {
    progress.send_modify(|p| {
        p.current = None;
        p.cancelled = true;
    });
}
