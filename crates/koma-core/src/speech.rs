use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SpeechError {
    #[error("failed to start speech engine: {0}")]
    Spawn(String),
    #[error("speech engine exited with {0}")]
    Engine(String),
    #[error("utterance was cancelled")]
    Cancelled,
}

/// Speaks one utterance at a time.
///
/// `speak` resolves when the utterance has finished (or failed). `cancel`
/// stops whatever is playing right now; the pending `speak` call then resolves
/// with [`SpeechError::Cancelled`] or is simply dropped by the caller.
#[async_trait]
pub trait SpeechEngine: Send + Sync {
    async fn speak(&self, text: &str) -> Result<(), SpeechError>;

    fn cancel(&self);
}
