//! Speech through an external command-line synthesizer.
//!
//! Each utterance runs the configured program once (default `espeak-ng`).
//! A `{text}` placeholder in the arguments is replaced with the utterance;
//! without one the text is written to the program's stdin. Cancelling kills
//! the running process.

use crate::config::AppConfig;
use async_trait::async_trait;
use koma_core::cancellation::CancellationToken;
use koma_core::{SpeechEngine, SpeechError};
use std::process::Stdio;
use std::sync::{Mutex, PoisonError};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, trace};

const TEXT_PLACEHOLDER: &str = "{text}";

pub struct CommandSpeechEngine {
    program: String,
    args: Vec<String>,
    current: Mutex<CancellationToken>,
}

impl CommandSpeechEngine {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            current: Mutex::new(CancellationToken::new()),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(config.speech_command.clone(), config.speech_args.clone())
    }

    fn arm(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = token.clone();
        token
    }
}

/// Arguments with the placeholder filled in, and whether the text still has
/// to go through stdin.
fn build_args(args: &[String], text: &str) -> (Vec<String>, bool) {
    let uses_placeholder = args.iter().any(|arg| arg.contains(TEXT_PLACEHOLDER));
    let filled = args
        .iter()
        .map(|arg| arg.replace(TEXT_PLACEHOLDER, text))
        .collect();
    (filled, !uses_placeholder)
}

#[async_trait]
impl SpeechEngine for CommandSpeechEngine {
    async fn speak(&self, text: &str) -> Result<(), SpeechError> {
        let token = self.arm();
        let (args, via_stdin) = build_args(&self.args, text);
        trace!(program = %self.program, chars = text.len(), "Starting utterance");

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(if via_stdin {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| SpeechError::Spawn(format!("{}: {err}", self.program)))?;

        if let Some(mut stdin) = child.stdin.take() {
            if let Err(err) = stdin.write_all(text.as_bytes()).await {
                debug!("Failed to pass utterance on stdin: {err}");
            }
        }

        tokio::select! {
            _ = token.cancelled() => {
                let _ = child.kill().await;
                Err(SpeechError::Cancelled)
            }
            status = child.wait() => match status {
                Ok(status) if status.success() => Ok(()),
                Ok(status) => Err(SpeechError::Engine(status.to_string())),
                Err(err) => Err(SpeechError::Engine(err.to_string())),
            },
        }
    }

    fn cancel(&self) {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cancel();
    }
}
