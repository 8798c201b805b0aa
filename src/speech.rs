//! Speech output for completed replies.
//!
//! The session hands finished text to a [`SpeechSink`] and never waits on
//! it.  [`CommandSpeech`] pipes the text to an external TTS program such as
//! `espeak`; [`NoSpeech`] is used when speech is disabled.

use std::process::Stdio;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::config::SpeechConfig;

pub trait SpeechSink: Send + Sync {
    /// Start speaking `text` and return immediately.
    fn speak(&self, text: &str);
}

#[derive(Debug, Default)]
pub struct NoSpeech;

impl SpeechSink for NoSpeech {
    fn speak(&self, _text: &str) {}
}

/// Runs `command args...` and writes the text to its stdin.
#[derive(Debug, Clone)]
pub struct CommandSpeech {
    command: String,
    args: Vec<String>,
}

impl CommandSpeech {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self { command: command.into(), args }
    }
}

impl SpeechSink for CommandSpeech {
    fn speak(&self, text: &str) {
        let Ok(rt) = tokio::runtime::Handle::try_current() else {
            warn!(command = %self.command, "speech skipped: no async runtime");
            return;
        };
        let command = self.command.clone();
        let args = self.args.clone();
        let text = text.to_string();

        rt.spawn(async move {
            let child = tokio::process::Command::new(&command)
                .args(&args)
                .stdin(Stdio::piped())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .kill_on_drop(false)
                .spawn();
            let mut child = match child {
                Ok(c) => c,
                Err(e) => {
                    warn!(%command, "speech command failed to start: {e}");
                    return;
                }
            };
            if let Some(mut stdin) = child.stdin.take() {
                if let Err(e) = stdin.write_all(text.as_bytes()).await {
                    warn!(%command, "speech stdin write failed: {e}");
                }
            }
            match child.wait().await {
                Ok(status) => debug!(%command, %status, "speech finished"),
                Err(e) => warn!(%command, "speech wait failed: {e}"),
            }
        });
    }
}

/// Construct the configured sink.
pub fn build(config: &SpeechConfig) -> Arc<dyn SpeechSink> {
    if config.enabled {
        Arc::new(CommandSpeech::new(config.command.clone(), config.args.clone()))
    } else {
        Arc::new(NoSpeech)
    }
}
