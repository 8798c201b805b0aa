//! Echo backend: streams the last user turn back word by word, prefixed
//! with `[echo]`.  Lets the console and the session run end-to-end without
//! a native engine or model weights.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use super::{BackendError, BackendModelId, InferenceBackend, LoadParams};
use crate::session::GenerationRequest;

const SLEEP_SLICE: Duration = Duration::from_millis(5);

#[derive(Debug, Default)]
pub struct EchoBackend {
    token_delay: Duration,
    next_id: AtomicU64,
    loaded: Mutex<HashSet<u64>>,
}

impl EchoBackend {
    pub fn new(token_delay_ms: u64) -> Self {
        Self {
            token_delay: Duration::from_millis(token_delay_ms),
            ..Default::default()
        }
    }

    fn is_loaded(&self, id: BackendModelId) -> bool {
        self.loaded
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains(&id.0)
    }

    /// Sleep for the token delay in short slices so cancellation stays prompt.
    fn pause(&self, cancel: &AtomicBool) {
        let mut left = self.token_delay;
        while !left.is_zero() && !cancel.load(Ordering::Acquire) {
            let step = left.min(SLEEP_SLICE);
            std::thread::sleep(step);
            left -= step;
        }
    }
}

/// The text after the last `User:` line, or the whole prompt.
fn last_user_turn(prompt: &str) -> &str {
    prompt
        .lines()
        .rev()
        .find_map(|l| l.strip_prefix("User:"))
        .unwrap_or(prompt)
        .trim()
}

impl InferenceBackend for EchoBackend {
    fn name(&self) -> &'static str {
        "echo"
    }

    fn load(&self, path: &Path, _params: &LoadParams) -> Result<BackendModelId, BackendError> {
        if !path.is_file() {
            return Err(BackendError::Load(format!("{} is not a file", path.display())));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.loaded
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(id);
        Ok(BackendModelId(id))
    }

    fn generate(
        &self,
        model: BackendModelId,
        request: &GenerationRequest,
        cancel: &AtomicBool,
        on_token: &mut dyn FnMut(&str),
    ) -> Result<String, BackendError> {
        if !self.is_loaded(model) {
            return Err(BackendError::Generation(format!("model {} is not loaded", model.0)));
        }

        let words = std::iter::once("[echo]").chain(last_user_turn(&request.prompt).split_whitespace());
        let mut out = String::new();
        for (i, word) in words.take(request.params.max_tokens as usize).enumerate() {
            self.pause(cancel);
            if cancel.load(Ordering::Acquire) {
                return Err(BackendError::Cancelled);
            }
            let piece = if i == 0 { word.to_string() } else { format!(" {word}") };
            on_token(&piece);
            out.push_str(&piece);
        }
        Ok(out)
    }

    fn unload(&self, model: BackendModelId) {
        self.loaded
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&model.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SamplingParams;
    use tempfile::NamedTempFile;

    fn loaded() -> (EchoBackend, BackendModelId, NamedTempFile) {
        let file = NamedTempFile::new().unwrap();
        let b = EchoBackend::new(0);
        let id = b.load(file.path(), &LoadParams::default()).unwrap();
        (b, id, file)
    }

    fn run(b: &EchoBackend, id: BackendModelId, prompt: &str, max_tokens: u32) -> (Result<String, BackendError>, Vec<String>) {
        let params = SamplingParams { max_tokens, ..Default::default() };
        let mut seen = Vec::new();
        let res = b.generate(id, &GenerationRequest::new(prompt, params), &AtomicBool::new(false), &mut |t| {
            seen.push(t.to_string())
        });
        (res, seen)
    }

    #[test]
    fn echoes_last_user_turn() {
        let (b, id, _f) = loaded();
        let prompt = "System: be nice\n\nUser: old\nAssistant: x\nUser: hello there\nAssistant:";
        let (res, seen) = run(&b, id, prompt, 512);
        assert_eq!(res.unwrap(), "[echo] hello there");
        assert_eq!(seen, vec!["[echo]", " hello", " there"]);
    }

    #[test]
    fn honours_max_tokens() {
        let (b, id, _f) = loaded();
        let (res, _) = run(&b, id, "one two three four", 2);
        assert_eq!(res.unwrap(), "[echo] one");
    }

    #[test]
    fn observes_cancel_flag() {
        let (b, id, _f) = loaded();
        let cancel = AtomicBool::new(true);
        let res = b.generate(id, &GenerationRequest::new("hi", SamplingParams::default()), &cancel, &mut |_| {});
        assert_eq!(res, Err(BackendError::Cancelled));
    }

    #[test]
    fn unknown_model_fails() {
        let (b, id, _f) = loaded();
        b.unload(id);
        let (res, _) = run(&b, id, "hi", 8);
        assert!(matches!(res, Err(BackendError::Generation(_))));
    }

    #[test]
    fn load_rejects_missing_file() {
        let b = EchoBackend::new(0);
        assert!(matches!(
            b.load(Path::new("/no/such/model.gguf"), &LoadParams::default()),
            Err(BackendError::Load(_))
        ));
    }
}
