//! Scripted backend: replays a fixed token list.
//!
//! Deterministic stand-in for a native engine.  Tokens can be gated so a
//! caller releases them one at a time, loads can be held open, and failures
//! can be injected on load or after N tokens.  Every call is counted so tests
//! can assert on what reached the backend.

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use super::{BackendError, BackendModelId, InferenceBackend, LoadParams};
use crate::session::GenerationRequest;

const GATE_POLL: Duration = Duration::from_millis(5);

/// What the backend does on its next calls.
#[derive(Debug, Clone, Default)]
pub struct Script {
    pub tokens: Vec<String>,
    /// Fail every load with this message.
    pub fail_load: Option<String>,
    /// Fail with the message once this many tokens have been emitted.
    pub fail_after: Option<(usize, String)>,
    /// Each token waits for a [`ScriptedBackend::release`] permit.
    pub gated: bool,
    /// Each load waits for a [`ScriptedBackend::release_load`] permit.
    pub hold_load: bool,
}

impl Script {
    pub fn tokens<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tokens: tokens.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn gated(mut self) -> Self {
        self.gated = true;
        self
    }

    pub fn hold_load(mut self) -> Self {
        self.hold_load = true;
        self
    }

    pub fn fail_load(mut self, msg: impl Into<String>) -> Self {
        self.fail_load = Some(msg.into());
        self
    }

    pub fn fail_after(mut self, tokens: usize, msg: impl Into<String>) -> Self {
        self.fail_after = Some((tokens, msg.into()));
        self
    }
}

// ── Gate ──────────────────────────────────────────────────────────────────────

/// Counting permit gate.  Waiters poll the cancel flag between short waits.
#[derive(Debug, Default)]
struct Gate {
    permits: Mutex<usize>,
    cv: Condvar,
}

impl Gate {
    fn release(&self, n: usize) {
        let mut p = self.permits.lock().unwrap_or_else(|e| e.into_inner());
        *p = p.saturating_add(n);
        self.cv.notify_all();
    }

    /// Take one permit.  Returns `false` if `cancel` was raised first.
    fn acquire(&self, cancel: &AtomicBool) -> bool {
        let mut p = self.permits.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if cancel.load(Ordering::Acquire) {
                return false;
            }
            if *p > 0 {
                *p -= 1;
                return true;
            }
            p = match self.cv.wait_timeout(p, GATE_POLL) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }
}

// ── Backend ───────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct ScriptedBackend {
    script: Mutex<Script>,
    token_gate: Gate,
    load_gate: Gate,
    next_id: AtomicU64,
    loaded: Mutex<HashSet<u64>>,
    last_request: Mutex<Option<GenerationRequest>>,
    loads: AtomicUsize,
    unloads: AtomicUsize,
    generate_calls: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl ScriptedBackend {
    pub fn new(script: Script) -> Self {
        Self { script: Mutex::new(script), ..Default::default() }
    }

    /// Replace the script used by subsequent calls.
    pub fn set_script(&self, script: Script) {
        *self.script.lock().unwrap_or_else(|e| e.into_inner()) = script;
    }

    /// Let `n` more gated tokens through.
    pub fn release(&self, n: usize) {
        self.token_gate.release(n);
    }

    pub fn release_all(&self) {
        self.token_gate.release(usize::MAX / 2);
    }

    /// Let one held load finish.
    pub fn release_load(&self) {
        self.load_gate.release(1);
    }

    /// Successful loads so far.
    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn unloads(&self) -> usize {
        self.unloads.load(Ordering::SeqCst)
    }

    pub fn generate_calls(&self) -> usize {
        self.generate_calls.load(Ordering::SeqCst)
    }

    /// Highest number of `generate` calls ever in flight at once.
    pub fn max_concurrent_generates(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    /// Models currently loaded and not yet unloaded.
    pub fn resident_models(&self) -> usize {
        self.loaded.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn last_request(&self) -> Option<GenerationRequest> {
        self.last_request.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn current_script(&self) -> Script {
        self.script.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl InferenceBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn load(&self, path: &Path, _params: &LoadParams) -> Result<BackendModelId, BackendError> {
        let script = self.current_script();
        if script.hold_load {
            // Loads have no cancel path; a never-set flag waits for release.
            self.load_gate.acquire(&AtomicBool::new(false));
        }
        if let Some(msg) = script.fail_load {
            return Err(BackendError::Load(format!("{}: {msg}", path.display())));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.loaded.lock().unwrap_or_else(|e| e.into_inner()).insert(id);
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(BackendModelId(id))
    }

    fn generate(
        &self,
        model: BackendModelId,
        request: &GenerationRequest,
        cancel: &AtomicBool,
        on_token: &mut dyn FnMut(&str),
    ) -> Result<String, BackendError> {
        self.generate_calls.fetch_add(1, Ordering::SeqCst);
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        let _active = ActiveGuard(&self.active);

        *self.last_request.lock().unwrap_or_else(|e| e.into_inner()) = Some(request.clone());

        let loaded = self.loaded.lock().unwrap_or_else(|e| e.into_inner()).contains(&model.0);
        if !loaded {
            return Err(BackendError::Generation(format!("model {} is not loaded", model.0)));
        }

        let script = self.current_script();
        let limit = request.params.max_tokens as usize;
        let mut out = String::new();
        let mut emitted = 0;

        for token in script.tokens.iter().take(limit) {
            if let Some((n, msg)) = &script.fail_after {
                if emitted == *n {
                    return Err(BackendError::Generation(msg.clone()));
                }
            }
            if script.gated && !self.token_gate.acquire(cancel) {
                return Err(BackendError::Cancelled);
            }
            if cancel.load(Ordering::Acquire) {
                return Err(BackendError::Cancelled);
            }
            on_token(token);
            out.push_str(token);
            emitted += 1;
        }

        if let Some((n, msg)) = script.fail_after {
            if emitted <= n {
                return Err(BackendError::Generation(msg));
            }
        }
        Ok(out)
    }

    fn unload(&self, model: BackendModelId) {
        if self.loaded.lock().unwrap_or_else(|e| e.into_inner()).remove(&model.0) {
            self.unloads.fetch_add(1, Ordering::SeqCst);
        }
    }
}
