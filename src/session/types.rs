//! Value types shared by the session components.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SessionError;

// ── Sampling ─────────────────────────────────────────────────────────────────

/// Per-request sampling parameters.
///
/// Ranges: `temperature` in (0, 2], `top_p` in (0, 1], `top_k` ≥ 0
/// (0 disables top-k), `max_tokens` > 0.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub max_tokens: u32,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 0.9,
            top_k: 40,
            max_tokens: 512,
        }
    }
}

impl SamplingParams {
    pub fn validate(&self) -> Result<(), SessionError> {
        if !(self.temperature > 0.0 && self.temperature <= 2.0) {
            return Err(SessionError::InvalidRequest(format!(
                "temperature must be in (0, 2], got {}",
                self.temperature
            )));
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(SessionError::InvalidRequest(format!(
                "top_p must be in (0, 1], got {}",
                self.top_p
            )));
        }
        if self.max_tokens == 0 {
            return Err(SessionError::InvalidRequest("max_tokens must be > 0".into()));
        }
        Ok(())
    }
}

/// One fully specified generation call.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub params: SamplingParams,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>, params: SamplingParams) -> Self {
        Self { prompt: prompt.into(), params }
    }

    pub fn validate(&self) -> Result<(), SessionError> {
        self.params.validate()
    }
}

// ── Outcome ──────────────────────────────────────────────────────────────────

/// Terminal result of a generation.  Produced exactly once per accepted request.
#[derive(Debug, Clone, PartialEq)]
pub enum GenerationOutcome {
    Completed(String),
    Cancelled(String),
    Failed(SessionError),
}

impl GenerationOutcome {
    /// Generated text, if any. `Failed` has none.
    pub fn text(&self) -> Option<&str> {
        match self {
            GenerationOutcome::Completed(t) | GenerationOutcome::Cancelled(t) => Some(t),
            GenerationOutcome::Failed(_) => None,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, GenerationOutcome::Completed(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            GenerationOutcome::Completed(_) => "completed",
            GenerationOutcome::Cancelled(_) => "cancelled",
            GenerationOutcome::Failed(_) => "failed",
        }
    }
}

// ── Identifiers & events ─────────────────────────────────────────────────────

/// Time-ordered identifier of one generation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GenerationId(Uuid);

impl GenerationId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for GenerationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for GenerationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One streamed token, as seen by session-wide token subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenEvent {
    pub generation: GenerationId,
    /// Zero-based position within its generation.
    pub index: usize,
    pub text: String,
}

// ── Model info ───────────────────────────────────────────────────────────────

/// Read-only snapshot of the loaded model, computed once at load time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelInfo {
    pub name: String,
    pub path: PathBuf,
    pub context_size: u32,
    /// Parameter count guessed from the file name (`"7B"`, `"1.1B"`, `"Unknown"`).
    pub parameter_class: String,
    pub size_bytes: u64,
}

impl ModelInfo {
    pub fn describe(path: &Path, context_size: u32, size_bytes: u64) -> Self {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let parameter_class = estimate_parameter_class(&name);
        Self {
            name,
            path: path.to_path_buf(),
            context_size,
            parameter_class,
            size_bytes,
        }
    }
}

/// Pull a parameter-count tag such as `7b`, `1.1B`, `8x7B` or `135M` out of a
/// model file name.
pub fn estimate_parameter_class(file_name: &str) -> String {
    let stem = file_name
        .strip_suffix(".gguf")
        .or_else(|| file_name.strip_suffix(".GGUF"))
        .unwrap_or(file_name);

    stem.split(['-', '_', ' '])
        .find_map(parameter_tag)
        .unwrap_or_else(|| "Unknown".to_string())
}

fn parameter_tag(token: &str) -> Option<String> {
    let unit = token.chars().last()?.to_ascii_uppercase();
    if unit != 'B' && unit != 'M' {
        return None;
    }
    let count = &token[..token.len() - 1];
    let is_count = |s: &str| {
        !s.is_empty()
            && s.chars().all(|c| c.is_ascii_digit() || c == '.')
            && s.starts_with(|c: char| c.is_ascii_digit())
            && s.matches('.').count() <= 1
            && !s.ends_with('.')
    };
    let valid = match count.split_once(['x', 'X']) {
        Some((experts, size)) => {
            !experts.is_empty() && experts.chars().all(|c| c.is_ascii_digit()) && is_count(size)
        }
        None => is_count(count),
    };
    valid.then(|| format!("{}{unit}", count.to_ascii_lowercase()))
}

// ── Load outcome ─────────────────────────────────────────────────────────────

/// Successful result of [`Session::load_model`](super::Session::load_model).
#[derive(Debug, Clone, PartialEq)]
pub enum LoadOutcome {
    Loaded(ModelInfo),
    /// The same path was already loaded; nothing changed.
    AlreadyLoaded(ModelInfo),
}

impl LoadOutcome {
    pub fn info(&self) -> &ModelInfo {
        match self {
            LoadOutcome::Loaded(i) | LoadOutcome::AlreadyLoaded(i) => i,
        }
    }
}
