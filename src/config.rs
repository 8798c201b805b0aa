//! Configuration loading with env-var overrides.
//!
//! Reads `config/default.toml` relative to the current working directory (or
//! the file named by `HEARTH_CONFIG`), then applies `HEARTH_WORK_DIR`,
//! `HEARTH_LOG_LEVEL` and `HEARTH_MODEL_PATH` env overrides.

use std::{
    env, fs,
    path::{Path, PathBuf},
};

use serde::Deserialize;

use crate::backend::LoadParams;
use crate::error::AppError;
use crate::session::{FailurePolicy, SamplingParams};

/// Model and backend selection (`[model]`).
#[derive(Debug, Clone)]
pub struct ModelConfig {
    /// Backend name: `"echo"`, `"scripted"` or `"llama"`.
    pub backend: String,
    /// Model to load at startup, if any.
    pub path: Option<PathBuf>,
    pub context_size: u32,
    pub threads: u32,
    pub gpu: bool,
    /// Artificial per-token delay for the echo backend.
    pub token_delay_ms: u64,
    /// Token list replayed by the scripted backend.
    pub script: Vec<String>,
}

impl ModelConfig {
    pub fn load_params(&self) -> LoadParams {
        LoadParams {
            context_size: self.context_size,
            threads: self.threads,
            use_gpu: self.gpu,
        }
    }
}

/// Chat-turn behaviour (`[chat]`).
#[derive(Debug, Clone)]
pub struct ChatConfig {
    pub system_prompt: String,
    /// How many past messages feed the prompt.
    pub history_window: usize,
    /// Capacity of the worker -> driver token channel.
    pub token_buffer: usize,
    pub on_failure: FailurePolicy,
}

/// Which transcript store backs the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TranscriptKind {
    Memory,
    File,
    Sqlite,
}

#[derive(Debug, Clone)]
pub struct TranscriptConfig {
    pub store: TranscriptKind,
    /// Maximum retained messages; oldest are dropped first.
    pub cap: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct SpeechConfig {
    pub enabled: bool,
    pub command: String,
    pub args: Vec<String>,
}

/// Fully-resolved configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub name: String,
    /// Working directory for all persistent data (already expanded, no `~`).
    pub work_dir: PathBuf,
    pub log_level: String,
    /// Log file (absolute, or relative to `work_dir`). `None` logs to stderr.
    pub log_file: Option<PathBuf>,
    pub model: ModelConfig,
    pub sampling: SamplingParams,
    pub chat: ChatConfig,
    pub transcript: TranscriptConfig,
    pub speech: SpeechConfig,
}

/// Env-sourced overrides.  Tests build these directly instead of mutating env vars.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub work_dir: Option<String>,
    pub log_level: Option<String>,
    pub model_path: Option<String>,
}

impl Overrides {
    pub fn from_env() -> Self {
        Self {
            work_dir: env::var("HEARTH_WORK_DIR").ok(),
            log_level: env::var("HEARTH_LOG_LEVEL").ok(),
            model_path: env::var("HEARTH_MODEL_PATH").ok(),
        }
    }
}

// ── raw TOML shape ───────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct RawConfig {
    session: RawSession,
    #[serde(default)]
    model: RawModel,
    #[serde(default)]
    sampling: RawSampling,
    #[serde(default)]
    chat: RawChat,
    #[serde(default)]
    transcript: RawTranscript,
    #[serde(default)]
    speech: RawSpeech,
}

#[derive(Deserialize)]
struct RawSession {
    #[serde(default = "default_name")]
    name: String,
    work_dir: String,
    #[serde(default = "default_log_level")]
    log_level: String,
    #[serde(default)]
    log_file: Option<String>,
}

#[derive(Deserialize)]
struct RawModel {
    #[serde(default = "default_backend")]
    backend: String,
    #[serde(default)]
    path: Option<String>,
    #[serde(default = "default_context_size")]
    context_size: u32,
    #[serde(default = "default_threads")]
    threads: u32,
    #[serde(default)]
    gpu: bool,
    #[serde(default)]
    token_delay_ms: u64,
    #[serde(default)]
    script: Vec<String>,
}

impl Default for RawModel {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            path: None,
            context_size: default_context_size(),
            threads: default_threads(),
            gpu: false,
            token_delay_ms: 0,
            script: Vec::new(),
        }
    }
}

#[derive(Deserialize)]
#[serde(default)]
struct RawSampling {
    temperature: f32,
    top_p: f32,
    top_k: u32,
    max_tokens: u32,
}

impl Default for RawSampling {
    fn default() -> Self {
        let d = SamplingParams::default();
        Self {
            temperature: d.temperature,
            top_p: d.top_p,
            top_k: d.top_k,
            max_tokens: d.max_tokens,
        }
    }
}

#[derive(Deserialize)]
struct RawChat {
    #[serde(default = "default_system_prompt")]
    system_prompt: String,
    #[serde(default = "default_history_window")]
    history_window: usize,
    #[serde(default = "default_token_buffer")]
    token_buffer: usize,
    #[serde(default)]
    on_failure: FailurePolicy,
}

impl Default for RawChat {
    fn default() -> Self {
        Self {
            system_prompt: default_system_prompt(),
            history_window: default_history_window(),
            token_buffer: default_token_buffer(),
            on_failure: FailurePolicy::default(),
        }
    }
}

#[derive(Deserialize)]
struct RawTranscript {
    #[serde(default = "default_transcript_store")]
    store: TranscriptKind,
    #[serde(default)]
    cap: Option<usize>,
}

impl Default for RawTranscript {
    fn default() -> Self {
        Self { store: default_transcript_store(), cap: None }
    }
}

#[derive(Deserialize)]
struct RawSpeech {
    #[serde(default)]
    enabled: bool,
    #[serde(default = "default_speech_command")]
    command: String,
    #[serde(default)]
    args: Vec<String>,
}

impl Default for RawSpeech {
    fn default() -> Self {
        Self { enabled: false, command: default_speech_command(), args: Vec::new() }
    }
}

fn default_name() -> String { "hearth".to_string() }
fn default_log_level() -> String { "info".to_string() }
fn default_backend() -> String { "echo".to_string() }
fn default_context_size() -> u32 { 2048 }
fn default_threads() -> u32 { 4 }
fn default_system_prompt() -> String {
    "You are a helpful AI assistant. Provide accurate and helpful responses.".to_string()
}
fn default_history_window() -> usize { 20 }
fn default_token_buffer() -> usize { 64 }
fn default_speech_command() -> String { "espeak".to_string() }

fn default_transcript_store() -> TranscriptKind {
    if cfg!(feature = "transcript-sqlite") {
        TranscriptKind::Sqlite
    } else {
        TranscriptKind::File
    }
}

// ── loading ──────────────────────────────────────────────────────────────────

/// Load config from `HEARTH_CONFIG` or `config/default.toml`, then apply env-var overrides.
pub fn load() -> Result<Config, AppError> {
    let path = env::var("HEARTH_CONFIG").unwrap_or_else(|_| "config/default.toml".to_string());
    load_from(Path::new(&path), &Overrides::from_env())
}

/// Internal loader: accepts an explicit path and overrides.
pub fn load_from(path: &Path, overrides: &Overrides) -> Result<Config, AppError> {
    let raw = fs::read_to_string(path)
        .map_err(|e| AppError::Config(format!("cannot read {}: {e}", path.display())))?;

    let parsed: RawConfig = toml::from_str(&raw)
        .map_err(|e| AppError::Config(format!("parse error in {}: {e}", path.display())))?;

    let s = parsed.session;
    let work_dir = expand_home(overrides.work_dir.as_deref().unwrap_or(&s.work_dir));
    let log_level = overrides.log_level.clone().unwrap_or(s.log_level);
    let log_file = s.log_file.map(|p| relative_to(&work_dir, &p));

    let model_path = overrides
        .model_path
        .as_deref()
        .or(parsed.model.path.as_deref())
        .filter(|p| !p.trim().is_empty())
        .map(expand_home);

    let sampling = SamplingParams {
        temperature: parsed.sampling.temperature,
        top_p: parsed.sampling.top_p,
        top_k: parsed.sampling.top_k,
        max_tokens: parsed.sampling.max_tokens,
    };
    sampling
        .validate()
        .map_err(|e| AppError::Config(format!("[sampling] {e}")))?;

    if parsed.chat.token_buffer == 0 {
        return Err(AppError::Config("[chat] token_buffer must be > 0".into()));
    }
    if parsed.transcript.cap == Some(0) {
        return Err(AppError::Config("[transcript] cap must be > 0 when set".into()));
    }

    Ok(Config {
        name: s.name,
        work_dir,
        log_level,
        log_file,
        model: ModelConfig {
            backend: parsed.model.backend,
            path: model_path,
            context_size: parsed.model.context_size,
            threads: parsed.model.threads,
            gpu: parsed.model.gpu,
            token_delay_ms: parsed.model.token_delay_ms,
            script: parsed.model.script,
        },
        sampling,
        chat: ChatConfig {
            system_prompt: parsed.chat.system_prompt,
            history_window: parsed.chat.history_window,
            token_buffer: parsed.chat.token_buffer,
            on_failure: parsed.chat.on_failure,
        },
        transcript: TranscriptConfig {
            store: parsed.transcript.store,
            cap: parsed.transcript.cap,
        },
        speech: SpeechConfig {
            enabled: parsed.speech.enabled,
            command: parsed.speech.command,
            args: parsed.speech.args,
        },
    })
}

fn relative_to(base: &Path, path: &str) -> PathBuf {
    let p = expand_home(path);
    if p.is_absolute() { p } else { base.join(p) }
}

/// Expand a leading `~` to the user's home directory.
/// Absolute or relative paths without `~` are returned unchanged.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    PathBuf::from(path)
}

// ── test helpers ──────────────────────────────────────────────────────────────

/// Safe `Config` for tests: in-memory transcript, echo backend, no speech.
impl Config {
    pub fn test_default(work_dir: &Path) -> Self {
        Self {
            name: "test".into(),
            work_dir: work_dir.to_path_buf(),
            log_level: "info".into(),
            log_file: None,
            model: ModelConfig {
                backend: "echo".into(),
                path: None,
                context_size: default_context_size(),
                threads: 1,
                gpu: false,
                token_delay_ms: 0,
                script: Vec::new(),
            },
            sampling: SamplingParams::default(),
            chat: ChatConfig {
                system_prompt: default_system_prompt(),
                history_window: default_history_window(),
                token_buffer: default_token_buffer(),
                on_failure: FailurePolicy::Retain,
            },
            transcript: TranscriptConfig { store: TranscriptKind::Memory, cap: None },
            speech: SpeechConfig {
                enabled: false,
                command: default_speech_command(),
                args: Vec::new(),
            },
        }
    }
}
