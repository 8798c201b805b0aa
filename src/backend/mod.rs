//! Inference backends.
//!
//! An [`InferenceBackend`] owns native model resources and runs blocking
//! token generation.  The session never calls it directly; everything goes
//! through [`BackendGateway`](crate::session::gateway::BackendGateway), which
//! moves calls onto the blocking pool and enforces the one-call-per-handle rule.
//!
//! `build(config)` is the factory, called at startup.
//! Adding a new backend = new module + new match arm.

pub mod echo;
#[cfg(feature = "backend-llama")]
pub mod llama;
pub mod pieces;
pub mod scripted;

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use thiserror::Error;

use crate::config::ModelConfig;
use crate::error::AppError;
use crate::session::GenerationRequest;

// ── Error ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("load failed: {0}")]
    Load(String),
    #[error("generation failed: {0}")]
    Generation(String),
    /// The cancel flag was observed before the backend could finish.
    #[error("cancelled")]
    Cancelled,
}

// ── Types ─────────────────────────────────────────────────────────────────────

/// Opaque id of a model loaded inside one backend instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BackendModelId(pub u64);

/// Native load parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadParams {
    pub context_size: u32,
    pub threads: u32,
    pub use_gpu: bool,
}

impl Default for LoadParams {
    fn default() -> Self {
        Self { context_size: 2048, threads: 4, use_gpu: false }
    }
}

// ── Trait ─────────────────────────────────────────────────────────────────────

/// Blocking interface to a native inference engine.
///
/// Implementations may be called from any blocking-pool thread, but never
/// concurrently for the same model id.
pub trait InferenceBackend: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    fn load(&self, path: &Path, params: &LoadParams) -> Result<BackendModelId, BackendError>;

    /// Run one generation, reporting each token piece through `on_token`.
    ///
    /// Must check `cancel` between tokens and return promptly once it is set,
    /// either with the text so far or with [`BackendError::Cancelled`].
    fn generate(
        &self,
        model: BackendModelId,
        request: &GenerationRequest,
        cancel: &AtomicBool,
        on_token: &mut dyn FnMut(&str),
    ) -> Result<String, BackendError>;

    /// Release native resources.  Unknown ids are ignored.
    fn unload(&self, model: BackendModelId);
}

/// Construct the configured backend.
pub fn build(config: &ModelConfig) -> Result<Arc<dyn InferenceBackend>, AppError> {
    match config.backend.as_str() {
        "echo" => Ok(Arc::new(echo::EchoBackend::new(config.token_delay_ms))),
        "scripted" => Ok(Arc::new(scripted::ScriptedBackend::new(scripted::Script::tokens(
            config.script.iter().map(String::as_str),
        )))),
        #[cfg(feature = "backend-llama")]
        "llama" => Ok(Arc::new(llama::LlamaBackend::new()?)),
        #[cfg(not(feature = "backend-llama"))]
        "llama" => Err(AppError::Config(
            "backend \"llama\" requires building with the backend-llama feature".into(),
        )),
        other => Err(AppError::Config(format!("unknown backend: {other}"))),
    }
}
