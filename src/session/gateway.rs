//! Backend gateway and model handles.
//!
//! The gateway is the only code that touches an [`InferenceBackend`].  It
//! checks paths before the backend sees them, moves blocking calls off the
//! async runtime, and translates [`BackendError`] into [`SessionError`].
//!
//! A [`ModelHandle`] is the exclusive owner of one loaded model.  The
//! generation worker borrows the model through a [`ModelLease`]; native
//! calls on one model are serialised by its `busy` lock, and the model is
//! released exactly once, either by [`BackendGateway::unload_model`] or when
//! the last owner drops.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::types::{GenerationRequest, ModelInfo};
use crate::backend::{BackendError, BackendModelId, InferenceBackend, LoadParams};
use crate::error::SessionError;

// ── Model ownership ───────────────────────────────────────────────────────────

struct NativeModel {
    id: BackendModelId,
    backend: Arc<dyn InferenceBackend>,
    busy: Mutex<()>,
    released: AtomicBool,
}

impl NativeModel {
    fn release(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.backend.unload(self.id);
            debug!(backend = self.backend.name(), id = self.id.0, "native model released");
        }
    }
}

impl Drop for NativeModel {
    fn drop(&mut self) {
        self.release();
    }
}

/// Exclusive owner of a loaded model.  Not `Clone`.
pub struct ModelHandle {
    model: Arc<NativeModel>,
}

impl ModelHandle {
    /// Borrow the model for one generation call.
    pub(crate) fn lease(&self) -> ModelLease {
        ModelLease { model: Arc::clone(&self.model) }
    }

    pub fn is_released(&self) -> bool {
        self.model.released.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelHandle")
            .field("id", &self.model.id.0)
            .field("backend", &self.model.backend.name())
            .finish()
    }
}

/// Non-owning borrow held by the generation worker for the length of one call.
pub(crate) struct ModelLease {
    model: Arc<NativeModel>,
}

// ── Cancellation ──────────────────────────────────────────────────────────────

/// Cancel signal for one generation run.
///
/// The token wakes the async driver; the flag is what the blocking backend
/// polls between tokens.  Each run gets a fresh signal, so a late cancel can
/// never reach a newer run.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal {
    token: CancellationToken,
    native: Arc<AtomicBool>,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.native.store(true, Ordering::SeqCst);
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    pub(crate) fn native_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.native)
    }
}

// ── Gateway ───────────────────────────────────────────────────────────────────

/// Result of checking a model path before loading.
#[derive(Debug, Clone)]
pub struct ResolvedFile {
    /// Canonical path, used to recognise a repeat load of the same file.
    pub canonical: PathBuf,
    pub size_bytes: u64,
}

#[derive(Clone)]
pub struct BackendGateway {
    backend: Arc<dyn InferenceBackend>,
}

impl BackendGateway {
    pub fn new(backend: Arc<dyn InferenceBackend>) -> Self {
        Self { backend }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Resolve `path` to an existing regular file.
    pub async fn resolve_file(&self, path: &Path) -> Result<ResolvedFile, SessionError> {
        let not_found = || SessionError::ModelNotFound(path.to_path_buf());
        let meta = tokio::fs::metadata(path).await.map_err(|_| not_found())?;
        if !meta.is_file() {
            return Err(not_found());
        }
        let canonical = tokio::fs::canonicalize(path)
            .await
            .unwrap_or_else(|_| path.to_path_buf());
        Ok(ResolvedFile { canonical, size_bytes: meta.len() })
    }

    /// Load a model on the blocking pool.
    pub async fn load_model(
        &self,
        path: &Path,
        params: LoadParams,
    ) -> Result<(ModelHandle, ModelInfo), SessionError> {
        let file = self.resolve_file(path).await?;
        let backend = Arc::clone(&self.backend);
        let load_path = path.to_path_buf();

        let id = tokio::task::spawn_blocking(move || backend.load(&load_path, &params))
            .await
            .map_err(|e| SessionError::BackendLoad(format!("load task failed: {e}")))?
            .map_err(translate)?;

        let info = ModelInfo::describe(path, params.context_size, file.size_bytes);
        info!(
            backend = self.backend.name(),
            model = %info.name,
            params = %info.parameter_class,
            size_bytes = info.size_bytes,
            "model loaded"
        );
        let handle = ModelHandle {
            model: Arc::new(NativeModel {
                id,
                backend: Arc::clone(&self.backend),
                busy: Mutex::new(()),
                released: AtomicBool::new(false),
            }),
        };
        Ok((handle, info))
    }

    /// Release the model.  Waits for a running native call on it to return
    /// (the caller cancels first), never fails, and is a no-op if the model
    /// was already released.
    pub async fn unload_model(&self, handle: ModelHandle) {
        let model = handle.model;
        let joined = tokio::task::spawn_blocking(move || {
            let _busy = model.busy.lock().unwrap_or_else(|p| p.into_inner());
            model.release();
        })
        .await;
        if let Err(e) = joined {
            warn!("unload task failed: {e}");
        }
    }

    /// Best-effort, non-blocking.
    pub fn request_cancel(&self, signal: &CancelSignal) {
        signal.cancel();
    }

    /// Run one generation.  Blocking; call from a worker thread only.
    pub(crate) fn generate_blocking(
        lease: &ModelLease,
        request: &GenerationRequest,
        cancel: &AtomicBool,
        on_token: &mut dyn FnMut(&str),
    ) -> Result<String, SessionError> {
        let model = &lease.model;
        let _busy = model.busy.lock().unwrap_or_else(|p| p.into_inner());
        if model.released.load(Ordering::Acquire) {
            return Err(SessionError::NoModelLoaded);
        }
        model
            .backend
            .generate(model.id, request, cancel, on_token)
            .map_err(translate)
    }
}

fn translate(e: BackendError) -> SessionError {
    match e {
        BackendError::Load(msg) => SessionError::BackendLoad(msg),
        BackendError::Generation(msg) => SessionError::BackendGeneration(msg),
        BackendError::Cancelled => SessionError::BackendGeneration("cancelled".into()),
    }
}
