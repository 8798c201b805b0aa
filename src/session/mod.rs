//! Inference session: the public surface over model lifecycle, generation
//! and transcript.
//!
//! A [`Session`] is constructed once and shared by cloning.  It owns at most
//! one loaded model and runs at most one generation at a time:
//!
//! - `load_model` / `unload_model` move the model axis
//!   (`NoModel → Loading → Loaded`, `Error` on failure).  They are serialised
//!   by a lifecycle lock; a second call while one is running is rejected.
//! - `generate` / `send_message` take the generation slot (`Idle →
//!   Generating`), open a transcript placeholder, and return a [`Generation`]
//!   that streams tokens and resolves to exactly one outcome.  The slot is
//!   released on every exit path.  Once the slot is taken the turn runs on
//!   its own task: a caller that goes away still leaves a finalized reply.
//! - `shutdown` cancels any run, waits for the slot, and unloads the model.
//!
//! Lifecycle work runs on its own task, so dropping a caller's future never
//! strands the session in `Loading`.

pub mod gateway;
pub mod pipeline;
pub mod prompt;
pub mod reconciler;
pub mod state;
pub mod types;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{OwnedMutexGuard, broadcast, mpsc, oneshot, watch};
use tracing::{debug, info, trace, warn};

pub use gateway::{BackendGateway, CancelSignal, ModelHandle};
pub use pipeline::GenerationPipeline;
pub use prompt::PromptBuilder;
pub use reconciler::{FailurePolicy, LiveMessage, TranscriptReconciler};
pub use state::{GenerationState, ModelState, SessionEvent};
pub use types::{
    GenerationId, GenerationOutcome, GenerationRequest, LoadOutcome, ModelInfo, SamplingParams,
    TokenEvent,
};

use crate::backend::{self, InferenceBackend};
use crate::config::{ChatConfig, Config};
use crate::error::{AppError, SessionError};
use crate::settings::SettingsProvider;
use crate::speech::{self, NoSpeech, SpeechSink};
use crate::transcript::{self, Role, TranscriptHandle, TranscriptMessage, TranscriptStore};
use gateway::ModelLease;
use pipeline::TokenRun;
use reconciler::Placeholder;
use state::SessionStateMachine;

// ── Options ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Past messages included in a chat-turn prompt.
    pub history_window: usize,
    pub token_buffer: usize,
    pub on_failure: FailurePolicy,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            history_window: 20,
            token_buffer: pipeline::DEFAULT_TOKEN_BUFFER,
            on_failure: FailurePolicy::Retain,
        }
    }
}

impl From<&ChatConfig> for SessionOptions {
    fn from(chat: &ChatConfig) -> Self {
        Self {
            history_window: chat.history_window,
            token_buffer: chat.token_buffer,
            on_failure: chat.on_failure,
        }
    }
}

// ── Token fan-out ─────────────────────────────────────────────────────────────

/// Tokens a [`TokenStream`] may hold unread before it is detached.
pub const TOKEN_SUBSCRIBER_BUFFER: usize = 1024;

/// Publishing never waits: a subscriber whose buffer is full is dropped.
struct TokenHub {
    capacity: usize,
    subscribers: Mutex<Vec<mpsc::Sender<TokenEvent>>>,
}

impl TokenHub {
    fn new(capacity: usize) -> Self {
        Self { capacity: capacity.max(1), subscribers: Mutex::new(Vec::new()) }
    }

    fn subscribe(&self) -> TokenStream {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.subscribers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(tx);
        TokenStream { rx }
    }

    fn publish(&self, event: TokenEvent) {
        self.subscribers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .retain(|tx| match tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    warn!(generation = %event.generation, index = event.index, "token subscriber fell behind, detached");
                    false
                }
                Err(TrySendError::Closed(_)) => false,
            });
    }
}

/// Every token of every generation, in order and without gaps.
///
/// Ends when the session is dropped, or early if the reader falls
/// [`TOKEN_SUBSCRIBER_BUFFER`] tokens behind.
#[derive(Debug)]
pub struct TokenStream {
    rx: mpsc::Receiver<TokenEvent>,
}

impl TokenStream {
    pub async fn next(&mut self) -> Option<TokenEvent> {
        self.rx.recv().await
    }

    pub fn try_next(&mut self) -> Option<TokenEvent> {
        self.rx.try_recv().ok()
    }
}

// ── Generation handle ─────────────────────────────────────────────────────────

/// Everything known about a finished generation.
#[derive(Debug, Clone)]
pub struct GenerationReport {
    pub id: GenerationId,
    pub outcome: GenerationOutcome,
    /// The finalized assistant message, unless it was deleted or evicted.
    pub message: Option<TranscriptMessage>,
    /// Set when the outcome could not be written to the transcript.
    pub transcript_error: Option<SessionError>,
}

/// An accepted generation.
///
/// Tokens can be read with [`next_token`](Self::next_token) until the run
/// resolves; [`wait`](Self::wait) yields the single terminal report.  The
/// token feed is bounded: a handle that is kept but not read holds the
/// backend back.
#[derive(Debug)]
pub struct Generation {
    id: GenerationId,
    message_id: u64,
    tokens: mpsc::Receiver<String>,
    report: oneshot::Receiver<GenerationReport>,
    cancel: CancelSignal,
}

impl Generation {
    pub fn id(&self) -> GenerationId {
        self.id
    }

    /// Transcript id of the assistant placeholder.
    pub fn message_id(&self) -> u64 {
        self.message_id
    }

    /// Next token of this run, or `None` once it has resolved.
    pub async fn next_token(&mut self) -> Option<String> {
        self.tokens.recv().await
    }

    /// Ask this run to stop.  No effect once it has resolved.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn wait(self) -> Result<GenerationReport, SessionError> {
        let Generation { report, tokens, .. } = self;
        // Unread tokens must not hold the run back.
        drop(tokens);
        report.await.map_err(|_| {
            SessionError::BackendGeneration("generation ended without an outcome".into())
        })
    }

    /// Shorthand for `wait()` when only the outcome matters.
    pub async fn outcome(self) -> GenerationOutcome {
        match self.wait().await {
            Ok(report) => report.outcome,
            Err(e) => GenerationOutcome::Failed(e),
        }
    }
}

// ── Internal state ────────────────────────────────────────────────────────────

struct LoadedModel {
    handle: ModelHandle,
    info: ModelInfo,
    canonical: PathBuf,
}

/// What a run generates from.
enum Turn {
    Prompt(GenerationRequest),
    /// Stored as a user message, then answered from recent history.
    Chat { text: String, params: SamplingParams },
}

#[derive(Debug, Clone)]
struct ActiveRun {
    id: GenerationId,
    cancel: CancelSignal,
}

#[derive(Default)]
struct Core {
    model: Option<LoadedModel>,
    active: Option<ActiveRun>,
    clearing: bool,
    closed: bool,
}

struct SessionInner {
    gateway: BackendGateway,
    pipeline: GenerationPipeline,
    reconciler: TranscriptReconciler,
    transcript: TranscriptHandle,
    settings: Arc<dyn SettingsProvider>,
    speech: Arc<dyn SpeechSink>,
    history_window: usize,
    machine: SessionStateMachine,
    tokens: TokenHub,
    core: Mutex<Core>,
    lifecycle: Arc<tokio::sync::Mutex<()>>,
}

/// Holds the generation slot.  Dropping it releases the slot and moves the
/// generation axis back to `Idle` (through `Error` if the run failed).
struct SlotGuard {
    inner: Arc<SessionInner>,
    run: ActiveRun,
    failed: bool,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        let mut core = self.inner.lock_core();
        if core.active.as_ref().is_some_and(|a| a.id == self.run.id) {
            core.active = None;
        }
        let axis = &self.inner.machine.generation;
        if self.failed {
            let _ = axis.transition(GenerationState::Error);
        }
        let _ = axis.transition(GenerationState::Idle);
    }
}

/// Resets the `clearing` flag however `clear_history` exits.
struct ClearingGuard<'a>(&'a SessionInner);

impl Drop for ClearingGuard<'_> {
    fn drop(&mut self) {
        self.0.lock_core().clearing = false;
    }
}

impl SessionInner {
    fn lock_core(&self) -> MutexGuard<'_, Core> {
        self.core.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn lifecycle_guard(&self) -> Result<OwnedMutexGuard<()>, SessionError> {
        Arc::clone(&self.lifecycle)
            .try_lock_owned()
            .map_err(|_| SessionError::LoadInProgress)
    }

    async fn wait_idle(&self) {
        let mut rx = self.machine.generation.subscribe();
        let _ = rx.wait_for(|s| *s == GenerationState::Idle).await;
    }

    // ── model lifecycle (caller holds the lifecycle lock) ──────────────

    async fn load(&self, path: PathBuf) -> Result<LoadOutcome, SessionError> {
        if self.lock_core().closed {
            return Err(SessionError::ShutDown);
        }
        let file = self.gateway.resolve_file(&path).await.inspect_err(|e| debug!("load rejected: {e}"))?;

        if let Some(m) = self.lock_core().model.as_ref() {
            if m.canonical == file.canonical {
                debug!(model = %m.info.name, "model already loaded");
                return Ok(LoadOutcome::AlreadyLoaded(m.info.clone()));
            }
        }

        if self.release_model().await {
            debug!("previous model released before load");
        }

        self.machine
            .model
            .transition(ModelState::Loading)
            .map_err(|from| SessionError::InvalidRequest(format!("cannot load while {from}")))?;
        info!(path = %path.display(), backend = self.gateway.backend_name(), "loading model");

        match self.gateway.load_model(&path, self.settings.load_params()).await {
            Ok((handle, info)) => {
                self.lock_core().model = Some(LoadedModel {
                    handle,
                    info: info.clone(),
                    canonical: file.canonical,
                });
                let _ = self.machine.model.transition(ModelState::Loaded);
                self.machine.emit(SessionEvent::ModelLoaded(info.clone()));
                Ok(LoadOutcome::Loaded(info))
            }
            Err(e) => {
                warn!(path = %path.display(), "model load failed: {e}");
                let _ = self.machine.model.transition(ModelState::Error);
                self.machine.emit(SessionEvent::LoadFailed(e.clone()));
                Err(e)
            }
        }
    }

    /// Cancel any run, wait for the slot, and unload.  `false` if nothing was loaded.
    async fn release_model(&self) -> bool {
        let (loaded, active) = {
            let mut core = self.lock_core();
            (core.model.take(), core.active.clone())
        };
        let Some(loaded) = loaded else {
            return false;
        };

        if let Some(run) = active {
            debug!(id = %run.id, "cancelling generation before unload");
            self.gateway.request_cancel(&run.cancel);
        }
        self.wait_idle().await;
        self.gateway.unload_model(loaded.handle).await;
        let _ = self.machine.model.transition(ModelState::NoModel);
        info!(model = %loaded.info.name, "model unloaded");
        true
    }

    async fn unload(&self) {
        if !self.release_model().await {
            // Clears a previous load error; no-op when already NoModel.
            let _ = self.machine.model.transition(ModelState::NoModel);
        }
    }

    // ── generation ─────────────────────────────────────────────────────

    fn acquire_slot(self: &Arc<Self>) -> Result<(SlotGuard, ModelLease), SessionError> {
        let mut core = self.lock_core();
        if core.closed {
            return Err(SessionError::ShutDown);
        }
        let lease = match core.model.as_ref() {
            Some(m) if self.machine.model.get() == ModelState::Loaded => m.handle.lease(),
            _ => return Err(SessionError::NoModelLoaded),
        };
        if core.clearing || core.active.is_some() {
            return Err(SessionError::GenerationInProgress);
        }
        self.machine
            .generation
            .transition(GenerationState::Generating)
            .map_err(|_| SessionError::GenerationInProgress)?;

        let run = ActiveRun { id: GenerationId::new(), cancel: CancelSignal::new() };
        core.active = Some(run.clone());
        Ok((SlotGuard { inner: Arc::clone(self), run, failed: false }, lease))
    }

    async fn start(
        self: &Arc<Self>,
        slot: SlotGuard,
        lease: ModelLease,
        turn: Turn,
    ) -> Result<Generation, SessionError> {
        let id = slot.run.id;
        let cancel = slot.run.cancel.clone();
        let (token_tx, token_rx) = mpsc::channel(self.pipeline.token_buffer());
        let (accepted_tx, accepted_rx) = oneshot::channel();
        let (report_tx, report_rx) = oneshot::channel();
        tokio::spawn(Arc::clone(self).run_turn(slot, lease, turn, accepted_tx, token_tx, report_tx));

        let message_id = accepted_rx.await.map_err(|_| {
            SessionError::BackendGeneration("generation task ended before starting".into())
        })??;
        Ok(Generation { id, message_id, tokens: token_rx, report: report_rx, cancel })
    }

    /// Write the turn to the transcript, then drive it to its outcome.
    async fn run_turn(
        self: Arc<Self>,
        slot: SlotGuard,
        lease: ModelLease,
        turn: Turn,
        accepted: oneshot::Sender<Result<u64, SessionError>>,
        token_tx: mpsc::Sender<String>,
        report_tx: oneshot::Sender<GenerationReport>,
    ) {
        let id = slot.run.id;
        let (placeholder, request) = match self.prepare(id, turn).await {
            Ok(prepared) => prepared,
            Err(e) => {
                debug!(%id, "generation not started: {e}");
                let _ = accepted.send(Err(e));
                return;
            }
        };
        let message_id = placeholder.id();

        info!(
            %id,
            message_id,
            prompt_chars = request.prompt.len(),
            max_tokens = request.params.max_tokens,
            "generation started"
        );
        self.machine.emit(SessionEvent::GenerationStarted { id, message_id });
        let _ = accepted.send(Ok(message_id));

        let run = self.pipeline.start(lease, request, slot.run.cancel.clone());
        self.drive(slot, placeholder, run, token_tx, report_tx).await;
    }

    async fn prepare(
        &self,
        id: GenerationId,
        turn: Turn,
    ) -> Result<(Placeholder, GenerationRequest), SessionError> {
        let request = match turn {
            Turn::Prompt(request) => request,
            Turn::Chat { text, params } => {
                let history = self.transcript.recent(self.history_window).await?;
                self.transcript.append(Role::User, &text).await?;
                let prompt = PromptBuilder::new()
                    .system(self.settings.system_prompt())
                    .history(&history)
                    .build(&text);
                GenerationRequest::new(prompt, params)
            }
        };
        let placeholder = self.reconciler.open_placeholder(id).await?;
        Ok((placeholder, request))
    }

    async fn drive(
        self: Arc<Self>,
        mut slot: SlotGuard,
        mut placeholder: Placeholder,
        run: TokenRun,
        token_tx: mpsc::Sender<String>,
        report_tx: oneshot::Sender<GenerationReport>,
    ) {
        let id = slot.run.id;
        let mut produced = 0usize;

        let outcome = run
            .drive(
                |piece| {
                    trace!(%id, index = produced, "token");
                    self.reconciler.push_token(&mut placeholder, piece);
                    self.tokens.publish(TokenEvent {
                        generation: id,
                        index: produced,
                        text: piece.to_string(),
                    });
                    produced += 1;
                },
                Some(token_tx),
            )
            .await;

        let (message, transcript_error) = match self.reconciler.finalize(placeholder, &outcome).await {
            Ok(message) => (message, None),
            Err(e) => {
                warn!(%id, "could not finalize transcript: {e}");
                (None, Some(e))
            }
        };

        match &outcome {
            GenerationOutcome::Completed(text) => {
                info!(%id, tokens = produced, "generation completed");
                let spoken = text.trim();
                if !spoken.is_empty() && self.settings.speech_enabled() {
                    self.speech.speak(spoken);
                }
            }
            GenerationOutcome::Cancelled(_) => info!(%id, tokens = produced, "generation cancelled"),
            GenerationOutcome::Failed(e) => {
                warn!(%id, tokens = produced, "generation failed: {e}");
                slot.failed = true;
            }
        }

        drop(slot);
        self.machine.emit(SessionEvent::GenerationResolved { id, outcome: outcome.label() });
        let _ = report_tx.send(GenerationReport { id, outcome, message, transcript_error });
    }
}

// ── Builder ───────────────────────────────────────────────────────────────────

pub struct SessionBuilder {
    backend: Arc<dyn InferenceBackend>,
    transcript: Arc<dyn TranscriptStore>,
    settings: Arc<dyn SettingsProvider>,
    speech: Arc<dyn SpeechSink>,
    options: SessionOptions,
}

impl SessionBuilder {
    pub fn new(
        backend: Arc<dyn InferenceBackend>,
        transcript: Arc<dyn TranscriptStore>,
        settings: Arc<dyn SettingsProvider>,
    ) -> Self {
        Self {
            backend,
            transcript,
            settings,
            speech: Arc::new(NoSpeech),
            options: SessionOptions::default(),
        }
    }

    pub fn speech(mut self, speech: Arc<dyn SpeechSink>) -> Self {
        self.speech = speech;
        self
    }

    pub fn options(mut self, options: SessionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn build(self) -> Session {
        let transcript = TranscriptHandle::new(self.transcript);
        Session {
            inner: Arc::new(SessionInner {
                gateway: BackendGateway::new(self.backend),
                pipeline: GenerationPipeline::new(self.options.token_buffer),
                reconciler: TranscriptReconciler::new(transcript.clone(), self.options.on_failure),
                transcript,
                settings: self.settings,
                speech: self.speech,
                history_window: self.options.history_window,
                machine: SessionStateMachine::new(),
                tokens: TokenHub::new(TOKEN_SUBSCRIBER_BUFFER),
                core: Mutex::new(Core::default()),
                lifecycle: Arc::new(tokio::sync::Mutex::new(())),
            }),
        }
    }
}

// ── Facade ────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    pub fn builder(
        backend: Arc<dyn InferenceBackend>,
        transcript: Arc<dyn TranscriptStore>,
        settings: Arc<dyn SettingsProvider>,
    ) -> SessionBuilder {
        SessionBuilder::new(backend, transcript, settings)
    }

    /// Wire backend, transcript store and speech from config.
    pub fn from_config(config: &Config, settings: Arc<dyn SettingsProvider>) -> Result<Self, AppError> {
        let backend = backend::build(&config.model)?;
        let store = transcript::build(&config.transcript, &config.work_dir)?;
        info!(
            backend = backend.name(),
            transcript = store.store_type(),
            speech = config.speech.enabled,
            "session configured"
        );
        Ok(SessionBuilder::new(backend, store, settings)
            .speech(speech::build(&config.speech))
            .options(SessionOptions::from(&config.chat))
            .build())
    }

    // ── model ──────────────────────────────────────────────────────────

    /// Load the model at `path`, replacing any other loaded model.
    ///
    /// A missing file fails with `ModelNotFound` before any state changes.
    /// The same file again is a no-op reported as `AlreadyLoaded`.
    pub async fn load_model(&self, path: impl AsRef<Path>) -> Result<LoadOutcome, SessionError> {
        let lifecycle = self.inner.lifecycle_guard()?;
        let inner = Arc::clone(&self.inner);
        let path = path.as_ref().to_path_buf();
        tokio::spawn(async move {
            let _lifecycle = lifecycle;
            inner.load(path).await
        })
        .await
        .map_err(|e| SessionError::BackendLoad(format!("load task failed: {e}")))?
    }

    /// Unload the current model.  Cancels a running generation first.
    /// Idempotent.
    pub async fn unload_model(&self) -> Result<(), SessionError> {
        let lifecycle = self.inner.lifecycle_guard()?;
        if self.inner.lock_core().closed {
            return Err(SessionError::ShutDown);
        }
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let _lifecycle = lifecycle;
            inner.unload().await;
        })
        .await
        .map_err(|e| SessionError::BackendLoad(format!("unload task failed: {e}")))
    }

    // ── generation ─────────────────────────────────────────────────────

    /// Generate from a raw prompt with the current sampling settings.
    pub async fn generate(&self, prompt: impl Into<String>) -> Result<Generation, SessionError> {
        let request = GenerationRequest::new(prompt, self.inner.settings.sampling());
        self.generate_with(request).await
    }

    /// Generate from a fully specified request.
    pub async fn generate_with(&self, request: GenerationRequest) -> Result<Generation, SessionError> {
        request.validate()?;
        let (slot, lease) = self.inner.acquire_slot()?;
        self.inner.start(slot, lease, Turn::Prompt(request)).await
    }

    /// One chat turn: store the user message, build a prompt from recent
    /// history, and generate the reply.
    pub async fn send_message(&self, text: &str) -> Result<Generation, SessionError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(SessionError::InvalidRequest("message is empty".into()));
        }
        let params = self.inner.settings.sampling();
        params.validate()?;

        let (slot, lease) = self.inner.acquire_slot()?;
        let turn = Turn::Chat { text: text.to_string(), params };
        self.inner.start(slot, lease, turn).await
    }

    /// Cancel the running generation, if any.  Returns whether one was running.
    pub fn cancel_generation(&self) -> bool {
        let core = self.inner.lock_core();
        match &core.active {
            Some(run) => {
                info!(id = %run.id, "cancel requested");
                self.inner.gateway.request_cancel(&run.cancel);
                true
            }
            None => false,
        }
    }

    // ── transcript ─────────────────────────────────────────────────────

    pub async fn history(&self) -> Result<Vec<TranscriptMessage>, SessionError> {
        Ok(self.inner.transcript.history().await?)
    }

    /// Remove every message.  Rejected while a generation is running.
    pub async fn clear_history(&self) -> Result<(), SessionError> {
        {
            let mut core = self.inner.lock_core();
            if core.closed {
                return Err(SessionError::ShutDown);
            }
            if core.active.is_some() || core.clearing {
                return Err(SessionError::GenerationInProgress);
            }
            core.clearing = true;
        }
        let _clearing = ClearingGuard(self.inner.as_ref());
        self.inner.transcript.clear().await?;
        info!("transcript cleared");
        Ok(())
    }

    // ── observation ────────────────────────────────────────────────────

    pub fn model_state(&self) -> ModelState {
        self.inner.machine.model.get()
    }

    pub fn generation_state(&self) -> GenerationState {
        self.inner.machine.generation.get()
    }

    pub fn model_info(&self) -> Option<ModelInfo> {
        self.inner.lock_core().model.as_ref().map(|m| m.info.clone())
    }

    pub fn subscribe_model_state(&self) -> watch::Receiver<ModelState> {
        self.inner.machine.model.subscribe()
    }

    pub fn subscribe_generation_state(&self) -> watch::Receiver<GenerationState> {
        self.inner.machine.generation.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.machine.subscribe_events()
    }

    pub fn subscribe_tokens(&self) -> TokenStream {
        self.inner.tokens.subscribe()
    }

    /// The message currently being streamed, if any.
    pub fn subscribe_live(&self) -> watch::Receiver<Option<LiveMessage>> {
        self.inner.reconciler.subscribe_live()
    }

    // ── teardown ───────────────────────────────────────────────────────

    /// Cancel any generation, unload the model, and refuse further work.
    /// Safe to call more than once.
    pub async fn shutdown(&self) {
        let lifecycle = Arc::clone(&self.inner.lifecycle).lock_owned().await;
        let inner = Arc::clone(&self.inner);
        let done = tokio::spawn(async move {
            let _lifecycle = lifecycle;
            let active = {
                let mut core = inner.lock_core();
                core.closed = true;
                core.active.clone()
            };
            if let Some(run) = active {
                inner.gateway.request_cancel(&run.cancel);
            }
            inner.unload().await;
            inner.wait_idle().await;
        })
        .await;
        match done {
            Ok(()) => info!("session shut down"),
            Err(e) => warn!("shutdown task failed: {e}"),
        }
    }
}
