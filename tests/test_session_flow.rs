//! End-to-end session flows against the scripted backend and in-memory transcript.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hearth::backend::scripted::{Script, ScriptedBackend};
use hearth::config::Config;
use hearth::session::{
    FailurePolicy, GenerationOutcome, GenerationState, LoadOutcome, ModelState, Session,
    SessionEvent, SessionOptions,
};
use hearth::settings::LiveSettings;
use hearth::speech::SpeechSink;
use hearth::transcript::Role;
use hearth::transcript::memory::MemoryTranscript;
use hearth::SessionError;
use tempfile::TempDir;

// ── harness ───────────────────────────────────────────────────────────────────

#[derive(Default)]
struct RecordingSpeech(Mutex<Vec<String>>);

impl SpeechSink for RecordingSpeech {
    fn speak(&self, text: &str) {
        self.0.lock().unwrap().push(text.to_string());
    }
}

impl RecordingSpeech {
    fn spoken(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

struct Harness {
    session: Session,
    backend: Arc<ScriptedBackend>,
    speech: Arc<RecordingSpeech>,
    dir: TempDir,
}

impl Harness {
    fn new(script: Script) -> Self {
        Self::with_options(script, SessionOptions::default())
    }

    fn with_options(script: Script, options: SessionOptions) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(ScriptedBackend::new(script));
        let settings = LiveSettings::from_config(&Config::test_default(dir.path()));
        settings.set_speech_enabled(true);
        let speech = Arc::new(RecordingSpeech::default());
        let session = Session::builder(
            backend.clone(),
            Arc::new(MemoryTranscript::new(100)),
            Arc::new(settings),
        )
        .speech(speech.clone())
        .options(options)
        .build();
        Self { session, backend, speech, dir }
    }

    /// Create a fake model file in the temp dir.
    fn model(&self, name: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, b"GGUF").unwrap();
        path
    }

    async fn loaded(script: Script) -> Self {
        let h = Self::new(script);
        let path = h.model("tiny-1.1B.gguf");
        h.session.load_model(&path).await.unwrap();
        h
    }
}

async fn within<F: std::future::Future>(f: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), f)
        .await
        .expect("timed out")
}

fn hi_there() -> Script {
    Script::tokens(["Hi", " there", "!"])
}

// ── model lifecycle ───────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_model_is_not_found_and_state_is_unchanged() {
    let h = Harness::new(hi_there());
    let mut events = h.session.subscribe_events();

    let err = h.session.load_model(Path::new("/no/such/model.gguf")).await.unwrap_err();
    assert_eq!(err, SessionError::ModelNotFound(PathBuf::from("/no/such/model.gguf")));
    assert_eq!(h.session.model_state(), ModelState::NoModel);
    assert_eq!(h.backend.loads(), 0);
    assert!(events.try_recv().is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn load_reports_model_info() {
    let h = Harness::new(hi_there());
    let path = h.model("tinyllama-1.1b-chat.Q4_K_M.gguf");

    let outcome = h.session.load_model(&path).await.unwrap();
    let LoadOutcome::Loaded(info) = outcome else {
        panic!("expected a fresh load");
    };
    assert_eq!(info.name, "tinyllama-1.1b-chat.Q4_K_M.gguf");
    assert_eq!(info.parameter_class, "1.1B");
    assert_eq!(info.size_bytes, 4);
    assert_eq!(h.session.model_state(), ModelState::Loaded);
    assert_eq!(h.session.model_info(), Some(info));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn same_path_is_already_loaded() {
    let h = Harness::loaded(hi_there()).await;
    let path = h.dir.path().join("tiny-1.1B.gguf");

    let again = h.session.load_model(&path).await.unwrap();
    assert!(matches!(again, LoadOutcome::AlreadyLoaded(_)));
    assert_eq!(h.backend.loads(), 1);
    assert_eq!(h.backend.unloads(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn load_failure_then_retry_succeeds() {
    let h = Harness::new(Script::default().fail_load("bad magic"));
    let path = h.model("broken-7b.gguf");

    let err = h.session.load_model(&path).await.unwrap_err();
    assert!(matches!(err, SessionError::BackendLoad(_)));
    assert_eq!(h.session.model_state(), ModelState::Error);
    assert_eq!(h.session.model_info(), None);

    h.backend.set_script(hi_there());
    let retry = h.session.load_model(&path).await.unwrap();
    assert!(matches!(retry, LoadOutcome::Loaded(_)));
    assert_eq!(h.session.model_state(), ModelState::Loaded);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn different_model_unloads_previous_first() {
    let h = Harness::loaded(hi_there()).await;
    let mut model_states = Vec::new();
    let mut events = h.session.subscribe_events();

    let other = h.model("other-3b.gguf");
    h.session.load_model(&other).await.unwrap();

    while let Ok(e) = events.try_recv() {
        if let SessionEvent::ModelState { to, .. } = e {
            model_states.push(to);
        }
    }
    assert_eq!(model_states, [ModelState::NoModel, ModelState::Loading, ModelState::Loaded]);
    assert_eq!(h.backend.unloads(), 1);
    assert_eq!(h.backend.resident_models(), 1);
    assert_eq!(h.session.model_info().unwrap().name, "other-3b.gguf");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reload_cancels_running_generation() {
    let h = Harness::loaded(hi_there().gated()).await;
    let g = h.session.generate("Hello").await.unwrap();

    let other = h.model("other-3b.gguf");
    within(h.session.load_model(&other)).await.unwrap();

    assert_eq!(within(g.outcome()).await, GenerationOutcome::Cancelled(String::new()));
    assert_eq!(h.session.generation_state(), GenerationState::Idle);
    assert_eq!(h.backend.resident_models(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unload_is_idempotent_and_blocks_generation() {
    let h = Harness::loaded(hi_there()).await;
    h.session.unload_model().await.unwrap();
    h.session.unload_model().await.unwrap();

    assert_eq!(h.session.model_state(), ModelState::NoModel);
    assert_eq!(h.backend.unloads(), 1);
    assert_eq!(h.session.generate("x").await.unwrap_err(), SessionError::NoModelLoaded);
}

// ── generation ────────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn chat_turn_completes_and_persists() {
    let h = Harness::loaded(hi_there()).await;

    let mut g = h.session.send_message("Hello").await.unwrap();
    let mut streamed = Vec::new();
    while let Some(t) = within(g.next_token()).await {
        streamed.push(t);
    }
    let report = within(g.wait()).await.unwrap();

    assert_eq!(streamed, ["Hi", " there", "!"]);
    assert_eq!(report.outcome, GenerationOutcome::Completed("Hi there!".into()));
    assert_eq!(report.message.unwrap().content, "Hi there!");
    assert!(report.transcript_error.is_none());
    assert_eq!(h.session.generation_state(), GenerationState::Idle);

    let history = h.session.history().await.unwrap();
    let turns: Vec<_> = history.iter().map(|m| (m.role, m.content.as_str())).collect();
    assert_eq!(turns, [(Role::User, "Hello"), (Role::Assistant, "Hi there!")]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dropped_caller_still_gets_a_finalized_turn() {
    let h = Harness::loaded(hi_there().gated()).await;
    let mut generation = h.session.subscribe_generation_state();

    // One poll takes the slot; the caller then gives up on the reply.
    let _ = tokio::time::timeout(Duration::ZERO, h.session.send_message("Hello")).await;
    h.backend.release_all();
    within(generation.wait_for(|s| *s == GenerationState::Idle)).await.unwrap();

    let history = h.session.history().await.unwrap();
    let turns: Vec<_> = history.iter().map(|m| (m.role, m.content.as_str())).collect();
    assert_eq!(turns, [(Role::User, "Hello"), (Role::Assistant, "Hi there!")]);

    // Nothing is left holding the slot.
    let next = h.session.generate("again").await.unwrap();
    assert!(within(next.outcome()).await.is_completed());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unread_generation_handle_still_resolves() {
    let tokens: Vec<String> = (0..40).map(|i| format!("{i} ")).collect();
    let options = SessionOptions { token_buffer: 1, ..Default::default() };
    let h = Harness::with_options(Script::tokens(tokens.clone()), options);
    h.session.load_model(h.model("tiny-1.1B.gguf")).await.unwrap();

    // The handle's feed fills after one token; waiting drops it and lets the run finish.
    let g = h.session.generate("x").await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    let report = within(g.wait()).await.unwrap();
    assert_eq!(report.outcome, GenerationOutcome::Completed(tokens.concat()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancel_after_first_token_keeps_partial() {
    let h = Harness::loaded(hi_there().gated()).await;
    let mut g = h.session.send_message("Hello").await.unwrap();

    h.backend.release(1);
    assert_eq!(within(g.next_token()).await.as_deref(), Some("Hi"));
    assert!(h.session.cancel_generation());

    let report = within(g.wait()).await.unwrap();
    assert_eq!(report.outcome, GenerationOutcome::Cancelled("Hi".into()));
    assert_eq!(h.session.generation_state(), GenerationState::Idle);
    let history = h.session.history().await.unwrap();
    assert_eq!(history.last().unwrap().content, "Hi");

    // The slot is free again.
    h.backend.release_all();
    let next = h.session.generate("again").await.unwrap();
    assert!(within(next.outcome()).await.is_completed());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancel_before_any_token_is_empty() {
    let h = Harness::loaded(hi_there().gated()).await;
    let g = h.session.send_message("Hello").await.unwrap();
    g.cancel();

    assert_eq!(within(g.outcome()).await, GenerationOutcome::Cancelled(String::new()));
    let history = h.session.history().await.unwrap();
    assert_eq!(history.last().unwrap().role, Role::Assistant);
    assert_eq!(history.last().unwrap().content, "");
    assert!(!h.session.cancel_generation());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn second_generation_is_rejected_while_running() {
    let h = Harness::loaded(hi_there().gated()).await;
    let g = h.session.generate("first").await.unwrap();

    assert_eq!(h.session.generate("second").await.unwrap_err(), SessionError::GenerationInProgress);
    assert_eq!(
        h.session.send_message("second").await.unwrap_err(),
        SessionError::GenerationInProgress
    );

    h.backend.release_all();
    assert!(within(g.outcome()).await.is_completed());
    assert_eq!(h.backend.generate_calls(), 1);
    assert_eq!(h.backend.max_concurrent_generates(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn many_concurrent_callers_get_one_slot() {
    let h = Harness::loaded(hi_there().gated()).await;
    let mut tasks = Vec::new();
    for i in 0..8 {
        let s = h.session.clone();
        tasks.push(tokio::spawn(async move { s.generate(format!("p{i}")).await }));
    }
    let mut accepted = Vec::new();
    for t in tasks {
        match t.await.unwrap() {
            Ok(g) => accepted.push(g),
            Err(e) => assert_eq!(e, SessionError::GenerationInProgress),
        }
    }
    assert_eq!(accepted.len(), 1);
    h.backend.release_all();
    for g in accepted {
        within(g.outcome()).await;
    }
    assert_eq!(h.backend.max_concurrent_generates(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn backend_failure_passes_through_error_state() {
    let h = Harness::loaded(hi_there().fail_after(1, "gpu lost")).await;
    let mut events = h.session.subscribe_events();

    let report = within(h.session.send_message("Hello").await.unwrap().wait()).await.unwrap();
    assert_eq!(
        report.outcome,
        GenerationOutcome::Failed(SessionError::BackendGeneration("gpu lost".into()))
    );
    assert_eq!(report.message.unwrap().content, "Hi");
    assert_eq!(h.session.generation_state(), GenerationState::Idle);

    let mut axis = Vec::new();
    loop {
        match within(events.recv()).await.unwrap() {
            SessionEvent::GenerationState { to, .. } => axis.push(to),
            SessionEvent::GenerationResolved { outcome, .. } => {
                assert_eq!(outcome, "failed");
                break;
            }
            _ => {}
        }
    }
    assert_eq!(axis, [GenerationState::Generating, GenerationState::Error, GenerationState::Idle]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_placeholder_deleted_under_delete_policy() {
    let options = SessionOptions { on_failure: FailurePolicy::Delete, ..Default::default() };
    let h = Harness::with_options(hi_there().fail_after(0, "boom"), options);
    let path = h.model("m.gguf");
    h.session.load_model(&path).await.unwrap();

    let report = within(h.session.send_message("Hello").await.unwrap().wait()).await.unwrap();
    assert!(matches!(report.outcome, GenerationOutcome::Failed(_)));
    assert!(report.message.is_none());

    let history = h.session.history().await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].role, Role::User);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn empty_message_is_rejected() {
    let h = Harness::loaded(hi_there()).await;
    assert!(matches!(
        h.session.send_message("   ").await,
        Err(SessionError::InvalidRequest(_))
    ));
    assert!(h.session.history().await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn prompt_carries_system_and_history() {
    let h = Harness::loaded(hi_there()).await;
    within(h.session.send_message("first").await.unwrap().wait()).await.unwrap();
    within(h.session.send_message("second").await.unwrap().wait()).await.unwrap();

    let prompt = h.backend.last_request().unwrap().prompt;
    assert!(prompt.starts_with("System: "), "{prompt}");
    assert!(
        prompt.ends_with("User: first\nAssistant: Hi there!\nUser: second\nAssistant:"),
        "{prompt}"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn live_message_tracks_stream() {
    let h = Harness::loaded(hi_there().gated()).await;
    let live = h.session.subscribe_live();
    let mut g = h.session.send_message("Hello").await.unwrap();

    h.backend.release(1);
    within(g.next_token()).await;
    {
        let current = live.borrow();
        let current = current.as_ref().unwrap();
        assert_eq!(current.message_id, g.message_id());
        assert_eq!(current.content, "Hi");
    }

    h.backend.release_all();
    within(g.wait()).await.unwrap();
    assert!(live.borrow().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn token_subscribers_see_every_run_in_order() {
    let h = Harness::loaded(hi_there()).await;
    let mut tokens = h.session.subscribe_tokens();

    let first = h.session.generate("a").await.unwrap();
    let first_id = first.id();
    within(first.wait()).await.unwrap();
    let second = h.session.generate("b").await.unwrap();
    let second_id = second.id();
    within(second.wait()).await.unwrap();

    let mut seen = Vec::new();
    while let Some(e) = tokens.try_next() {
        seen.push((e.generation, e.index, e.text));
    }
    assert_eq!(seen.len(), 6);
    assert!(seen[..3].iter().all(|(g, _, _)| *g == first_id));
    assert!(seen[3..].iter().all(|(g, _, _)| *g == second_id));
    assert_eq!(seen[3].1, 0);
    assert_eq!(seen[5].2, "!");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn speech_only_for_completed_replies() {
    let h = Harness::loaded(hi_there().gated()).await;

    let g = h.session.send_message("one").await.unwrap();
    g.cancel();
    within(g.wait()).await.unwrap();
    assert!(h.speech.spoken().is_empty());

    h.backend.release_all();
    within(h.session.send_message("two").await.unwrap().wait()).await.unwrap();
    assert_eq!(h.speech.spoken(), ["Hi there!"]);
}

// ── teardown ──────────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_cancels_and_unloads() {
    let h = Harness::loaded(hi_there().gated()).await;
    let g = h.session.send_message("Hello").await.unwrap();

    within(h.session.shutdown()).await;

    assert_eq!(within(g.outcome()).await, GenerationOutcome::Cancelled(String::new()));
    assert_eq!(h.session.model_state(), ModelState::NoModel);
    assert_eq!(h.session.generation_state(), GenerationState::Idle);
    assert_eq!(h.backend.resident_models(), 0);
    assert_eq!(h.session.send_message("again").await.unwrap_err(), SessionError::ShutDown);
    assert_eq!(h.session.clear_history().await.unwrap_err(), SessionError::ShutDown);
}
