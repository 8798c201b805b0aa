//! Generation pipeline: one blocking worker per run, one async driver.
//!
//! The worker runs the backend call on the blocking pool and pushes every
//! token into a bounded channel with `blocking_send`, so a slow consumer
//! stalls the backend instead of losing tokens.  The driver forwards tokens
//! in order and resolves the run to exactly one [`GenerationOutcome`].
//!
//! An optional feed hands each token on to the caller with the same bounded
//! wait, so a caller that reads slowly also stalls the backend.  A feed the
//! caller dropped is ignored; a feed that is still full when the run is
//! cancelled is closed early, leaving the caller a gap-free prefix.
//!
//! On cancel the driver keeps receiving until the worker is outside its token
//! callback, so a token already handed over (even one blocked on a full
//! channel) is delivered, then resolves with `Cancelled(partial)`.  It never
//! waits for the backend itself to return; the worker winds down on its own.
//!
//! The callback marks itself busy before reading the cancel flag, and the
//! driver reads the busy mark after the flag is raised.  Both sides use
//! `SeqCst`, so either the driver sees the callback running or the callback
//! sees the flag and drops the token.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::gateway::{BackendGateway, CancelSignal, ModelLease};
use super::types::{GenerationOutcome, GenerationRequest};
use crate::error::SessionError;

pub const DEFAULT_TOKEN_BUFFER: usize = 64;

#[derive(Debug, Clone)]
pub struct GenerationPipeline {
    token_buffer: usize,
}

impl Default for GenerationPipeline {
    fn default() -> Self {
        Self::new(DEFAULT_TOKEN_BUFFER)
    }
}

impl GenerationPipeline {
    pub fn new(token_buffer: usize) -> Self {
        Self { token_buffer: token_buffer.max(1) }
    }

    pub fn token_buffer(&self) -> usize {
        self.token_buffer
    }

    /// Spawn the worker.  Tokens flow once the returned run is driven.
    pub(crate) fn start(
        &self,
        lease: ModelLease,
        request: GenerationRequest,
        cancel: CancelSignal,
    ) -> TokenRun {
        let (tx, rx) = mpsc::channel::<String>(self.token_buffer);
        let flag = cancel.native_flag();
        let in_callback = Arc::new(AtomicBool::new(false));
        let busy = Arc::clone(&in_callback);

        let worker = tokio::task::spawn_blocking(move || {
            let mut feed = Some(tx);
            let mut on_token = |piece: &str| {
                busy.store(true, Ordering::SeqCst);
                if let Some(tx) = feed.as_ref().filter(|_| !flag.load(Ordering::SeqCst)) {
                    // Fails only once the driver has gone away.
                    if tx.blocking_send(piece.to_string()).is_err() {
                        trace!("token dropped after driver closed");
                    }
                }
                if flag.load(Ordering::SeqCst) {
                    // Closing the feed ends the driver's drain.
                    feed = None;
                }
                busy.store(false, Ordering::SeqCst);
            };
            BackendGateway::generate_blocking(&lease, &request, &flag, &mut on_token)
        });

        TokenRun { rx, worker, cancel, in_callback }
    }
}

/// Sets the native cancel flag when the driver goes away, including when
/// its task is aborted mid-run.
struct StopWorkerOnDrop(Arc<AtomicBool>);

impl Drop for StopWorkerOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// A started run, waiting to be driven.
pub(crate) struct TokenRun {
    rx: mpsc::Receiver<String>,
    worker: JoinHandle<Result<String, SessionError>>,
    cancel: CancelSignal,
    /// Set while the worker is inside its token callback.
    in_callback: Arc<AtomicBool>,
}

impl TokenRun {
    /// Forward tokens to `on_token` (and `feed`, when given) in production
    /// order and resolve the run.
    pub(crate) async fn drive(
        self,
        mut on_token: impl FnMut(&str),
        mut feed: Option<mpsc::Sender<String>>,
    ) -> GenerationOutcome {
        let TokenRun { mut rx, worker, cancel, in_callback } = self;
        let _stop = StopWorkerOnDrop(cancel.native_flag());
        let mut partial = String::new();

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    let mut drained = 0usize;
                    loop {
                        while let Ok(piece) = rx.try_recv() {
                            on_token(&piece);
                            partial.push_str(&piece);
                            offer(&mut feed, piece);
                            drained += 1;
                        }
                        if !in_callback.load(Ordering::SeqCst) {
                            // A send that finished before the mark cleared is queued by now.
                            while let Ok(piece) = rx.try_recv() {
                                on_token(&piece);
                                partial.push_str(&piece);
                                offer(&mut feed, piece);
                                drained += 1;
                            }
                            break;
                        }
                        // The callback sees the flag before it returns and closes the feed.
                        match rx.recv().await {
                            Some(piece) => {
                                on_token(&piece);
                                partial.push_str(&piece);
                                offer(&mut feed, piece);
                                drained += 1;
                            }
                            None => break,
                        }
                    }
                    rx.close();
                    debug!(drained, chars = partial.len(), "generation cancelled");
                    return GenerationOutcome::Cancelled(partial);
                }

                next = rx.recv() => match next {
                    Some(piece) => {
                        on_token(&piece);
                        partial.push_str(&piece);
                        forward(&mut feed, piece, &cancel).await;
                    }
                    None => break,
                },
            }
        }

        // Channel closed: the worker has returned or is about to.
        match worker.await {
            Ok(_) if cancel.is_cancelled() => GenerationOutcome::Cancelled(partial),
            Ok(Ok(text)) => GenerationOutcome::Completed(text),
            Ok(Err(e)) => GenerationOutcome::Failed(e),
            Err(e) => {
                warn!("generation worker failed: {e}");
                GenerationOutcome::Failed(SessionError::BackendGeneration(format!(
                    "generation worker failed: {e}"
                )))
            }
        }
    }
}

/// Wait for room in the caller's feed.  Cancellation abandons the wait and
/// closes the feed.
async fn forward(feed: &mut Option<mpsc::Sender<String>>, piece: String, cancel: &CancelSignal) {
    let Some(tx) = feed.as_ref() else {
        return;
    };
    let keep = tokio::select! {
        biased;
        sent = tx.send(piece) => sent.is_ok(),
        _ = cancel.cancelled() => false,
    };
    if !keep {
        *feed = None;
    }
}

/// Hand over without waiting; a full or dropped feed is closed.
fn offer(feed: &mut Option<mpsc::Sender<String>>, piece: String) {
    if feed.as_ref().is_some_and(|tx| tx.try_send(piece).is_err()) {
        *feed = None;
    }
}
