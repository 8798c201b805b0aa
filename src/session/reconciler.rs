//! Transcript reconciler: ties one streaming generation to one assistant
//! message in the transcript.
//!
//! The placeholder is written before the first token is requested.  Tokens
//! only touch memory and the live-message watch; the store is written once
//! more, when the run resolves.

use serde::Deserialize;
use tokio::sync::watch;
use tracing::warn;

use super::types::{GenerationId, GenerationOutcome};
use crate::error::SessionError;
use crate::transcript::{Role, TranscriptHandle, TranscriptMessage};

/// What happens to the assistant placeholder when a generation fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Keep it with whatever partial text arrived.
    #[default]
    Retain,
    /// Remove it from the transcript.
    Delete,
}

/// The message currently being streamed into, for incremental rendering.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveMessage {
    pub message_id: u64,
    pub generation: GenerationId,
    pub content: String,
}

/// An open placeholder and its in-memory accumulator.
#[derive(Debug)]
pub struct Placeholder {
    message: TranscriptMessage,
    generation: GenerationId,
}

impl Placeholder {
    pub fn id(&self) -> u64 {
        self.message.id
    }

    pub fn content(&self) -> &str {
        &self.message.content
    }
}

pub struct TranscriptReconciler {
    transcript: TranscriptHandle,
    live: watch::Sender<Option<LiveMessage>>,
    on_failure: FailurePolicy,
}

impl TranscriptReconciler {
    pub fn new(transcript: TranscriptHandle, on_failure: FailurePolicy) -> Self {
        let (live, _) = watch::channel(None);
        Self { transcript, live, on_failure }
    }

    pub fn subscribe_live(&self) -> watch::Receiver<Option<LiveMessage>> {
        self.live.subscribe()
    }

    /// Persist an empty assistant message and mark it live.
    pub async fn open_placeholder(&self, generation: GenerationId) -> Result<Placeholder, SessionError> {
        let message = self.transcript.append(Role::Assistant, "").await?;
        self.live.send_replace(Some(LiveMessage {
            message_id: message.id,
            generation,
            content: String::new(),
        }));
        Ok(Placeholder { message, generation })
    }

    pub fn push_token(&self, placeholder: &mut Placeholder, token: &str) {
        placeholder.message.content.push_str(token);
        self.live.send_modify(|live| {
            if let Some(m) = live.as_mut().filter(|m| m.generation == placeholder.generation) {
                m.content.push_str(token);
            }
        });
    }

    /// Write the terminal content and clear the live marker.
    ///
    /// Returns the stored message, or `None` if it was deleted by the failure
    /// policy or is gone from the store.
    pub async fn finalize(
        &self,
        placeholder: Placeholder,
        outcome: &GenerationOutcome,
    ) -> Result<Option<TranscriptMessage>, SessionError> {
        let result = self.persist(placeholder, outcome).await;
        self.live.send_replace(None);
        result
    }

    async fn persist(
        &self,
        placeholder: Placeholder,
        outcome: &GenerationOutcome,
    ) -> Result<Option<TranscriptMessage>, SessionError> {
        let mut message = placeholder.message;
        message.content = match outcome {
            GenerationOutcome::Completed(text) => text.trim().to_string(),
            GenerationOutcome::Cancelled(partial) => partial.clone(),
            GenerationOutcome::Failed(_) => match self.on_failure {
                FailurePolicy::Retain => message.content,
                FailurePolicy::Delete => {
                    self.transcript.delete(message.id).await?;
                    return Ok(None);
                }
            },
        };

        if self.transcript.update(message.id, &message.content).await? {
            Ok(Some(message))
        } else {
            warn!(id = message.id, "placeholder evicted before it could be finalized");
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcript::memory::MemoryTranscript;
    use std::sync::Arc;

    fn reconciler(policy: FailurePolicy) -> (TranscriptReconciler, TranscriptHandle) {
        let handle = TranscriptHandle::new(Arc::new(MemoryTranscript::new(100)));
        (TranscriptReconciler::new(handle.clone(), policy), handle)
    }

    async fn stream(r: &TranscriptReconciler, tokens: &[&str]) -> Placeholder {
        let mut p = r.open_placeholder(GenerationId::new()).await.unwrap();
        for t in tokens {
            r.push_token(&mut p, t);
        }
        p
    }

    #[tokio::test]
    async fn placeholder_is_empty_assistant_message() {
        let (r, store) = reconciler(FailurePolicy::Retain);
        let p = r.open_placeholder(GenerationId::new()).await.unwrap();
        let all = store.history().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, p.id());
        assert_eq!(all[0].role, Role::Assistant);
        assert_eq!(all[0].content, "");
    }

    #[tokio::test]
    async fn tokens_update_live_not_store() {
        let (r, store) = reconciler(FailurePolicy::Retain);
        let live = r.subscribe_live();
        let p = stream(&r, &["Hi", " there"]).await;

        assert_eq!(p.content(), "Hi there");
        assert_eq!(live.borrow().as_ref().unwrap().content, "Hi there");
        assert_eq!(store.history().await.unwrap()[0].content, "");
    }

    #[tokio::test]
    async fn completed_is_trimmed() {
        let (r, store) = reconciler(FailurePolicy::Retain);
        let live = r.subscribe_live();
        let p = stream(&r, &[" Hi", " there!\n"]).await;
        let msg = r
            .finalize(p, &GenerationOutcome::Completed(" Hi there!\n".into()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.content, "Hi there!");
        assert_eq!(store.history().await.unwrap()[0].content, "Hi there!");
        assert!(live.borrow().is_none());
    }

    #[tokio::test]
    async fn cancelled_keeps_partial_exactly() {
        let (r, store) = reconciler(FailurePolicy::Retain);
        let p = stream(&r, &["The answer is "]).await;
        r.finalize(p, &GenerationOutcome::Cancelled("The answer is ".into()))
            .await
            .unwrap();
        assert_eq!(store.history().await.unwrap()[0].content, "The answer is ");
    }

    #[tokio::test]
    async fn failed_retains_partial_by_default() {
        let (r, store) = reconciler(FailurePolicy::Retain);
        let p = stream(&r, &["par"]).await;
        let failed = GenerationOutcome::Failed(SessionError::BackendGeneration("x".into()));
        let msg = r.finalize(p, &failed).await.unwrap().unwrap();
        assert_eq!(msg.content, "par");
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn failed_deletes_under_delete_policy() {
        let (r, store) = reconciler(FailurePolicy::Delete);
        let live = r.subscribe_live();
        let p = stream(&r, &["par"]).await;
        let failed = GenerationOutcome::Failed(SessionError::BackendGeneration("x".into()));
        assert!(r.finalize(p, &failed).await.unwrap().is_none());
        assert_eq!(store.count().await.unwrap(), 0);
        assert!(live.borrow().is_none());
    }

    #[tokio::test]
    async fn evicted_placeholder_yields_none() {
        let (r, store) = reconciler(FailurePolicy::Retain);
        let p = stream(&r, &["x"]).await;
        store.clear().await.unwrap();
        let out = r.finalize(p, &GenerationOutcome::Completed("x".into())).await.unwrap();
        assert!(out.is_none());
    }
}
