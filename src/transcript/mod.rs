//! Transcript persistence: the ordered log of user and assistant messages.
//!
//! Stores are pluggable: `memory` keeps everything in process, `file` writes
//! a JSON log under the work dir, and `sqlite` (feature `transcript-sqlite`)
//! keeps one row per message.  Every store applies the same FIFO cap and
//! hands out monotonically increasing ids.
//!
//! The store trait is blocking; [`TranscriptHandle`] moves each call onto the
//! blocking pool so the session can await it.

pub mod json_file;
pub mod memory;
#[cfg(feature = "transcript-sqlite")]
pub mod sqlite;

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{TranscriptConfig, TranscriptKind};
use crate::error::AppError;

/// Messages kept when no cap is configured.
pub const DEFAULT_CAP: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptMessage {
    pub id: u64,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Blocking transcript store.
pub trait TranscriptStore: Send + Sync {
    /// Unique type name for this store (e.g. `"memory"`).
    fn store_type(&self) -> &str;

    fn append(&self, role: Role, content: &str) -> Result<TranscriptMessage, AppError>;

    /// Replace a message's content.  `Ok(false)` if the id no longer exists.
    fn update(&self, id: u64, content: &str) -> Result<bool, AppError>;

    fn delete(&self, id: u64) -> Result<bool, AppError>;

    /// The last `n` messages, oldest first.
    fn recent(&self, n: usize) -> Result<Vec<TranscriptMessage>, AppError>;

    /// All retained messages, oldest first.
    fn history(&self) -> Result<Vec<TranscriptMessage>, AppError>;

    fn clear(&self) -> Result<(), AppError>;

    fn count(&self) -> Result<usize, AppError>;
}

// ── Shared capped log ─────────────────────────────────────────────────────────

/// In-memory message log used by the memory and file stores.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct TranscriptLog {
    next_id: u64,
    cap: usize,
    messages: Vec<TranscriptMessage>,
}

impl TranscriptLog {
    pub(crate) fn new(cap: usize) -> Self {
        Self { next_id: 1, cap: cap.max(1), messages: Vec::new() }
    }

    pub(crate) fn set_cap(&mut self, cap: usize) {
        self.cap = cap.max(1);
        self.enforce_cap();
    }

    pub(crate) fn append(&mut self, role: Role, content: &str) -> TranscriptMessage {
        let msg = TranscriptMessage {
            id: self.next_id,
            role,
            content: content.to_string(),
            created_at: Utc::now(),
        };
        self.next_id += 1;
        self.messages.push(msg.clone());
        self.enforce_cap();
        msg
    }

    pub(crate) fn update(&mut self, id: u64, content: &str) -> bool {
        match self.messages.iter_mut().find(|m| m.id == id) {
            Some(m) => {
                m.content = content.to_string();
                true
            }
            None => false,
        }
    }

    pub(crate) fn delete(&mut self, id: u64) -> bool {
        let before = self.messages.len();
        self.messages.retain(|m| m.id != id);
        self.messages.len() < before
    }

    pub(crate) fn recent(&self, n: usize) -> Vec<TranscriptMessage> {
        let start = self.messages.len().saturating_sub(n);
        self.messages[start..].to_vec()
    }

    pub(crate) fn history(&self) -> Vec<TranscriptMessage> {
        self.messages.clone()
    }

    /// Drops messages but keeps the id counter, so ids are never reused.
    pub(crate) fn clear(&mut self) {
        self.messages.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.messages.len()
    }

    fn enforce_cap(&mut self) {
        if self.messages.len() > self.cap {
            let excess = self.messages.len() - self.cap;
            self.messages.drain(..excess);
        }
    }
}

// ── Factory ───────────────────────────────────────────────────────────────────

/// Construct the configured transcript store inside `work_dir`.
pub fn build(config: &TranscriptConfig, work_dir: &Path) -> Result<Arc<dyn TranscriptStore>, AppError> {
    let cap = config.cap.unwrap_or(DEFAULT_CAP);
    match config.store {
        TranscriptKind::Memory => Ok(Arc::new(memory::MemoryTranscript::new(cap))),
        TranscriptKind::File => {
            ensure_dir(work_dir)?;
            Ok(Arc::new(json_file::JsonFileTranscript::open(
                &work_dir.join(json_file::FILENAME),
                cap,
            )?))
        }
        #[cfg(feature = "transcript-sqlite")]
        TranscriptKind::Sqlite => {
            ensure_dir(work_dir)?;
            Ok(Arc::new(sqlite::SqliteTranscript::open(
                &work_dir.join(sqlite::DB_FILENAME),
                cap,
            )?))
        }
        #[cfg(not(feature = "transcript-sqlite"))]
        TranscriptKind::Sqlite => Err(AppError::Config(
            "transcript store \"sqlite\" requires building with the transcript-sqlite feature".into(),
        )),
    }
}

fn ensure_dir(dir: &Path) -> Result<(), AppError> {
    std::fs::create_dir_all(dir)
        .map_err(|e| AppError::Transcript(format!("cannot create {}: {e}", dir.display())))
}

// ── Async handle ──────────────────────────────────────────────────────────────

/// Async-safe handle to a transcript store.
///
/// Cheaply cloneable (`Arc`-backed).  Every call runs on
/// `tokio::task::spawn_blocking`.
#[derive(Clone)]
pub struct TranscriptHandle {
    store: Arc<dyn TranscriptStore>,
}

impl TranscriptHandle {
    pub fn new(store: Arc<dyn TranscriptStore>) -> Self {
        Self { store }
    }

    pub fn store_type(&self) -> &str {
        self.store.store_type()
    }

    async fn run<T, F>(&self, op: &'static str, f: F) -> Result<T, AppError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn TranscriptStore) -> Result<T, AppError> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || f(store.as_ref()))
            .await
            .map_err(|e| AppError::Transcript(format!("{op} join: {e}")))?
    }

    pub async fn append(&self, role: Role, content: &str) -> Result<TranscriptMessage, AppError> {
        let content = content.to_string();
        self.run("append", move |s| s.append(role, &content)).await
    }

    pub async fn update(&self, id: u64, content: &str) -> Result<bool, AppError> {
        let content = content.to_string();
        self.run("update", move |s| s.update(id, &content)).await
    }

    pub async fn delete(&self, id: u64) -> Result<bool, AppError> {
        self.run("delete", move |s| s.delete(id)).await
    }

    pub async fn recent(&self, n: usize) -> Result<Vec<TranscriptMessage>, AppError> {
        self.run("recent", move |s| s.recent(n)).await
    }

    pub async fn history(&self) -> Result<Vec<TranscriptMessage>, AppError> {
        self.run("history", |s| s.history()).await
    }

    pub async fn clear(&self) -> Result<(), AppError> {
        self.run("clear", |s| s.clear()).await
    }

    pub async fn count(&self) -> Result<usize, AppError> {
        self.run("count", |s| s.count()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_ids_are_monotonic_across_clear() {
        let mut log = TranscriptLog::new(10);
        let a = log.append(Role::User, "a");
        let b = log.append(Role::Assistant, "b");
        assert!(b.id > a.id);
        log.clear();
        let c = log.append(Role::User, "c");
        assert!(c.id > b.id);
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn log_cap_drops_oldest_first() {
        let mut log = TranscriptLog::new(2);
        log.append(Role::User, "1");
        log.append(Role::Assistant, "2");
        log.append(Role::User, "3");
        let contents: Vec<_> = log.history().into_iter().map(|m| m.content).collect();
        assert_eq!(contents, vec!["2", "3"]);
    }

    #[test]
    fn log_recent_is_oldest_first() {
        let mut log = TranscriptLog::new(10);
        for c in ["a", "b", "c"] {
            log.append(Role::User, c);
        }
        let recent: Vec<_> = log.recent(2).into_iter().map(|m| m.content).collect();
        assert_eq!(recent, vec!["b", "c"]);
        assert_eq!(log.recent(10).len(), 3);
    }

    #[test]
    fn log_update_and_delete_report_presence() {
        let mut log = TranscriptLog::new(10);
        let m = log.append(Role::Assistant, "");
        assert!(log.update(m.id, "done"));
        assert_eq!(log.history()[0].content, "done");
        assert!(log.delete(m.id));
        assert!(!log.delete(m.id));
        assert!(!log.update(m.id, "late"));
    }

    #[test]
    fn role_round_trips_through_str() {
        for r in [Role::User, Role::Assistant] {
            assert_eq!(Role::parse(r.as_str()), Some(r));
        }
        assert_eq!(Role::parse("system"), None);
    }

    #[tokio::test]
    async fn handle_runs_store_calls() {
        let handle = TranscriptHandle::new(Arc::new(memory::MemoryTranscript::new(10)));
        let m = handle.append(Role::User, "hi").await.unwrap();
        assert!(handle.update(m.id, "hello").await.unwrap());
        assert_eq!(handle.count().await.unwrap(), 1);
        assert_eq!(handle.recent(5).await.unwrap()[0].content, "hello");
        handle.clear().await.unwrap();
        assert!(handle.history().await.unwrap().is_empty());
    }

    #[test]
    fn build_file_store_creates_work_dir() {
        let dir = tempfile::tempdir().unwrap();
        let work = dir.path().join("nested");
        let cfg = TranscriptConfig { store: TranscriptKind::File, cap: Some(5) };
        let store = build(&cfg, &work).unwrap();
        assert_eq!(store.store_type(), "file");
        store.append(Role::User, "x").unwrap();
        assert!(work.join(json_file::FILENAME).exists());
    }
}
