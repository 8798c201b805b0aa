//! `file` store: the whole transcript as one JSON document.
//!
//! `transcript.json` holds `{ "next_id": N, "cap": N, "messages": [...] }`.
//! Every mutation rewrites the file through a temp file and rename, so a
//! crash mid-write leaves the previous version intact.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use super::{Role, TranscriptLog, TranscriptMessage, TranscriptStore};
use crate::error::AppError;

pub const FILENAME: &str = "transcript.json";

pub struct JsonFileTranscript {
    path: PathBuf,
    log: Mutex<TranscriptLog>,
}

impl JsonFileTranscript {
    /// Open `path`, creating an empty log if the file does not exist yet.
    pub fn open(path: &Path, cap: usize) -> Result<Self, AppError> {
        let mut log = if path.exists() {
            let data = fs::read_to_string(path)
                .map_err(|e| AppError::Transcript(format!("cannot read {}: {e}", path.display())))?;
            serde_json::from_str::<TranscriptLog>(&data)
                .map_err(|e| AppError::Transcript(format!("malformed {}: {e}", path.display())))?
        } else {
            TranscriptLog::new(cap)
        };
        log.set_cap(cap);

        let store = Self { path: path.to_path_buf(), log: Mutex::new(log) };
        store.save(&*store.lock())?;
        Ok(store)
    }

    fn lock(&self) -> MutexGuard<'_, TranscriptLog> {
        self.log.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn save(&self, log: &TranscriptLog) -> Result<(), AppError> {
        let data = serde_json::to_string_pretty(log)
            .map_err(|e| AppError::Transcript(format!("serialise transcript: {e}")))?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, data)
            .map_err(|e| AppError::Transcript(format!("cannot write {}: {e}", tmp.display())))?;
        fs::rename(&tmp, &self.path)
            .map_err(|e| AppError::Transcript(format!("cannot replace {}: {e}", self.path.display())))
    }

    /// Apply `f` to a copy of the log, persist it, then swap it in.
    /// A failed write leaves the in-memory log as it was on disk.
    fn mutate<T>(&self, f: impl FnOnce(&mut TranscriptLog) -> T) -> Result<T, AppError> {
        let mut log = self.lock();
        let mut next = log.clone();
        let out = f(&mut next);
        self.save(&next)?;
        *log = next;
        Ok(out)
    }
}

impl TranscriptStore for JsonFileTranscript {
    fn store_type(&self) -> &str {
        "file"
    }

    fn append(&self, role: Role, content: &str) -> Result<TranscriptMessage, AppError> {
        self.mutate(|log| log.append(role, content))
    }

    fn update(&self, id: u64, content: &str) -> Result<bool, AppError> {
        self.mutate(|log| log.update(id, content))
    }

    fn delete(&self, id: u64) -> Result<bool, AppError> {
        self.mutate(|log| log.delete(id))
    }

    fn recent(&self, n: usize) -> Result<Vec<TranscriptMessage>, AppError> {
        Ok(self.lock().recent(n))
    }

    fn history(&self) -> Result<Vec<TranscriptMessage>, AppError> {
        Ok(self.lock().history())
    }

    fn clear(&self) -> Result<(), AppError> {
        self.mutate(|log| log.clear())
    }

    fn count(&self) -> Result<usize, AppError> {
        Ok(self.lock().len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open(dir: &TempDir, cap: usize) -> JsonFileTranscript {
        JsonFileTranscript::open(&dir.path().join(FILENAME), cap).unwrap()
    }

    #[test]
    fn survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let s = open(&dir, 10);
            s.append(Role::User, "Hello").unwrap();
            let a = s.append(Role::Assistant, "").unwrap();
            s.update(a.id, "Hi").unwrap();
        }
        let s = open(&dir, 10);
        let all = s.history().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].content, "Hi");

        let next = s.append(Role::User, "again").unwrap();
        assert_eq!(next.id, 3);
    }

    #[test]
    fn smaller_cap_on_reopen_trims() {
        let dir = TempDir::new().unwrap();
        {
            let s = open(&dir, 10);
            for i in 0..4 {
                s.append(Role::User, &i.to_string()).unwrap();
            }
        }
        let s = open(&dir, 2);
        let all: Vec<_> = s.history().unwrap().into_iter().map(|m| m.content).collect();
        assert_eq!(all, vec!["2", "3"]);
    }

    #[test]
    fn malformed_file_errors() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(FILENAME);
        fs::write(&path, "not json").unwrap();
        let err = JsonFileTranscript::open(&path, 10).err().unwrap();
        assert!(err.to_string().contains("malformed"));
    }

    #[test]
    fn failed_write_leaves_log_unchanged() {
        let dir = TempDir::new().unwrap();
        let s = open(&dir, 10);
        s.append(Role::User, "kept").unwrap();

        fs::remove_dir_all(dir.path()).unwrap();
        assert!(s.append(Role::Assistant, "lost").is_err());
        assert!(s.clear().is_err());

        let all: Vec<_> = s.history().unwrap().into_iter().map(|m| m.content).collect();
        assert_eq!(all, vec!["kept"]);
        assert_eq!(s.count().unwrap(), 1);
    }

    #[test]
    fn poisoned_lock_is_recovered() {
        let dir = TempDir::new().unwrap();
        let s = std::sync::Arc::new(open(&dir, 10));
        let poisoner = s.clone();
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.log.lock().unwrap();
            panic!("writer died holding the lock");
        })
        .join();

        assert!(s.log.is_poisoned());
        s.append(Role::User, "still works").unwrap();
        assert_eq!(s.count().unwrap(), 1);
    }

    #[test]
    fn no_temp_file_left_behind() {
        let dir = TempDir::new().unwrap();
        let s = open(&dir, 10);
        s.append(Role::User, "x").unwrap();
        assert!(!dir.path().join("transcript.json.tmp").exists());
    }
}
