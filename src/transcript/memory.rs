//! `memory` store: in-process transcript, discarded when the process exits.

use std::sync::{Mutex, MutexGuard};

use super::{Role, TranscriptLog, TranscriptMessage, TranscriptStore};
use crate::error::AppError;

pub struct MemoryTranscript {
    log: Mutex<TranscriptLog>,
}

impl MemoryTranscript {
    pub fn new(cap: usize) -> Self {
        Self { log: Mutex::new(TranscriptLog::new(cap)) }
    }

    fn log(&self) -> MutexGuard<'_, TranscriptLog> {
        self.log.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl TranscriptStore for MemoryTranscript {
    fn store_type(&self) -> &str {
        "memory"
    }

    fn append(&self, role: Role, content: &str) -> Result<TranscriptMessage, AppError> {
        Ok(self.log().append(role, content))
    }

    fn update(&self, id: u64, content: &str) -> Result<bool, AppError> {
        Ok(self.log().update(id, content))
    }

    fn delete(&self, id: u64) -> Result<bool, AppError> {
        Ok(self.log().delete(id))
    }

    fn recent(&self, n: usize) -> Result<Vec<TranscriptMessage>, AppError> {
        Ok(self.log().recent(n))
    }

    fn history(&self) -> Result<Vec<TranscriptMessage>, AppError> {
        Ok(self.log().history())
    }

    fn clear(&self) -> Result<(), AppError> {
        self.log().clear();
        Ok(())
    }

    fn count(&self) -> Result<usize, AppError> {
        Ok(self.log().len())
    }
}
