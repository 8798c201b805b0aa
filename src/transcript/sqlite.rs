//! `sqlite` store: one row per message in `transcript.db`.
//!
//! `AUTOINCREMENT` keeps ids monotonic even after deletes and clears.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, Row, params};

use super::{Role, TranscriptMessage, TranscriptStore};
use crate::error::AppError;

pub const DB_FILENAME: &str = "transcript.db";

const SCHEMA_VERSION: i64 = 1;

pub struct SqliteTranscript {
    conn: Mutex<Connection>,
    cap: usize,
}

impl SqliteTranscript {
    pub fn open(db_path: &Path, cap: usize) -> Result<Self, AppError> {
        let conn = Connection::open(db_path)
            .map_err(|e| AppError::Transcript(format!("sqlite: open {}: {e}", db_path.display())))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| AppError::Transcript(format!("sqlite: set journal_mode WAL: {e}")))?;
        conn.pragma_update(None, "busy_timeout", 5000)
            .map_err(|e| AppError::Transcript(format!("sqlite: set busy_timeout: {e}")))?;
        Self::init_schema(&conn)?;

        let store = Self { conn: Mutex::new(conn), cap: cap.max(1) };
        store.enforce_cap(&*store.conn())?;
        Ok(store)
    }

    /// Open a private in-memory database.
    pub fn in_memory(cap: usize) -> Result<Self, AppError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| AppError::Transcript(format!("sqlite: open in-memory: {e}")))?;
        Self::init_schema(&conn)?;
        Ok(Self { conn: Mutex::new(conn), cap: cap.max(1) })
    }

    fn init_schema(conn: &Connection) -> Result<(), AppError> {
        let version: i64 = conn
            .query_row("PRAGMA user_version;", [], |row| row.get(0))
            .map_err(|e| AppError::Transcript(format!("sqlite: read schema version: {e}")))?;

        match version {
            0 => conn
                .execute_batch(
                    "
                    CREATE TABLE IF NOT EXISTS chat_messages (
                        id INTEGER PRIMARY KEY AUTOINCREMENT,
                        role TEXT NOT NULL,
                        content TEXT NOT NULL,
                        created_at TEXT NOT NULL
                    );

                    PRAGMA user_version = 1;
                    ",
                )
                .map_err(|e| AppError::Transcript(format!("sqlite: initialize schema: {e}"))),
            SCHEMA_VERSION => Ok(()),
            other => Err(AppError::Transcript(format!(
                "sqlite: unsupported schema version {other}, expected {SCHEMA_VERSION}"
            ))),
        }
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn enforce_cap(&self, conn: &Connection) -> Result<(), AppError> {
        conn.execute(
            "DELETE FROM chat_messages WHERE id NOT IN \
             (SELECT id FROM chat_messages ORDER BY id DESC LIMIT ?1)",
            params![self.cap as i64],
        )
        .map_err(|e| AppError::Transcript(format!("sqlite: enforce cap: {e}")))?;
        Ok(())
    }

    fn select(conn: &Connection, sql: &str, limit: i64) -> Result<Vec<TranscriptMessage>, AppError> {
        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| AppError::Transcript(format!("sqlite: prepare select: {e}")))?;
        let rows = stmt
            .query_map(params![limit], row_to_message)
            .map_err(|e| AppError::Transcript(format!("sqlite: query messages: {e}")))?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(|e| AppError::Transcript(format!("sqlite: map message row: {e}")))?);
        }
        Ok(out)
    }
}

fn row_to_message(row: &Row<'_>) -> rusqlite::Result<TranscriptMessage> {
    let role: String = row.get(1)?;
    let created_at: String = row.get(3)?;
    Ok(TranscriptMessage {
        id: row.get::<_, i64>(0)? as u64,
        role: Role::parse(&role).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(1, Type::Text, format!("unknown role '{role}'").into())
        })?,
        content: row.get(2)?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|d| d.with_timezone(&Utc))
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e)))?,
    })
}

impl TranscriptStore for SqliteTranscript {
    fn store_type(&self) -> &str {
        "sqlite"
    }

    fn append(&self, role: Role, content: &str) -> Result<TranscriptMessage, AppError> {
        let conn = self.conn();
        let created_at = Utc::now();
        conn.execute(
            "INSERT INTO chat_messages (role, content, created_at) VALUES (?1, ?2, ?3)",
            params![
                role.as_str(),
                content,
                created_at.to_rfc3339_opts(SecondsFormat::Micros, true)
            ],
        )
        .map_err(|e| AppError::Transcript(format!("sqlite: insert message: {e}")))?;
        let id = conn.last_insert_rowid() as u64;
        self.enforce_cap(&conn)?;
        Ok(TranscriptMessage { id, role, content: content.to_string(), created_at })
    }

    fn update(&self, id: u64, content: &str) -> Result<bool, AppError> {
        let n = self
            .conn()
            .execute(
                "UPDATE chat_messages SET content = ?1 WHERE id = ?2",
                params![content, id as i64],
            )
            .map_err(|e| AppError::Transcript(format!("sqlite: update message {id}: {e}")))?;
        Ok(n > 0)
    }

    fn delete(&self, id: u64) -> Result<bool, AppError> {
        let n = self
            .conn()
            .execute("DELETE FROM chat_messages WHERE id = ?1", params![id as i64])
            .map_err(|e| AppError::Transcript(format!("sqlite: delete message {id}: {e}")))?;
        Ok(n > 0)
    }

    fn recent(&self, n: usize) -> Result<Vec<TranscriptMessage>, AppError> {
        let conn = self.conn();
        let mut out = Self::select(
            &conn,
            "SELECT id, role, content, created_at FROM chat_messages ORDER BY id DESC LIMIT ?1",
            n as i64,
        )?;
        out.reverse();
        Ok(out)
    }

    fn history(&self) -> Result<Vec<TranscriptMessage>, AppError> {
        let conn = self.conn();
        Self::select(
            &conn,
            "SELECT id, role, content, created_at FROM chat_messages ORDER BY id ASC LIMIT ?1",
            -1,
        )
    }

    fn clear(&self) -> Result<(), AppError> {
        self.conn()
            .execute("DELETE FROM chat_messages", [])
            .map_err(|e| AppError::Transcript(format!("sqlite: clear messages: {e}")))?;
        Ok(())
    }

    fn count(&self) -> Result<usize, AppError> {
        let n: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM chat_messages", [], |row| row.get(0))
            .map_err(|e| AppError::Transcript(format!("sqlite: count messages: {e}")))?;
        Ok(n as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn append_update_read() {
        let s = SqliteTranscript::in_memory(10).unwrap();
        s.append(Role::User, "Hello").unwrap();
        let a = s.append(Role::Assistant, "").unwrap();
        assert!(s.update(a.id, "Hi there!").unwrap());

        let all = s.history().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].role, Role::User);
        assert_eq!(all[1].content, "Hi there!");
        assert_eq!(s.count().unwrap(), 2);
    }

    #[test]
    fn ids_never_reused_after_clear() {
        let s = SqliteTranscript::in_memory(10).unwrap();
        let a = s.append(Role::User, "a").unwrap();
        s.clear().unwrap();
        let b = s.append(Role::User, "b").unwrap();
        assert!(b.id > a.id);
    }

    #[test]
    fn cap_and_recent_order() {
        let s = SqliteTranscript::in_memory(3).unwrap();
        for i in 0..5 {
            s.append(Role::User, &i.to_string()).unwrap();
        }
        let all: Vec<_> = s.history().unwrap().into_iter().map(|m| m.content).collect();
        assert_eq!(all, vec!["2", "3", "4"]);
        let recent: Vec<_> = s.recent(2).unwrap().into_iter().map(|m| m.content).collect();
        assert_eq!(recent, vec!["3", "4"]);
    }

    #[test]
    fn delete_reports_presence() {
        let s = SqliteTranscript::in_memory(10).unwrap();
        let m = s.append(Role::Assistant, "x").unwrap();
        assert!(s.delete(m.id).unwrap());
        assert!(!s.delete(m.id).unwrap());
        assert!(!s.update(m.id, "y").unwrap());
    }

    #[test]
    fn reopen_keeps_rows() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(DB_FILENAME);
        {
            let s = SqliteTranscript::open(&path, 10).unwrap();
            s.append(Role::User, "persisted").unwrap();
        }
        let s = SqliteTranscript::open(&path, 10).unwrap();
        let all = s.history().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].content, "persisted");
    }
}
