//! Optional write-through sqlite mirror for the signature store.
//!
//! One table per lookup index. Persistence is best-effort: callers log and
//! continue on any error here.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{Connection, OptionalExtension, Result};

/// One persisted signature row, shared by all three index tables.
#[derive(Debug, Clone)]
pub struct MirrorRow {
    pub signature: String,
    pub content: Option<String>,
    pub owner_id: Option<String>,
    pub model_family: String,
    pub created_at: i64,
    pub ttl_secs: u64,
}

pub struct SignatureMirror {
    db: Mutex<Connection>,
}

impl SignatureMirror {
    /// Open (or create) the mirror database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    /// In-memory mirror for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    /// Upsert the row under every provided index key.
    pub fn put(
        &self,
        content_key: Option<&str>,
        tool_id: Option<&str>,
        session_fp: Option<&str>,
        row: &MirrorRow,
    ) -> Result<()> {
        let db = self.db.lock().unwrap();
        for (table, key) in [
            ("sig_by_content", content_key),
            ("sig_by_tool", tool_id),
            ("sig_by_session", session_fp),
        ] {
            let Some(key) = key else { continue };
            db.execute(
                &format!(
                    "INSERT OR REPLACE INTO {table}
                     (key, signature, content, owner_id, model_family, created_at, ttl_secs)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"
                ),
                rusqlite::params![
                    key,
                    row.signature,
                    row.content,
                    row.owner_id,
                    row.model_family,
                    row.created_at,
                    row.ttl_secs as i64,
                ],
            )?;
        }
        Ok(())
    }

    pub fn get_by_content(&self, content_key: &str) -> Result<Option<MirrorRow>> {
        self.get("sig_by_content", content_key)
    }

    pub fn get_by_tool(&self, tool_id: &str) -> Result<Option<MirrorRow>> {
        self.get("sig_by_tool", tool_id)
    }

    pub fn get_by_session(&self, session_fp: &str) -> Result<Option<MirrorRow>> {
        self.get("sig_by_session", session_fp)
    }

    fn get(&self, table: &str, key: &str) -> Result<Option<MirrorRow>> {
        let db = self.db.lock().unwrap();
        db.query_row(
            &format!(
                "SELECT signature, content, owner_id, model_family, created_at, ttl_secs
                 FROM {table} WHERE key = ?1"
            ),
            rusqlite::params![key],
            |row| {
                Ok(MirrorRow {
                    signature: row.get(0)?,
                    content: row.get(1)?,
                    owner_id: row.get(2)?,
                    model_family: row.get(3)?,
                    created_at: row.get(4)?,
                    ttl_secs: row.get::<_, i64>(5)? as u64,
                })
            },
        )
        .optional()
    }

    /// Delete rows whose TTL elapsed before `now`.
    pub fn cleanup_expired(&self, now: i64) -> Result<usize> {
        let db = self.db.lock().unwrap();
        let mut removed = 0;
        for table in ["sig_by_content", "sig_by_tool", "sig_by_session"] {
            removed += db.execute(
                &format!("DELETE FROM {table} WHERE created_at + ttl_secs <= ?1"),
                rusqlite::params![now],
            )?;
        }
        Ok(removed)
    }

    pub fn clear(&self) -> Result<()> {
        let db = self.db.lock().unwrap();
        for table in ["sig_by_content", "sig_by_tool", "sig_by_session"] {
            db.execute(&format!("DELETE FROM {table}"), [])?;
        }
        Ok(())
    }
}

/// Initialise the three index tables. Safe to call on every startup.
fn init_db(conn: &Connection) -> Result<()> {
    for table in ["sig_by_content", "sig_by_tool", "sig_by_session"] {
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                key           TEXT PRIMARY KEY,
                signature     TEXT NOT NULL,
                content       TEXT,
                owner_id      TEXT,
                model_family  TEXT NOT NULL,
                created_at    INTEGER NOT NULL,
                ttl_secs      INTEGER NOT NULL
            );"
        ))?;
    }
    Ok(())
}
