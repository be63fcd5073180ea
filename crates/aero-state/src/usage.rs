//! Token-usage accounting.
//!
//! Raw per-request rows in `token_usage`, rolled up into
//! `token_stats_hourly` on write so the usage endpoint never scans raw rows.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::Connection;
use serde::Serialize;

use crate::error::Result;

pub struct UsageRecorder {
    db: Mutex<Connection>,
}

/// Aggregated usage for one model.
#[derive(Debug, Clone, Serialize)]
pub struct ModelUsage {
    pub model: String,
    pub requests: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl UsageRecorder {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    /// Record one successful upstream response.
    pub fn record(
        &self,
        model: &str,
        backend: &str,
        credential_id: &str,
        input_tokens: u32,
        output_tokens: u32,
    ) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        let hour = now - now.rem_euclid(3_600);
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO token_usage
             (ts, model, backend, credential_id, input_tokens, output_tokens)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![now, model, backend, credential_id, input_tokens, output_tokens],
        )?;
        db.execute(
            "INSERT INTO token_stats_hourly (hour_ts, model, requests, input_tokens, output_tokens)
             VALUES (?1, ?2, 1, ?3, ?4)
             ON CONFLICT(hour_ts, model) DO UPDATE SET
                 requests      = requests + 1,
                 input_tokens  = input_tokens + excluded.input_tokens,
                 output_tokens = output_tokens + excluded.output_tokens",
            rusqlite::params![hour, model, input_tokens, output_tokens],
        )?;
        Ok(())
    }

    /// Per-model totals from the hourly rollup since `since_ts`.
    pub fn totals_since(&self, since_ts: i64) -> Result<Vec<ModelUsage>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT model, SUM(requests), SUM(input_tokens), SUM(output_tokens)
             FROM token_stats_hourly
             WHERE hour_ts >= ?1
             GROUP BY model
             ORDER BY SUM(input_tokens) + SUM(output_tokens) DESC",
        )?;
        let rows = stmt.query_map(rusqlite::params![since_ts], |row| {
            Ok(ModelUsage {
                model: row.get(0)?,
                requests: row.get::<_, i64>(1)? as u64,
                input_tokens: row.get::<_, i64>(2)? as u64,
                output_tokens: row.get::<_, i64>(3)? as u64,
            })
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }
}

/// Initialise the usage tables. Safe to call on every startup.
fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS token_usage (
            id            INTEGER PRIMARY KEY AUTOINCREMENT,
            ts            INTEGER NOT NULL,
            model         TEXT NOT NULL,
            backend       TEXT NOT NULL,
            credential_id TEXT NOT NULL,
            input_tokens  INTEGER NOT NULL DEFAULT 0,
            output_tokens INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_usage_ts ON token_usage(ts);
        CREATE TABLE IF NOT EXISTS token_stats_hourly (
            hour_ts       INTEGER NOT NULL,
            model         TEXT NOT NULL,
            requests      INTEGER NOT NULL DEFAULT 0,
            input_tokens  INTEGER NOT NULL DEFAULT 0,
            output_tokens INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (hour_ts, model)
        );",
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_and_aggregate() {
        let usage = UsageRecorder::open_in_memory().unwrap();
        usage.record("claude-x", "primary", "c1", 100, 50).unwrap();
        usage.record("claude-x", "primary", "c2", 30, 20).unwrap();
        usage.record("gemini-pro", "gem", "c1", 10, 5).unwrap();

        let totals = usage.totals_since(0).unwrap();
        assert_eq!(totals.len(), 2);
        let claude = totals.iter().find(|t| t.model == "claude-x").unwrap();
        assert_eq!(claude.requests, 2);
        assert_eq!(claude.input_tokens, 130);
        assert_eq!(claude.output_tokens, 70);
    }

    #[test]
    fn totals_respect_since_bound() {
        let usage = UsageRecorder::open_in_memory().unwrap();
        usage.record("claude-x", "primary", "c1", 1, 1).unwrap();
        let future = chrono::Utc::now().timestamp() + 7_200;
        assert!(usage.totals_since(future).unwrap().is_empty());
    }
}
