use rusqlite::Connection;

use crate::error::Result;

/// Initialise the conversations table. Safe to call on every startup.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS conversations (
            scid           TEXT PRIMARY KEY,
            client_type    TEXT NOT NULL,
            history        TEXT NOT NULL,
            last_signature TEXT,
            created_at     INTEGER NOT NULL,
            expires_at     INTEGER NOT NULL,
            access_count   INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_conversations_expiry
            ON conversations(expires_at);",
    )?;
    Ok(())
}
