//! Database schema initialization and startup verification.

use sqlx::{Row, SqlitePool};

use super::StoreError;

pub const SCHEMA_VERSION: i64 = 1;

/// Tables that must exist before anything is served.
const REQUIRED_TABLES: [&str; 2] = ["pending_actions", "apply_tokens"];

/// Initialize database schema with both tables and their indexes.
pub async fn init_schema(pool: &SqlitePool) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        -- Schema version tracking
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        );

        -- Proposed mailbox mutations and their lifecycle
        CREATE TABLE IF NOT EXISTS pending_actions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            email_id INTEGER NOT NULL,
            message_uid INTEGER NOT NULL,
            source_folder TEXT NOT NULL,
            action_type TEXT NOT NULL,
            target_folder TEXT,
            reason TEXT,
            status TEXT NOT NULL DEFAULT 'PENDING',
            created_at INTEGER NOT NULL,
            approved_at INTEGER,
            applied_at INTEGER,
            error_code TEXT,
            error_message TEXT,
            proposed_by TEXT NOT NULL,
            approved_by TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_actions_status_created ON pending_actions(status, created_at);
        CREATE INDEX IF NOT EXISTS idx_actions_email_status ON pending_actions(email_id, status);
        CREATE INDEX IF NOT EXISTS idx_actions_type ON pending_actions(action_type);

        -- Single-use apply capabilities; only the SHA-256 of the secret is kept
        CREATE TABLE IF NOT EXISTS apply_tokens (
            token_hash TEXT PRIMARY KEY,
            action_ids TEXT NOT NULL,
            issued_at INTEGER NOT NULL,
            expires_at INTEGER NOT NULL,
            is_used INTEGER NOT NULL DEFAULT 0,
            used_at INTEGER
        );

        CREATE INDEX IF NOT EXISTS idx_tokens_expires ON apply_tokens(expires_at);
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("INSERT OR IGNORE INTO schema_version (version) VALUES (?)")
        .bind(SCHEMA_VERSION)
        .execute(pool)
        .await?;

    Ok(())
}

/// Fail closed when a table the workflow depends on is missing.
pub async fn verify_schema(pool: &SqlitePool) -> Result<(), StoreError> {
    let rows = sqlx::query("SELECT name FROM sqlite_master WHERE type = 'table'")
        .fetch_all(pool)
        .await?;
    let present: Vec<String> = rows.iter().map(|r| r.get("name")).collect();

    for table in REQUIRED_TABLES {
        if !present.iter().any(|t| t == table) {
            return Err(StoreError::SchemaIncomplete(table));
        }
    }
    Ok(())
}
