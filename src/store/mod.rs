//! Action record store: pending actions and apply tokens in SQLite.
//!
//! This module is split into:
//! - `mod.rs` - `ActionStore` trait, `SqliteStore` and its connection pool
//! - `schema.rs` - Schema initialization and the startup table check
//! - `action.rs` - Pending action CRUD and the apply commit
//! - `token.rs` - Apply token persistence
//! - `retention.rs` - Purge of expired tokens and old finished actions
//!
//! The workflow controller is written against `ActionStore` so the state
//! machine can be exercised without SQLite.

mod action;
mod retention;
mod schema;
#[cfg(test)]
pub mod spy;
mod token;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::collections::BTreeSet;
use std::future::Future;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::constants::STORE_POOL_SIZE;
use crate::sanitize::ErrorCategory;
use crate::types::{
    ActionFilter, ActionPage, ActionProposal, ActionStatus, ActionSummary, ActionType,
    ActionUpdate, ApplyToken, PendingAction,
};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("database schema incomplete: table '{0}' not found")]
    SchemaIncomplete(&'static str),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl ErrorCategory for StoreError {
    fn category(&self) -> &'static str {
        match self {
            StoreError::Database(_) => "DatabaseError",
            StoreError::SchemaIncomplete(_) => "SchemaIncomplete",
            StoreError::Corrupt(_) => "CorruptRecord",
        }
    }
}

/// Result of persisting one apply call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitReport {
    /// Rows that moved out of APPROVED.
    pub updated: usize,
    /// Whether this commit flipped the token to used.
    pub token_consumed: bool,
}

/// Rows removed by one purge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub tokens: u64,
    pub actions: u64,
}

/// Persistence seam for pending actions and apply tokens.
///
/// Every method is a single statement or a single transaction; nothing is
/// written unless the method returns `Ok`.
pub trait ActionStore: Send + Sync {
    fn insert_action(
        &self,
        proposal: &ActionProposal,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<PendingAction, StoreError>> + Send;

    /// Id of a PENDING or APPROVED action for the same email and type.
    fn find_open_duplicate(
        &self,
        email_id: i64,
        action_type: ActionType,
    ) -> impl Future<Output = Result<Option<i64>, StoreError>> + Send;

    fn get_action(
        &self,
        id: i64,
    ) -> impl Future<Output = Result<Option<PendingAction>, StoreError>> + Send;

    fn get_actions(
        &self,
        ids: &BTreeSet<i64>,
    ) -> impl Future<Output = Result<Vec<PendingAction>, StoreError>> + Send;

    fn list_actions(
        &self,
        filter: &ActionFilter,
    ) -> impl Future<Output = Result<ActionPage, StoreError>> + Send;

    /// Oldest APPROVED actions first.
    fn approved_actions(
        &self,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<PendingAction>, StoreError>> + Send;

    fn summary(&self) -> impl Future<Output = Result<ActionSummary, StoreError>> + Send;

    /// Move a PENDING action to APPROVED or REJECTED. Returns `false` when
    /// the row was not PENDING (or does not exist); nothing is written then.
    fn record_decision(
        &self,
        id: i64,
        status: ActionStatus,
        decided_by: &str,
        at: DateTime<Utc>,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    fn insert_token(&self, token: &ApplyToken)
    -> impl Future<Output = Result<(), StoreError>> + Send;

    fn find_token(
        &self,
        token_hash: &str,
    ) -> impl Future<Output = Result<Option<ApplyToken>, StoreError>> + Send;

    /// Persist the outcomes of one apply call and, when `consume_token` is
    /// set, mark that token used, all in one transaction. Only APPROVED rows
    /// are updated.
    fn commit_apply(
        &self,
        updates: &[ActionUpdate],
        consume_token: Option<&str>,
        at: DateTime<Utc>,
    ) -> impl Future<Output = Result<CommitReport, StoreError>> + Send;

    /// Delete tokens expired at `now` and, when `actions_before` is set,
    /// APPLIED, FAILED and REJECTED actions last changed before it. PENDING
    /// and APPROVED rows are never deleted.
    fn purge(
        &self,
        now: DateTime<Utc>,
        actions_before: Option<DateTime<Utc>>,
    ) -> impl Future<Output = Result<PurgeReport, StoreError>> + Send;
}

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        let db_url = format!("sqlite:{}?mode=rwc", path.display());

        let options = SqliteConnectOptions::from_str(&db_url)?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(STORE_POOL_SIZE)
            .connect_with(options)
            .await?;

        schema::init_schema(&pool).await?;

        Ok(Self { pool })
    }

    #[cfg(test)]
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);

        // A single connection keeps every query on the same in-memory database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        schema::init_schema(&pool).await?;

        Ok(Self { pool })
    }

    /// Startup check: both tables must exist.
    pub async fn verify_schema(&self) -> Result<(), StoreError> {
        schema::verify_schema(&self.pool).await
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    #[cfg(test)]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

impl ActionStore for SqliteStore {
    async fn insert_action(
        &self,
        proposal: &ActionProposal,
        now: DateTime<Utc>,
    ) -> Result<PendingAction, StoreError> {
        action::insert_action(&self.pool, proposal, now).await
    }

    async fn find_open_duplicate(
        &self,
        email_id: i64,
        action_type: ActionType,
    ) -> Result<Option<i64>, StoreError> {
        action::find_open_duplicate(&self.pool, email_id, action_type).await
    }

    async fn get_action(&self, id: i64) -> Result<Option<PendingAction>, StoreError> {
        action::get_action(&self.pool, id).await
    }

    async fn get_actions(&self, ids: &BTreeSet<i64>) -> Result<Vec<PendingAction>, StoreError> {
        action::get_actions(&self.pool, ids).await
    }

    async fn list_actions(&self, filter: &ActionFilter) -> Result<ActionPage, StoreError> {
        action::list_actions(&self.pool, filter).await
    }

    async fn approved_actions(&self, limit: usize) -> Result<Vec<PendingAction>, StoreError> {
        action::approved_actions(&self.pool, limit).await
    }

    async fn summary(&self) -> Result<ActionSummary, StoreError> {
        action::summary(&self.pool).await
    }

    async fn record_decision(
        &self,
        id: i64,
        status: ActionStatus,
        decided_by: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        action::record_decision(&self.pool, id, status, decided_by, at).await
    }

    async fn insert_token(&self, token: &ApplyToken) -> Result<(), StoreError> {
        token::insert_token(&self.pool, token).await
    }

    async fn find_token(&self, token_hash: &str) -> Result<Option<ApplyToken>, StoreError> {
        token::find_token(&self.pool, token_hash).await
    }

    async fn commit_apply(
        &self,
        updates: &[ActionUpdate],
        consume_token: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<CommitReport, StoreError> {
        action::commit_apply(&self.pool, updates, consume_token, at).await
    }

    async fn purge(
        &self,
        now: DateTime<Utc>,
        actions_before: Option<DateTime<Utc>>,
    ) -> Result<PurgeReport, StoreError> {
        retention::purge(&self.pool, now, actions_before).await
    }
}

pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}
