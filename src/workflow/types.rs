//! Inputs, outputs and errors of the workflow controller.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::mailbox::{ConnectError, ExecuteError};
use crate::policy::BlockReason;
use crate::sanitize::ErrorCategory;
use crate::store::StoreError;
use crate::token::{TokenError, TokenInvalid};
use crate::types::{ActionStatus, ActionType, PendingAction};

/// What the upstream classifier decided about one message.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct EmailDisposition {
    pub email_id: i64,
    pub message_uid: u32,
    pub folder: String,
    pub is_spam: bool,
    #[serde(default)]
    pub spam_probability: Option<f32>,
    #[serde(default)]
    pub action_required: bool,
    #[serde(default)]
    pub category: Option<String>,
}

/// Result of trying to queue one proposal.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum EnqueueOutcome {
    Created(PendingAction),
    /// An open action for the same email and type already exists.
    Duplicate { existing_id: i64 },
    Blocked(BlockReason),
    SafeMode,
}

impl EnqueueOutcome {
    #[cfg(test)]
    pub fn created(&self) -> Option<&PendingAction> {
        match self {
            EnqueueOutcome::Created(action) => Some(action),
            _ => None,
        }
    }
}

/// What `propose` did with a disposition.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "mode", content = "actions", rename_all = "snake_case")]
pub enum ProposeReport {
    /// Safe mode: nothing queued, nothing executed.
    Skipped,
    Queued(Vec<EnqueueOutcome>),
    Executed(Vec<ExecutedAction>),
}

/// One action run directly in normal mode, without a table row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutedAction {
    pub action_type: ActionType,
    pub target_folder: Option<String>,
    pub status: ResultStatus,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResultStatus {
    Applied,
    Failed,
    /// Not APPROVED (or missing); left untouched.
    Skipped,
    WouldApply,
    WouldFail,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PreviewRequest {
    #[serde(default)]
    pub action_ids: Option<Vec<i64>>,
    #[serde(default)]
    pub max_count: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PreviewEntry {
    pub id: i64,
    pub email_id: Option<i64>,
    pub action_type: Option<ActionType>,
    pub target_folder: Option<String>,
    pub reason: Option<String>,
    pub expected: ResultStatus,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Preview {
    pub apply_token: String,
    pub token_expires_at: DateTime<Utc>,
    pub action_count: usize,
    /// Number of actions per type.
    pub summary: BTreeMap<ActionType, usize>,
    pub actions: Vec<PreviewEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApplyRequest {
    pub apply_token: String,
    pub action_ids: Vec<i64>,
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApplyResult {
    pub id: i64,
    pub status: ResultStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApplyReport {
    pub dry_run: bool,
    pub applied: usize,
    pub failed: usize,
    pub skipped: usize,
    pub token_consumed: bool,
    pub results: Vec<ApplyResult>,
}

impl ApplyReport {
    pub(crate) fn new(dry_run: bool, results: Vec<ApplyResult>, token_consumed: bool) -> Self {
        let count = |s: ResultStatus| results.iter().filter(|r| r.status == s).count();
        Self {
            dry_run,
            applied: count(ResultStatus::Applied) + count(ResultStatus::WouldApply),
            failed: count(ResultStatus::Failed) + count(ResultStatus::WouldFail),
            skipped: count(ResultStatus::Skipped),
            token_consumed,
            results,
        }
    }

    #[cfg(test)]
    pub fn result(&self, id: i64) -> Option<&ApplyResult> {
        self.results.iter().find(|r| r.id == id)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("safe mode enabled")]
    SafeMode,
    #[error(transparent)]
    Token(#[from] TokenInvalid),
    #[error("a batch apply is already in progress")]
    Busy,
    #[error("action {0} not found")]
    NotFound(i64),
    #[error("action {id} is {status}, not PENDING")]
    NotPending { id: i64, status: ActionStatus },
    #[error("{0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error(transparent)]
    ConnectionLost(ExecuteError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failed to generate apply token: {0}")]
    Entropy(String),
}

impl From<TokenError> for WorkflowError {
    fn from(e: TokenError) -> Self {
        match e {
            TokenError::Invalid(invalid) => WorkflowError::Token(invalid),
            TokenError::Store(store) => WorkflowError::Store(store),
            TokenError::Entropy(msg) => WorkflowError::Entropy(msg),
        }
    }
}

impl WorkflowError {
    /// Connection-class failures: retryable, nothing was written.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            WorkflowError::Connect(_)
                | WorkflowError::ConnectionLost(_)
                | WorkflowError::Busy
                | WorkflowError::Token(TokenInvalid::InUse)
        )
    }
}

impl ErrorCategory for WorkflowError {
    fn category(&self) -> &'static str {
        match self {
            WorkflowError::SafeMode => "SafeModeEnabled",
            WorkflowError::Token(e) => e.category(),
            WorkflowError::Busy => "ConcurrentApplyRejected",
            WorkflowError::NotFound(_) => "ActionNotFound",
            WorkflowError::NotPending { .. } => "ActionNotPending",
            WorkflowError::InvalidRequest(_) => "InvalidRequest",
            WorkflowError::Connect(e) => e.category(),
            WorkflowError::ConnectionLost(e) => e.category(),
            WorkflowError::Store(e) => e.category(),
            WorkflowError::Entropy(_) => "EntropyUnavailable",
        }
    }
}
