//! Entities shared by the store, the safety policy and the workflow controller.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// The mailbox mutation a pending action proposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionType {
    MoveFolder,
    MarkRead,
    AddFlag,
    Delete,
}

impl ActionType {
    pub const ALL: [ActionType; 4] = [
        ActionType::MoveFolder,
        ActionType::MarkRead,
        ActionType::AddFlag,
        ActionType::Delete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::MoveFolder => "MOVE_FOLDER",
            ActionType::MarkRead => "MARK_READ",
            ActionType::AddFlag => "ADD_FLAG",
            ActionType::Delete => "DELETE",
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| UnknownVariant(s.to_string()))
    }
}

/// Lifecycle state of a pending action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionStatus {
    Pending,
    Approved,
    Rejected,
    Applied,
    Failed,
}

impl ActionStatus {
    pub const ALL: [ActionStatus; 5] = [
        ActionStatus::Pending,
        ActionStatus::Approved,
        ActionStatus::Rejected,
        ActionStatus::Applied,
        ActionStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionStatus::Pending => "PENDING",
            ActionStatus::Approved => "APPROVED",
            ActionStatus::Rejected => "REJECTED",
            ActionStatus::Applied => "APPLIED",
            ActionStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| UnknownVariant(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown variant '{0}'")]
pub struct UnknownVariant(pub String);

/// A proposed mutation against one message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingAction {
    pub id: i64,
    /// Upstream email record; not owned by this subsystem.
    pub email_id: i64,
    pub message_uid: u32,
    pub source_folder: String,
    pub action_type: ActionType,
    pub target_folder: Option<String>,
    pub reason: Option<String>,
    pub status: ActionStatus,
    pub created_at: DateTime<Utc>,
    pub approved_at: Option<DateTime<Utc>>,
    pub applied_at: Option<DateTime<Utc>>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub proposed_by: String,
    pub approved_by: Option<String>,
}

/// Everything needed to create a pending action row.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionProposal {
    pub email_id: i64,
    pub message_uid: u32,
    pub source_folder: String,
    pub action_type: ActionType,
    pub target_folder: Option<String>,
    pub reason: Option<String>,
    pub proposed_by: String,
}

impl ActionProposal {
    pub fn new(email_id: i64, message_uid: u32, source_folder: &str, action_type: ActionType) -> Self {
        Self {
            email_id,
            message_uid,
            source_folder: source_folder.to_string(),
            action_type,
            target_folder: None,
            reason: None,
            proposed_by: "system".to_string(),
        }
    }

    pub fn target(mut self, folder: &str) -> Self {
        self.target_folder = Some(folder.to_string());
        self
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn proposed_by(mut self, who: impl Into<String>) -> Self {
        self.proposed_by = who.into();
        self
    }
}

/// A stored apply token. The secret itself is never persisted, only its digest.
#[derive(Debug, Clone, PartialEq)]
pub struct ApplyToken {
    pub token_hash: String,
    pub action_ids: BTreeSet<i64>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub is_used: bool,
    pub used_at: Option<DateTime<Utc>>,
}

/// Terminal outcome of one action in an apply call, as written to the store.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionOutcome {
    Applied {
        at: DateTime<Utc>,
    },
    Failed {
        code: &'static str,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActionUpdate {
    pub id: i64,
    pub outcome: ActionOutcome,
}

/// Filter and page for listing pending actions.
#[derive(Debug, Clone, Default)]
pub struct ActionFilter {
    pub status: Option<ActionStatus>,
    pub action_type: Option<ActionType>,
    pub page: u32,
    pub page_size: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActionPage {
    pub results: Vec<PendingAction>,
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
    pub total_pages: u64,
}

/// Row counts per status, plus PENDING rows per action type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ActionSummary {
    pub status_pending: u64,
    pub status_approved: u64,
    pub status_rejected: u64,
    pub status_applied: u64,
    pub status_failed: u64,
    pub type_move_folder: u64,
    pub type_mark_read: u64,
    pub type_add_flag: u64,
    pub type_delete: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enum_string_forms() {
        for t in ActionType::ALL {
            assert_eq!(t.as_str().parse::<ActionType>().unwrap(), t);
        }
        for s in ActionStatus::ALL {
            assert_eq!(s.as_str().parse::<ActionStatus>().unwrap(), s);
        }
        assert!("FLAG".parse::<ActionType>().is_err());
        assert_eq!(
            serde_json::to_string(&ActionType::MoveFolder).unwrap(),
            "\"MOVE_FOLDER\""
        );
    }
}
