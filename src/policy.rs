//! Safety policy: the global switches that decide whether a mailbox mutation
//! may happen at all.
//!
//! Rules are evaluated in order and the first match wins:
//! 1. safe mode blocks everything
//! 2. DELETE needs destructive operations enabled
//! 3. MOVE_FOLDER needs an allowlisted destination
//!
//! Evaluation is pure; it runs at enqueue time and again at apply time.

use serde::Serialize;
use std::fmt;

use crate::config::SafetyConfig;
use crate::types::{ActionType, PendingAction};

/// Why the policy refused an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BlockReason {
    SafeMode,
    DestructiveDisabled,
    FolderNotAllowed,
}

impl BlockReason {
    /// Stable code stored in `error_code`.
    pub fn code(&self) -> &'static str {
        match self {
            BlockReason::SafeMode => "SAFE_MODE",
            BlockReason::DestructiveDisabled => "DESTRUCTIVE_DISABLED",
            BlockReason::FolderNotAllowed => "FOLDER_NOT_ALLOWED",
        }
    }
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockReason::SafeMode => write!(f, "safe mode enabled"),
            BlockReason::DestructiveDisabled => write!(f, "destructive operations disabled"),
            BlockReason::FolderNotAllowed => write!(f, "folder not allowed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Block(BlockReason),
}

impl Verdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Verdict::Allow)
    }
}

#[derive(Debug, Clone)]
pub struct SafetyPolicy {
    config: SafetyConfig,
}

impl SafetyPolicy {
    pub fn new(config: SafetyConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SafetyConfig {
        &self.config
    }

    /// Rule 1 alone. Checked before anything else on every mutating path.
    pub fn check_safe_mode(&self) -> Verdict {
        if self.config.safe_mode {
            Verdict::Block(BlockReason::SafeMode)
        } else {
            Verdict::Allow
        }
    }

    /// All rules, in order.
    pub fn evaluate(&self, action_type: ActionType, target_folder: Option<&str>) -> Verdict {
        match self.check_safe_mode() {
            Verdict::Allow => self.evaluate_action(action_type, target_folder),
            blocked => blocked,
        }
    }

    /// Rules 2 and 3, for callers that have already handled safe mode.
    pub fn evaluate_action(&self, action_type: ActionType, target_folder: Option<&str>) -> Verdict {
        match action_type {
            ActionType::Delete if !self.config.allow_destructive => {
                Verdict::Block(BlockReason::DestructiveDisabled)
            }
            ActionType::MoveFolder => match target_folder {
                Some(folder) if self.config.is_folder_allowed(folder) => Verdict::Allow,
                // A move without a destination can never be allowlisted.
                _ => Verdict::Block(BlockReason::FolderNotAllowed),
            },
            _ => Verdict::Allow,
        }
    }

    pub fn evaluate_pending(&self, action: &PendingAction) -> Verdict {
        self.evaluate_action(action.action_type, action.target_folder.as_deref())
    }
}
