//! Preview, apply and dry run.
//!
//! Apply order: safe mode, id-set caps, token claim, token, status guard,
//! policy, then one mailbox connection for whatever is left. Results and
//! token consumption are committed together in one transaction; a
//! connection failure commits nothing and leaves the token valid.
//!
//! A real apply claims its token before validating it and holds the claim
//! until after the commit, so a concurrent apply with the same token is
//! refused with `TokenInUse` and one token never reaches the mailbox twice.

use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet};

use super::types::{
    ApplyReport, ApplyRequest, ApplyResult, Preview, PreviewEntry, PreviewRequest, ResultStatus,
};
use super::{Controller, WorkflowError};
use crate::audit::AuditEvent;
use crate::mailbox::{MailboxConnector, MailboxOp, MailboxScope};
use crate::policy::{BlockReason, Verdict};
use crate::store::ActionStore;
use crate::types::{ActionOutcome, ActionStatus, ActionUpdate, PendingAction};

/// `error_code` for a mailbox operation the server refused.
const OPERATION_FAILED: &str = "OPERATION_FAILED";

/// What apply would do with one requested id.
enum Plan<'a> {
    Missing(i64),
    NotApproved(&'a PendingAction),
    Blocked(&'a PendingAction, BlockReason),
    Ready(&'a PendingAction, MailboxOp),
}

impl Plan<'_> {
    fn id(&self) -> i64 {
        match self {
            Plan::Missing(id) => *id,
            Plan::NotApproved(a) | Plan::Blocked(a, _) | Plan::Ready(a, _) => a.id,
        }
    }

    fn skip_reason(&self) -> Option<String> {
        match self {
            Plan::Missing(_) => Some("action not found".to_string()),
            Plan::NotApproved(a) => Some(format!("action is {}, not APPROVED", a.status)),
            _ => None,
        }
    }
}

impl<S: ActionStore, C: MailboxConnector> Controller<S, C> {
    /// Read-only: describe what apply would do and issue a token bound to
    /// exactly the previewed ids.
    pub async fn preview(&self, request: &PreviewRequest) -> Result<Preview, WorkflowError> {
        if !self.policy.check_safe_mode().is_allowed() {
            return Err(WorkflowError::SafeMode);
        }

        let (ids, actions) = match &request.action_ids {
            Some(ids) => {
                let ids = self.checked_id_set(ids)?;
                let actions = self.store.get_actions(&ids).await?;
                (ids, actions)
            }
            None => {
                let cap = self.config().max_apply_per_request;
                let limit = request.max_count.map_or(cap, |n| n.min(cap));
                if limit == 0 {
                    return Err(WorkflowError::InvalidRequest(
                        "max_count must be at least 1".to_string(),
                    ));
                }
                let actions = self.store.approved_actions(limit).await?;
                let ids: BTreeSet<i64> = actions.iter().map(|a| a.id).collect();
                (ids, actions)
            }
        };

        if ids.is_empty() {
            return Err(WorkflowError::InvalidRequest(
                "no approved actions to preview".to_string(),
            ));
        }

        let plans = self.plan(&ids, &actions);
        let mut summary = BTreeMap::new();
        let entries: Vec<PreviewEntry> = plans
            .iter()
            .map(|plan| {
                let action = match plan {
                    Plan::Missing(_) => None,
                    Plan::NotApproved(a) | Plan::Blocked(a, _) | Plan::Ready(a, _) => Some(*a),
                };
                if let Some(a) = action {
                    *summary.entry(a.action_type).or_insert(0) += 1;
                }
                let (expected, error) = match plan {
                    Plan::Ready(..) => (ResultStatus::WouldApply, None),
                    Plan::Blocked(_, reason) => (ResultStatus::WouldFail, Some(reason.to_string())),
                    Plan::Missing(_) | Plan::NotApproved(_) => {
                        (ResultStatus::Skipped, plan.skip_reason())
                    }
                };
                PreviewEntry {
                    id: plan.id(),
                    email_id: action.map(|a| a.email_id),
                    action_type: action.map(|a| a.action_type),
                    target_folder: action.and_then(|a| a.target_folder.clone()),
                    reason: action.and_then(|a| a.reason.clone()),
                    expected,
                    error,
                }
            })
            .collect();

        let issued = self.issuer.issue(&self.store, ids, Utc::now()).await?;

        Ok(Preview {
            apply_token: issued.token,
            token_expires_at: issued.expires_at,
            action_count: entries.len(),
            summary,
            actions: entries,
        })
    }

    /// Batch apply. Only one runs at a time; a concurrent call gets `Busy`.
    pub async fn apply_batch(&self, request: &ApplyRequest) -> Result<ApplyReport, WorkflowError> {
        if !self.policy.check_safe_mode().is_allowed() {
            return Err(WorkflowError::SafeMode);
        }

        let _guard = self.batch_lock.try_lock().map_err(|_| {
            tracing::warn!("Batch apply rejected: another batch apply is running");
            WorkflowError::Busy
        })?;

        self.apply_ids(&request.action_ids, &request.apply_token, request.dry_run)
            .await
    }

    /// Apply one action with a token issued for exactly that id.
    pub async fn apply_single(
        &self,
        id: i64,
        apply_token: &str,
        dry_run: bool,
    ) -> Result<ApplyReport, WorkflowError> {
        self.apply_ids(&[id], apply_token, dry_run).await
    }

    async fn apply_ids(
        &self,
        requested: &[i64],
        apply_token: &str,
        dry_run: bool,
    ) -> Result<ApplyReport, WorkflowError> {
        // Rule 1 first: no store access, no connection.
        if !self.policy.check_safe_mode().is_allowed() {
            return Err(WorkflowError::SafeMode);
        }

        let ids = self.checked_id_set(requested)?;
        let now = Utc::now();

        let _claim = if dry_run {
            None
        } else {
            let claim = self.in_flight.claim(apply_token).map_err(|e| {
                tracing::warn!("Apply refused: {}", e);
                WorkflowError::Token(e)
            })?;
            Some(claim)
        };

        let token = self
            .issuer
            .validate(&self.store, apply_token, &ids, now)
            .await
            .inspect_err(|e| tracing::info!("Apply refused: {}", e))?;

        let actions = self.store.get_actions(&ids).await?;
        let plans = self.plan(&ids, &actions);

        if dry_run {
            let results = plans
                .iter()
                .map(|plan| match plan {
                    Plan::Ready(a, _) => ApplyResult {
                        id: a.id,
                        status: ResultStatus::WouldApply,
                        error: None,
                    },
                    Plan::Blocked(a, reason) => ApplyResult {
                        id: a.id,
                        status: ResultStatus::WouldFail,
                        error: Some(reason.to_string()),
                    },
                    Plan::Missing(_) | Plan::NotApproved(_) => ApplyResult {
                        id: plan.id(),
                        status: ResultStatus::Skipped,
                        error: plan.skip_reason(),
                    },
                })
                .collect();
            return Ok(ApplyReport::new(true, results, false));
        }

        // Outcomes keyed by id so results come back in id order.
        let mut outcomes: BTreeMap<i64, ActionOutcome> = BTreeMap::new();
        let mut ready: Vec<(&PendingAction, &MailboxOp)> = Vec::new();

        for plan in &plans {
            match plan {
                Plan::Blocked(a, reason) => {
                    tracing::warn!(action_id = a.id, "Action blocked at apply: {}", reason);
                    outcomes.insert(
                        a.id,
                        ActionOutcome::Failed {
                            code: reason.code(),
                            message: reason.to_string(),
                        },
                    );
                }
                Plan::Ready(a, op) => ready.push((*a, op)),
                Plan::Missing(_) | Plan::NotApproved(_) => {}
            }
        }

        let reached_mailbox = !ready.is_empty();
        if reached_mailbox {
            let mut scope = MailboxScope::open(&self.connector).await.map_err(|e| {
                tracing::warn!("Mailbox connection failed: {}", self.sanitizer.sanitize(&e));
                WorkflowError::Connect(e)
            })?;

            // Ids the server has carried out in this call.
            let mut executed: Vec<i64> = Vec::new();
            for (action, op) in ready {
                match scope.execute(op).await {
                    Ok(()) => {
                        executed.push(action.id);
                        outcomes.insert(action.id, ActionOutcome::Applied { at: Utc::now() });
                    }
                    // The scope is dropped on return and nothing is committed.
                    Err(e) if e.is_connection_failure() => {
                        tracing::warn!(
                            action_id = action.id,
                            "Mailbox connection lost during apply: {}",
                            self.sanitizer.sanitize(&e)
                        );
                        if !executed.is_empty() {
                            tracing::warn!(
                                executed = ?executed,
                                "Actions ran on the server before the connection was lost but remain APPROVED"
                            );
                            self.emit(AuditEvent::Interrupted {
                                executed,
                                lost_at: action.id,
                            });
                        }
                        return Err(WorkflowError::ConnectionLost(e));
                    }
                    Err(e) => {
                        let message = self.sanitizer.sanitize(&e);
                        tracing::warn!(action_id = action.id, "Mailbox operation failed: {}", message);
                        outcomes.insert(
                            action.id,
                            ActionOutcome::Failed {
                                code: OPERATION_FAILED,
                                message,
                            },
                        );
                    }
                }
            }

            scope.close().await;
        }

        let updates: Vec<ActionUpdate> = outcomes
            .iter()
            .map(|(id, outcome)| ActionUpdate {
                id: *id,
                outcome: outcome.clone(),
            })
            .collect();

        let consume = reached_mailbox.then_some(token.token_hash.as_str());
        let report = self.store.commit_apply(&updates, consume, Utc::now()).await?;

        if report.updated != updates.len() {
            tracing::warn!(
                expected = updates.len(),
                updated = report.updated,
                "Some actions left APPROVED state during apply"
            );
        }
        if reached_mailbox && !report.token_consumed {
            tracing::warn!("Apply token was consumed concurrently");
        }

        let by_id: BTreeMap<i64, &PendingAction> = actions.iter().map(|a| (a.id, a)).collect();
        let results = plans
            .iter()
            .map(|plan| {
                let id = plan.id();
                match outcomes.get(&id) {
                    Some(ActionOutcome::Applied { .. }) => ApplyResult {
                        id,
                        status: ResultStatus::Applied,
                        error: None,
                    },
                    Some(ActionOutcome::Failed { message, .. }) => ApplyResult {
                        id,
                        status: ResultStatus::Failed,
                        error: Some(message.clone()),
                    },
                    None => ApplyResult {
                        id,
                        status: ResultStatus::Skipped,
                        error: plan.skip_reason(),
                    },
                }
            })
            .collect();

        for (id, outcome) in &outcomes {
            let Some(action) = by_id.get(id) else { continue };
            self.emit(match outcome {
                ActionOutcome::Applied { .. } => AuditEvent::Applied {
                    action_id: Some(*id),
                    email_id: action.email_id,
                    action_type: action.action_type,
                },
                ActionOutcome::Failed { code, .. } => AuditEvent::Failed {
                    action_id: Some(*id),
                    email_id: action.email_id,
                    action_type: action.action_type,
                    error_code: code.to_string(),
                },
            });
        }

        let report = ApplyReport::new(false, results, report.token_consumed);
        tracing::info!(
            applied = report.applied,
            failed = report.failed,
            skipped = report.skipped,
            token_consumed = report.token_consumed,
            "Apply finished"
        );
        Ok(report)
    }

    /// Non-empty and within `max_apply_per_request`.
    fn checked_id_set(&self, ids: &[i64]) -> Result<BTreeSet<i64>, WorkflowError> {
        let set: BTreeSet<i64> = ids.iter().copied().collect();
        let cap = self.config().max_apply_per_request;
        if set.is_empty() {
            return Err(WorkflowError::InvalidRequest(
                "action_ids must not be empty".to_string(),
            ));
        }
        if set.len() > cap {
            return Err(WorkflowError::InvalidRequest(format!(
                "at most {cap} actions per request"
            )));
        }
        Ok(set)
    }

    /// Status guard plus policy rules 2–3 for each requested id, in id order.
    fn plan<'a>(&self, ids: &BTreeSet<i64>, actions: &'a [PendingAction]) -> Vec<Plan<'a>> {
        let by_id: BTreeMap<i64, &PendingAction> = actions.iter().map(|a| (a.id, a)).collect();

        ids.iter()
            .map(|id| {
                let Some(action) = by_id.get(id).copied() else {
                    return Plan::Missing(*id);
                };
                if action.status != ActionStatus::Approved {
                    return Plan::NotApproved(action);
                }
                match self.policy.evaluate_pending(action) {
                    Verdict::Block(reason) => Plan::Blocked(action, reason),
                    Verdict::Allow => match MailboxOp::for_action(action) {
                        Some(op) => Plan::Ready(action, op),
                        None => Plan::Blocked(action, BlockReason::FolderNotAllowed),
                    },
                }
            })
            .collect()
    }
}
