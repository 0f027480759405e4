//! Turning classifier output into queued or directly executed actions.
//!
//! Mode precedence is fixed: safe mode does nothing, approval mode queues,
//! and only with both off are actions run immediately.

use chrono::Utc;

use super::types::{EmailDisposition, EnqueueOutcome, ExecutedAction, ProposeReport, ResultStatus};
use super::{Controller, WorkflowError};
use crate::audit::AuditEvent;
use crate::mailbox::{MailboxConnector, MailboxOp, MailboxScope};
use crate::policy::{BlockReason, Verdict};
use crate::store::ActionStore;
use crate::types::{ActionProposal, ActionType};

const PROPOSED_BY: &str = "pipeline";

impl<S: ActionStore, C: MailboxConnector> Controller<S, C> {
    /// Act on one classified message according to the configured mode.
    pub async fn propose(&self, disposition: &EmailDisposition) -> Result<ProposeReport, WorkflowError> {
        let config = self.config();

        if config.safe_mode {
            tracing::info!(email_id = disposition.email_id, "Safe mode: skipping mailbox actions");
            return Ok(ProposeReport::Skipped);
        }

        if config.require_approval {
            let mut outcomes = Vec::new();
            for proposal in self.implied_actions(disposition, true) {
                outcomes.push(self.enqueue_action(proposal).await?);
            }
            return Ok(ProposeReport::Queued(outcomes));
        }

        let proposals = self.implied_actions(disposition, false);
        Ok(ProposeReport::Executed(self.execute_immediately(&proposals).await?))
    }

    /// The actions a disposition implies. Flag changes come before the move
    /// because the UID is only valid in the source folder.
    ///
    /// When `queued`, spam always goes to quarantine regardless of
    /// `delete_spam`; a reviewer then decides on anything harsher.
    pub fn implied_actions(&self, d: &EmailDisposition, queued: bool) -> Vec<ActionProposal> {
        let config = self.config();
        let base = |action_type| {
            ActionProposal::new(d.email_id, d.message_uid, &d.folder, action_type)
                .proposed_by(PROPOSED_BY)
        };

        if d.is_spam {
            let (target, label) = if !queued && config.delete_spam {
                (&config.spam_folder, "Spam detected")
            } else {
                (&config.quarantine_folder, "Spam quarantine")
            };
            let reason = match d.spam_probability {
                Some(p) => format!("{label} (probability: {p:.2})"),
                None => label.to_string(),
            };
            return vec![base(ActionType::MoveFolder).target(target).reason(reason)];
        }

        let mut actions = Vec::new();
        if config.mark_as_read {
            actions.push(base(ActionType::MarkRead).reason("Mark processed email as read"));
        }
        if d.action_required {
            actions.push(base(ActionType::AddFlag).reason("Action required flag"));
        }
        let archive_reason = match &d.category {
            Some(category) => format!("Archive processed email (category: {category})"),
            None => "Archive processed email".to_string(),
        };
        actions.push(
            base(ActionType::MoveFolder)
                .target(&config.archive_folder)
                .reason(archive_reason),
        );
        actions
    }

    /// Queue one proposal as PENDING after the policy and duplicate checks.
    pub async fn enqueue_action(&self, proposal: ActionProposal) -> Result<EnqueueOutcome, WorkflowError> {
        if !self.policy.check_safe_mode().is_allowed() {
            return Ok(EnqueueOutcome::SafeMode);
        }

        if let Verdict::Block(reason) = self
            .policy
            .evaluate_action(proposal.action_type, proposal.target_folder.as_deref())
        {
            tracing::warn!(
                email_id = proposal.email_id,
                action = %proposal.action_type,
                "Proposal blocked: {}",
                reason
            );
            self.emit(AuditEvent::Blocked {
                email_id: proposal.email_id,
                action_type: proposal.action_type,
                reason: reason.to_string(),
            });
            return Ok(EnqueueOutcome::Blocked(reason));
        }

        if let Some(existing_id) = self
            .store
            .find_open_duplicate(proposal.email_id, proposal.action_type)
            .await?
        {
            tracing::debug!(
                email_id = proposal.email_id,
                action = %proposal.action_type,
                existing_id,
                "Duplicate proposal ignored"
            );
            return Ok(EnqueueOutcome::Duplicate { existing_id });
        }

        let action = self.store.insert_action(&proposal, Utc::now()).await?;
        tracing::info!(
            action_id = action.id,
            email_id = action.email_id,
            action = %action.action_type,
            "Enqueued pending action"
        );
        self.emit(AuditEvent::Enqueued {
            action_id: action.id,
            email_id: action.email_id,
            action_type: action.action_type,
            proposed_by: action.proposed_by.clone(),
        });
        Ok(EnqueueOutcome::Created(action))
    }

    /// Normal mode: run the actions now, without touching the action table.
    async fn execute_immediately(
        &self,
        proposals: &[ActionProposal],
    ) -> Result<Vec<ExecutedAction>, WorkflowError> {
        let mut results: Vec<ExecutedAction> = Vec::with_capacity(proposals.len());
        let mut ready = Vec::new();

        for (index, proposal) in proposals.iter().enumerate() {
            let planned = match self
                .policy
                .evaluate(proposal.action_type, proposal.target_folder.as_deref())
            {
                Verdict::Allow => MailboxOp::for_proposal(proposal).ok_or(BlockReason::FolderNotAllowed),
                Verdict::Block(reason) => Err(reason),
            };

            let mut result = ExecutedAction {
                action_type: proposal.action_type,
                target_folder: proposal.target_folder.clone(),
                status: ResultStatus::Applied,
                error: None,
            };
            match planned {
                Ok(op) => ready.push((index, op)),
                Err(reason) => {
                    result.status = ResultStatus::Failed;
                    result.error = Some(reason.to_string());
                    self.emit(AuditEvent::Blocked {
                        email_id: proposal.email_id,
                        action_type: proposal.action_type,
                        reason: reason.to_string(),
                    });
                }
            }
            results.push(result);
        }

        if ready.is_empty() {
            return Ok(results);
        }

        let mut scope = MailboxScope::open(&self.connector).await.map_err(|e| {
            tracing::warn!("Mailbox connection failed: {}", self.sanitizer.sanitize(&e));
            WorkflowError::Connect(e)
        })?;

        for (index, op) in &ready {
            let proposal = &proposals[*index];
            match scope.execute(op).await {
                Ok(()) => {
                    self.emit(AuditEvent::Applied {
                        action_id: None,
                        email_id: proposal.email_id,
                        action_type: proposal.action_type,
                    });
                }
                Err(e) if e.is_connection_failure() => {
                    tracing::warn!("Mailbox connection lost: {}", self.sanitizer.sanitize(&e));
                    return Err(WorkflowError::ConnectionLost(e));
                }
                Err(e) => {
                    let message = self.sanitizer.sanitize(&e);
                    tracing::warn!(action = %proposal.action_type, "Mailbox operation failed: {}", message);
                    results[*index].status = ResultStatus::Failed;
                    results[*index].error = Some(message);
                    self.emit(AuditEvent::Failed {
                        action_id: None,
                        email_id: proposal.email_id,
                        action_type: proposal.action_type,
                        error_code: "OPERATION_FAILED".to_string(),
                    });
                }
            }
        }

        scope.close().await;
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::super::fixtures::{harness, harness_with, safety};
    use super::*;
    use crate::audit::AuditEvent;
    use crate::mailbox::fake::FakeConnector;
    use crate::types::ActionStatus;

    fn ham(email_id: i64) -> EmailDisposition {
        EmailDisposition {
            email_id,
            message_uid: email_id as u32,
            folder: "INBOX".to_string(),
            is_spam: false,
            spam_probability: None,
            action_required: true,
            category: Some("newsletter".to_string()),
        }
    }

    fn spam(email_id: i64) -> EmailDisposition {
        EmailDisposition {
            is_spam: true,
            spam_probability: Some(0.97),
            action_required: false,
            ..ham(email_id)
        }
    }

    #[tokio::test]
    async fn test_safe_mode_creates_and_executes_nothing() {
        let config = crate::config::SafetyConfig {
            safe_mode: true,
            ..safety()
        };
        let h = harness_with(config, FakeConnector::new()).await;

        let report = h.controller.propose(&ham(1)).await.unwrap();
        assert_eq!(report, ProposeReport::Skipped);
        assert_eq!(h.controller.store().calls(), 0);
        assert_eq!(h.controller.connector().connects(), 0);

        let outcome = h
            .controller
            .enqueue_action(ActionProposal::new(1, 1, "INBOX", ActionType::MarkRead))
            .await
            .unwrap();
        assert_eq!(outcome, EnqueueOutcome::SafeMode);
        assert_eq!(h.controller.store().calls(), 0);
    }

    #[tokio::test]
    async fn test_approval_mode_queues_pending_rows() {
        let config = crate::config::SafetyConfig {
            mark_as_read: true,
            ..safety()
        };
        let h = harness_with(config, FakeConnector::new()).await;

        let ProposeReport::Queued(outcomes) = h.controller.propose(&ham(5)).await.unwrap() else {
            panic!("expected queued actions");
        };
        let types: Vec<ActionType> = outcomes
            .iter()
            .map(|o| o.created().unwrap().action_type)
            .collect();
        assert_eq!(
            types,
            vec![ActionType::MarkRead, ActionType::AddFlag, ActionType::MoveFolder]
        );
        for outcome in &outcomes {
            let action = outcome.created().unwrap();
            assert_eq!(action.status, ActionStatus::Pending);
            assert_eq!(action.proposed_by, "pipeline");
        }
        let archive = outcomes[2].created().unwrap();
        assert_eq!(archive.target_folder.as_deref(), Some("Archive"));
        assert_eq!(
            archive.reason.as_deref(),
            Some("Archive processed email (category: newsletter)")
        );

        assert_eq!(h.controller.connector().connects(), 0);
        let enqueued = h
            .audit
            .events()
            .iter()
            .filter(|e| matches!(e, AuditEvent::Enqueued { .. }))
            .count();
        assert_eq!(enqueued, 3);
    }

    #[tokio::test]
    async fn test_spam_is_quarantined_even_with_delete_spam() {
        let config = crate::config::SafetyConfig {
            delete_spam: true,
            allow_destructive: true,
            ..safety()
        };
        let h = harness_with(config, FakeConnector::new()).await;

        let ProposeReport::Queued(outcomes) = h.controller.propose(&spam(9)).await.unwrap() else {
            panic!("expected queued actions");
        };
        assert_eq!(outcomes.len(), 1);
        let action = outcomes[0].created().unwrap();
        assert_eq!(action.action_type, ActionType::MoveFolder);
        assert_eq!(action.target_folder.as_deref(), Some("Quarantine"));
        assert_eq!(
            action.reason.as_deref(),
            Some("Spam quarantine (probability: 0.97)")
        );
    }

    #[tokio::test]
    async fn test_duplicates_are_not_queued_twice() {
        let h = harness().await;
        h.controller.propose(&spam(3)).await.unwrap();

        let ProposeReport::Queued(outcomes) = h.controller.propose(&spam(3)).await.unwrap() else {
            panic!("expected queued actions");
        };
        assert!(matches!(outcomes[0], EnqueueOutcome::Duplicate { .. }));
    }

    #[tokio::test]
    async fn test_blocked_proposals_write_nothing() {
        let h = harness().await;

        let outcome = h
            .controller
            .enqueue_action(ActionProposal::new(1, 1, "INBOX", ActionType::MoveFolder).target("Spam"))
            .await
            .unwrap();
        assert_eq!(outcome, EnqueueOutcome::Blocked(BlockReason::FolderNotAllowed));

        let outcome = h
            .controller
            .enqueue_action(ActionProposal::new(1, 1, "INBOX", ActionType::Delete))
            .await
            .unwrap();
        assert_eq!(outcome, EnqueueOutcome::Blocked(BlockReason::DestructiveDisabled));

        assert_eq!(h.controller.store().writes(), 0);
        assert!(
            h.audit
                .events()
                .iter()
                .all(|e| matches!(e, AuditEvent::Blocked { .. }))
        );
    }

    #[tokio::test]
    async fn test_normal_mode_executes_without_table_writes() {
        let config = crate::config::SafetyConfig {
            require_approval: false,
            ..safety()
        };
        let h = harness_with(config, FakeConnector::new()).await;

        let ProposeReport::Executed(results) = h.controller.propose(&ham(4)).await.unwrap() else {
            panic!("expected immediate execution");
        };
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.status == ResultStatus::Applied));
        assert_eq!(h.controller.store().calls(), 0);

        let connector = h.controller.connector();
        assert_eq!(connector.connects(), 1);
        assert_eq!(connector.logouts(), 1);
        assert_eq!(
            connector.executed(),
            vec![
                MailboxOp::AddFlag {
                    uid: 4,
                    folder: "INBOX".to_string()
                },
                MailboxOp::Move {
                    uid: 4,
                    folder: "INBOX".to_string(),
                    target: "Archive".to_string()
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_normal_mode_spam_honours_delete_spam_subject_to_allowlist() {
        let config = crate::config::SafetyConfig {
            require_approval: false,
            delete_spam: true,
            ..safety()
        };
        let h = harness_with(config, FakeConnector::new()).await;

        // "Spam" is not allowlisted in the fixture, so the move is refused
        // before any connection.
        let ProposeReport::Executed(results) = h.controller.propose(&spam(2)).await.unwrap() else {
            panic!("expected immediate execution");
        };
        assert_eq!(results[0].status, ResultStatus::Failed);
        assert_eq!(results[0].error.as_deref(), Some("folder not allowed"));
        assert_eq!(h.controller.connector().connects(), 0);
    }

    #[tokio::test]
    async fn test_normal_mode_connection_failure_is_retryable() {
        let config = crate::config::SafetyConfig {
            require_approval: false,
            ..safety()
        };
        let h = harness_with(config, FakeConnector::new().failing_connect()).await;

        let err = h.controller.propose(&ham(4)).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(h.controller.store().calls(), 0);
        assert!(h.audit.events().is_empty());
    }

    #[tokio::test]
    async fn test_normal_mode_operation_failure_is_sanitized() {
        let config = crate::config::SafetyConfig {
            require_approval: false,
            ..safety()
        };
        let h = harness_with(config, FakeConnector::new().fail_uid(6)).await;

        let ProposeReport::Executed(results) = h.controller.propose(&ham(6)).await.unwrap() else {
            panic!("expected immediate execution");
        };
        assert!(results.iter().all(|r| r.status == ResultStatus::Failed));
        assert!(
            results
                .iter()
                .all(|r| r.error.as_deref() == Some("OperationFailed"))
        );
    }
}
