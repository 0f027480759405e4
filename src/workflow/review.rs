//! Human review: approve/reject, and the read-only views a dashboard uses.

use chrono::Utc;

use super::{Controller, WorkflowError};
use crate::audit::AuditEvent;
use crate::mailbox::MailboxConnector;
use crate::store::ActionStore;
use crate::types::{ActionFilter, ActionPage, ActionStatus, ActionSummary, PendingAction};

const MAX_REVIEWER_LEN: usize = 64;

/// Reviewer names are free text from the client; keep them short and printable.
fn reviewer_name(who: &str) -> String {
    let cleaned: String = who
        .trim()
        .chars()
        .filter(|c| !c.is_control())
        .take(MAX_REVIEWER_LEN)
        .collect();
    if cleaned.is_empty() {
        "admin".to_string()
    } else {
        cleaned
    }
}

impl<S: ActionStore, C: MailboxConnector> Controller<S, C> {
    pub async fn approve(&self, id: i64, by: &str) -> Result<PendingAction, WorkflowError> {
        self.decide(id, true, by).await
    }

    pub async fn reject(&self, id: i64, by: &str) -> Result<PendingAction, WorkflowError> {
        self.decide(id, false, by).await
    }

    /// PENDING → APPROVED or PENDING → REJECTED. Both stamp `approved_at`;
    /// anything other than a PENDING action is refused.
    pub async fn decide(
        &self,
        id: i64,
        approve: bool,
        by: &str,
    ) -> Result<PendingAction, WorkflowError> {
        let who = reviewer_name(by);
        let (status, recorded_by) = if approve {
            (ActionStatus::Approved, who.clone())
        } else {
            (ActionStatus::Rejected, format!("rejected_by:{who}"))
        };

        let changed = self
            .store
            .record_decision(id, status, &recorded_by, Utc::now())
            .await?;

        if !changed {
            return Err(match self.store.get_action(id).await? {
                None => WorkflowError::NotFound(id),
                Some(action) => {
                    tracing::warn!(action_id = id, status = %action.status, "Decision on non-pending action refused");
                    WorkflowError::NotPending {
                        id,
                        status: action.status,
                    }
                }
            });
        }

        let action = self
            .store
            .get_action(id)
            .await?
            .ok_or(WorkflowError::NotFound(id))?;

        tracing::info!(action_id = id, status = %status, "Recorded review decision");
        self.emit(if approve {
            AuditEvent::Approved { action_id: id, by: who }
        } else {
            AuditEvent::Rejected { action_id: id, by: who }
        });

        Ok(action)
    }

    pub async fn get_action(&self, id: i64) -> Result<PendingAction, WorkflowError> {
        self.store
            .get_action(id)
            .await?
            .ok_or(WorkflowError::NotFound(id))
    }

    pub async fn list_actions(&self, filter: &ActionFilter) -> Result<ActionPage, WorkflowError> {
        Ok(self.store.list_actions(filter).await?)
    }

    pub async fn summary(&self) -> Result<ActionSummary, WorkflowError> {
        Ok(self.store.summary().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::super::fixtures::{approved, harness};
    use super::*;
    use crate::types::{ActionProposal, ActionType};

    async fn pending(h: &super::super::fixtures::Harness, email_id: i64) -> PendingAction {
        h.controller
            .enqueue_action(ActionProposal::new(email_id, 1, "INBOX", ActionType::MarkRead))
            .await
            .unwrap()
            .created()
            .cloned()
            .unwrap()
    }

    #[tokio::test]
    async fn test_approve_stamps_decision() {
        let h = harness().await;
        let action = pending(&h, 1).await;
        assert!(action.approved_at.is_none());

        let approved = h.controller.approve(action.id, "alice").await.unwrap();
        assert_eq!(approved.status, ActionStatus::Approved);
        assert!(approved.approved_at.is_some());
        assert_eq!(approved.approved_by.as_deref(), Some("alice"));
        assert!(matches!(
            h.audit.events().last(),
            Some(AuditEvent::Approved { by, .. }) if by == "alice"
        ));
    }

    #[tokio::test]
    async fn test_reject_stamps_timestamp() {
        let h = harness().await;
        let action = pending(&h, 1).await;

        let rejected = h.controller.reject(action.id, "bob").await.unwrap();
        assert_eq!(rejected.status, ActionStatus::Rejected);
        assert!(rejected.approved_at.is_some());
        assert_eq!(rejected.approved_by.as_deref(), Some("rejected_by:bob"));
    }

    #[tokio::test]
    async fn test_decisions_on_non_pending_actions_are_errors() {
        let h = harness().await;
        let action = pending(&h, 1).await;
        h.controller.reject(action.id, "bob").await.unwrap();

        for approve in [true, false] {
            let err = h.controller.decide(action.id, approve, "bob").await.unwrap_err();
            assert!(matches!(
                err,
                WorkflowError::NotPending {
                    status: ActionStatus::Rejected,
                    ..
                }
            ));
        }

        let already = approved(&h.controller, 2, ActionType::AddFlag, None).await;
        let err = h.controller.approve(already.id, "alice").await.unwrap_err();
        assert!(matches!(err, WorkflowError::NotPending { .. }));

        let unchanged = h.controller.get_action(action.id).await.unwrap();
        assert_eq!(unchanged.approved_by.as_deref(), Some("rejected_by:bob"));
    }

    #[tokio::test]
    async fn test_unknown_action_is_not_found() {
        let h = harness().await;
        assert!(matches!(
            h.controller.approve(404, "alice").await.unwrap_err(),
            WorkflowError::NotFound(404)
        ));
        assert!(matches!(
            h.controller.get_action(404).await.unwrap_err(),
            WorkflowError::NotFound(404)
        ));
    }

    #[test]
    fn test_reviewer_names_are_bounded() {
        assert_eq!(reviewer_name("  "), "admin");
        assert_eq!(reviewer_name("a\nb"), "ab");
        assert_eq!(reviewer_name(&"x".repeat(200)).len(), MAX_REVIEWER_LEN);
    }

    #[tokio::test]
    async fn test_summary_and_listing() {
        let h = harness().await;
        let a = pending(&h, 1).await;
        pending(&h, 2).await;
        h.controller.approve(a.id, "alice").await.unwrap();

        let summary = h.controller.summary().await.unwrap();
        assert_eq!(summary.status_pending, 1);
        assert_eq!(summary.status_approved, 1);

        let page = h
            .controller
            .list_actions(&ActionFilter {
                status: Some(ActionStatus::Pending),
                ..ActionFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.results[0].email_id, 2);
    }
}
