//! Audit trail of every decision and mailbox mutation.
//!
//! Events go to the `audit` tracing target so they can be routed
//! separately with an `EnvFilter` directive such as `audit=info`.

use serde::Serialize;

use crate::types::ActionType;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    Enqueued {
        action_id: i64,
        email_id: i64,
        action_type: ActionType,
        proposed_by: String,
    },
    Approved {
        action_id: i64,
        by: String,
    },
    Rejected {
        action_id: i64,
        by: String,
    },
    Applied {
        action_id: Option<i64>,
        email_id: i64,
        action_type: ActionType,
    },
    Failed {
        action_id: Option<i64>,
        email_id: i64,
        action_type: ActionType,
        error_code: String,
    },
    /// The connection dropped during an apply after `executed` had already
    /// run on the server. Those rows stay APPROVED and need reconciling.
    Interrupted {
        executed: Vec<i64>,
        lost_at: i64,
    },
    /// Rows removed by the retention purge.
    Purged {
        tokens: u64,
        actions: u64,
    },
    /// A mutation refused by the safety policy without a row being written.
    Blocked {
        email_id: i64,
        action_type: ActionType,
        reason: String,
    },
}

pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAudit;

impl AuditSink for TracingAudit {
    fn record(&self, event: AuditEvent) {
        match &event {
            AuditEvent::Enqueued {
                action_id,
                email_id,
                action_type,
                proposed_by,
            } => tracing::info!(
                target: "audit",
                action_id,
                email_id,
                action = %action_type,
                proposed_by = %proposed_by,
                "action enqueued"
            ),
            AuditEvent::Approved { action_id, by } => {
                tracing::info!(target: "audit", action_id, by = %by, "action approved")
            }
            AuditEvent::Rejected { action_id, by } => {
                tracing::info!(target: "audit", action_id, by = %by, "action rejected")
            }
            AuditEvent::Applied {
                action_id,
                email_id,
                action_type,
            } => tracing::info!(
                target: "audit",
                action_id = ?action_id,
                email_id,
                action = %action_type,
                "action applied"
            ),
            AuditEvent::Failed {
                action_id,
                email_id,
                action_type,
                error_code,
            } => tracing::warn!(
                target: "audit",
                action_id = ?action_id,
                email_id,
                action = %action_type,
                error_code = %error_code,
                "action failed"
            ),
            AuditEvent::Interrupted { executed, lost_at } => tracing::warn!(
                target: "audit",
                executed = ?executed,
                lost_at,
                "apply interrupted after server-side changes"
            ),
            AuditEvent::Purged { tokens, actions } => {
                tracing::info!(target: "audit", tokens, actions, "retention purge")
            }
            AuditEvent::Blocked {
                email_id,
                action_type,
                reason,
            } => tracing::info!(
                target: "audit",
                email_id,
                action = %action_type,
                reason = %reason,
                "action blocked by policy"
            ),
        }
    }
}

#[cfg(test)]
pub mod recording {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct RecordingAudit {
        events: Mutex<Vec<AuditEvent>>,
    }

    impl RecordingAudit {
        pub fn events(&self) -> Vec<AuditEvent> {
            self.events.lock().map(|e| e.clone()).unwrap_or_default()
        }
    }

    impl AuditSink for RecordingAudit {
        fn record(&self, event: AuditEvent) {
            if let Ok(mut events) = self.events.lock() {
                events.push(event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_serialize_with_tag() {
        let json = serde_json::to_value(AuditEvent::Rejected {
            action_id: 3,
            by: "alice".to_string(),
        })
        .unwrap();
        assert_eq!(json["event"], "rejected");
        assert_eq!(json["action_id"], 3);
    }

    #[test]
    fn test_tracing_sink_accepts_every_event() {
        let sink = TracingAudit;
        sink.record(AuditEvent::Failed {
            action_id: Some(1),
            email_id: 2,
            action_type: ActionType::Delete,
            error_code: "OPERATION_FAILED".to_string(),
        });
        sink.record(AuditEvent::Blocked {
            email_id: 2,
            action_type: ActionType::MoveFolder,
            reason: "folder not allowed".to_string(),
        });
        sink.record(AuditEvent::Interrupted {
            executed: vec![1, 2],
            lost_at: 3,
        });
        sink.record(AuditEvent::Purged {
            tokens: 4,
            actions: 0,
        });
    }
}
