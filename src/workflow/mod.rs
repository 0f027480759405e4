//! Workflow controller: the propose → approve/reject → apply lifecycle.
//!
//! This module is split into:
//! - `mod.rs` - `Controller` and its shared helpers
//! - `types.rs` - Requests, reports and `WorkflowError`
//! - `enqueue.rs` - Turning classifier output into queued or executed actions
//! - `review.rs` - Approve/reject and read-only queries
//! - `apply.rs` - Preview, apply and dry run
//! - `retention.rs` - Purging expired tokens and old finished actions
//!
//! The controller is the only writer to the action store. Every check that
//! needs no I/O (safe mode, id-set caps, token, policy) runs before the
//! mailbox is contacted.

mod apply;
mod enqueue;
mod retention;
mod review;
mod types;

use std::sync::Arc;
use tokio::sync::Mutex;

use crate::audit::{AuditEvent, AuditSink};
use crate::config::SafetyConfig;
use crate::mailbox::MailboxConnector;
use crate::policy::SafetyPolicy;
use crate::sanitize::Sanitizer;
use crate::store::ActionStore;
use crate::token::{InFlightTokens, TokenIssuer};

pub use retention::spawn_retention_task;
pub use types::{
    ApplyReport, ApplyRequest, ApplyResult, EmailDisposition, EnqueueOutcome, ExecutedAction,
    Preview, PreviewEntry, PreviewRequest, ProposeReport, ResultStatus, WorkflowError,
};

pub struct Controller<S, C> {
    policy: SafetyPolicy,
    store: S,
    connector: C,
    issuer: TokenIssuer,
    sanitizer: Sanitizer,
    audit: Arc<dyn AuditSink>,
    /// Held for the whole of a batch apply.
    batch_lock: Mutex<()>,
    /// Tokens presented by an apply that has not committed yet.
    in_flight: InFlightTokens,
}

impl<S: ActionStore, C: MailboxConnector> Controller<S, C> {
    pub fn new(
        config: SafetyConfig,
        store: S,
        connector: C,
        sanitizer: Sanitizer,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        let issuer = TokenIssuer::new(config.token_ttl);
        Self {
            policy: SafetyPolicy::new(config),
            store,
            connector,
            issuer,
            sanitizer,
            audit,
            batch_lock: Mutex::new(()),
            in_flight: InFlightTokens::default(),
        }
    }

    pub fn policy(&self) -> &SafetyPolicy {
        &self.policy
    }

    #[cfg(test)]
    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn sanitizer(&self) -> &Sanitizer {
        &self.sanitizer
    }

    #[cfg(test)]
    pub fn connector(&self) -> &C {
        &self.connector
    }

    fn config(&self) -> &SafetyConfig {
        self.policy.config()
    }

    fn emit(&self, event: AuditEvent) {
        self.audit.record(event);
    }
}
