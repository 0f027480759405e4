//! Periodic purge of expired tokens and old finished actions.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use super::{Controller, WorkflowError};
use crate::audit::AuditEvent;
use crate::mailbox::MailboxConnector;
use crate::store::{ActionStore, PurgeReport};

impl<S: ActionStore, C: MailboxConnector> Controller<S, C> {
    /// Remove expired tokens, plus finished actions older than
    /// `actions_days` when that is non-zero. Open actions are never touched.
    pub async fn purge(&self, actions_days: u32) -> Result<PurgeReport, WorkflowError> {
        let now = Utc::now();
        let actions_before =
            (actions_days > 0).then(|| now - chrono::Duration::days(i64::from(actions_days)));

        let report = self.store.purge(now, actions_before).await?;
        if report.tokens > 0 || report.actions > 0 {
            self.emit(AuditEvent::Purged {
                tokens: report.tokens,
                actions: report.actions,
            });
        }
        tracing::debug!(
            tokens = report.tokens,
            actions = report.actions,
            "Retention purge finished"
        );
        Ok(report)
    }
}

/// Purge now and then every `every` until the runtime shuts down.
pub fn spawn_retention_task<S, C>(
    controller: Arc<Controller<S, C>>,
    actions_days: u32,
    every: Duration,
) -> JoinHandle<()>
where
    S: ActionStore + 'static,
    C: MailboxConnector + 'static,
{
    tokio::spawn(async move {
        loop {
            if let Err(e) = controller.purge(actions_days).await {
                tracing::warn!(
                    "Retention purge failed: {}",
                    controller.sanitizer().sanitize(&e)
                );
            }
            tokio::time::sleep(every).await;
        }
    })
}
