//! Mailbox executor: a scoped IMAP connection that performs one operation
//! per call and reports a structured result.
//!
//! This module is split into:
//! - `mod.rs` - `MailboxOp`, error types, the connector/session traits and `MailboxScope`
//! - `imap.rs` - The `async-imap` implementation over rustls
//! - `fake.rs` - Scriptable in-process connector for tests
//!
//! The executor never writes to the action store; the workflow controller
//! persists whatever it reports.

#[cfg(test)]
pub mod fake;
mod imap;

use std::future::Future;
use std::time::Duration;

use crate::sanitize::ErrorCategory;
use crate::types::{ActionProposal, ActionType, PendingAction};

pub use imap::ImapConnector;

/// One IMAP-level mutation against a single message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MailboxOp {
    Move {
        uid: u32,
        folder: String,
        target: String,
    },
    MarkRead {
        uid: u32,
        folder: String,
    },
    AddFlag {
        uid: u32,
        folder: String,
    },
    Delete {
        uid: u32,
        folder: String,
    },
}

impl MailboxOp {
    /// `None` for a move without a destination.
    pub fn new(
        action_type: ActionType,
        uid: u32,
        folder: &str,
        target: Option<&str>,
    ) -> Option<Self> {
        let folder = folder.to_string();
        Some(match action_type {
            ActionType::MoveFolder => MailboxOp::Move {
                uid,
                folder,
                target: target?.to_string(),
            },
            ActionType::MarkRead => MailboxOp::MarkRead { uid, folder },
            ActionType::AddFlag => MailboxOp::AddFlag { uid, folder },
            ActionType::Delete => MailboxOp::Delete { uid, folder },
        })
    }

    pub fn for_action(action: &PendingAction) -> Option<Self> {
        Self::new(
            action.action_type,
            action.message_uid,
            &action.source_folder,
            action.target_folder.as_deref(),
        )
    }

    pub fn for_proposal(proposal: &ActionProposal) -> Option<Self> {
        Self::new(
            proposal.action_type,
            proposal.message_uid,
            &proposal.source_folder,
            proposal.target_folder.as_deref(),
        )
    }

    pub fn uid(&self) -> u32 {
        match self {
            MailboxOp::Move { uid, .. }
            | MailboxOp::MarkRead { uid, .. }
            | MailboxOp::AddFlag { uid, .. }
            | MailboxOp::Delete { uid, .. } => *uid,
        }
    }

    /// Folder the message currently lives in.
    pub fn folder(&self) -> &str {
        match self {
            MailboxOp::Move { folder, .. }
            | MailboxOp::MarkRead { folder, .. }
            | MailboxOp::AddFlag { folder, .. }
            | MailboxOp::Delete { folder, .. } => folder,
        }
    }

    pub fn action_type(&self) -> ActionType {
        match self {
            MailboxOp::Move { .. } => ActionType::MoveFolder,
            MailboxOp::MarkRead { .. } => ActionType::MarkRead,
            MailboxOp::AddFlag { .. } => ActionType::AddFlag,
            MailboxOp::Delete { .. } => ActionType::Delete,
        }
    }
}

/// Failure to obtain an authenticated session.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("connection timed out after {0:?}")]
    Timeout(Duration),
    #[error("failed to connect to {addr}: {source}")]
    Network {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("TLS handshake failed: {0}")]
    Tls(String),
    #[error("login failed: {0}")]
    Auth(String),
}

impl ErrorCategory for ConnectError {
    fn category(&self) -> &'static str {
        match self {
            ConnectError::Timeout(_) => "ConnectTimeout",
            ConnectError::Network { .. } => "ConnectionFailed",
            ConnectError::Tls(_) => "TlsHandshakeFailed",
            ConnectError::Auth(_) => "AuthenticationFailed",
        }
    }
}

/// Failure of a single operation on an open session.
///
/// `ConnectionLost` and `Timeout` mean the session itself is gone; the
/// caller must treat them like a failed connect. `Operation` means the
/// server refused this one command and the session is still usable.
#[derive(Debug, thiserror::Error)]
pub enum ExecuteError {
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("{0}")]
    Operation(String),
}

impl ExecuteError {
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            ExecuteError::ConnectionLost(_) | ExecuteError::Timeout(_)
        )
    }
}

impl ErrorCategory for ExecuteError {
    fn category(&self) -> &'static str {
        match self {
            ExecuteError::ConnectionLost(_) => "ConnectionLost",
            ExecuteError::Timeout(_) => "OperationTimeout",
            ExecuteError::Operation(_) => "OperationFailed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MailboxTimeouts {
    pub connect: Duration,
    pub operation: Duration,
}

/// Produces authenticated sessions. Implementations must not hand out a
/// session that has not completed login.
pub trait MailboxConnector: Send + Sync {
    type Session: MailboxSession;

    fn timeouts(&self) -> MailboxTimeouts;

    fn connect(&self) -> impl Future<Output = Result<Self::Session, ConnectError>> + Send;
}

pub trait MailboxSession: Send {
    fn execute(&mut self, op: &MailboxOp)
    -> impl Future<Output = Result<(), ExecuteError>> + Send;

    /// Best-effort LOGOUT; the connection is closed either way.
    fn logout(self) -> impl Future<Output = ()> + Send;
}

/// A live session with enforced timeouts and guaranteed release.
///
/// `close` logs out; dropping the scope on any other path (early return,
/// `?`, panic unwinding) drops the session and with it the socket.
pub struct MailboxScope<S: MailboxSession> {
    session: Option<S>,
    timeouts: MailboxTimeouts,
}

impl<S: MailboxSession> MailboxScope<S> {
    /// Connect within the connect timeout. Fails fast; there is no
    /// half-open scope.
    pub async fn open<C>(connector: &C) -> Result<Self, ConnectError>
    where
        C: MailboxConnector<Session = S>,
    {
        let timeouts = connector.timeouts();
        let session = tokio::time::timeout(timeouts.connect, connector.connect())
            .await
            .map_err(|_| ConnectError::Timeout(timeouts.connect))??;

        Ok(Self {
            session: Some(session),
            timeouts,
        })
    }

    pub fn is_open(&self) -> bool {
        self.session.is_some()
    }

    /// Run one operation within the operation timeout. After a connection
    /// failure the session is discarded and every later call fails the same way.
    pub async fn execute(&mut self, op: &MailboxOp) -> Result<(), ExecuteError> {
        let Some(session) = self.session.as_mut() else {
            return Err(ExecuteError::ConnectionLost("session closed".to_string()));
        };

        let result = match tokio::time::timeout(self.timeouts.operation, session.execute(op)).await
        {
            Ok(result) => result,
            Err(_) => Err(ExecuteError::Timeout(self.timeouts.operation)),
        };

        if let Err(e) = &result
            && e.is_connection_failure()
        {
            self.session = None;
        }
        result
    }

    pub async fn close(mut self) {
        if let Some(session) = self.session.take() {
            let timeout = self.timeouts.operation;
            if tokio::time::timeout(timeout, session.logout()).await.is_err() {
                tracing::debug!("Mailbox logout timed out; connection dropped");
            }
        }
    }
}

impl<S: MailboxSession> Drop for MailboxScope<S> {
    fn drop(&mut self) {
        if self.session.take().is_some() {
            tracing::debug!("Mailbox scope released without logout");
        }
    }
}
