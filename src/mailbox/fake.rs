//! In-process mailbox for exercising the executor and the workflow
//! controller without a server.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{
    ConnectError, ExecuteError, MailboxConnector, MailboxOp, MailboxSession, MailboxTimeouts,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectMode {
    Ok,
    Fail,
    Hang,
}

#[derive(Default)]
struct FakeState {
    connects: AtomicUsize,
    open: AtomicUsize,
    logouts: AtomicUsize,
    executed: Mutex<Vec<MailboxOp>>,
}

pub struct FakeConnector {
    state: Arc<FakeState>,
    timeouts: MailboxTimeouts,
    mode: ConnectMode,
    fail_uids: HashSet<u32>,
    lost_uids: HashSet<u32>,
    hang_uids: HashSet<u32>,
    op_delay: Option<Duration>,
}

impl Default for FakeConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeConnector {
    pub fn new() -> Self {
        Self {
            state: Arc::new(FakeState::default()),
            timeouts: MailboxTimeouts {
                connect: Duration::from_secs(5),
                operation: Duration::from_secs(5),
            },
            mode: ConnectMode::Ok,
            fail_uids: HashSet::new(),
            lost_uids: HashSet::new(),
            hang_uids: HashSet::new(),
            op_delay: None,
        }
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.operation = timeout;
        self
    }

    /// Login is refused.
    pub fn failing_connect(mut self) -> Self {
        self.mode = ConnectMode::Fail;
        self
    }

    /// Connect never completes.
    pub fn hanging_connect(mut self) -> Self {
        self.mode = ConnectMode::Hang;
        self
    }

    /// The server answers NO for this uid.
    pub fn fail_uid(mut self, uid: u32) -> Self {
        self.fail_uids.insert(uid);
        self
    }

    /// The socket dies while handling this uid.
    pub fn drop_on_uid(mut self, uid: u32) -> Self {
        self.lost_uids.insert(uid);
        self
    }

    /// The server never answers for this uid.
    pub fn hang_on_uid(mut self, uid: u32) -> Self {
        self.hang_uids.insert(uid);
        self
    }

    /// Every operation takes `delay` before it is answered.
    pub fn slow_ops(mut self, delay: Duration) -> Self {
        self.op_delay = Some(delay);
        self
    }

    pub fn connects(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub fn open_sessions(&self) -> usize {
        self.state.open.load(Ordering::SeqCst)
    }

    pub fn logouts(&self) -> usize {
        self.state.logouts.load(Ordering::SeqCst)
    }

    pub fn executed(&self) -> Vec<MailboxOp> {
        self.state
            .executed
            .lock()
            .map(|ops| ops.clone())
            .unwrap_or_default()
    }
}

impl MailboxConnector for FakeConnector {
    type Session = FakeSession;

    fn timeouts(&self) -> MailboxTimeouts {
        self.timeouts
    }

    async fn connect(&self) -> Result<FakeSession, ConnectError> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        match self.mode {
            ConnectMode::Ok => {}
            ConnectMode::Fail => {
                return Err(ConnectError::Auth(
                    "NO [AUTHENTICATIONFAILED] invalid credentials".to_string(),
                ));
            }
            ConnectMode::Hang => std::future::pending::<()>().await,
        }

        self.state.open.fetch_add(1, Ordering::SeqCst);
        Ok(FakeSession {
            state: Arc::clone(&self.state),
            fail_uids: self.fail_uids.clone(),
            lost_uids: self.lost_uids.clone(),
            hang_uids: self.hang_uids.clone(),
            op_delay: self.op_delay,
        })
    }
}

pub struct FakeSession {
    state: Arc<FakeState>,
    fail_uids: HashSet<u32>,
    lost_uids: HashSet<u32>,
    hang_uids: HashSet<u32>,
    op_delay: Option<Duration>,
}

impl MailboxSession for FakeSession {
    async fn execute(&mut self, op: &MailboxOp) -> Result<(), ExecuteError> {
        let uid = op.uid();
        if let Some(delay) = self.op_delay {
            tokio::time::sleep(delay).await;
        }
        if self.hang_uids.contains(&uid) {
            std::future::pending::<()>().await;
        }
        if self.lost_uids.contains(&uid) {
            return Err(ExecuteError::ConnectionLost("connection reset by peer".to_string()));
        }
        if self.fail_uids.contains(&uid) {
            return Err(ExecuteError::Operation(format!(
                "NO [TRYCREATE] uid {uid} could not be processed"
            )));
        }
        if let Ok(mut ops) = self.state.executed.lock() {
            ops.push(op.clone());
        }
        Ok(())
    }

    async fn logout(self) {
        self.state.logouts.fetch_add(1, Ordering::SeqCst);
    }
}

impl Drop for FakeSession {
    fn drop(&mut self) {
        self.state.open.fetch_sub(1, Ordering::SeqCst);
    }
}
