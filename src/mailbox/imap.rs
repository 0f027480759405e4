//! IMAP session over TLS: connect, login and the four mutating operations.

use async_imap::types::Capability;
use futures::StreamExt;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};

use super::{
    ConnectError, ExecuteError, MailboxConnector, MailboxOp, MailboxSession, MailboxTimeouts,
};
use crate::config::ImapConfig;

type ImapSession = async_imap::Session<Compat<TlsStream<TcpStream>>>;

/// Connects with the configured account. The password is resolved once at
/// startup and never logged.
pub struct ImapConnector {
    config: ImapConfig,
    password: String,
    tls: TlsConnector,
}

impl std::fmt::Debug for ImapConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImapConnector")
            .field("server", &self.config.server)
            .field("port", &self.config.port)
            .finish_non_exhaustive()
    }
}

impl ImapConnector {
    pub fn new(config: ImapConfig, password: String) -> Self {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        Self {
            config,
            password,
            tls: TlsConnector::from(Arc::new(tls_config)),
        }
    }
}

impl MailboxConnector for ImapConnector {
    type Session = ImapMailbox;

    fn timeouts(&self) -> MailboxTimeouts {
        MailboxTimeouts {
            connect: self.config.connect_timeout(),
            operation: self.config.operation_timeout(),
        }
    }

    async fn connect(&self) -> Result<ImapMailbox, ConnectError> {
        let addr = format!("{}:{}", self.config.server, self.config.port);

        let tcp = TcpStream::connect(&addr)
            .await
            .map_err(|source| ConnectError::Network {
                addr: addr.clone(),
                source,
            })?;

        let server_name = ServerName::try_from(self.config.server.clone())
            .map_err(|e| ConnectError::Tls(e.to_string()))?;
        let tls_stream = self
            .tls
            .connect(server_name, tcp)
            .await
            .map_err(|e| ConnectError::Tls(e.to_string()))?;

        // The client is only a temporary handle until LOGIN succeeds; on
        // failure it is dropped here and the socket with it.
        let client = async_imap::Client::new(tls_stream.compat());
        let mut session = client
            .login(&self.config.username, &self.password)
            .await
            .map_err(|(e, _client)| ConnectError::Auth(e.to_string()))?;

        // UIDPLUS (RFC 4315) allows expunging a single message
        let has_uidplus = match session.capabilities().await {
            Ok(caps) => caps.has(&Capability::Atom("UIDPLUS".into())),
            Err(e) => {
                tracing::debug!("CAPABILITY failed, assuming no UIDPLUS: {}", e);
                false
            }
        };

        tracing::info!(server = %self.config.server, has_uidplus, "Connected to IMAP server");

        Ok(ImapMailbox {
            session,
            has_uidplus,
            selected: None,
        })
    }
}

pub struct ImapMailbox {
    session: ImapSession,
    has_uidplus: bool,
    selected: Option<String>,
}

/// Socket-level failures end the session; anything else is the server
/// refusing one command.
fn classify(e: async_imap::error::Error, what: &str) -> ExecuteError {
    match e {
        async_imap::error::Error::Io(io) => ExecuteError::ConnectionLost(io.to_string()),
        async_imap::error::Error::ConnectionLost => {
            ExecuteError::ConnectionLost("server closed the connection".to_string())
        }
        other => ExecuteError::Operation(format!("{what}: {other}")),
    }
}

impl ImapMailbox {
    async fn select(&mut self, folder: &str) -> Result<(), ExecuteError> {
        if self.selected.as_deref() == Some(folder) {
            return Ok(());
        }
        self.session
            .select(folder)
            .await
            .map_err(|e| classify(e, "SELECT failed"))?;
        self.selected = Some(folder.to_string());
        Ok(())
    }

    async fn ensure_folder(&mut self, folder: &str) -> Result<(), ExecuteError> {
        let names: Vec<String> = {
            let mut stream = self
                .session
                .list(Some(""), Some(folder))
                .await
                .map_err(|e| classify(e, "LIST failed"))?;
            let mut names = Vec::new();
            while let Some(result) = stream.next().await {
                let name = result.map_err(|e| classify(e, "LIST failed"))?;
                names.push(name.name().to_string());
            }
            names
        };

        if names.iter().any(|n| n == folder) {
            return Ok(());
        }

        tracing::info!(folder, "Creating missing destination folder");
        self.session
            .create(folder)
            .await
            .map_err(|e| classify(e, "CREATE failed"))
    }

    async fn store_flag(&mut self, uid: u32, flag: &str) -> Result<(), ExecuteError> {
        let responses: Vec<_> = self
            .session
            .uid_store(uid.to_string(), format!("+FLAGS ({})", flag))
            .await
            .map_err(|e| classify(e, "STORE failed"))?
            .collect()
            .await;

        for response in responses {
            response.map_err(|e| classify(e, "STORE failed"))?;
        }
        Ok(())
    }

    async fn delete(&mut self, uid: u32) -> Result<(), ExecuteError> {
        self.store_flag(uid, "\\Deleted").await?;

        // A plain EXPUNGE would remove every \Deleted message in the folder,
        // not just this one. Without UIDPLUS the message stays flagged.
        if !self.has_uidplus {
            tracing::warn!(uid, "Server lacks UIDPLUS; message flagged \\Deleted but not expunged");
            return Ok(());
        }

        self.session
            .run_command_and_check_ok(&format!("UID EXPUNGE {}", uid))
            .await
            .map_err(|e| classify(e, "UID EXPUNGE failed"))
    }
}

impl MailboxSession for ImapMailbox {
    async fn execute(&mut self, op: &MailboxOp) -> Result<(), ExecuteError> {
        self.select(op.folder()).await?;

        match op {
            MailboxOp::Move { uid, target, .. } => {
                self.ensure_folder(target).await?;
                self.session
                    .uid_mv(uid.to_string(), target)
                    .await
                    .map_err(|e| classify(e, "MOVE failed"))?;
            }
            MailboxOp::MarkRead { uid, .. } => self.store_flag(*uid, "\\Seen").await?,
            MailboxOp::AddFlag { uid, .. } => self.store_flag(*uid, "\\Flagged").await?,
            MailboxOp::Delete { uid, .. } => self.delete(*uid).await?,
        }

        tracing::debug!(uid = op.uid(), action = %op.action_type(), "Mailbox operation done");
        Ok(())
    }

    async fn logout(mut self) {
        if let Err(e) = self.session.logout().await {
            tracing::debug!("LOGOUT failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ImapConfig {
        ImapConfig {
            server: "imap.example.com".to_string(),
            port: 993,
            tls: true,
            username: "user@example.com".to_string(),
            connect_timeout_secs: 7,
            operation_timeout_secs: 11,
        }
    }

    #[test]
    fn test_timeouts_come_from_config() {
        let connector = ImapConnector::new(config(), "pw".to_string());
        let t = connector.timeouts();
        assert_eq!(t.connect.as_secs(), 7);
        assert_eq!(t.operation.as_secs(), 11);
    }

    #[test]
    fn test_debug_output_omits_password() {
        let connector = ImapConnector::new(config(), "hunter2".to_string());
        let text = format!("{:?}", connector);
        assert!(text.contains("imap.example.com"));
        assert!(!text.contains("hunter2"));
    }

    #[test]
    fn test_socket_errors_are_connection_failures() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "broken pipe");
        assert!(classify(async_imap::error::Error::Io(io), "x").is_connection_failure());
        assert!(classify(async_imap::error::Error::ConnectionLost, "x").is_connection_failure());
        let refused = classify(async_imap::error::Error::No("no such mailbox".into()), "MOVE failed");
        assert!(!refused.is_connection_failure());
        assert!(refused.to_string().starts_with("MOVE failed"));
    }
}
