use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::{
    DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_MAX_APPLY_PER_REQUEST, DEFAULT_OPERATION_TIMEOUT_SECS,
    DEFAULT_TOKEN_TTL_SECS, MAX_TOKEN_TTL_SECS, MIN_TOKEN_TTL_SECS,
};

const ENV_CONFIG: &str = "MAILWARDEN_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub imap: ImapConfig,
    #[serde(default)]
    pub folders: FolderConfig,
    #[serde(default)]
    pub safety: SafetySettings,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImapConfig {
    pub server: String,
    #[serde(default = "default_imap_port")]
    pub port: u16,
    #[serde(default = "default_true")]
    pub tls: bool,
    pub username: String,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_operation_timeout_secs")]
    pub operation_timeout_secs: u64,
}

impl ImapConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }
}

/// Well-known destination folders. Together with `extra_allowed` they form
/// the allowlist for MOVE_FOLDER actions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FolderConfig {
    #[serde(default = "default_archive_folder")]
    pub archive: String,
    #[serde(default = "default_spam_folder")]
    pub spam: String,
    #[serde(default = "default_quarantine_folder")]
    pub quarantine: String,
    #[serde(default = "default_review_folder")]
    pub review: String,
    #[serde(default)]
    pub extra_allowed: Vec<String>,
}

impl Default for FolderConfig {
    fn default() -> Self {
        Self {
            archive: default_archive_folder(),
            spam: default_spam_folder(),
            quarantine: default_quarantine_folder(),
            review: default_review_folder(),
            extra_allowed: Vec::new(),
        }
    }
}

impl FolderConfig {
    /// De-duplicated, non-empty union of the configured folders.
    pub fn allowlist(&self) -> BTreeSet<String> {
        [&self.archive, &self.spam, &self.quarantine, &self.review]
            .into_iter()
            .chain(self.extra_allowed.iter())
            .map(|f| f.trim())
            .filter(|f| !f.is_empty())
            .map(str::to_string)
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetySettings {
    /// Suppress every mutating mailbox operation
    #[serde(default = "default_true")]
    pub safe_mode: bool,
    /// Queue proposals for human review instead of executing them
    #[serde(default)]
    pub require_approval: bool,
    /// Permit DELETE actions
    #[serde(default)]
    pub allow_destructive: bool,
    /// Spam goes to the spam folder instead of quarantine in immediate mode
    #[serde(default)]
    pub delete_spam: bool,
    #[serde(default)]
    pub mark_as_read: bool,
    #[serde(default = "default_max_apply_per_request")]
    pub max_apply_per_request: usize,
    #[serde(default = "default_token_ttl_secs")]
    pub token_ttl_secs: u64,
}

impl Default for SafetySettings {
    fn default() -> Self {
        Self {
            safe_mode: true,
            require_approval: false,
            allow_destructive: false,
            delete_spam: false,
            mark_as_read: false,
            max_apply_per_request: default_max_apply_per_request(),
            token_ttl_secs: default_token_ttl_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Keep full error text in responses and logs (trusted local debugging only)
    #[serde(default)]
    pub verbose_errors: bool,
    /// SQLite database path (default: data dir)
    #[serde(default)]
    pub database: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            verbose_errors: false,
            database: None,
        }
    }
}

/// How long finished actions are kept. Expired apply tokens are always purged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Days to keep APPLIED, FAILED and REJECTED actions (0 = keep forever)
    #[serde(default)]
    pub actions_days: u32,
}

/// Immutable snapshot of everything the safety policy and the workflow
/// controller consult. Built once from [`Config`] and passed by value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SafetyConfig {
    pub safe_mode: bool,
    pub require_approval: bool,
    pub allow_destructive: bool,
    pub delete_spam: bool,
    pub mark_as_read: bool,
    pub allowed_folders: BTreeSet<String>,
    pub archive_folder: String,
    pub spam_folder: String,
    pub quarantine_folder: String,
    pub max_apply_per_request: usize,
    pub token_ttl: Duration,
}

impl SafetyConfig {
    pub fn is_folder_allowed(&self, folder: &str) -> bool {
        self.allowed_folders.contains(folder)
    }
}

impl Default for SafetyConfig {
    fn default() -> Self {
        let folders = FolderConfig::default();
        let safety = SafetySettings::default();
        Self {
            safe_mode: safety.safe_mode,
            require_approval: safety.require_approval,
            allow_destructive: safety.allow_destructive,
            delete_spam: safety.delete_spam,
            mark_as_read: safety.mark_as_read,
            allowed_folders: folders.allowlist(),
            archive_folder: folders.archive,
            spam_folder: folders.spam,
            quarantine_folder: folders.quarantine,
            max_apply_per_request: safety.max_apply_per_request,
            token_ttl: Duration::from_secs(safety.token_ttl_secs),
        }
    }
}

fn default_imap_port() -> u16 {
    993
}

fn default_true() -> bool {
    true
}

fn default_connect_timeout_secs() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_SECS
}

fn default_operation_timeout_secs() -> u64 {
    DEFAULT_OPERATION_TIMEOUT_SECS
}

fn default_archive_folder() -> String {
    "Archive".to_string()
}

fn default_spam_folder() -> String {
    "Spam".to_string()
}

fn default_quarantine_folder() -> String {
    "Quarantine".to_string()
}

fn default_review_folder() -> String {
    "MailWarden/Review".to_string()
}

fn default_max_apply_per_request() -> usize {
    DEFAULT_MAX_APPLY_PER_REQUEST
}

fn default_token_ttl_secs() -> u64 {
    DEFAULT_TOKEN_TTL_SECS
}

fn default_bind() -> String {
    "127.0.0.1:8400".to_string()
}

impl Config {
    pub fn config_dir() -> Result<PathBuf> {
        let dir = dirs::config_dir()
            .context("Could not find config directory")?
            .join("mailwarden");
        Ok(dir)
    }

    pub fn data_dir() -> Result<PathBuf> {
        let dir = dirs::data_local_dir()
            .context("Could not find data directory")?
            .join("mailwarden");
        Ok(dir)
    }

    /// Explicit path, then `MAILWARDEN_CONFIG`, then the config directory.
    pub fn resolve_path(explicit: Option<&Path>) -> Result<PathBuf> {
        if let Some(path) = explicit {
            return Ok(path.to_path_buf());
        }
        if let Ok(path) = std::env::var(ENV_CONFIG)
            && !path.trim().is_empty()
        {
            return Ok(PathBuf::from(path));
        }
        Ok(Self::config_dir()?.join("config.toml"))
    }

    pub fn database_path(&self) -> Result<PathBuf> {
        match &self.server.database {
            Some(path) => Ok(path.clone()),
            None => Ok(Self::data_dir()?.join("mailwarden.db")),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            anyhow::bail!(
                "Configuration file not found at {}\n\
                 Please create a config file. Example:\n\n\
                 [imap]\n\
                 server = \"imap.example.com\"\n\
                 username = \"you@example.com\"\n\n\
                 [safety]\n\
                 safe_mode = false\n\
                 require_approval = true",
                path.display()
            );
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        self.server
            .bind
            .parse()
            .with_context(|| format!("Invalid bind address '{}'", self.server.bind))
    }

    /// A bind address other than loopback means the API is reachable from
    /// the network.
    pub fn is_web_exposed(&self) -> bool {
        self.bind_addr().map(|a| !a.ip().is_loopback()).unwrap_or(true)
    }

    /// Fail-closed checks run before anything is served.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.imap.server.trim().is_empty() {
            errors.push("imap.server is required".to_string());
        }
        if self.imap.username.trim().is_empty() {
            errors.push("imap.username is required".to_string());
        }
        if !self.imap.tls {
            errors.push("imap.tls = false is not supported; plaintext IMAP is refused".to_string());
        }
        if self.imap.connect_timeout_secs == 0 || self.imap.operation_timeout_secs == 0 {
            errors.push("imap timeouts must be greater than zero".to_string());
        }
        if let Err(e) = self.bind_addr() {
            errors.push(e.to_string());
        }
        if self.is_web_exposed() {
            if self.server.verbose_errors {
                errors.push(
                    "server.verbose_errors must be false when the API is bound to a non-loopback address"
                        .to_string(),
                );
            }
            if !self.safety.safe_mode && !self.safety.require_approval {
                errors.push(
                    "a non-loopback bind requires safety.safe_mode or safety.require_approval"
                        .to_string(),
                );
            }
        }
        if self.safety.max_apply_per_request == 0 {
            errors.push("safety.max_apply_per_request must be at least 1".to_string());
        }
        if !(MIN_TOKEN_TTL_SECS..=MAX_TOKEN_TTL_SECS).contains(&self.safety.token_ttl_secs) {
            errors.push(format!(
                "safety.token_ttl_secs must be between {} and {}",
                MIN_TOKEN_TTL_SECS, MAX_TOKEN_TTL_SECS
            ));
        }
        if self.folders.allowlist().is_empty() {
            errors.push("at least one allowed folder must be configured".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Invalid configuration:\n  - {}", errors.join("\n  - "));
        }
        Ok(())
    }

    pub fn safety_config(&self) -> SafetyConfig {
        SafetyConfig {
            safe_mode: self.safety.safe_mode,
            require_approval: self.safety.require_approval,
            allow_destructive: self.safety.allow_destructive,
            delete_spam: self.safety.delete_spam,
            mark_as_read: self.safety.mark_as_read,
            allowed_folders: self.folders.allowlist(),
            archive_folder: self.folders.archive.clone(),
            spam_folder: self.folders.spam.clone(),
            quarantine_folder: self.folders.quarantine.clone(),
            max_apply_per_request: self.safety.max_apply_per_request,
            token_ttl: Duration::from_secs(self.safety.token_ttl_secs),
        }
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        fs::create_dir_all(Self::config_dir()?)?;
        let db = self.database_path()?;
        if let Some(parent) = db.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create data directory: {}", parent.display()))?;
        }
        Ok(())
    }
}
