use anyhow::Result;
use std::env;
use std::fs;
use std::io::Write;
use std::path::PathBuf;

#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;

const ENV_PASSWORD: &str = "MAILWARDEN_IMAP_PASSWORD";
const KEYRING_SERVICE: &str = "mailwarden";

/// Which credential backends are usable. Never carries the secret itself.
#[derive(Debug, Clone)]
pub struct CredentialDebugInfo {
    pub keyring_has_entry: bool,
    pub env_var_set: bool,
    pub file_path: PathBuf,
    pub file_exists: bool,
}

impl std::fmt::Display for CredentialDebugInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Credential sources:")?;
        writeln!(
            f,
            "  Environment var ({}): {}",
            ENV_PASSWORD,
            if self.env_var_set { "set" } else { "not set" }
        )?;
        writeln!(
            f,
            "  Keyring entry: {}",
            if self.keyring_has_entry {
                "present"
            } else {
                "absent"
            }
        )?;
        writeln!(f, "  File fallback: {}", self.file_path.display())?;
        writeln!(f, "  File exists: {}", self.file_exists)?;
        Ok(())
    }
}

/// IMAP password lookup: environment, then OS keyring, then a 0600 file in
/// the config directory.
pub struct CredentialStore {
    username: String,
    password_file: PathBuf,
}

impl CredentialStore {
    pub fn new(username: &str) -> Self {
        let safe_name = username.replace(['@', '.', '/', '\\', ':'], "_");
        let password_file = crate::config::Config::config_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(format!(".password_{}", safe_name));

        Self {
            username: username.to_string(),
            password_file,
        }
    }

    pub fn debug_info(&self) -> CredentialDebugInfo {
        CredentialDebugInfo {
            keyring_has_entry: self.keyring_get().is_some(),
            env_var_set: Self::env_password().is_some(),
            file_path: self.password_file.clone(),
            file_exists: self.password_file.exists(),
        }
    }

    fn env_password() -> Option<String> {
        env::var(ENV_PASSWORD).ok().filter(|s| !s.is_empty())
    }

    fn keyring_key(&self) -> String {
        format!("imap:{}", self.username)
    }

    fn keyring_get(&self) -> Option<String> {
        let entry = keyring::Entry::new(KEYRING_SERVICE, &self.keyring_key()).ok()?;
        entry.get_password().ok()
    }

    fn keyring_set(&self, password: &str) -> bool {
        match keyring::Entry::new(KEYRING_SERVICE, &self.keyring_key()) {
            Ok(entry) => entry.set_password(password).is_ok(),
            Err(_) => false,
        }
    }

    fn file_get(&self) -> Option<String> {
        fs::read_to_string(&self.password_file)
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    fn file_set(&self, password: &str) -> Result<()> {
        if let Some(parent) = self.password_file.parent() {
            fs::create_dir_all(parent)?;
        }

        // Create with restricted permissions up front to avoid TOCTOU
        #[cfg(unix)]
        {
            let mut file = fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(&self.password_file)?;
            file.write_all(password.as_bytes())?;
        }

        #[cfg(not(unix))]
        {
            fs::write(&self.password_file, password)?;
        }

        Ok(())
    }

    pub fn get_imap_password(&self) -> Result<String> {
        if let Some(pwd) = Self::env_password() {
            return Ok(pwd);
        }

        if let Some(pwd) = self.keyring_get() {
            return Ok(pwd);
        }

        if let Some(pwd) = self.file_get() {
            return Ok(pwd);
        }

        anyhow::bail!(
            "IMAP password not found. Set {} or run 'mailwarden set-password'.",
            ENV_PASSWORD
        )
    }

    /// Store in the keyring, falling back to the password file.
    pub fn set_password(&self, password: &str) -> Result<()> {
        if self.keyring_set(password) && self.keyring_get().is_some() {
            return Ok(());
        }

        tracing::warn!("Keyring unavailable, using file-based password storage");
        self.file_set(password)
    }
}
