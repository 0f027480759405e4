mod api;
mod audit;
mod config;
mod constants;
mod credentials;
mod mailbox;
mod policy;
mod sanitize;
mod store;
mod token;
mod types;
mod workflow;

use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::audit::TracingAudit;
use crate::config::Config;
use crate::constants::PURGE_INTERVAL_SECS;
use crate::credentials::CredentialStore;
use crate::mailbox::ImapConnector;
use crate::sanitize::Sanitizer;
use crate::store::SqliteStore;
use crate::workflow::{Controller, spawn_retention_task};

fn setup_logging() {
    use std::fs::OpenOptions;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,mailwarden=debug"));

    // Append to a log file in the data directory when possible
    let log_file = Config::data_dir()
        .ok()
        .and_then(|dir| std::fs::create_dir_all(&dir).ok().map(|_| dir))
        .map(|dir| dir.join("mailwarden.log"))
        .and_then(|path| OpenOptions::new().create(true).append(true).open(&path).ok());

    if let Some(file) = log_file {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::sync::Mutex::new(file))
                    .with_ansi(false),
            )
            .init();
    } else {
        // Fallback to stderr if file logging fails
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn print_usage() {
    eprintln!(
        r#"mailwarden - Approval and safe-apply service for mailbox actions

Usage: mailwarden [--config <path>] [command]

Commands:
    serve           Start the HTTP API (default)
    check           Validate the configuration and the database, then exit
    set-password    Store the IMAP password in the OS keyring
    help            Show this help message

Configuration file: ~/.config/mailwarden/config.toml (or MAILWARDEN_CONFIG)
"#
    );
}

/// Config, directories and an opened, verified store.
async fn load(config_path: Option<PathBuf>) -> Result<(Config, SqliteStore)> {
    let path = Config::resolve_path(config_path.as_deref())?;
    let config = Config::load(&path)?;
    config.ensure_dirs()?;

    let sanitizer = Sanitizer::new(config.server.verbose_errors);
    let db_path = config.database_path()?;
    let store = SqliteStore::open(&db_path)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to open database: {}", sanitizer.sanitize(&e)))?;
    store
        .verify_schema()
        .await
        .map_err(|e| anyhow::anyhow!("Database check failed: {}", sanitizer.sanitize(&e)))?;
    store
        .ping()
        .await
        .map_err(|e| anyhow::anyhow!("Database unreachable: {}", sanitizer.sanitize(&e)))?;

    tracing::info!(config = %path.display(), database = %db_path.display(), "Configuration loaded");
    Ok((config, store))
}

async fn run_check(config_path: Option<PathBuf>) -> Result<()> {
    let (config, _store) = load(config_path).await?;
    let safety = config.safety_config();

    println!("Configuration OK");
    println!("  bind:              {}", config.server.bind);
    println!("  safe_mode:         {}", safety.safe_mode);
    println!("  require_approval:  {}", safety.require_approval);
    println!("  allow_destructive: {}", safety.allow_destructive);
    println!("  action retention:  {} days (0 = forever)", config.retention.actions_days);
    println!(
        "  allowed folders:   {}",
        safety
            .allowed_folders
            .iter()
            .cloned()
            .collect::<Vec<_>>()
            .join(", ")
    );
    println!();
    println!("{}", CredentialStore::new(&config.imap.username).debug_info());
    Ok(())
}

async fn run_serve(config_path: Option<PathBuf>) -> Result<()> {
    let (config, store) = load(config_path).await?;
    let safety = config.safety_config();
    let sanitizer = Sanitizer::new(config.server.verbose_errors);

    let password = CredentialStore::new(&config.imap.username)
        .get_imap_password()
        .context("No IMAP password available. Run 'mailwarden set-password' first.")?;
    let connector = ImapConnector::new(config.imap.clone(), password);

    if safety.safe_mode {
        tracing::warn!("Safe mode is enabled: no mailbox changes will be made");
    }

    let controller = Arc::new(Controller::new(
        safety,
        store,
        connector,
        sanitizer,
        Arc::new(TracingAudit),
    ));
    spawn_retention_task(
        Arc::clone(&controller),
        config.retention.actions_days,
        Duration::from_secs(PURGE_INTERVAL_SECS),
    );
    let app = api::router(controller);

    let addr = config.bind_addr()?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    tracing::info!(%addr, "Listening");
    eprintln!("mailwarden listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down");
        })
        .await
        .context("HTTP server failed")
}

fn run_set_password(config_path: Option<PathBuf>) -> Result<()> {
    use std::io::{self, Write};

    let path = Config::resolve_path(config_path.as_deref())?;
    let config = Config::load(&path)?;
    config.ensure_dirs()?;

    print!("IMAP password for {}: ", config.imap.username);
    io::stdout().flush()?;
    let password = rpassword_read()?;
    println!();
    if password.is_empty() {
        anyhow::bail!("Empty password, nothing stored");
    }

    let creds = CredentialStore::new(&config.imap.username);
    creds.set_password(&password)?;

    // Verify the password can be read back
    match creds.get_imap_password() {
        Ok(_) => println!("Password stored successfully."),
        Err(e) => {
            eprintln!("Warning: Failed to store credentials.");
            return Err(e);
        }
    }
    Ok(())
}

fn rpassword_read() -> Result<String> {
    use std::io;

    // Disable echo
    let _guard = DisableEcho::new()?;

    let mut password = String::new();
    io::stdin().read_line(&mut password)?;
    Ok(password.trim().to_string())
}

struct DisableEcho {
    #[cfg(unix)]
    original: libc::termios,
}

impl DisableEcho {
    #[cfg(unix)]
    fn new() -> Result<Self> {
        use std::mem::MaybeUninit;
        use std::os::unix::io::AsRawFd;

        let fd = std::io::stdin().as_raw_fd();
        let mut termios = MaybeUninit::<libc::termios>::uninit();

        unsafe {
            if libc::tcgetattr(fd, termios.as_mut_ptr()) != 0 {
                anyhow::bail!("Failed to get terminal attributes");
            }
            let original = termios.assume_init();
            let mut new = original;
            new.c_lflag &= !libc::ECHO;
            if libc::tcsetattr(fd, libc::TCSANOW, &new) != 0 {
                anyhow::bail!("Failed to set terminal attributes");
            }
            Ok(Self { original })
        }
    }

    #[cfg(not(unix))]
    fn new() -> Result<Self> {
        Ok(Self {})
    }
}

#[cfg(unix)]
impl Drop for DisableEcho {
    fn drop(&mut self) {
        use std::os::unix::io::AsRawFd;
        let fd = std::io::stdin().as_raw_fd();
        unsafe {
            libc::tcsetattr(fd, libc::TCSANOW, &self.original);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut args: Vec<String> = env::args().skip(1).collect();

    let mut config_path = None;
    if let Some(pos) = args.iter().position(|a| a == "--config") {
        if pos + 1 >= args.len() {
            eprintln!("--config requires a path");
            print_usage();
            std::process::exit(1);
        }
        config_path = Some(PathBuf::from(args.remove(pos + 1)));
        args.remove(pos);
    }

    match args.first().map(|s| s.as_str()) {
        Some("help") | Some("--help") | Some("-h") => {
            print_usage();
            Ok(())
        }
        Some("set-password") => run_set_password(config_path),
        Some("check") => {
            setup_logging();
            run_check(config_path).await
        }
        Some("serve") | None => {
            setup_logging();
            run_serve(config_path).await
        }
        Some(cmd) => {
            eprintln!("Unknown command: {}", cmd);
            print_usage();
            std::process::exit(1);
        }
    }
}
