//! Application-wide constants for tuning and configuration
//!
//! Centralizes magic numbers to make them discoverable and configurable.

/// Default lifetime of an apply token in seconds.
pub const DEFAULT_TOKEN_TTL_SECS: u64 = 300;

/// Bounds accepted for `safety.token_ttl_secs`.
pub const MIN_TOKEN_TTL_SECS: u64 = 30;
pub const MAX_TOKEN_TTL_SECS: u64 = 3600;

/// Random bytes in an apply token before base64 encoding.
pub const TOKEN_BYTES: usize = 32;

/// Default cap on the number of actions a single preview/apply may cover.
pub const DEFAULT_MAX_APPLY_PER_REQUEST: usize = 20;

/// TCP connect + TLS + LOGIN must finish within this many seconds.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 15;

/// Any single IMAP command must finish within this many seconds.
pub const DEFAULT_OPERATION_TIMEOUT_SECS: u64 = 30;

/// Sanitized error messages are cut to this many bytes.
pub const MAX_ERROR_MESSAGE_LEN: usize = 500;

/// Page size limits for listing pending actions.
pub const DEFAULT_PAGE_SIZE: u32 = 50;
pub const MAX_PAGE_SIZE: u32 = 100;

/// Connection pool size for the SQLite store.
pub const STORE_POOL_SIZE: u32 = 8;

/// Seconds between retention purges while serving.
pub const PURGE_INTERVAL_SECS: u64 = 3600;
