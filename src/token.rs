//! Apply tokens: short-lived, single-use capabilities bound to an exact set
//! of action ids.
//!
//! Only the SHA-256 digest of a token is stored. Validation never writes;
//! consumption happens inside the apply commit (see `ActionStore::commit_apply`).
//! Between validation and that commit the token is held in [`InFlightTokens`]
//! so no second apply can present it.

use base64::Engine;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashSet};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use crate::constants::TOKEN_BYTES;
use crate::sanitize::ErrorCategory;
use crate::store::{ActionStore, StoreError};
use crate::types::ApplyToken;

/// Why a presented token cannot authorize the requested apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TokenInvalid {
    #[error("apply token not found")]
    NotFound,
    #[error("apply token already used")]
    AlreadyUsed,
    #[error("apply token expired")]
    Expired,
    #[error("apply token does not match the requested actions")]
    SetMismatch,
    #[error("apply token is in use by another apply")]
    InUse,
}

impl ErrorCategory for TokenInvalid {
    fn category(&self) -> &'static str {
        match self {
            TokenInvalid::NotFound => "TokenNotFound",
            TokenInvalid::AlreadyUsed => "TokenAlreadyUsed",
            TokenInvalid::Expired => "TokenExpired",
            TokenInvalid::SetMismatch => "TokenSetMismatch",
            TokenInvalid::InUse => "TokenInUse",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error(transparent)]
    Invalid(#[from] TokenInvalid),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failed to generate random bytes: {0}")]
    Entropy(String),
}

impl ErrorCategory for TokenError {
    fn category(&self) -> &'static str {
        match self {
            TokenError::Invalid(e) => e.category(),
            TokenError::Store(e) => e.category(),
            TokenError::Entropy(_) => "EntropyUnavailable",
        }
    }
}

/// A freshly issued token. The plaintext exists only here and in the
/// response to the caller.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub action_ids: BTreeSet<i64>,
    pub expires_at: DateTime<Utc>,
}

/// Digest under which a token is stored and looked up.
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(hasher.finalize())
}

fn generate_secret() -> Result<String, TokenError> {
    let mut bytes = [0u8; TOKEN_BYTES];
    getrandom::fill(&mut bytes).map_err(|e| TokenError::Entropy(e.to_string()))?;
    Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes))
}

#[derive(Debug, Clone, Copy)]
pub struct TokenIssuer {
    ttl: Duration,
}

impl TokenIssuer {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl }
    }

    /// Mint a token for exactly `action_ids` and persist it unused.
    pub async fn issue<S: ActionStore>(
        &self,
        store: &S,
        action_ids: BTreeSet<i64>,
        now: DateTime<Utc>,
    ) -> Result<IssuedToken, TokenError> {
        let secret = generate_secret()?;
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::minutes(5));
        let expires_at = now + ttl;

        store
            .insert_token(&ApplyToken {
                token_hash: hash_token(&secret),
                action_ids: action_ids.clone(),
                issued_at: now,
                expires_at,
                is_used: false,
                used_at: None,
            })
            .await?;

        tracing::debug!(actions = action_ids.len(), %expires_at, "Issued apply token");

        Ok(IssuedToken {
            token: secret,
            action_ids,
            expires_at,
        })
    }

    /// Read-only check of `token` against the requested id set.
    pub async fn validate<S: ActionStore>(
        &self,
        store: &S,
        token: &str,
        action_ids: &BTreeSet<i64>,
        now: DateTime<Utc>,
    ) -> Result<ApplyToken, TokenError> {
        if token.trim().is_empty() {
            return Err(TokenInvalid::NotFound.into());
        }

        let stored = store
            .find_token(&hash_token(token))
            .await?
            .ok_or(TokenInvalid::NotFound)?;

        check(&stored, action_ids, now)?;
        Ok(stored)
    }
}

/// Token digests currently held by a running apply.
#[derive(Debug, Default)]
pub struct InFlightTokens {
    held: Mutex<HashSet<String>>,
}

impl InFlightTokens {
    /// Hold `token` until the returned claim is dropped.
    pub fn claim(&self, token: &str) -> Result<TokenClaim<'_>, TokenInvalid> {
        let token_hash = hash_token(token);
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        if !held.insert(token_hash.clone()) {
            return Err(TokenInvalid::InUse);
        }
        Ok(TokenClaim {
            owner: self,
            token_hash,
        })
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.held.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

pub struct TokenClaim<'a> {
    owner: &'a InFlightTokens,
    token_hash: String,
}

impl Drop for TokenClaim<'_> {
    fn drop(&mut self) {
        self.owner
            .held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.token_hash);
    }
}

fn check(
    stored: &ApplyToken,
    action_ids: &BTreeSet<i64>,
    now: DateTime<Utc>,
) -> Result<(), TokenInvalid> {
    if stored.is_used {
        return Err(TokenInvalid::AlreadyUsed);
    }
    if now >= stored.expires_at {
        return Err(TokenInvalid::Expired);
    }
    if &stored.action_ids != action_ids {
        return Err(TokenInvalid::SetMismatch);
    }
    Ok(())
}
