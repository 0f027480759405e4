//! Apply token persistence.

use sqlx::{Row, SqlitePool};
use std::collections::BTreeSet;

use super::{StoreError, from_millis, to_millis};
use crate::types::ApplyToken;

/// Canonical text form of an id set: sorted, comma-separated.
pub(crate) fn encode_ids(ids: &BTreeSet<i64>) -> String {
    ids.iter().map(|id| id.to_string()).collect::<Vec<_>>().join(",")
}

pub(crate) fn decode_ids(text: &str) -> Result<BTreeSet<i64>, StoreError> {
    text.split(',')
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<i64>()
                .map_err(|e| StoreError::Corrupt(format!("action_ids: {e}")))
        })
        .collect()
}

pub async fn insert_token(pool: &SqlitePool, token: &ApplyToken) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO apply_tokens (token_hash, action_ids, issued_at, expires_at, is_used, used_at) VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(&token.token_hash)
    .bind(encode_ids(&token.action_ids))
    .bind(to_millis(token.issued_at))
    .bind(to_millis(token.expires_at))
    .bind(token.is_used)
    .bind(token.used_at.map(to_millis))
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn find_token(
    pool: &SqlitePool,
    token_hash: &str,
) -> Result<Option<ApplyToken>, StoreError> {
    let row = sqlx::query(
        "SELECT token_hash, action_ids, issued_at, expires_at, is_used, used_at FROM apply_tokens WHERE token_hash = ?",
    )
    .bind(token_hash)
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    Ok(Some(ApplyToken {
        token_hash: row.get("token_hash"),
        action_ids: decode_ids(row.get::<&str, _>("action_ids"))?,
        issued_at: from_millis(row.get("issued_at")),
        expires_at: from_millis(row.get("expires_at")),
        is_used: row.get("is_used"),
        used_at: row.get::<Option<i64>, _>("used_at").map(from_millis),
    }))
}

#[cfg(test)]
mod tests {
    use super::super::{ActionStore, SqliteStore};
    use super::*;
    use chrono::{Duration, Utc};

    fn token(hash: &str, ids: &[i64]) -> ApplyToken {
        let now = Utc::now();
        ApplyToken {
            token_hash: hash.to_string(),
            action_ids: ids.iter().copied().collect(),
            issued_at: now,
            expires_at: now + Duration::minutes(5),
            is_used: false,
            used_at: None,
        }
    }

    #[test]
    fn test_id_set_text_form_is_canonical() {
        let ids = BTreeSet::from([3, 1, 2]);
        assert_eq!(encode_ids(&ids), "1,2,3");
        assert_eq!(decode_ids("1,2,3").unwrap(), ids);
        assert!(decode_ids("").unwrap().is_empty());
        assert!(decode_ids("1,x").is_err());
    }

    #[tokio::test]
    async fn test_token_round_trip_and_single_consumption() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        store.insert_token(&token("abc", &[5, 2])).await.unwrap();

        let found = store.find_token("abc").await.unwrap().unwrap();
        assert_eq!(found.action_ids, BTreeSet::from([2, 5]));
        assert!(!found.is_used);
        assert!(store.find_token("nope").await.unwrap().is_none());

        let first = store.commit_apply(&[], Some("abc"), Utc::now()).await.unwrap();
        assert!(first.token_consumed);
        let second = store.commit_apply(&[], Some("abc"), Utc::now()).await.unwrap();
        assert!(!second.token_consumed);

        let used = store.find_token("abc").await.unwrap().unwrap();
        assert!(used.is_used);
        assert!(used.used_at.is_some());
    }

    #[tokio::test]
    async fn test_duplicate_token_hash_is_rejected() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        store.insert_token(&token("dup", &[1])).await.unwrap();
        assert!(store.insert_token(&token("dup", &[2])).await.is_err());
    }
}
