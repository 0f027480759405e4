//! Retention purge: expired apply tokens and old finished actions.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use super::{PurgeReport, StoreError, to_millis};

pub async fn purge(
    pool: &SqlitePool,
    now: DateTime<Utc>,
    actions_before: Option<DateTime<Utc>>,
) -> Result<PurgeReport, StoreError> {
    let mut tx = pool.begin().await?;

    // A used token stays until expiry so a replay still reads as already used.
    let tokens = sqlx::query("DELETE FROM apply_tokens WHERE expires_at <= ?")
        .bind(to_millis(now))
        .execute(&mut *tx)
        .await?
        .rows_affected();

    // Age is measured from the last transition. PENDING and APPROVED are never purged.
    let actions = match actions_before {
        Some(cutoff) => sqlx::query(
            r#"
            DELETE FROM pending_actions
            WHERE status IN ('APPLIED', 'FAILED', 'REJECTED')
              AND COALESCE(applied_at, approved_at, created_at) < ?
            "#,
        )
        .bind(to_millis(cutoff))
        .execute(&mut *tx)
        .await?
        .rows_affected(),
        None => 0,
    };

    tx.commit().await?;
    Ok(PurgeReport { tokens, actions })
}
