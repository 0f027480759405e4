//! Pending action CRUD and the apply commit.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::collections::BTreeSet;

use super::{CommitReport, StoreError, from_millis, to_millis};
use crate::constants::{DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE};
use crate::types::{
    ActionFilter, ActionOutcome, ActionPage, ActionProposal, ActionStatus, ActionSummary,
    ActionType, ActionUpdate, PendingAction,
};

const ACTION_COLUMNS: &str = "id, email_id, message_uid, source_folder, action_type, target_folder, reason, status, created_at, approved_at, applied_at, error_code, error_message, proposed_by, approved_by";

/// Convert a SQLite row to a PendingAction.
fn row_to_action(row: &SqliteRow) -> Result<PendingAction, StoreError> {
    let action_type: String = row.get("action_type");
    let status: String = row.get("status");
    Ok(PendingAction {
        id: row.get("id"),
        email_id: row.get("email_id"),
        message_uid: row.get::<i64, _>("message_uid") as u32,
        source_folder: row.get("source_folder"),
        action_type: action_type
            .parse()
            .map_err(|e| StoreError::Corrupt(format!("action_type: {e}")))?,
        target_folder: row.get("target_folder"),
        reason: row.get("reason"),
        status: status
            .parse()
            .map_err(|e| StoreError::Corrupt(format!("status: {e}")))?,
        created_at: from_millis(row.get("created_at")),
        approved_at: row.get::<Option<i64>, _>("approved_at").map(from_millis),
        applied_at: row.get::<Option<i64>, _>("applied_at").map(from_millis),
        error_code: row.get("error_code"),
        error_message: row.get("error_message"),
        proposed_by: row.get("proposed_by"),
        approved_by: row.get("approved_by"),
    })
}

pub async fn insert_action(
    pool: &SqlitePool,
    proposal: &ActionProposal,
    now: DateTime<Utc>,
) -> Result<PendingAction, StoreError> {
    let result = sqlx::query(
        r#"
        INSERT INTO pending_actions
        (email_id, message_uid, source_folder, action_type, target_folder, reason, status, created_at, proposed_by)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(proposal.email_id)
    .bind(proposal.message_uid as i64)
    .bind(&proposal.source_folder)
    .bind(proposal.action_type.as_str())
    .bind(&proposal.target_folder)
    .bind(&proposal.reason)
    .bind(ActionStatus::Pending.as_str())
    .bind(to_millis(now))
    .bind(&proposal.proposed_by)
    .execute(pool)
    .await?;

    let id = result.last_insert_rowid();
    get_action(pool, id)
        .await?
        .ok_or_else(|| StoreError::Corrupt(format!("inserted action {id} not readable")))
}

pub async fn find_open_duplicate(
    pool: &SqlitePool,
    email_id: i64,
    action_type: ActionType,
) -> Result<Option<i64>, StoreError> {
    let row = sqlx::query(
        "SELECT id FROM pending_actions WHERE email_id = ? AND action_type = ? AND status IN ('PENDING', 'APPROVED') LIMIT 1",
    )
    .bind(email_id)
    .bind(action_type.as_str())
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|r| r.get("id")))
}

pub async fn get_action(pool: &SqlitePool, id: i64) -> Result<Option<PendingAction>, StoreError> {
    let row = sqlx::query(&format!(
        "SELECT {ACTION_COLUMNS} FROM pending_actions WHERE id = ?"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(row_to_action).transpose()
}

pub async fn get_actions(
    pool: &SqlitePool,
    ids: &BTreeSet<i64>,
) -> Result<Vec<PendingAction>, StoreError> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }

    let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
        "SELECT {ACTION_COLUMNS} FROM pending_actions WHERE id IN ("
    ));
    let mut separated = qb.separated(", ");
    for id in ids {
        separated.push_bind(*id);
    }
    separated.push_unseparated(") ORDER BY id ASC");

    let rows = qb.build().fetch_all(pool).await?;
    rows.iter().map(row_to_action).collect()
}

fn push_filters(qb: &mut QueryBuilder<'_, Sqlite>, filter: &ActionFilter) {
    qb.push(" WHERE 1 = 1");
    if let Some(status) = filter.status {
        qb.push(" AND status = ").push_bind(status.as_str());
    }
    if let Some(action_type) = filter.action_type {
        qb.push(" AND action_type = ").push_bind(action_type.as_str());
    }
}

pub async fn list_actions(
    pool: &SqlitePool,
    filter: &ActionFilter,
) -> Result<ActionPage, StoreError> {
    let page = filter.page.max(1);
    let page_size = match filter.page_size {
        0 => DEFAULT_PAGE_SIZE,
        n => n.min(MAX_PAGE_SIZE),
    };

    let mut count_qb: QueryBuilder<Sqlite> =
        QueryBuilder::new("SELECT COUNT(*) AS total FROM pending_actions");
    push_filters(&mut count_qb, filter);
    let total: i64 = count_qb.build().fetch_one(pool).await?.get("total");

    let mut qb: QueryBuilder<Sqlite> =
        QueryBuilder::new(format!("SELECT {ACTION_COLUMNS} FROM pending_actions"));
    push_filters(&mut qb, filter);
    qb.push(" ORDER BY created_at DESC, id DESC LIMIT ")
        .push_bind(page_size as i64)
        .push(" OFFSET ")
        .push_bind(((page - 1) as i64) * page_size as i64);

    let rows = qb.build().fetch_all(pool).await?;
    let results = rows.iter().map(row_to_action).collect::<Result<Vec<_>, _>>()?;

    let total = total.max(0) as u64;
    Ok(ActionPage {
        results,
        total,
        page,
        page_size,
        total_pages: total.div_ceil(page_size as u64),
    })
}

pub async fn approved_actions(
    pool: &SqlitePool,
    limit: usize,
) -> Result<Vec<PendingAction>, StoreError> {
    let rows = sqlx::query(&format!(
        "SELECT {ACTION_COLUMNS} FROM pending_actions WHERE status = 'APPROVED' ORDER BY created_at ASC, id ASC LIMIT ?"
    ))
    .bind(limit as i64)
    .fetch_all(pool)
    .await?;
    rows.iter().map(row_to_action).collect()
}

pub async fn summary(pool: &SqlitePool) -> Result<ActionSummary, StoreError> {
    let mut summary = ActionSummary::default();

    let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM pending_actions GROUP BY status")
        .fetch_all(pool)
        .await?;
    for row in rows {
        let n = row.get::<i64, _>("n").max(0) as u64;
        match row.get::<String, _>("status").parse::<ActionStatus>() {
            Ok(ActionStatus::Pending) => summary.status_pending = n,
            Ok(ActionStatus::Approved) => summary.status_approved = n,
            Ok(ActionStatus::Rejected) => summary.status_rejected = n,
            Ok(ActionStatus::Applied) => summary.status_applied = n,
            Ok(ActionStatus::Failed) => summary.status_failed = n,
            Err(e) => tracing::warn!("Ignoring unknown status in summary: {}", e),
        }
    }

    let rows = sqlx::query(
        "SELECT action_type, COUNT(*) AS n FROM pending_actions WHERE status = 'PENDING' GROUP BY action_type",
    )
    .fetch_all(pool)
    .await?;
    for row in rows {
        let n = row.get::<i64, _>("n").max(0) as u64;
        match row.get::<String, _>("action_type").parse::<ActionType>() {
            Ok(ActionType::MoveFolder) => summary.type_move_folder = n,
            Ok(ActionType::MarkRead) => summary.type_mark_read = n,
            Ok(ActionType::AddFlag) => summary.type_add_flag = n,
            Ok(ActionType::Delete) => summary.type_delete = n,
            Err(e) => tracing::warn!("Ignoring unknown action type in summary: {}", e),
        }
    }

    Ok(summary)
}

/// Compare-and-set on `status = 'PENDING'`.
pub async fn record_decision(
    pool: &SqlitePool,
    id: i64,
    status: ActionStatus,
    decided_by: &str,
    at: DateTime<Utc>,
) -> Result<bool, StoreError> {
    if !matches!(status, ActionStatus::Approved | ActionStatus::Rejected) {
        return Err(StoreError::Corrupt(format!(
            "{status} is not a review decision"
        )));
    }

    let result = sqlx::query(
        "UPDATE pending_actions SET status = ?, approved_at = ?, approved_by = ? WHERE id = ? AND status = 'PENDING'",
    )
    .bind(status.as_str())
    .bind(to_millis(at))
    .bind(decided_by)
    .bind(id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

pub async fn commit_apply(
    pool: &SqlitePool,
    updates: &[ActionUpdate],
    consume_token: Option<&str>,
    at: DateTime<Utc>,
) -> Result<CommitReport, StoreError> {
    let mut tx = pool.begin().await?;
    let mut report = CommitReport::default();

    for update in updates {
        let result = match &update.outcome {
            ActionOutcome::Applied { at } => {
                sqlx::query(
                    "UPDATE pending_actions SET status = 'APPLIED', applied_at = ?, error_code = NULL, error_message = NULL WHERE id = ? AND status = 'APPROVED'",
                )
                .bind(to_millis(*at))
                .bind(update.id)
                .execute(&mut *tx)
                .await?
            }
            ActionOutcome::Failed { code, message } => {
                sqlx::query(
                    "UPDATE pending_actions SET status = 'FAILED', error_code = ?, error_message = ? WHERE id = ? AND status = 'APPROVED'",
                )
                .bind(*code)
                .bind(message)
                .bind(update.id)
                .execute(&mut *tx)
                .await?
            }
        };
        report.updated += result.rows_affected() as usize;
    }

    // Token consumption is last so it only lands together with the results.
    if let Some(token_hash) = consume_token {
        let result = sqlx::query(
            "UPDATE apply_tokens SET is_used = 1, used_at = ? WHERE token_hash = ? AND is_used = 0",
        )
        .bind(to_millis(at))
        .bind(token_hash)
        .execute(&mut *tx)
        .await?;
        report.token_consumed = result.rows_affected() == 1;
    }

    tx.commit().await?;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::super::{ActionStore, SqliteStore};
    use super::*;
    use chrono::Duration;

    fn proposal(email_id: i64, action_type: ActionType) -> ActionProposal {
        let p = ActionProposal::new(email_id, email_id as u32 + 100, "INBOX", action_type);
        if action_type == ActionType::MoveFolder {
            p.target("Archive")
        } else {
            p
        }
    }

    #[tokio::test]
    async fn test_insert_and_read_back() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let now = Utc::now();

        let created = store
            .insert_action(
                &proposal(7, ActionType::MoveFolder)
                    .reason("archive policy")
                    .proposed_by("AI"),
                now,
            )
            .await
            .unwrap();

        assert_eq!(created.status, ActionStatus::Pending);
        assert_eq!(created.message_uid, 107);
        assert_eq!(created.target_folder.as_deref(), Some("Archive"));
        assert_eq!(created.reason.as_deref(), Some("archive policy"));
        assert_eq!(created.proposed_by, "AI");
        assert_eq!(created.created_at.timestamp_millis(), now.timestamp_millis());
        assert!(created.approved_at.is_none());
        assert!(created.applied_at.is_none());
    }

    #[tokio::test]
    async fn test_duplicate_lookup_only_sees_open_actions() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let a = store
            .insert_action(&proposal(1, ActionType::AddFlag), Utc::now())
            .await
            .unwrap();

        assert_eq!(
            store.find_open_duplicate(1, ActionType::AddFlag).await.unwrap(),
            Some(a.id)
        );
        assert_eq!(store.find_open_duplicate(1, ActionType::MarkRead).await.unwrap(), None);

        store
            .record_decision(a.id, ActionStatus::Rejected, "admin", Utc::now())
            .await
            .unwrap();
        assert_eq!(store.find_open_duplicate(1, ActionType::AddFlag).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_decision_is_compare_and_set() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let a = store
            .insert_action(&proposal(1, ActionType::MarkRead), Utc::now())
            .await
            .unwrap();

        assert!(store
            .record_decision(a.id, ActionStatus::Approved, "admin", Utc::now())
            .await
            .unwrap());
        assert!(!store
            .record_decision(a.id, ActionStatus::Rejected, "admin", Utc::now())
            .await
            .unwrap());
        assert!(!store
            .record_decision(9999, ActionStatus::Approved, "admin", Utc::now())
            .await
            .unwrap());

        let a = store.get_action(a.id).await.unwrap().unwrap();
        assert_eq!(a.status, ActionStatus::Approved);
        assert!(a.approved_at.is_some());
        assert_eq!(a.approved_by.as_deref(), Some("admin"));
    }

    #[tokio::test]
    async fn test_list_filters_and_paginates_newest_first() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let base = Utc::now();
        for i in 0..5 {
            store
                .insert_action(
                    &proposal(i, if i % 2 == 0 { ActionType::AddFlag } else { ActionType::MarkRead }),
                    base + Duration::seconds(i),
                )
                .await
                .unwrap();
        }

        let page = store
            .list_actions(&ActionFilter {
                page: 1,
                page_size: 2,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page.total, 5);
        assert_eq!(page.total_pages, 3);
        assert_eq!(page.results.len(), 2);
        assert_eq!(page.results[0].email_id, 4);

        let flags = store
            .list_actions(&ActionFilter {
                action_type: Some(ActionType::AddFlag),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(flags.total, 3);
        assert_eq!(flags.page_size, DEFAULT_PAGE_SIZE);

        let approved = store
            .list_actions(&ActionFilter {
                status: Some(ActionStatus::Approved),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(approved.total, 0);
        assert!(approved.results.is_empty());
    }

    #[tokio::test]
    async fn test_summary_counts() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let a = store.insert_action(&proposal(1, ActionType::AddFlag), Utc::now()).await.unwrap();
        store.insert_action(&proposal(2, ActionType::AddFlag), Utc::now()).await.unwrap();
        store.insert_action(&proposal(3, ActionType::MoveFolder), Utc::now()).await.unwrap();
        store
            .record_decision(a.id, ActionStatus::Approved, "admin", Utc::now())
            .await
            .unwrap();

        let s = store.summary().await.unwrap();
        assert_eq!(s.status_pending, 2);
        assert_eq!(s.status_approved, 1);
        assert_eq!(s.type_add_flag, 1);
        assert_eq!(s.type_move_folder, 1);
        assert_eq!(s.type_delete, 0);
    }

    #[tokio::test]
    async fn test_commit_only_touches_approved_rows() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let approved = store.insert_action(&proposal(1, ActionType::AddFlag), Utc::now()).await.unwrap();
        let pending = store.insert_action(&proposal(2, ActionType::AddFlag), Utc::now()).await.unwrap();
        store
            .record_decision(approved.id, ActionStatus::Approved, "admin", Utc::now())
            .await
            .unwrap();

        let now = Utc::now();
        let report = store
            .commit_apply(
                &[
                    ActionUpdate {
                        id: approved.id,
                        outcome: ActionOutcome::Applied { at: now },
                    },
                    ActionUpdate {
                        id: pending.id,
                        outcome: ActionOutcome::Failed {
                            code: "X",
                            message: "x".to_string(),
                        },
                    },
                ],
                None,
                now,
            )
            .await
            .unwrap();

        assert_eq!(report.updated, 1);
        assert!(!report.token_consumed);
        let applied = store.get_action(approved.id).await.unwrap().unwrap();
        assert_eq!(applied.status, ActionStatus::Applied);
        assert!(applied.applied_at.is_some());
        let untouched = store.get_action(pending.id).await.unwrap().unwrap();
        assert_eq!(untouched.status, ActionStatus::Pending);
        assert!(untouched.error_message.is_none());
    }

    #[tokio::test]
    async fn test_get_actions_by_set() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let a = store.insert_action(&proposal(1, ActionType::AddFlag), Utc::now()).await.unwrap();
        let b = store.insert_action(&proposal(2, ActionType::AddFlag), Utc::now()).await.unwrap();

        let found = store
            .get_actions(&BTreeSet::from([b.id, a.id, 404]))
            .await
            .unwrap();
        assert_eq!(found.iter().map(|a| a.id).collect::<Vec<_>>(), vec![a.id, b.id]);
        assert!(store.get_actions(&BTreeSet::new()).await.unwrap().is_empty());
    }
}
