use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};

use super::{ApiError, AppState};
use crate::mailbox::MailboxConnector;
use crate::store::ActionStore;
use crate::types::{ActionFilter, ActionPage, ActionStatus, ActionSummary, ActionType, PendingAction};
use crate::workflow::{
    ApplyReport, ApplyRequest, EmailDisposition, Preview, PreviewRequest, ProposeReport,
    WorkflowError,
};

type ApiResult<T> = Result<Json<T>, ApiError>;

fn fail<S, C>(state: &AppState<S, C>) -> impl Fn(WorkflowError) -> ApiError + '_
where
    S: ActionStore,
    C: MailboxConnector,
{
    move |err| ApiError::from_workflow(err, state.sanitizer())
}

#[derive(Debug, Serialize)]
pub struct Health {
    status: &'static str,
    store: &'static str,
    safe_mode: bool,
    require_approval: bool,
    allow_destructive: bool,
}

pub async fn health<S, C>(State(state): State<AppState<S, C>>) -> (StatusCode, Json<Health>)
where
    S: ActionStore,
    C: MailboxConnector,
{
    let store_ok = match state.summary().await {
        Ok(_) => true,
        Err(e) => {
            tracing::error!(error = %state.sanitizer().sanitize(&e), "Health check: store unreachable");
            false
        }
    };
    let config = state.policy().config();
    let health = Health {
        status: if store_ok { "ok" } else { "degraded" },
        store: if store_ok { "ok" } else { "unavailable" },
        safe_mode: config.safe_mode,
        require_approval: config.require_approval,
        allow_destructive: config.allow_destructive,
    };
    let status = if store_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(health))
}

pub async fn propose<S, C>(
    State(state): State<AppState<S, C>>,
    Json(disposition): Json<EmailDisposition>,
) -> ApiResult<ProposeReport>
where
    S: ActionStore,
    C: MailboxConnector,
{
    if disposition.folder.trim().is_empty() {
        return Err(ApiError::bad_request("folder is required"));
    }
    state
        .propose(&disposition)
        .await
        .map(Json)
        .map_err(fail(&state))
}

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    status: Option<String>,
    action_type: Option<String>,
    page: Option<u32>,
    page_size: Option<u32>,
}

impl ListQuery {
    fn into_filter(self) -> Result<ActionFilter, ApiError> {
        let status = self
            .status
            .map(|s| s.to_ascii_uppercase().parse::<ActionStatus>())
            .transpose()
            .map_err(|e| ApiError::bad_request(format!("status: {e}")))?;
        let action_type = self
            .action_type
            .map(|s| s.to_ascii_uppercase().parse::<ActionType>())
            .transpose()
            .map_err(|e| ApiError::bad_request(format!("action_type: {e}")))?;
        Ok(ActionFilter {
            status,
            action_type,
            page: self.page.unwrap_or(1),
            page_size: self.page_size.unwrap_or(0),
        })
    }
}

pub async fn list_actions<S, C>(
    State(state): State<AppState<S, C>>,
    Query(query): Query<ListQuery>,
) -> ApiResult<ActionPage>
where
    S: ActionStore,
    C: MailboxConnector,
{
    let filter = query.into_filter()?;
    state
        .list_actions(&filter)
        .await
        .map(Json)
        .map_err(fail(&state))
}

pub async fn summary<S, C>(State(state): State<AppState<S, C>>) -> ApiResult<ActionSummary>
where
    S: ActionStore,
    C: MailboxConnector,
{
    state.summary().await.map(Json).map_err(fail(&state))
}

pub async fn get_action<S, C>(
    State(state): State<AppState<S, C>>,
    Path(id): Path<i64>,
) -> ApiResult<PendingAction>
where
    S: ActionStore,
    C: MailboxConnector,
{
    state.get_action(id).await.map(Json).map_err(fail(&state))
}

#[derive(Debug, Deserialize)]
pub struct ReviewRequest {
    approve: bool,
    #[serde(default)]
    approved_by: Option<String>,
}

pub async fn approve<S, C>(
    State(state): State<AppState<S, C>>,
    Path(id): Path<i64>,
    Json(review): Json<ReviewRequest>,
) -> ApiResult<PendingAction>
where
    S: ActionStore,
    C: MailboxConnector,
{
    let by = review.approved_by.as_deref().unwrap_or("admin");
    state
        .decide(id, review.approve, by)
        .await
        .map(Json)
        .map_err(fail(&state))
}

pub async fn preview<S, C>(
    State(state): State<AppState<S, C>>,
    Json(request): Json<PreviewRequest>,
) -> ApiResult<Preview>
where
    S: ActionStore,
    C: MailboxConnector,
{
    state
        .preview(&request)
        .await
        .map(Json)
        .map_err(fail(&state))
}

pub async fn apply_batch<S, C>(
    State(state): State<AppState<S, C>>,
    Json(request): Json<ApplyRequest>,
) -> ApiResult<ApplyReport>
where
    S: ActionStore,
    C: MailboxConnector,
{
    let report = state.apply_batch(&request).await.map_err(fail(&state))?;
    log_report(&report);
    Ok(Json(report))
}

#[derive(Debug, Deserialize)]
pub struct SingleApplyRequest {
    apply_token: String,
    #[serde(default)]
    dry_run: bool,
}

pub async fn apply_single<S, C>(
    State(state): State<AppState<S, C>>,
    Path(id): Path<i64>,
    Json(request): Json<SingleApplyRequest>,
) -> ApiResult<ApplyReport>
where
    S: ActionStore,
    C: MailboxConnector,
{
    let report = state
        .apply_single(id, &request.apply_token, request.dry_run)
        .await
        .map_err(fail(&state))?;
    log_report(&report);
    Ok(Json(report))
}

fn log_report(report: &ApplyReport) {
    tracing::info!(
        dry_run = report.dry_run,
        applied = report.applied,
        failed = report.failed,
        skipped = report.skipped,
        token_consumed = report.token_consumed,
        "Apply finished"
    );
}
