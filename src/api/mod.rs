//! HTTP surface for reviewers and the classification pipeline.
//!
//! This module is split into:
//! - `mod.rs` - Router construction
//! - `handlers.rs` - One handler per route
//! - `error.rs` - `ApiError` and the status-code mapping
//!
//! Handlers only translate between JSON and the workflow controller; every
//! rule lives in the controller.

mod error;
mod handlers;

use axum::Router;
use axum::routing::{get, post};
use std::sync::Arc;

use crate::mailbox::MailboxConnector;
use crate::store::ActionStore;
use crate::workflow::Controller;

pub use error::ApiError;

pub type AppState<S, C> = Arc<Controller<S, C>>;

pub fn router<S, C>(state: AppState<S, C>) -> Router
where
    S: ActionStore + 'static,
    C: MailboxConnector + 'static,
{
    Router::new()
        .route("/api/health", get(handlers::health::<S, C>))
        .route("/api/dispositions", post(handlers::propose::<S, C>))
        .route("/api/pending-actions", get(handlers::list_actions::<S, C>))
        .route(
            "/api/pending-actions/summary",
            get(handlers::summary::<S, C>),
        )
        .route(
            "/api/pending-actions/preview",
            post(handlers::preview::<S, C>),
        )
        .route(
            "/api/pending-actions/apply",
            post(handlers::apply_batch::<S, C>),
        )
        .route("/api/pending-actions/:id", get(handlers::get_action::<S, C>))
        .route(
            "/api/pending-actions/:id/approve",
            post(handlers::approve::<S, C>),
        )
        .route(
            "/api/pending-actions/:id/apply",
            post(handlers::apply_single::<S, C>),
        )
        .with_state(state)
}
