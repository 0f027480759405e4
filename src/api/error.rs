use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::sanitize::{ErrorCategory, Sanitizer};
use crate::workflow::WorkflowError;

/// An error on its way to the client. The message has already been through
/// the sanitizer when this is built.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    category: &'static str,
    message: String,
    retryable: bool,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    category: &'a str,
    retryable: bool,
}

impl ApiError {
    pub fn from_workflow(err: WorkflowError, sanitizer: &Sanitizer) -> Self {
        let status = status_for(&err);
        let message = sanitizer.sanitize(&err);

        if status.is_server_error() {
            tracing::error!(category = err.category(), error = %message, "Request failed");
        } else {
            tracing::debug!(category = err.category(), error = %message, "Request refused");
        }

        Self {
            status,
            category: err.category(),
            message,
            retryable: err.is_retryable(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            category: "InvalidRequest",
            message: message.into(),
            retryable: false,
        }
    }

    #[cfg(test)]
    pub fn status(&self) -> StatusCode {
        self.status
    }
}

fn status_for(err: &WorkflowError) -> StatusCode {
    match err {
        WorkflowError::SafeMode
        | WorkflowError::Token(_)
        | WorkflowError::Busy
        | WorkflowError::NotPending { .. } => StatusCode::CONFLICT,
        WorkflowError::NotFound(_) => StatusCode::NOT_FOUND,
        WorkflowError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        WorkflowError::Connect(_) | WorkflowError::ConnectionLost(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        WorkflowError::Store(_) | WorkflowError::Entropy(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: &self.message,
            category: self.category,
            retryable: self.retryable,
        };
        (self.status, Json(body)).into_response()
    }
}
