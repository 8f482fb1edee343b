//! JSON error envelope and status mapping.
//!
//! The bridge is the only layer that turns typed errors into HTTP statuses;
//! everything below it returns `CodexError`/`IdentityError` values.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use climate_codex::CodexError;
use serde::Serialize;

/// Wire format: `{"error":{"code":"...","message":"..."}}`.
#[derive(Debug, Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

/// Build a JSON error response.
pub fn error_response(status: StatusCode, code: &str, message: impl Into<String>) -> Response {
    let body = ErrorBody {
        error: ErrorDetail {
            code: code.to_owned(),
            message: message.into(),
        },
    };
    (status, Json(body)).into_response()
}

/// Map a failure from `SessionManager::ensure` to a response.
///
/// `MaxSessions` is the one admission failure clients are expected to retry
/// after backing off, hence 429; everything else is a server-side failure.
pub fn manager_error_response(err: &CodexError) -> Response {
    match err {
        CodexError::MaxSessions => error_response(
            StatusCode::TOO_MANY_REQUESTS,
            "max_sessions",
            err.to_string(),
        ),
        _ => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            err.to_string(),
        ),
    }
}

/// Map a failure from `Session::send_rpc` to a response.
pub fn rpc_error_response(err: &CodexError) -> Response {
    error_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        "rpc_failed",
        err.to_string(),
    )
}
