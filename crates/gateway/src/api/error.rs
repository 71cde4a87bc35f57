//! Error-to-HTTP mapping. Lower layers raise typed [`Error`]s; this is the
//! single place that owns status codes and the response body shape
//! `{ "detail": { "code", "message" } }`.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;

use hlh_domain::Error;

pub struct ApiError(pub Error);

pub type ApiResult<T> = std::result::Result<T, ApiError>;

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        ApiError(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let error = self.0;
        let status = match &error {
            Error::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Error::Unauthenticated => StatusCode::UNAUTHORIZED,
            Error::InactiveServer(_) => StatusCode::FORBIDDEN,
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::CommandTimeout(_) => StatusCode::REQUEST_TIMEOUT,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::WhitelistViolation(_) => StatusCode::BAD_REQUEST,
            Error::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Error::SshUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Database(_) | Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        // Internal failures are logged server-side; clients get a generic
        // line with no detail that could leak secrets.
        let message = match &error {
            Error::Database(e) => {
                tracing::error!(error = %e, "database error");
                "An internal error occurred".to_string()
            }
            Error::Internal(m) => {
                tracing::error!(error = %m, "internal error");
                "An internal error occurred".to_string()
            }
            other => other.to_string(),
        };

        let body = Json(serde_json::json!({
            "detail": { "code": error.code(), "message": message }
        }));

        if let Error::RateLimited { retry_after_secs } = &error {
            return (
                status,
                [(header::RETRY_AFTER, retry_after_secs.to_string())],
                body,
            )
                .into_response();
        }

        (status, body).into_response()
    }
}

/// Special-case helper for alert acknowledgement guards, where the code
/// string differs from the generic taxonomy.
pub fn bad_request_with_code(code: &str, message: impl Into<String>) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({
            "detail": { "code": code, "message": message.into() }
        })),
    )
        .into_response()
}
