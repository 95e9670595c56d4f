use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use hitl_types::HitlError;

/// A [`HitlError`] rendered as `{"error": ...}` with its mapped status code.
#[derive(Debug)]
pub struct ApiError(pub HitlError);

impl From<HitlError> for ApiError {
    fn from(err: HitlError) -> Self {
        Self(err)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        self.0
            .http_status()
            .and_then(|code| StatusCode::from_u16(code).ok())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self.0, "Request failed");
        } else {
            tracing::debug!(error = %self.0, status = status.as_u16(), "Request rejected");
        }
        (status, Json(serde_json::json!({ "error": self.0.to_string() }))).into_response()
    }
}
