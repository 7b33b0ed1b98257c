use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use shared::{ErrCode, ErrorInfo};

/// Manifest PUT bodies are capped; blobs stream uncapped.
pub static MAX_MANIFEST_BYTES: usize = 1 << 20;

/// Error responses
///
/// {
///     "code": "<error identifier>",
///     "message": "<message describing condition>",
///     "detail": "<unstructured>"
/// }
#[derive(Debug, Clone)]
pub struct ErrorResponse(pub ErrorInfo);

impl ErrorResponse {
    pub fn from_code(code: ErrCode, detail: impl Into<String>) -> Self {
        Self(ErrorInfo::new(code, code.description()).with_detail(detail))
    }

    pub fn internal(err: impl std::fmt::Display) -> Self {
        Self(ErrorInfo::internal(err))
    }

    pub fn code(&self) -> ErrCode {
        self.0.code
    }
}

impl From<ErrorInfo> for ErrorResponse {
    fn from(info: ErrorInfo) -> Self {
        Self(info)
    }
}

impl IntoResponse for ErrorResponse {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.http_status)
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self.0)).into_response()
    }
}
