//! 统一的 API 错误类型与 HTTP 映射。

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// 纯文本错误响应，消息原样作为响应体。
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg).into_response(),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg).into_response(),
        }
    }
}

impl ApiError {
    pub fn jailbreak(path: &str) -> Self {
        ApiError::BadRequest(format!("error: Jailbreak for path: {path}\n"))
    }

    pub fn write_failed() -> Self {
        ApiError::Internal("error: Internal write error.\n".into())
    }

    pub fn no_such_file(path: &str) -> Self {
        ApiError::NotFound(format!("error: No such file or directory ({path})."))
    }
}
