use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use braid_engine::EngineError;
use braid_store::StoreError;

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: String,
}

/// Errors surfaced by HTTP handlers, rendered as `{ error, code }`.
#[derive(Debug)]
pub enum ApiError {
    Engine(EngineError),
    BadRequest(String),
    NotFound(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Engine(e) => match e.kind() {
                "conflict" => StatusCode::CONFLICT,
                "not_found" => StatusCode::NOT_FOUND,
                "unsupported_agent" | "depth_exceeded" => StatusCode::UNPROCESSABLE_ENTITY,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "bad_request",
            Self::NotFound(_) => "not_found",
            Self::Engine(e) => e.kind(),
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        Self::Engine(err)
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        Self::Engine(EngineError::Store(err))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code = self.code().to_string();
        let message = match self {
            Self::Engine(e) => {
                if status.is_server_error() {
                    tracing::error!(error = %e, error_kind = e.kind(), "request failed");
                }
                e.to_string()
            }
            Self::BadRequest(msg) | Self::NotFound(msg) => msg,
        };
        (status, Json(ErrorBody { error: message, code })).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use braid_core::frame::DepthExceeded;

    #[test]
    fn engine_errors_map_to_status_codes() {
        assert_eq!(
            ApiError::from(EngineError::Conflict("busy".into())).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::from(StoreError::NotFound("node x".into())).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::from(EngineError::UnsupportedAgent("ghost".into())).status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        let depth = DepthExceeded {
            name: "deep".into(),
            depth: 5,
            max: 4,
        };
        assert_eq!(
            ApiError::from(EngineError::DepthExceeded(depth)).status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            ApiError::from(EngineError::Internal("boom".into())).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn code_follows_engine_kind() {
        assert_eq!(ApiError::from(EngineError::Conflict("busy".into())).code(), "conflict");
        assert_eq!(ApiError::BadRequest("x".into()).code(), "bad_request");
    }
}
