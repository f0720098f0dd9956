//! Maps domain failures onto HTTP responses.

use domains::errors::DomainError;
use serde::Serialize;

/// JSON error body: `{ "success": false, "error": "..." }`.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub success: bool,
    pub error: String,
}

#[derive(Debug)]
pub struct ApiError(pub DomainError);

impl ApiError {
    pub fn status_code(&self) -> u16 {
        match self.0 {
            DomainError::NotFound { .. } => 404,
            DomainError::Validation(_) => 400,
            DomainError::Storage(_) | DomainError::Render(_) => 500,
        }
    }

    pub fn body(&self) -> ErrorBody {
        ErrorBody {
            success: false,
            error: self.0.to_string(),
        }
    }
}

impl From<DomainError> for ApiError {
    fn from(e: DomainError) -> Self {
        Self(e)
    }
}

#[cfg(feature = "web-axum")]
mod axum_impl {
    use axum::http::StatusCode;
    use axum::response::{IntoResponse, Response};
    use axum::Json;
    use tracing::{error, info};

    use super::ApiError;

    impl IntoResponse for ApiError {
        fn into_response(self) -> Response {
            let status = StatusCode::from_u16(self.status_code())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            if status.is_server_error() {
                error!(error = %self.0, "request failed");
            } else {
                info!(error = %self.0, "request rejected");
            }
            (status, Json(self.body())).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(ApiError(DomainError::not_found("path", 3)).status_code(), 404);
        assert_eq!(ApiError(DomainError::Validation("x".into())).status_code(), 400);
        assert_eq!(ApiError(DomainError::Storage("x".into())).status_code(), 500);

        let body = ApiError(DomainError::not_found("path", 3)).body();
        assert!(!body.success);
        assert_eq!(body.error, "path not found with ID 3");
    }
}
