use {
    crate::domain::error::PipelineError,
    axum::{
        Json,
        extract::rejection::JsonRejection,
        http::StatusCode,
        response::{IntoResponse, Response},
    },
};

pub enum ApiError {
    Pipeline(PipelineError),
    /// Admin routes called without the right `x-admin-token`.
    Unauthorized,
    /// Admin routes are off because no token is configured.
    AdminDisabled,
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        Self::Pipeline(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::Pipeline(PipelineError::Validation(rejection.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match self {
            Self::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                "missing or invalid admin token".to_string(),
            ),
            Self::AdminDisabled => (
                StatusCode::FORBIDDEN,
                "admin_disabled",
                "admin routes are disabled".to_string(),
            ),
            Self::Pipeline(err) => match err {
                PipelineError::Validation(msg) => {
                    (StatusCode::BAD_REQUEST, "validation_error", msg)
                }
                PipelineError::RecordNotFound(id) => (
                    StatusCode::NOT_FOUND,
                    "not_found",
                    format!("no payment record for {id}"),
                ),
                PipelineError::Conflict(msg) => (StatusCode::CONFLICT, "conflict", msg),
                PipelineError::ProviderUnavailable(msg) => {
                    tracing::warn!("provider unavailable: {msg}");
                    (
                        StatusCode::SERVICE_UNAVAILABLE,
                        "provider_unavailable",
                        "payment provider unavailable, retry later".to_string(),
                    )
                }
                PipelineError::Provider(msg) => {
                    tracing::warn!("provider error: {msg}");
                    (
                        StatusCode::BAD_GATEWAY,
                        "provider_error",
                        "payment provider rejected the request".to_string(),
                    )
                }
                PipelineError::Timeout(msg) => {
                    tracing::warn!("timeout: {msg}");
                    (
                        StatusCode::SERVICE_UNAVAILABLE,
                        "timeout",
                        "timed out, retry later".to_string(),
                    )
                }
                err @ (PipelineError::Database(_)
                | PipelineError::Serialization(_)
                | PipelineError::Dispatcher { .. }
                | PipelineError::Task(_)) => {
                    tracing::error!("internal error: {err}");
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "internal_error",
                        "internal error".to_string(),
                    )
                }
            },
        };

        let body = serde_json::json!({
            "error_code": error_code,
            "message": message,
        });

        (status, Json(body)).into_response()
    }
}
