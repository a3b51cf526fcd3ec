//! Engine error → HTTP status mapping.
//!
//! Validation problems are the caller's fault (400), missing things are 404,
//! remote rejections are 401, tripped gates are 422, a down experiment store
//! is 503 (read paths catch it earlier and render a degraded view instead),
//! and anything else is a 500 carrying a correlation id that is also logged.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use tracing::error;
use uuid::Uuid;
use weft::EngineError;

pub struct ApiError(pub EngineError);

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let e = self.0;
        let status = match &e {
            EngineError::ConfigParse(_)
            | EngineError::ConfigValidation(_)
            | EngineError::TypeValidation { .. }
            | EngineError::TemplateResolution(_) => StatusCode::BAD_REQUEST,
            EngineError::ToolMissing(_)
            | EngineError::AgentUnreachable { .. }
            | EngineError::RunNotFound(_)
            | EngineError::AgentNotFound(_)
            | EngineError::WorkflowNotFound(_) => StatusCode::NOT_FOUND,
            EngineError::AgentRejected { .. } => StatusCode::UNAUTHORIZED,
            EngineError::GateFailed { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            EngineError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            let correlation_id = Uuid::new_v4();
            error!(%correlation_id, error = %e, "internal error");
            return (
                status,
                Json(serde_json::json!({
                    "error": "internal error",
                    "correlation_id": correlation_id,
                })),
            )
                .into_response();
        }
        (
            status,
            Json(serde_json::json!({ "error": e.to_string() })),
        )
            .into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn status_of(e: EngineError) -> StatusCode {
        ApiError(e).into_response().status()
    }

    #[test]
    fn mapping_matches_the_contract() {
        assert_eq!(
            status_of(EngineError::ConfigParse("bad".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(EngineError::WorkflowNotFound("w".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(EngineError::AgentRejected {
                agent_id: "a".into(),
                message: "no".into()
            }),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            status_of(EngineError::GateFailed {
                metric: "cost_usd".into(),
                value: 1.0,
                limit: 0.5
            }),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            status_of(EngineError::StoreUnavailable("down".into())),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_of(EngineError::Storage("disk full".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
