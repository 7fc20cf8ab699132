use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use lens_api::ClusterError;
use topic_engine::EngineError;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Malformed partition id, offset or offset range.
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("publish failed: {0}")]
    Publish(#[from] ClusterError),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Engine(_) | ApiError::Publish(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::debug!(error = %self, "request rejected");
        }
        (status, self.to_string()).into_response()
    }
}
