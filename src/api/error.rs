use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use tracing::error;

use crate::error::ChatError;

use super::types::ErrorResponse;

impl ChatError {
    pub fn status(&self) -> StatusCode {
        match self {
            ChatError::PromptTooLong { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            ChatError::Generation(_) | ChatError::Timeout(_) | ChatError::Join(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ChatError {
    fn into_response(self) -> Response {
        let status = self.status();
        let detail = self.to_string();
        error!(status = status.as_u16(), %detail, "chat request failed");
        (status, Json(ErrorResponse { detail })).into_response()
    }
}
