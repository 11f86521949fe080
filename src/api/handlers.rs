use axum::{
    extract::State,
    http::{Method, StatusCode, Uri},
    response::{Html, IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::{debug, info, info_span, Instrument};
use uuid::Uuid;

use crate::error::ChatError;

use super::types::{ChatRequest, ChatResponse, ErrorResponse, HealthResponse};
use super::AppState;

pub const API_PREFIX: &str = "api";
const INDEX_FILE: &str = "index.html";

pub async fn chat(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, ChatError> {
    let request_id = Uuid::new_v4();

    async move {
        info!(
            message_chars = req.message.chars().count(),
            turns = req.history.len(),
            "chat request"
        );
        debug!(message = %req.message, history = ?req.history, "chat payload");

        let message = state.infer.chat(req.history, req.message).await?;
        Ok::<_, ChatError>(Json(ChatResponse { message }))
    }
    .instrument(info_span!("chat", %request_id))
    .await
}

/// Catch-all GET: the SPA entry document, or a JSON marker for API paths.
pub async fn serve_frontend(State(state): State<AppState>, method: Method, uri: Uri) -> Response {
    if method != Method::GET && method != Method::HEAD {
        return (
            StatusCode::METHOD_NOT_ALLOWED,
            Json(ErrorResponse {
                detail: "Method Not Allowed".to_string(),
            }),
        )
            .into_response();
    }

    let path = uri.path().trim_start_matches('/');
    if path.starts_with(API_PREFIX) {
        return Json(json!({ "message": "API route" })).into_response();
    }

    let index = state.frontend_dir.join(INDEX_FILE);
    match tokio::fs::read_to_string(&index).await {
        Ok(html) => Html(html).into_response(),
        Err(err) => {
            debug!(path = %index.display(), %err, "frontend entry document unavailable");
            (
                StatusCode::NOT_FOUND,
                Json(ErrorResponse {
                    detail: format!("frontend not found: {}", index.display()),
                }),
            )
                .into_response()
        }
    }
}

pub async fn healthz(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        model: state.infer.model_id().to_string(),
    })
}
