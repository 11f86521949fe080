use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::services::ServeDir;

use crate::inference::InferenceService;

pub mod error;
pub mod handlers;
pub mod types;

use handlers::{chat, healthz, serve_frontend};

#[derive(Clone)]
pub struct AppState {
    pub infer: Arc<InferenceService>,
    pub frontend_dir: Arc<PathBuf>,
}

impl AppState {
    pub fn new(infer: Arc<InferenceService>, frontend_dir: PathBuf) -> Self {
        Self {
            infer,
            frontend_dir: Arc::new(frontend_dir),
        }
    }
}

/// `/api/chat`, `/healthz`, the `/static` asset mount and the SPA fallback.
pub fn router(state: AppState) -> Router {
    let static_dir = state.frontend_dir.join("static");

    Router::new()
        .route("/api/chat", post(chat).get(serve_frontend))
        .route("/healthz", get(healthz))
        .nest_service("/static", ServeDir::new(static_dir))
        .fallback(serve_frontend)
        .with_state(state)
}
