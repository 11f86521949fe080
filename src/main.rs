use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod api;
mod config;
mod conversation;
mod error;
mod inference;
mod model;
mod prompts;

use api::AppState;
use config::AppConfig;
use inference::{device, llama::LlamaService, snapshot, InferenceService, ServiceOptions};
use prompts::Persona;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // -----------------------------
    // Logging
    // -----------------------------
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cfg = AppConfig::from_env()?;
    let persona = Persona::load(cfg.persona_path.as_deref())?;

    // -----------------------------
    // Model (loaded once, held for the process lifetime)
    // -----------------------------
    let model_cfg = cfg.model.clone();
    let engine = tokio::task::spawn_blocking(move || -> anyhow::Result<LlamaService> {
        let files = snapshot::resolve(&model_cfg)?;
        let device = device::select_device(&model_cfg.device)?;
        LlamaService::load(model_cfg.id.clone(), &files, device)
    })
    .await
    .context("model loading task panicked")??;

    let infer = Arc::new(InferenceService::new(
        Arc::new(engine),
        persona,
        ServiceOptions {
            params: cfg.generation.clone(),
            max_history_turns: cfg.max_history_turns,
            max_concurrent: cfg.max_concurrent_generations,
            timeout: cfg.generation_timeout,
        },
    ));

    let state = AppState::new(infer, cfg.frontend_dir.clone());

    // -----------------------------
    // Routers
    // -----------------------------
    let app = api::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_headers(Any)
                .allow_methods(Any),
        );

    let addr = cfg.bind_addr();
    info!(%addr, frontend = %cfg.frontend_dir.display(), "HTTP listening");

    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("shutdown requested");
    }
}
