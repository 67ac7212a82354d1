use axum::{routing::get, Router};
use tower_http::trace::TraceLayer;

use super::api::{get_status, health_check, AppState};
use crate::config::WebConfig;
use crate::pipeline::PipelineHandle;

pub fn create_router(pipeline: PipelineHandle) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/status", get(get_status))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { pipeline })
}

/// Serve the status endpoints until the pipeline's shutdown token fires.
pub async fn run_server(
    pipeline: PipelineHandle,
    web_config: WebConfig,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let shutdown = pipeline.shutdown_token();
    let app = create_router(pipeline);

    let listener = tokio::net::TcpListener::bind(&web_config.listen).await?;
    tracing::info!("Web server listening on {}", web_config.listen);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
            tracing::info!("Web server shutting down gracefully");
        })
        .await?;

    Ok(())
}
