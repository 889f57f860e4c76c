pub mod handlers;

use axum::extract::DefaultBodyLimit;
use axum::routing::{delete, get, post};
use axum::Router;
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};

pub use handlers::ApiState;

const MAX_REQUEST_BYTES: usize = 1024 * 1024;

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/status", get(handlers::handle_status))
        .route("/spawn/activate", post(handlers::handle_activate))
        .route("/spawn/deactivate", post(handlers::handle_deactivate))
        .route(
            "/workflow/start",
            post(handlers::handle_workflow_start).layer(DefaultBodyLimit::max(MAX_REQUEST_BYTES)),
        )
        .route("/workflow/{id}/status", get(handlers::handle_workflow_status))
        .route("/cache/stats", get(handlers::handle_cache_stats))
        .route("/cache/info", get(handlers::handle_cache_info))
        .route("/cache/invalidate", delete(handlers::handle_cache_invalidate))
        .route("/cache/clear", delete(handlers::handle_cache_clear))
        .route("/scaler", get(handlers::handle_scaler))
        .route("/events", get(handlers::handle_events))
        .with_state(state)
        .layer(cors)
}

pub async fn serve(
    state: ApiState,
    port: u16,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{}", port)).await?;
    tracing::info!(port, "API listening on 127.0.0.1");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;
    Ok(())
}
