use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::handler::{handle_get, handle_head, ProxyState};

/// Build the axum router with GET and HEAD handlers for all paths.
pub fn build_router(state: ProxyState) -> Router {
    Router::new()
        .route("/*key", get(handle_get).head(handle_head))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until Ctrl-C. In-flight bodies are dropped on shutdown, which
/// cancels their transfers.
pub async fn run_server(listener: TcpListener, state: ProxyState) -> std::io::Result<()> {
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await
}
