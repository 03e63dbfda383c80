//! Read-only status API.
//!
//! `GET /api/status` returns the daemon's `DaemonStatus` as JSON and
//! `GET /api/health` answers `200 OK` while the process is up.
use axum::{extract::State, http::StatusCode, response::Json, routing::get, Router};
use palette_proto::protocol::DaemonStatus;
use palette_proto::state::StatusManager;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

#[derive(Clone)]
struct HttpState {
    status: Arc<StatusManager>,
}

pub fn router(status: Arc<StatusManager>) -> Router {
    Router::new()
        .route("/api/status", get(get_status))
        .route("/api/health", get(health))
        .layer(CorsLayer::permissive())
        .with_state(HttpState { status })
}

pub fn start_server(
    bind_address: String,
    port: u16,
    status: Arc<StatusManager>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let app = router(status);

        let addr = format!("{}:{}", bind_address, port);
        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind HTTP server to {}: {}", addr, e);
                return;
            }
        };

        info!("HTTP API server listening on http://{}", addr);

        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(cancel.cancelled_owned())
            .await
        {
            error!("HTTP server error: {}", e);
        }
    })
}

async fn get_status(State(state): State<HttpState>) -> Json<DaemonStatus> {
    Json(state.status.get_status().await)
}

async fn health() -> StatusCode {
    StatusCode::OK
}
