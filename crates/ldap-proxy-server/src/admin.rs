//! Admin HTTP endpoint: `/metrics` and `/health`

use axum::{extract::State, routing::get, Json, Router};
use ldap_proxy_core::{ProxyError, VERSION};
use ldap_proxy_session::SessionStore;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::metrics::{metrics_handler, MetricsRecorder};

/// State shared by the admin handlers
#[derive(Clone)]
pub struct AdminState {
    pub metrics: Option<MetricsRecorder>,
    pub store: Arc<dyn SessionStore>,
    pub start_time: Instant,
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_handler(State(state): State<AdminState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": VERSION,
        "active_sessions": state.store.len(),
        "uptime_secs": state.start_time.elapsed().as_secs(),
    }))
}

/// Serve the admin router until the shutdown signal fires
pub async fn serve(
    addr: &str,
    state: AdminState,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), ProxyError> {
    let listener = TcpListener::bind(addr).await?;
    info!("Admin endpoint at http://{} (/metrics, /health)", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
        })
        .await?;
    Ok(())
}
