//! Prometheus metrics for ldap-proxy
//!
//! Exposes metrics at the admin `/metrics` endpoint in Prometheus format.
//! The recording helpers are no-ops until a recorder is installed.

use axum::{extract::State, http::StatusCode, response::IntoResponse};
use ldap_proxy_core::types::ResultCode;
use ldap_proxy_core::ProxyError;
use metrics::{counter, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::time::Instant;

use crate::admin::AdminState;

/// Metric names
pub mod names {
    // Client connections
    pub const CLIENT_CONNECTIONS_ACTIVE: &str = "ldap_proxy_client_connections_active";
    pub const CLIENT_CONNECTIONS_TOTAL: &str = "ldap_proxy_client_connections_total";
    pub const CLIENT_CONNECTIONS_REJECTED_TOTAL: &str =
        "ldap_proxy_client_connections_rejected_total";
    pub const CLIENT_DEADLINE_EXPIRED_TOTAL: &str = "ldap_proxy_client_deadline_expired_total";

    // Operations
    pub const BINDS_TOTAL: &str = "ldap_proxy_binds_total";
    pub const SEARCHES_TOTAL: &str = "ldap_proxy_searches_total";
    pub const SEARCH_ENTRIES_TOTAL: &str = "ldap_proxy_search_entries_total";

    // Session layer
    pub use ldap_proxy_session::names::{
        BACKEND_DIALS_TOTAL, INTERNAL_FAULTS_TOTAL, SESSIONS_ACTIVE,
    };

    // System
    pub const UPTIME_SECONDS: &str = "ldap_proxy_uptime_seconds";
    pub const INFO: &str = "ldap_proxy_info";
}

/// Metrics recorder
#[derive(Clone)]
pub struct MetricsRecorder {
    handle: PrometheusHandle,
    start_time: Instant,
}

impl MetricsRecorder {
    /// Install the global Prometheus recorder. Fails if one is already installed.
    pub fn install() -> Result<Self, ProxyError> {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .map_err(|e| ProxyError::Config(format!("Failed to install Prometheus recorder: {}", e)))?;

        gauge!(names::INFO, "version" => ldap_proxy_core::VERSION).set(1.0);

        Ok(Self {
            handle,
            start_time: Instant::now(),
        })
    }

    /// Get metrics output in Prometheus format
    pub fn render(&self) -> String {
        gauge!(names::UPTIME_SECONDS).set(self.start_time.elapsed().as_secs_f64());

        self.handle.render()
    }
}

/// Record a proxied bind
pub fn record_bind(code: ResultCode) {
    counter!(names::BINDS_TOTAL, "result" => code.as_str()).increment(1);
}

/// Record a proxied search and the number of entries returned
pub fn record_search(code: ResultCode, entries: usize) {
    counter!(names::SEARCHES_TOTAL, "result" => code.as_str()).increment(1);
    counter!(names::SEARCH_ENTRIES_TOTAL).increment(entries as u64);
}

pub fn record_connection_accepted() {
    counter!(names::CLIENT_CONNECTIONS_TOTAL).increment(1);
}

pub fn record_connection_rejected() {
    counter!(names::CLIENT_CONNECTIONS_REJECTED_TOTAL).increment(1);
}

pub fn record_deadline_expired() {
    counter!(names::CLIENT_DEADLINE_EXPIRED_TOTAL).increment(1);
}

/// Update active client connections
pub fn set_active_connections(count: u64) {
    gauge!(names::CLIENT_CONNECTIONS_ACTIVE).set(count as f64);
}

/// Handler for /metrics endpoint
pub async fn metrics_handler(State(state): State<AdminState>) -> impl IntoResponse {
    match &state.metrics {
        Some(metrics) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            metrics.render(),
        ),
        None => (
            StatusCode::NOT_FOUND,
            [("content-type", "text/plain; charset=utf-8")],
            "metrics recorder not installed\n".to_string(),
        ),
    }
}
