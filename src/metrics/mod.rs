//! Prometheus metrics.
//!
//! A shared counter store mirroring the agent's probe traffic, exported via
//! a small axum server for scraping.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Router};
use prometheus::{
    Encoder, Gauge, IntCounterVec, Opts, Registry, TextEncoder,
};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::{Error, Result};

/// Label names shared by the probe counters.
pub const LABEL_FROM: &str = "from";
pub const LABEL_TARGET: &str = "target";
pub const LABEL_CLIENT: &str = "client";

/// Prometheus registry and collectors for probe traffic.
pub struct CounterStore {
    registry: Registry,

    /// Probe bytes written to the wire.
    pub bytes_sent_total: IntCounterVec,
    /// Probe bytes read from the wire.
    pub bytes_received_total: IntCounterVec,
    /// Probe requests served.
    pub requests_served_total: IntCounterVec,
    /// Milliseconds spent serving probe requests.
    pub served_duration_ms_total: IntCounterVec,
    /// Unix timestamp of process start.
    pub started_time: Gauge,
}

impl CounterStore {
    /// Create a new store with all collectors registered.
    pub fn new() -> std::result::Result<Self, prometheus::Error> {
        let registry = Registry::new();
        let labels = &[LABEL_FROM, LABEL_TARGET, LABEL_CLIENT];

        let bytes_sent_total = IntCounterVec::new(
            Opts::new("globalping_bytes_sent_total", "Probe bytes sent"),
            labels,
        )?;
        let bytes_received_total = IntCounterVec::new(
            Opts::new("globalping_bytes_received_total", "Probe bytes received"),
            labels,
        )?;
        let requests_served_total = IntCounterVec::new(
            Opts::new("globalping_requests_served_total", "Probe requests served"),
            labels,
        )?;
        let served_duration_ms_total = IntCounterVec::new(
            Opts::new(
                "globalping_served_duration_ms_total",
                "Milliseconds spent serving probe requests",
            ),
            labels,
        )?;
        let started_time = Gauge::new(
            "globalping_started_time",
            "Unix timestamp at which the process started",
        )?;

        registry.register(Box::new(bytes_sent_total.clone()))?;
        registry.register(Box::new(bytes_received_total.clone()))?;
        registry.register(Box::new(requests_served_total.clone()))?;
        registry.register(Box::new(served_duration_ms_total.clone()))?;
        registry.register(Box::new(started_time.clone()))?;

        Ok(Self {
            registry,
            bytes_sent_total,
            bytes_received_total,
            requests_served_total,
            served_duration_ms_total,
            started_time,
        })
    }

    /// Render the registry in the Prometheus text exposition format.
    pub fn export(&self) -> std::result::Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&families, &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

/// Serve `/metrics` (or the configured path) until cancelled.
pub async fn serve_metrics(
    addr: SocketAddr,
    path: String,
    store: Arc<CounterStore>,
    cancel: CancellationToken,
) -> Result<()> {
    let app = Router::new()
        .route(&path, get(metrics_handler))
        .with_state(store);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Config(format!("failed to bind metrics listener {addr}: {e}")))?;

    info!("serving prometheus metrics on {addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|e| Error::Internal(format!("metrics server failed: {e}")))
}

async fn metrics_handler(State(store): State<Arc<CounterStore>>) -> impl IntoResponse {
    match store.export() {
        Ok(body) => (StatusCode::OK, body),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("metrics encoding failed: {e}"),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_register_and_export() {
        let store = CounterStore::new().unwrap();
        store
            .bytes_sent_total
            .with_label_values(&["node-a", "1.1.1.1", "client-1"])
            .inc_by(64);
        store.started_time.set(1_700_000_000.0);

        let text = store.export().unwrap();
        assert!(text.contains("globalping_bytes_sent_total"));
        assert!(text.contains("globalping_started_time"));
    }
}
