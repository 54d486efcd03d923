//! Hub public HTTP API.
//!
//! `/conns` dumps the connection registry, `/ping` relays a probe task to
//! a matching agent and streams the agent's events back incrementally,
//! `/version` reports the build.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{HubConfig, RespondRangePolicy};
use crate::error::{Error, ProbeError, Result};
use crate::hub::{dispatch_probe, ConnRegistry};
use crate::probe::{L4PacketType, L7PacketType, ProbeRequest, SimplePingRequest};
use crate::session::frames::ConnectionAttributes;
use crate::types::attr;
use crate::VERSION;

/// Shared handler state.
#[derive(Clone)]
pub struct ApiState {
    registry: ConnRegistry,
    config: Arc<HubConfig>,
}

impl ApiState {
    pub fn new(registry: ConnRegistry, config: HubConfig) -> Self {
        Self {
            registry,
            config: Arc::new(config),
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

fn error_response(status: StatusCode, error: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
        }),
    )
        .into_response()
}

/// Serve the API until cancelled.
pub async fn serve(listen: SocketAddr, state: ApiState, cancel: CancellationToken) -> Result<()> {
    let app = Router::new()
        .route("/conns", get(conns_handler))
        .route("/ping", post(ping_handler))
        .route("/version", get(version_handler))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .map_err(|e| Error::Config(format!("failed to bind hub API listener {listen}: {e}")))?;

    info!("hub API listening on {listen}");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|e| Error::Internal(format!("hub API server failed: {e}")))
}

async fn conns_handler(State(state): State<ApiState>) -> Response {
    match state.registry.dump().await {
        Ok(dump) => Json(dump).into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn version_handler() -> Json<HashMap<&'static str, &'static str>> {
    Json(HashMap::from([("version", VERSION)]))
}

/// A `/ping` task body: the probe parameters plus the agent selector.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PingTaskBody {
    #[serde(flatten)]
    request: SimplePingRequest,
    /// HTTP probes, dispatched as an HTTP fan-out when present.
    #[serde(default)]
    http_probes: Vec<crate::probe::http::HttpProbeRequest>,
}

async fn ping_handler(State(state): State<ApiState>, Json(body): Json<PingTaskBody>) -> Response {
    match run_ping_task(&state, body).await {
        Ok(response) => response,
        Err(e) => error_response(StatusCode::BAD_REQUEST, e.to_string()),
    }
}

async fn run_ping_task(state: &ApiState, mut body: PingTaskBody) -> Result<Response> {
    apply_clamps(&state.config, &mut body.request);

    // Pick the serving agent: an explicit `from` selects by node name,
    // otherwise any ping-capable agent wins.
    let mut required: ConnectionAttributes = HashMap::new();
    if let Some(node_name) = body.request.from.first() {
        required.insert(attr::NODE_NAME.to_string(), node_name.clone());
    } else {
        required.insert(attr::PING_CAPABILITY.to_string(), "true".to_string());
    }

    let (key, entry) = state
        .registry
        .search_by_attributes(required)
        .await?
        .ok_or(ProbeError::NoMatchingAgent)?;

    enforce_respond_range(&state.config, &entry.attributes, &body.request)?;

    let connection = entry
        .session
        .ok_or_else(|| Error::Internal(format!("agent {key} has no live session")))?;

    let request = if !body.http_probes.is_empty() {
        ProbeRequest::Httpprobe {
            probes: body.http_probes,
        }
    } else if body.request.l7_packet_type == Some(L7PacketType::Dns) {
        ProbeRequest::Dnsprobe {
            targets: body.request.dns_targets.clone(),
        }
    } else if body.request.l4_packet_type == Some(L4PacketType::Tcp) {
        ProbeRequest::Tcping(body.request)
    } else {
        ProbeRequest::Simple(body.request)
    };

    let reader = dispatch_probe(&connection, &request).await?;

    // Relay the agent's lines as they arrive, one event per line.
    let stream = futures::stream::unfold(reader, |mut reader| async move {
        match reader.next_line().await {
            Ok(Some(mut line)) => {
                line.push('\n');
                Some((Ok::<Bytes, std::io::Error>(Bytes::from(line)), reader))
            }
            _ => None,
        }
    });

    Ok((
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(stream),
    )
        .into_response())
}

/// Apply the hub's task clamps: not faster, not longer, not more packets
/// than configured.
fn apply_clamps(config: &HubConfig, request: &mut SimplePingRequest) {
    if let Some(min_interval) = config.min_pkt_interval {
        let min_ms = min_interval.as_millis() as u64;
        request.intv_ms = Some(request.intv_ms.unwrap_or(min_ms).max(min_ms));
    }
    if let Some(max_timeout) = config.max_pkt_timeout {
        let max_ms = max_timeout.as_millis() as u64;
        request.pkt_timeout_ms = Some(request.pkt_timeout_ms.unwrap_or(max_ms).min(max_ms));
    }
    if let Some(clamp) = config.pkt_count_clamp {
        request.total_pkts = Some(request.total_pkts.unwrap_or(clamp).min(clamp));
    }
}

/// With the `deny` policy, an IP-literal destination outside the agent's
/// advertised respond range is rejected before dispatch.
fn enforce_respond_range(
    config: &HubConfig,
    attributes: &ConnectionAttributes,
    request: &SimplePingRequest,
) -> Result<()> {
    if config.out_of_respond_range_policy != RespondRangePolicy::Deny {
        return Ok(());
    }
    let Some(ranges) = attributes.get(attr::RESPOND_RANGE) else {
        return Ok(());
    };
    let Ok(dst) = request.host().parse::<std::net::IpAddr>() else {
        // Hostname targets are validated agent-side after resolution.
        return Ok(());
    };

    let nets: Vec<IpNet> = ranges
        .split(',')
        .filter_map(|s| s.trim().parse().ok())
        .collect();
    if nets.is_empty() || nets.iter().any(|net| net.contains(&dst)) {
        return Ok(());
    }

    Err(ProbeError::OutOfRespondRange(dst.to_string()).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_apply_clamps() {
        let config = HubConfig {
            min_pkt_interval: Some(Duration::from_millis(500)),
            max_pkt_timeout: Some(Duration::from_secs(5)),
            pkt_count_clamp: Some(10),
            ..Default::default()
        };

        let mut request = SimplePingRequest {
            destination: "1.1.1.1".into(),
            intv_ms: Some(100),
            pkt_timeout_ms: Some(30_000),
            total_pkts: Some(50),
            ..Default::default()
        };
        apply_clamps(&config, &mut request);

        assert_eq!(request.intv_ms, Some(500));
        assert_eq!(request.pkt_timeout_ms, Some(5000));
        assert_eq!(request.total_pkts, Some(10));

        // Unset fields inherit the clamp values.
        let mut request = SimplePingRequest {
            destination: "1.1.1.1".into(),
            ..Default::default()
        };
        apply_clamps(&config, &mut request);
        assert_eq!(request.intv_ms, Some(500));
        assert_eq!(request.total_pkts, Some(10));
    }

    #[test]
    fn test_enforce_respond_range_deny() {
        let config = HubConfig {
            out_of_respond_range_policy: RespondRangePolicy::Deny,
            ..Default::default()
        };
        let attributes: ConnectionAttributes = HashMap::from([(
            attr::RESPOND_RANGE.to_string(),
            "10.0.0.0/8, 192.168.0.0/16".to_string(),
        )]);

        let inside = SimplePingRequest {
            destination: "10.1.2.3".into(),
            ..Default::default()
        };
        assert!(enforce_respond_range(&config, &attributes, &inside).is_ok());

        let outside = SimplePingRequest {
            destination: "8.8.8.8".into(),
            ..Default::default()
        };
        assert!(enforce_respond_range(&config, &attributes, &outside).is_err());

        // Hostnames pass through; the agent validates after resolution.
        let hostname = SimplePingRequest {
            destination: "example.com".into(),
            ..Default::default()
        };
        assert!(enforce_respond_range(&config, &attributes, &hostname).is_ok());
    }

    #[test]
    fn test_allow_policy_never_rejects() {
        let config = HubConfig::default();
        let attributes: ConnectionAttributes = HashMap::from([(
            attr::RESPOND_RANGE.to_string(),
            "10.0.0.0/8".to_string(),
        )]);
        let outside = SimplePingRequest {
            destination: "8.8.8.8".into(),
            ..Default::default()
        };
        assert!(enforce_respond_range(&config, &attributes, &outside).is_ok());
    }
}
