//! Agent: runs probes on behalf of the hub.
//!
//! The agent maintains a QUIC session to the hub (registration, attribute
//! announcement, heartbeat echoes) and serves dispatch streams the hub
//! opens on that same connection. The identical probe surface is also
//! exposed over local HTTP/TLS listeners, streaming newline-JSON
//! `PingEvent`s with a flush per event.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use ipnet::IpNet;
use regex::Regex;
use rustls::server::WebPkiClientVerifier;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{AgentConfig, Config};
use crate::error::{Error, ProbeError, Result, TransportError};
use crate::ipinfo::{AutoIpInfoDispatcher, IpInfoProvider, StaticIpInfoProvider};
use crate::metrics::{serve_metrics, CounterStore};
use crate::probe::dns::DnsLookupRequest;
use crate::probe::http::HttpProbeRequest;
use crate::probe::icmp::unix_millis;
use crate::probe::pinger::{
    DnsPinger, HttpPinger, PingData, PingEvent, Pinger, PingerContext, SimplePinger, TcpSynPinger,
};
use crate::probe::{ProbeRequest, SimplePingRequest};
use crate::ratelimit::{RateLimitPool, RateLimiter};
use crate::session::frames::{ConnectionAttributes, EchoDirection, EchoPayload, MessagePayload};
use crate::session::{self, auth, FrameReader};
use crate::types::attr;
use crate::util::{check_intersect, ProbeResolver};
use crate::VERSION;

/// Shared state behind every probe entry point.
#[derive(Clone)]
pub struct AgentState {
    pub config: Arc<AgentConfig>,
    pub counters: Arc<CounterStore>,
    pub rate_limiter: Option<Arc<RateLimiter>>,
    pub resolver: Arc<ProbeResolver>,
    pub respond_range: Arc<Vec<IpNet>>,
    pub domain_patterns: Arc<Vec<Regex>>,
    pub ipinfo: Option<Arc<AutoIpInfoDispatcher>>,
}

impl AgentState {
    pub fn new(
        config: AgentConfig,
        rate_limiter: Option<Arc<RateLimiter>>,
        ipinfo: Option<Arc<AutoIpInfoDispatcher>>,
    ) -> Result<Self> {
        let respond_range = config
            .respond_range
            .iter()
            .map(|s| {
                s.parse::<IpNet>()
                    .map_err(|_| Error::InvalidCidr(s.clone()))
            })
            .collect::<Result<Vec<_>>>()?;

        let domain_patterns = config
            .domain_respond_range
            .iter()
            .map(|pattern| {
                Regex::new(pattern)
                    .map_err(|e| Error::InvalidConfig(format!("bad domain pattern {pattern:?}: {e}")))
            })
            .collect::<Result<Vec<_>>>()?;

        let counters = Arc::new(
            CounterStore::new().map_err(|e| Error::Internal(format!("metrics setup: {e}")))?,
        );
        counters.started_time.set(unix_millis() as f64 / 1000.0);

        Ok(Self {
            config: Arc::new(config),
            counters,
            rate_limiter,
            resolver: Arc::new(ProbeResolver::new(None, Duration::from_secs(10))?),
            respond_range: Arc::new(respond_range),
            domain_patterns: Arc::new(domain_patterns),
            ipinfo,
        })
    }

    fn pinger_context(&self) -> PingerContext {
        let mut metadata = HashMap::new();
        if !self.config.node_name.is_empty() {
            metadata.insert("from".to_string(), self.config.node_name.clone());
        }
        PingerContext {
            rate_limiter: self.rate_limiter.clone(),
            respond_range: self.respond_range.clone(),
            resolver: self.resolver.clone(),
            ipinfo: self.ipinfo.clone(),
            metadata,
        }
    }

    /// Enforce the domain respond patterns for a hostname target.
    fn check_domain(&self, destination: &str) -> Result<()> {
        if self.domain_patterns.is_empty() || destination.parse::<std::net::IpAddr>().is_ok() {
            return Ok(());
        }
        if self.domain_patterns.iter().any(|p| p.is_match(destination)) {
            return Ok(());
        }
        Err(ProbeError::DomainNotAllowed(destination.to_string()).into())
    }

    /// Build the pinger serving a dispatched request.
    pub fn build_pinger(&self, request: ProbeRequest) -> Result<Box<dyn Pinger>> {
        let ctx = self.pinger_context();
        match request {
            ProbeRequest::Simple(request) => {
                // A simple request can still select another engine through
                // its packet-type fields.
                if request.l7_packet_type == Some(crate::probe::L7PacketType::Dns) {
                    let targets = request.dns_targets;
                    self.check_dns_targets(&targets)?;
                    return Ok(Box::new(DnsPinger {
                        requests: targets,
                        ctx,
                    }));
                }
                if request.l4_packet_type == Some(crate::probe::L4PacketType::Tcp) {
                    self.check_domain(&request.host())?;
                    return Ok(Box::new(TcpSynPinger { request, ctx }));
                }
                self.check_domain(&request.host())?;
                Ok(Box::new(SimplePinger { request, ctx }))
            }
            ProbeRequest::Tcping(request) => {
                self.check_domain(&request.host())?;
                Ok(Box::new(TcpSynPinger { request, ctx }))
            }
            ProbeRequest::Dnsprobe { targets } => {
                self.check_dns_targets(&targets)?;
                Ok(Box::new(DnsPinger {
                    requests: targets,
                    ctx,
                }))
            }
            ProbeRequest::Httpprobe { probes } => {
                for probe in &probes {
                    if let Some(host) = probe.url.parse::<http::Uri>().ok().and_then(|u| {
                        u.host().map(ToString::to_string)
                    }) {
                        self.check_domain(&host)?;
                    }
                }
                Ok(Box::new(HttpPinger {
                    requests: probes,
                    ctx,
                }))
            }
        }
    }

    /// In DNS mode the probed endpoints are the servers themselves; all of
    /// them must sit inside the respond range.
    fn check_dns_targets(&self, targets: &[DnsLookupRequest]) -> Result<()> {
        if self.respond_range.is_empty() {
            return Ok(());
        }
        let ips: Vec<std::net::IpAddr> = targets
            .iter()
            .filter_map(|t| {
                t.addr_port
                    .parse::<SocketAddr>()
                    .ok()
                    .map(|addr| addr.ip())
            })
            .collect();
        if ips.len() != targets.len() || !check_intersect(&ips, &self.respond_range) {
            return Err(ProbeError::OutOfRespondRange("dns servers".into()).into());
        }
        Ok(())
    }
}

/// Run the agent until cancelled.
pub async fn run_agent(config: Config, cancel: CancellationToken) -> Result<()> {
    let pool = RateLimitPool::spawn(config.ratelimit.clone(), cancel.child_token());
    let limiter = RateLimiter::global(pool);
    info!(
        "shared outbound rate limit: {} tokens per {:?}",
        config.ratelimit.tokens_per_key, config.ratelimit.refresh_interval
    );

    // DN42 space and the public internet dispatch to different metadata
    // providers. Both default to the static (empty) provider until a
    // deployment registers richer ones.
    let dn42: Arc<dyn IpInfoProvider> = Arc::new(StaticIpInfoProvider::new("dn42"));
    let internet: Arc<dyn IpInfoProvider> = Arc::new(StaticIpInfoProvider::new("internet"));
    let ipinfo = Arc::new(AutoIpInfoDispatcher::with_default_routes(dn42, internet)?);

    let state = AgentState::new(config.agent.clone(), Some(limiter), Some(ipinfo))?;

    // Listener failures are fatal: they surface here and abort the agent
    // instead of leaving it half-alive.
    let (err_tx, mut err_rx) = mpsc::channel::<Error>(1);

    if let Some(metrics_addr) = state.config.metrics_listen_addr {
        let metrics = serve_metrics(
            metrics_addr,
            state.config.metrics_path.clone(),
            state.counters.clone(),
            cancel.child_token(),
        );
        let err_tx = err_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = metrics.await {
                let _ = err_tx.send(e).await;
            }
        });
    }

    if let Some(listen) = state.config.http_listen_addr {
        let router = local_router(state.clone());
        let http_cancel = cancel.child_token();
        let err_tx = err_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_plain(listen, router, http_cancel).await {
                let _ = err_tx.send(e).await;
            }
        });
    }

    if let Some(listen) = state.config.tls_listen_addr {
        let router = local_router(state.clone());
        let tls_cancel = cancel.child_token();
        let tls_state = state.clone();
        let err_tx = err_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_tls(listen, &tls_state, router, tls_cancel).await {
                let _ = err_tx.send(e).await;
            }
        });
    }

    if !state.config.node_name.is_empty() && state.config.hub_addr.is_some() {
        tokio::spawn(registration_loop(state.clone(), cancel.child_token()));
    }
    drop(err_tx);

    tokio::select! {
        () = cancel.cancelled() => Ok(()),
        failed = err_rx.recv() => match failed {
            Some(e) => {
                cancel.cancel();
                Err(e)
            }
            // No fallible subsystem configured; run until cancelled.
            None => {
                cancel.cancelled().await;
                Ok(())
            }
        },
    }
}

// ---------------------------------------------------------------------------
// Local HTTP surface
// ---------------------------------------------------------------------------

fn local_router(state: AgentState) -> Router {
    Router::new()
        .route("/simpleping", post(simpleping_handler))
        .route("/tcping", post(tcping_handler))
        .route("/dnsprobe", post(dnsprobe_handler))
        .route("/httpprobe", post(httpprobe_handler))
        .route("/version", get(version_handler))
        .with_state(state)
}

async fn serve_plain(listen: SocketAddr, router: Router, cancel: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .map_err(|e| Error::Config(format!("failed to bind HTTP listener {listen}: {e}")))?;
    info!("serving plaintext HTTP probes on {listen}");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|e| Error::Internal(format!("HTTP server failed: {e}")))
}

/// TLS endpoint with mandatory client certificates, verified against the
/// peer-CA pool.
async fn serve_tls(
    listen: SocketAddr,
    state: &AgentState,
    router: Router,
    cancel: CancellationToken,
) -> Result<()> {
    let (Some(cert), Some(key)) = (
        state.config.server_cert.as_ref(),
        state.config.server_cert_key.as_ref(),
    ) else {
        return Err(Error::InvalidConfig(
            "TLS listener requires server_cert and server_cert_key".into(),
        ));
    };

    let (certs, key) = auth::load_cert_pair(cert, key)?;
    let roots = auth::load_ca_pool(&state.config.peer_ca)?;
    let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .map_err(|e| TransportError::Tls(format!("client verifier: {e}")))?;
    let tls_config = rustls::ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)
        .map_err(|e| TransportError::Tls(format!("server cert rejected: {e}")))?;
    let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(tls_config));

    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .map_err(|e| Error::Config(format!("failed to bind TLS listener {listen}: {e}")))?;
    info!("serving TLS probes on {listen}");

    loop {
        let (stream, remote) = tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("TLS accept failed: {e}");
                    continue;
                }
            },
        };

        let acceptor = acceptor.clone();
        let router = router.clone();
        tokio::spawn(async move {
            let tls = match acceptor.accept(stream).await {
                Ok(tls) => tls,
                Err(e) => {
                    debug!("TLS handshake with {remote} failed: {e}");
                    return;
                }
            };
            let service = hyper_util::service::TowerToHyperService::new(router);
            let io = hyper_util::rt::TokioIo::new(tls);
            if let Err(e) = hyper_util::server::conn::auto::Builder::new(
                hyper_util::rt::TokioExecutor::new(),
            )
            .serve_connection(io, service)
            .await
            {
                debug!("TLS connection from {remote} ended: {e}");
            }
        });
    }
}

async fn version_handler() -> Json<HashMap<&'static str, &'static str>> {
    Json(HashMap::from([("version", VERSION)]))
}

async fn simpleping_handler(
    State(state): State<AgentState>,
    Json(request): Json<SimplePingRequest>,
) -> Response {
    serve_probe(&state, ProbeRequest::Simple(request))
}

async fn tcping_handler(
    State(state): State<AgentState>,
    Json(request): Json<SimplePingRequest>,
) -> Response {
    serve_probe(&state, ProbeRequest::Tcping(request))
}

async fn dnsprobe_handler(
    State(state): State<AgentState>,
    Json(targets): Json<Vec<DnsLookupRequest>>,
) -> Response {
    serve_probe(&state, ProbeRequest::Dnsprobe { targets })
}

async fn httpprobe_handler(
    State(state): State<AgentState>,
    Json(probes): Json<Vec<HttpProbeRequest>>,
) -> Response {
    serve_probe(&state, ProbeRequest::Httpprobe { probes })
}

fn probe_labels(state: &AgentState, request: &ProbeRequest, client: &str) -> [String; 3] {
    let target = match request {
        ProbeRequest::Simple(r) | ProbeRequest::Tcping(r) => r.destination.clone(),
        ProbeRequest::Dnsprobe { targets } => targets
            .iter()
            .map(|t| t.addr_port.clone())
            .collect::<Vec<_>>()
            .join(","),
        ProbeRequest::Httpprobe { probes } => probes
            .iter()
            .map(|p| p.url.clone())
            .collect::<Vec<_>>()
            .join(","),
    };
    [state.config.node_name.clone(), target, client.to_string()]
}

/// Run a probe and stream its events as newline-JSON, flushing per event.
fn serve_probe(state: &AgentState, request: ProbeRequest) -> Response {
    let labels = probe_labels(state, &request, "http");
    let pinger = match state.build_pinger(request) {
        Ok(pinger) => pinger,
        Err(e) => {
            return (
                StatusCode::OK,
                Json(HashMap::from([("error", e.to_string())])),
            )
                .into_response();
        }
    };

    let counters = state.counters.clone();
    let started = Instant::now();
    let cancel = CancellationToken::new();
    let events = pinger.ping(cancel.clone());
    // The guard travels with the stream state: client disconnects cancel
    // the probe internals as surely as normal completion does.
    let guard = cancel.drop_guard();

    let stream = futures::stream::unfold(
        (events, guard, counters, labels, started),
        |(mut events, guard, counters, labels, started)| async move {
            match events.recv().await {
                Some(event) => {
                    let line = render_event(&counters, &labels, &event);
                    Some((
                        Ok::<Bytes, std::io::Error>(line),
                        (events, guard, counters, labels, started),
                    ))
                }
                None => {
                    let label_refs: Vec<&str> = labels.iter().map(String::as_str).collect();
                    counters
                        .requests_served_total
                        .with_label_values(&label_refs)
                        .inc();
                    counters
                        .served_duration_ms_total
                        .with_label_values(&label_refs)
                        .inc_by(started.elapsed().as_millis() as u64);
                    None
                }
            }
        },
    );

    (
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(stream),
    )
        .into_response()
}

fn render_event(counters: &CounterStore, labels: &[String; 3], event: &PingEvent) -> Bytes {
    if let Some(PingData::Icmp(reply)) = &event.data {
        counters
            .bytes_received_total
            .with_label_values(&[&labels[0], &labels[1], &labels[2]])
            .inc_by(reply.size as u64);
    }

    let mut line = serde_json::to_vec(event).unwrap_or_else(|_| b"{}".to_vec());
    line.push(b'\n');
    Bytes::from(line)
}

// ---------------------------------------------------------------------------
// Hub session
// ---------------------------------------------------------------------------

/// The attributes announced at registration.
fn node_attributes(config: &AgentConfig) -> ConnectionAttributes {
    let mut attributes = ConnectionAttributes::new();
    attributes.insert(attr::PING_CAPABILITY.to_string(), "true".to_string());
    attributes.insert(attr::NODE_NAME.to_string(), config.node_name.clone());

    let optional = [
        (attr::HTTP_ENDPOINT, config.http_endpoint.as_ref()),
        (attr::EXACT_LOCATION, config.exact_location.as_ref()),
        (attr::COUNTRY_CODE, config.country_code.as_ref()),
        (attr::CITY_NAME, config.city_name.as_ref()),
        (attr::ASN, config.asn.as_ref()),
        (attr::ISP, config.isp.as_ref()),
        (attr::DN42_ASN, config.dn42_asn.as_ref()),
        (attr::DN42_ISP, config.dn42_isp.as_ref()),
    ];
    for (key, value) in optional {
        if let Some(value) = value.filter(|v| !v.is_empty()) {
            attributes.insert(key.to_string(), value.clone());
        }
    }

    if !config.respond_range.is_empty() {
        attributes.insert(
            attr::RESPOND_RANGE.to_string(),
            config.respond_range.join(","),
        );
    }
    if !config.domain_respond_range.is_empty() {
        // Patterns carry regex syntax; JSON-encode before transmitting.
        if let Ok(encoded) = serde_json::to_string(&config.domain_respond_range) {
            attributes.insert(attr::DOMAIN_RESPOND_RANGE.to_string(), encoded);
        }
    }

    for (key, enabled) in [
        (attr::SUPPORT_UDP, config.support_udp),
        (attr::SUPPORT_PMTU, config.support_pmtu),
        (attr::SUPPORT_TCP, config.support_tcp),
        (attr::DNS_PROBE_CAPABILITY, config.support_dns),
    ] {
        if enabled {
            attributes.insert(key.to_string(), "true".to_string());
        }
    }
    attributes.insert(attr::SUPPORT_QUIC_TUNNEL.to_string(), "true".to_string());
    attributes.insert(
        attr::VERSION.to_string(),
        format!("{{\"version\":\"{VERSION}\"}}"),
    );

    attributes
}

/// Keep a hub session alive, reconnecting on the next tick after failures.
async fn registration_loop(state: AgentState, cancel: CancellationToken) {
    let tick = state.config.tick_interval;
    loop {
        if cancel.is_cancelled() {
            return;
        }

        match run_session(&state, &cancel).await {
            Ok(()) => {
                info!("hub session ended");
                return;
            }
            Err(e) => warn!("hub session failed: {e}, retrying in {tick:?}"),
        }

        tokio::select! {
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(tick) => {}
        }
    }
}

async fn run_session(state: &AgentState, cancel: &CancellationToken) -> Result<()> {
    let config = &state.config;
    let hub_spec = config
        .hub_addr
        .as_ref()
        .ok_or_else(|| Error::InvalidConfig("hub address not configured".into()))?;

    let addr = tokio::net::lookup_host(hub_spec.as_str())
        .await
        .map_err(|e| Error::Config(format!("cannot resolve hub {hub_spec}: {e}")))?
        .next()
        .ok_or_else(|| Error::Config(format!("no address for hub {hub_spec}")))?;

    let server_name = config.server_name.clone().unwrap_or_else(|| {
        hub_spec
            .rsplit_once(':')
            .map_or(hub_spec.clone(), |(host, _)| host.to_string())
    });

    let client_cert = match (&config.client_cert, &config.client_cert_key) {
        (Some(cert), Some(key)) => Some((cert.as_path(), key.as_path())),
        _ => None,
    };
    let endpoint = session::client_endpoint(&config.peer_ca, client_cert, addr.is_ipv6())?;

    info!("connecting to hub at {addr} (sni {server_name})");
    let connection = session::connect(&endpoint, addr, &server_name).await?;

    let (mut send, recv) = connection
        .open_bi()
        .await
        .map_err(|e| TransportError::Quic(format!("open registration stream: {e}")))?;
    let mut reader = FrameReader::new(recv);

    if let Some(token) = auth::token_from(
        Some(config.jwt_token_from_env.as_str()),
        config.jwt_token_from_file.as_deref(),
    ) {
        session::write_frame(&mut send, &MessagePayload::auth(token)).await?;
    }

    session::write_frame(&mut send, &MessagePayload::register(&config.node_name)).await?;
    session::write_frame(
        &mut send,
        &MessagePayload::attributes(node_attributes(config), vec![]),
    )
    .await?;

    // Serve dispatch streams the hub opens on this connection.
    let dispatch_cancel = cancel.child_token();
    tokio::spawn(serve_dispatch(
        connection.clone(),
        state.clone(),
        dispatch_cancel.clone(),
    ));

    let result = echo_loop(state, &mut send, &mut reader, cancel).await;
    dispatch_cancel.cancel();
    connection.close(0u32.into(), b"session ended");
    result
}

/// Tick-driven heartbeat: ping every tick, expect frames (pongs) within
/// the session-timeout watchdog window.
async fn echo_loop(
    state: &AgentState,
    send: &mut quinn::SendStream,
    reader: &mut FrameReader,
    cancel: &CancellationToken,
) -> Result<()> {
    let session_timeout = state.config.session_timeout;

    let mut ticker = tokio::time::interval(state.config.tick_interval);
    let mut seq_id: u64 = 0;

    let watchdog = tokio::time::sleep(session_timeout);
    tokio::pin!(watchdog);

    loop {
        tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            () = &mut watchdog => return Err(Error::ConnectionTimeout),
            _ = ticker.tick() => {
                seq_id += 1;
                let ping = MessagePayload::echo(EchoPayload {
                    direction: EchoDirection::Ping,
                    correlation_id: Uuid::new_v4().to_string(),
                    server_timestamp: 0,
                    timestamp: unix_millis(),
                    seq_id,
                });
                session::write_frame(send, &ping).await?;
            }
            frame = reader.next_frame::<MessagePayload>() => {
                let Some(payload) = frame? else {
                    return Err(Error::ConnectionClosed);
                };
                watchdog.as_mut().reset(tokio::time::Instant::now() + session_timeout);

                if let Some(echo) = payload.echo {
                    if echo.direction == EchoDirection::Pong {
                        let (rtt, one_trip, back_trip) = echo.delays(unix_millis());
                        debug!(
                            seq = echo.seq_id,
                            rtt_ms = rtt,
                            one_trip_ms = one_trip,
                            back_trip_ms = back_trip,
                            "heartbeat pong"
                        );
                    }
                }
            }
        }
    }
}

/// Accept dispatch streams and answer each with an event stream.
async fn serve_dispatch(
    connection: quinn::Connection,
    state: AgentState,
    cancel: CancellationToken,
) {
    loop {
        let (send, recv) = tokio::select! {
            () = cancel.cancelled() => return,
            accepted = connection.accept_bi() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    debug!("dispatch accept ended: {e}");
                    return;
                }
            },
        };

        let state = state.clone();
        let stream_cancel = cancel.child_token();
        tokio::spawn(async move {
            if let Err(e) = handle_dispatch_stream(send, recv, &state, stream_cancel).await {
                warn!("dispatch stream failed: {e}");
            }
        });
    }
}

async fn handle_dispatch_stream(
    mut send: quinn::SendStream,
    recv: quinn::RecvStream,
    state: &AgentState,
    cancel: CancellationToken,
) -> Result<()> {
    let mut reader = FrameReader::new(recv);
    let Some(request) = reader.next_frame::<ProbeRequest>().await? else {
        return Ok(());
    };

    let labels = probe_labels(state, &request, "hub");
    let started = Instant::now();

    let mut events: mpsc::Receiver<PingEvent> = match state.build_pinger(request) {
        Ok(pinger) => pinger.ping(cancel.clone()),
        Err(e) => {
            let metadata = HashMap::new();
            let event = PingEvent::error(e.to_string(), &metadata);
            session::write_frame(&mut send, &event).await?;
            let _ = send.finish();
            return Ok(());
        }
    };

    while let Some(event) = events.recv().await {
        if let Some(PingData::Icmp(reply)) = &event.data {
            state
                .counters
                .bytes_received_total
                .with_label_values(&[&labels[0], &labels[1], &labels[2]])
                .inc_by(reply.size as u64);
        }
        session::write_frame(&mut send, &event).await?;
    }

    let label_refs: Vec<&str> = labels.iter().map(String::as_str).collect();
    state
        .counters
        .requests_served_total
        .with_label_values(&label_refs)
        .inc();
    state
        .counters
        .served_duration_ms_total
        .with_label_values(&label_refs)
        .inc_by(started.elapsed().as_millis() as u64);

    let _ = send.finish();
    Ok(())
}
