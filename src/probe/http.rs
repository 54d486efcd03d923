//! HTTP probing with transport-level event capture.
//!
//! The transport is a tagged choice of HTTP/1.1, HTTP/2 (ALPN `h2`) or
//! HTTP/3 (QUIC), built fresh for every probe so concurrent probes never
//! share connection state. Name resolution is injected and honours the
//! request's address-family preference; every step of the exchange (DNS,
//! dial, request line, headers, body chunks) is emitted as a timestamped
//! transport event wrapped with the probe's correlation id.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::{Buf, Bytes};
use http::header::{CONTENT_LENGTH, CONTENT_TYPE, HOST, TRANSFER_ENCODING, USER_AGENT};
use http::{Request, Uri, Version};
use http_body_util::{BodyExt, Empty};
use hyper_util::rt::{TokioExecutor, TokioIo};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{ProbeError, Result};
use crate::probe::icmp::unix_millis;
use crate::types::InetFamilyPreference;
use crate::util::ProbeResolver;

/// Per-probe wall-clock budget, covering dial through body completion.
const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Response header fields larger than this are skipped, not emitted.
const MAX_HEADER_FIELD_SIZE: usize = 4 * 1024;

/// Body chunk size; every chunk becomes one base64 event.
const BODY_CHUNK_SIZE: usize = 1024;

/// Transport selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum HttpProto {
    #[default]
    #[serde(rename = "http/1.1")]
    Http1,
    #[serde(rename = "http/2")]
    Http2,
    #[serde(rename = "http/3")]
    Http3,
}

/// Coarse category of a transport event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportEventType {
    Connection,
    DnsLookup,
    Request,
    RequestHeader,
    Response,
    ResponseHeader,
    Metadata,
}

/// Well-known event names. Header events use the header name itself.
pub mod event_name {
    pub const METHOD: &str = "method";
    pub const URL: &str = "url";
    pub const PROTO: &str = "proto";
    pub const REQUEST_LINE: &str = "request-line";
    pub const STATUS: &str = "status";
    pub const DIAL_STARTED: &str = "dial-started";
    pub const DIAL_COMPLETED: &str = "dial-completed";
    pub const DIAL_ERROR: &str = "dial-error";
    pub const DNS_LOOKUP_STARTED: &str = "dns-lookup-started";
    pub const DNS_LOOKUP_COMPLETED: &str = "dns-lookup-completed";
    pub const DNS_LOOKUP_ERROR: &str = "dns-lookup-error";
    pub const TRANSFER_ENCODING: &str = "transfer-encoding";
    pub const CONTENT_LENGTH: &str = "content-length";
    pub const CONTENT_TYPE: &str = "content-type";
    pub const REQUEST_HEADERS_START: &str = "request-headers-start";
    pub const REQUEST_HEADERS_END: &str = "request-headers-end";
    pub const RESPONSE_HEADERS_START: &str = "response-headers-start";
    pub const RESPONSE_HEADERS_END: &str = "response-headers-end";
    pub const SKIP_MALFORMED_RESPONSE_HEADER: &str = "skip-malformed-response-header";
    pub const RESPONSE_HEADER_FIELDS_TRUNCATED: &str = "response-header-fields-truncated";
    pub const BODY_START: &str = "body-start";
    pub const BODY_END: &str = "body-end";
    pub const BODY_BYTES_READ: &str = "body-bytes-read";
    pub const BODY_CHUNK_BASE64: &str = "body-chunk-base64";
    pub const BODY_READ_TRUNCATED: &str = "body-read-truncated";
}

/// One timestamped step of the exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportEvent {
    #[serde(rename = "type")]
    pub event_type: TransportEventType,
    pub name: String,
    pub value: String,
    /// Unix milliseconds.
    pub date: u64,
}

/// The carrier struct consumers demultiplex on: a transport event or an
/// error string, plus the probe's correlation id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpEvent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transport: Option<TransportEvent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub correlation_id: String,
}

/// An HTTP probe request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HttpProbeRequest {
    /// E.g. `https://www.google.com/robots.txt`.
    pub url: String,

    /// Extra request headers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra_headers: Option<HashMap<String, String>>,

    pub proto: Option<HttpProto>,

    /// Body read limit in bytes; unset means unlimited.
    pub size_limit: Option<u64>,

    /// Custom resolver, `ip:port`.
    pub resolver: Option<String>,

    pub inet_family_preference: Option<InetFamilyPreference>,

    /// Cap on emitted response header fields.
    pub num_headers_fields_limit: Option<usize>,

    /// Correlates this probe's events when probes run concurrently.
    pub correlation_id: String,
}

/// Event sink handed through the transport layers.
#[derive(Clone)]
pub struct EventLogger {
    tx: mpsc::Sender<TransportEvent>,
}

impl EventLogger {
    pub async fn log(&self, event_type: TransportEventType, name: &str, value: impl Into<String>) {
        let _ = self
            .tx
            .send(TransportEvent {
                event_type,
                name: name.to_string(),
                value: value.into(),
                date: unix_millis(),
            })
            .await;
    }
}

/// Run the probe, yielding the wrapped event stream. The stream ends when
/// the exchange completes, fails, or the context is cancelled.
pub fn do_probe(request: HttpProbeRequest, cancel: CancellationToken) -> mpsc::Receiver<HttpEvent> {
    let (out_tx, out_rx) = mpsc::channel(16);

    tokio::spawn(async move {
        let (event_tx, mut event_rx) = mpsc::channel::<TransportEvent>(16);
        let logger = EventLogger { tx: event_tx };

        let correlation_id = request.correlation_id.clone();
        let forward_tx = out_tx.clone();
        let forward_correlation = correlation_id.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                let wrapped = HttpEvent {
                    transport: Some(event),
                    error: None,
                    correlation_id: forward_correlation.clone(),
                };
                if forward_tx.send(wrapped).await.is_err() {
                    return;
                }
            }
        });

        let outcome = tokio::select! {
            () = cancel.cancelled() => Err(ProbeError::HttpTransport("cancelled".into()).into()),
            result = tokio::time::timeout(PROBE_TIMEOUT, run_probe(&request, &logger)) => {
                match result {
                    Ok(inner) => inner,
                    Err(_) => Err(ProbeError::HttpTransport("probe timed out".into()).into()),
                }
            }
        };

        // Close the event stream before reporting the terminal error, so
        // ordering on the output channel is deterministic.
        drop(logger);
        let _ = forwarder.await;

        if let Err(e) = outcome {
            let _ = out_tx
                .send(HttpEvent {
                    transport: None,
                    error: Some(e.to_string()),
                    correlation_id,
                })
                .await;
        }
    });

    out_rx
}

async fn run_probe(request: &HttpProbeRequest, logger: &EventLogger) -> Result<()> {
    let uri: Uri = request
        .url
        .parse()
        .map_err(|e| ProbeError::InvalidRequest(format!("bad url {:?}: {e}", request.url)))?;

    let scheme = uri.scheme_str().unwrap_or("http").to_string();
    let host = uri
        .host()
        .ok_or_else(|| ProbeError::InvalidRequest("url has no host".into()))?
        .to_string();
    let port = uri
        .port_u16()
        .unwrap_or(if scheme == "https" { 443 } else { 80 });

    let proto = request.proto.unwrap_or_default();
    let pref = request.inet_family_preference.unwrap_or_default();

    let resolver = ProbeResolver::new(request.resolver.as_deref(), Duration::from_secs(10))?;
    let ip = resolve_host(logger, &resolver, &host, port, pref).await?;
    let addr = SocketAddr::new(ip, port);

    match proto {
        HttpProto::Http1 | HttpProto::Http2 => {
            run_tcp_probe(request, logger, &uri, &scheme, &host, addr, proto).await
        }
        HttpProto::Http3 => run_h3_probe(request, logger, &uri, &scheme, &host, addr).await,
    }
}

async fn resolve_host(
    logger: &EventLogger,
    resolver: &ProbeResolver,
    host: &str,
    port: u16,
    pref: InetFamilyPreference,
) -> Result<IpAddr> {
    logger
        .log(
            TransportEventType::DnsLookup,
            event_name::DNS_LOOKUP_STARTED,
            format!("addr={host}:{port},pref={pref}"),
        )
        .await;

    let ips = match resolver.lookup(host, pref).await {
        Ok(ips) => ips,
        Err(e) => {
            logger
                .log(
                    TransportEventType::DnsLookup,
                    event_name::DNS_LOOKUP_ERROR,
                    e.to_string(),
                )
                .await;
            return Err(e);
        }
    };

    let rendered: Vec<String> = ips.iter().map(ToString::to_string).collect();
    let used = ips[0];
    logger
        .log(
            TransportEventType::DnsLookup,
            event_name::DNS_LOOKUP_COMPLETED,
            format!(
                "addr={host}:{port},ips={},usedIP={used}",
                rendered.join(" ")
            ),
        )
        .await;

    Ok(used)
}

fn tls_client_config(alpn: &[&[u8]]) -> rustls::ClientConfig {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let mut config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
    config
}

fn format_version(version: Version) -> &'static str {
    match version {
        Version::HTTP_10 => "HTTP/1.0",
        Version::HTTP_11 => "HTTP/1.1",
        Version::HTTP_2 => "HTTP/2.0",
        Version::HTTP_3 => "HTTP/3.0",
        _ => "HTTP/?",
    }
}

async fn run_tcp_probe(
    request: &HttpProbeRequest,
    logger: &EventLogger,
    uri: &Uri,
    scheme: &str,
    host: &str,
    addr: SocketAddr,
    proto: HttpProto,
) -> Result<()> {
    if proto == HttpProto::Http2 && scheme != "https" {
        return Err(ProbeError::InvalidRequest("http/2 probing requires https".into()).into());
    }

    logger
        .log(
            TransportEventType::Connection,
            event_name::DIAL_STARTED,
            format!("network=tcp,addr={addr}"),
        )
        .await;

    let stream = match TcpStream::connect(addr).await {
        Ok(stream) => stream,
        Err(e) => {
            logger
                .log(
                    TransportEventType::Connection,
                    event_name::DIAL_ERROR,
                    e.to_string(),
                )
                .await;
            return Err(ProbeError::HttpTransport(format!("dial {addr}: {e}")).into());
        }
    };
    let local = stream.local_addr().ok();
    logger
        .log(
            TransportEventType::Connection,
            event_name::DIAL_COMPLETED,
            format!(
                "network=tcp,remoteAddr={addr},localAddr={}",
                local.map(|a| a.to_string()).unwrap_or_default()
            ),
        )
        .await;

    // Build the request up front so its line and headers can be logged
    // before the exchange.
    let (outgoing, logged_version) = build_request(request, uri, host, proto)?;
    log_request(logger, &outgoing, uri, logged_version).await;

    let response = if scheme == "https" {
        let alpn: &[&[u8]] = match proto {
            HttpProto::Http1 => &[b"http/1.1"],
            _ => &[b"h2"],
        };
        let connector = TlsConnector::from(Arc::new(tls_client_config(alpn)));
        let server_name = rustls::pki_types::ServerName::try_from(host.to_string())
            .map_err(|e| ProbeError::HttpTransport(format!("bad TLS name {host}: {e}")))?;
        let tls = connector
            .connect(server_name, stream)
            .await
            .map_err(|e| ProbeError::HttpTransport(format!("TLS handshake: {e}")))?;

        exchange(outgoing, TokioIo::new(tls), proto).await?
    } else {
        exchange(outgoing, TokioIo::new(stream), proto).await?
    };

    log_response(request, logger, &response).await;
    read_body(request, logger, response.into_body()).await
}

/// Drive one request over an established connection; H1 and H2 differ only
/// in the handshake entry point.
async fn exchange<S>(
    request: Request<Empty<Bytes>>,
    io: S,
    proto: HttpProto,
) -> Result<http::Response<hyper::body::Incoming>>
where
    S: hyper::rt::Read + hyper::rt::Write + Send + Unpin + 'static,
{
    match proto {
        HttpProto::Http1 => {
            let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
                .await
                .map_err(|e| ProbeError::HttpTransport(format!("h1 handshake: {e}")))?;
            tokio::spawn(async move {
                if let Err(e) = conn.await {
                    debug!("h1 connection task ended: {e}");
                }
            });
            sender
                .send_request(request)
                .await
                .map_err(|e| ProbeError::HttpTransport(format!("h1 request: {e}")).into())
        }
        _ => {
            let (mut sender, conn) =
                hyper::client::conn::http2::handshake(TokioExecutor::new(), io)
                    .await
                    .map_err(|e| ProbeError::HttpTransport(format!("h2 handshake: {e}")))?;
            tokio::spawn(async move {
                if let Err(e) = conn.await {
                    debug!("h2 connection task ended: {e}");
                }
            });
            sender
                .send_request(request)
                .await
                .map_err(|e| ProbeError::HttpTransport(format!("h2 request: {e}")).into())
        }
    }
}

fn build_request(
    request: &HttpProbeRequest,
    uri: &Uri,
    host: &str,
    proto: HttpProto,
) -> Result<(Request<Empty<Bytes>>, Version)> {
    // HTTP/1.1 wants an origin-form target plus a Host header; HTTP/2 and
    // HTTP/3 derive :authority from an absolute URI.
    let (target, version) = match proto {
        HttpProto::Http1 => (
            uri.path_and_query()
                .map_or("/", http::uri::PathAndQuery::as_str)
                .to_string(),
            Version::HTTP_11,
        ),
        HttpProto::Http2 => (uri.to_string(), Version::HTTP_2),
        HttpProto::Http3 => (uri.to_string(), Version::HTTP_3),
    };

    let mut builder = Request::builder()
        .method("GET")
        .uri(target)
        .version(version)
        .header(USER_AGENT, concat!("globalping/", env!("CARGO_PKG_VERSION")));
    if proto == HttpProto::Http1 {
        builder = builder.header(HOST, host);
    }
    if let Some(extra) = &request.extra_headers {
        for (name, value) in extra {
            builder = builder.header(name.as_str(), value.as_str());
        }
    }

    let built = builder
        .body(Empty::new())
        .map_err(|e| ProbeError::InvalidRequest(format!("bad request: {e}")))?;
    Ok((built, version))
}

async fn log_request(
    logger: &EventLogger,
    outgoing: &Request<Empty<Bytes>>,
    uri: &Uri,
    version: Version,
) {
    let proto = format_version(version);
    logger
        .log(TransportEventType::Request, event_name::METHOD, "GET")
        .await;
    logger
        .log(TransportEventType::Request, event_name::URL, uri.to_string())
        .await;
    logger
        .log(TransportEventType::Request, event_name::PROTO, proto)
        .await;
    logger
        .log(
            TransportEventType::Request,
            event_name::REQUEST_LINE,
            format!(
                "GET {} {proto}",
                uri.path_and_query()
                    .map_or("/", http::uri::PathAndQuery::as_str)
            ),
        )
        .await;

    if !outgoing.headers().is_empty() {
        logger
            .log(
                TransportEventType::Metadata,
                event_name::REQUEST_HEADERS_START,
                "---- Start Request Headers ----",
            )
            .await;
        for (name, value) in outgoing.headers() {
            logger
                .log(
                    TransportEventType::RequestHeader,
                    name.as_str(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
                .await;
        }
        logger
            .log(
                TransportEventType::Metadata,
                event_name::REQUEST_HEADERS_END,
                "---- End Request Headers ----",
            )
            .await;
    }
}

async fn log_response<B>(
    request: &HttpProbeRequest,
    logger: &EventLogger,
    response: &http::Response<B>,
) {
    logger
        .log(
            TransportEventType::Response,
            event_name::PROTO,
            format_version(response.version()),
        )
        .await;
    logger
        .log(
            TransportEventType::Response,
            event_name::STATUS,
            response.status().to_string(),
        )
        .await;

    logger
        .log(
            TransportEventType::Metadata,
            event_name::RESPONSE_HEADERS_START,
            "---- Start Response Headers ----",
        )
        .await;

    let limit = request.num_headers_fields_limit;
    let mut emitted = 0usize;
    if limit != Some(0) {
        for (name, value) in response.headers() {
            let rendered = String::from_utf8_lossy(value.as_bytes()).into_owned();
            if name.as_str().len() + rendered.len() > MAX_HEADER_FIELD_SIZE {
                logger
                    .log(
                        TransportEventType::Metadata,
                        event_name::SKIP_MALFORMED_RESPONSE_HEADER,
                        format!("maxHeaderFieldSize={MAX_HEADER_FIELD_SIZE}"),
                    )
                    .await;
                continue;
            }
            logger
                .log(TransportEventType::ResponseHeader, name.as_str(), rendered)
                .await;
            emitted += 1;
            if let Some(limit) = limit {
                if emitted >= limit {
                    logger
                        .log(
                            TransportEventType::Metadata,
                            event_name::RESPONSE_HEADER_FIELDS_TRUNCATED,
                            format!("read={emitted},limit={limit}"),
                        )
                        .await;
                    break;
                }
            }
        }
    }

    logger
        .log(
            TransportEventType::Metadata,
            event_name::RESPONSE_HEADERS_END,
            "---- End Response Headers ----",
        )
        .await;

    let transfer_encoding = response
        .headers()
        .get(TRANSFER_ENCODING)
        .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
        .unwrap_or_default();
    logger
        .log(
            TransportEventType::Response,
            event_name::TRANSFER_ENCODING,
            transfer_encoding,
        )
        .await;

    let content_length = response
        .headers()
        .get(CONTENT_LENGTH)
        .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
        .unwrap_or_else(|| "-1".into());
    logger
        .log(
            TransportEventType::Response,
            event_name::CONTENT_LENGTH,
            content_length,
        )
        .await;

    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
        .unwrap_or_default();
    logger
        .log(
            TransportEventType::Response,
            event_name::CONTENT_TYPE,
            content_type,
        )
        .await;
}

async fn read_body(
    request: &HttpProbeRequest,
    logger: &EventLogger,
    mut body: hyper::body::Incoming,
) -> Result<()> {
    logger
        .log(
            TransportEventType::Metadata,
            event_name::BODY_START,
            "---- Start Response Body ----",
        )
        .await;

    let size_limit = request.size_limit;
    let mut bytes_read: u64 = 0;
    let mut truncated = false;

    'outer: while remaining_capacity(size_limit, bytes_read) > 0 {
        let Some(frame) = body.frame().await else {
            break;
        };
        let frame = match frame {
            Ok(frame) => frame,
            Err(_) => break,
        };
        let Some(data) = frame.data_ref() else {
            continue;
        };

        let mut offset = 0usize;
        while offset < data.len() {
            let capacity = remaining_capacity(size_limit, bytes_read);
            if capacity == 0 {
                truncated = true;
                break 'outer;
            }
            let take = data.len().saturating_sub(offset).min(BODY_CHUNK_SIZE).min(capacity);
            let chunk = &data[offset..offset + take];
            offset += take;
            bytes_read += take as u64;

            logger
                .log(
                    TransportEventType::Response,
                    event_name::BODY_CHUNK_BASE64,
                    BASE64.encode(chunk),
                )
                .await;

            if let Some(limit) = size_limit {
                if bytes_read >= limit {
                    truncated = true;
                    break 'outer;
                }
            }
        }
    }

    if truncated {
        logger
            .log(
                TransportEventType::Response,
                event_name::BODY_READ_TRUNCATED,
                format!(
                    "read={bytes_read},limit={}",
                    size_limit.unwrap_or_default()
                ),
            )
            .await;
    }
    logger
        .log(
            TransportEventType::Response,
            event_name::BODY_END,
            "---- End Response Body ----",
        )
        .await;
    logger
        .log(
            TransportEventType::Response,
            event_name::BODY_BYTES_READ,
            bytes_read.to_string(),
        )
        .await;

    Ok(())
}

fn remaining_capacity(size_limit: Option<u64>, bytes_read: u64) -> usize {
    match size_limit {
        Some(limit) => usize::try_from(limit.saturating_sub(bytes_read)).unwrap_or(usize::MAX),
        None => usize::MAX,
    }
}

async fn run_h3_probe(
    request: &HttpProbeRequest,
    logger: &EventLogger,
    uri: &Uri,
    scheme: &str,
    host: &str,
    addr: SocketAddr,
) -> Result<()> {
    if scheme != "https" {
        return Err(ProbeError::InvalidRequest("http/3 probing requires https".into()).into());
    }

    logger
        .log(
            TransportEventType::Connection,
            event_name::DIAL_STARTED,
            format!("network=quic,addr={addr}"),
        )
        .await;

    let tls = tls_client_config(&[b"h3"]);
    let quic_tls = quinn::crypto::rustls::QuicClientConfig::try_from(tls)
        .map_err(|e| ProbeError::HttpTransport(format!("quic tls config: {e}")))?;
    let client_config = quinn::ClientConfig::new(Arc::new(quic_tls));

    let bind: SocketAddr = if addr.is_ipv6() {
        "[::]:0".parse().expect("valid literal")
    } else {
        "0.0.0.0:0".parse().expect("valid literal")
    };
    let mut endpoint = quinn::Endpoint::client(bind)
        .map_err(|e| ProbeError::HttpTransport(format!("quic endpoint: {e}")))?;
    endpoint.set_default_client_config(client_config);

    let connection = match endpoint
        .connect(addr, host)
        .map_err(|e| ProbeError::HttpTransport(format!("quic connect: {e}")))?
        .await
    {
        Ok(connection) => connection,
        Err(e) => {
            logger
                .log(
                    TransportEventType::Connection,
                    event_name::DIAL_ERROR,
                    e.to_string(),
                )
                .await;
            return Err(ProbeError::HttpTransport(format!("quic dial {addr}: {e}")).into());
        }
    };
    logger
        .log(
            TransportEventType::Connection,
            event_name::DIAL_COMPLETED,
            format!(
                "network=quic,remoteAddr={},localAddr={}",
                connection.remote_address(),
                endpoint
                    .local_addr()
                    .map(|a| a.to_string())
                    .unwrap_or_default()
            ),
        )
        .await;

    let h3_conn = h3_quinn::Connection::new(connection);
    let (mut driver, mut send_request) = h3::client::new(h3_conn)
        .await
        .map_err(|e| ProbeError::HttpTransport(format!("h3 handshake: {e}")))?;

    tokio::spawn(async move {
        let _ = futures::future::poll_fn(|cx| driver.poll_close(cx)).await;
    });

    let (outgoing, version) = build_request(request, uri, host, HttpProto::Http3)?;
    log_request(logger, &outgoing, uri, version).await;
    let (parts, _body) = outgoing.into_parts();

    let mut stream = send_request
        .send_request(Request::from_parts(parts, ()))
        .await
        .map_err(|e| ProbeError::HttpTransport(format!("h3 request: {e}")))?;
    stream
        .finish()
        .await
        .map_err(|e| ProbeError::HttpTransport(format!("h3 finish: {e}")))?;

    let response = stream
        .recv_response()
        .await
        .map_err(|e| ProbeError::HttpTransport(format!("h3 response: {e}")))?;
    log_response(request, logger, &response).await;

    // Body: same chunking rules as the TCP transports, reading QUIC frames.
    logger
        .log(
            TransportEventType::Metadata,
            event_name::BODY_START,
            "---- Start Response Body ----",
        )
        .await;

    let size_limit = request.size_limit;
    let mut bytes_read: u64 = 0;
    let mut truncated = false;

    'outer: while remaining_capacity(size_limit, bytes_read) > 0 {
        let chunk = match stream.recv_data().await {
            Ok(Some(mut chunk)) => chunk.copy_to_bytes(chunk.remaining()),
            Ok(None) => break,
            Err(_) => break,
        };

        let mut offset = 0usize;
        while offset < chunk.len() {
            let capacity = remaining_capacity(size_limit, bytes_read);
            if capacity == 0 {
                truncated = true;
                break 'outer;
            }
            let take = chunk.len().saturating_sub(offset).min(BODY_CHUNK_SIZE).min(capacity);
            logger
                .log(
                    TransportEventType::Response,
                    event_name::BODY_CHUNK_BASE64,
                    BASE64.encode(&chunk[offset..offset + take]),
                )
                .await;
            offset += take;
            bytes_read += take as u64;

            if let Some(limit) = size_limit {
                if bytes_read >= limit {
                    truncated = true;
                    break 'outer;
                }
            }
        }
    }

    if truncated {
        logger
            .log(
                TransportEventType::Response,
                event_name::BODY_READ_TRUNCATED,
                format!(
                    "read={bytes_read},limit={}",
                    size_limit.unwrap_or_default()
                ),
            )
            .await;
    }
    logger
        .log(
            TransportEventType::Response,
            event_name::BODY_END,
            "---- End Response Body ----",
        )
        .await;
    logger
        .log(
            TransportEventType::Response,
            event_name::BODY_BYTES_READ,
            bytes_read.to_string(),
        )
        .await;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proto_serde_uses_slash_names() {
        let proto: HttpProto = serde_json::from_str("\"http/2\"").unwrap();
        assert_eq!(proto, HttpProto::Http2);
        assert_eq!(
            serde_json::to_string(&HttpProto::Http3).unwrap(),
            "\"http/3\""
        );
    }

    #[test]
    fn test_request_parsing_defaults() {
        let json = r#"{"url":"https://example.com/","correlationId":"abc"}"#;
        let request: HttpProbeRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.proto, None);
        assert_eq!(request.size_limit, None);
        assert_eq!(request.correlation_id, "abc");
    }

    #[test]
    fn test_event_wrapper_serialization() {
        let event = HttpEvent {
            transport: Some(TransportEvent {
                event_type: TransportEventType::Response,
                name: event_name::STATUS.into(),
                value: "200 OK".into(),
                date: 1_700_000_000_000,
            }),
            error: None,
            correlation_id: "c1".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["correlationId"], "c1");
        assert_eq!(json["transport"]["type"], "response");
        assert!(json.get("error").is_none());
    }

    #[test]
    fn test_remaining_capacity() {
        assert_eq!(remaining_capacity(Some(10), 4), 6);
        assert_eq!(remaining_capacity(Some(4), 4), 0);
        assert_eq!(remaining_capacity(None, u64::MAX - 1), usize::MAX);
    }

    #[tokio::test]
    async fn test_zero_size_limit_emits_no_chunks() {
        // With sizeLimit=0 the body loop never runs: events are start, end,
        // bytes-read=0. Exercised through a canned local server.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            use tokio::io::{AsyncReadExt, AsyncWriteExt};
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await;
            let _ = stream
                .write_all(
                    b"HTTP/1.1 200 OK\r\ncontent-length: 5\r\ncontent-type: text/plain\r\n\r\nhello",
                )
                .await;
        });

        let request = HttpProbeRequest {
            url: format!("http://{addr}/"),
            size_limit: Some(0),
            correlation_id: "zero".into(),
            ..Default::default()
        };
        let mut events = do_probe(request, CancellationToken::new());

        let mut names = Vec::new();
        while let Some(event) = events.recv().await {
            assert!(event.error.is_none(), "unexpected error: {event:?}");
            names.push(event.transport.unwrap().name);
        }

        assert!(names.contains(&event_name::BODY_START.to_string()));
        assert!(names.contains(&event_name::BODY_END.to_string()));
        assert!(!names.iter().any(|n| n == event_name::BODY_CHUNK_BASE64));
        let idx_read = names
            .iter()
            .position(|n| n == event_name::BODY_BYTES_READ)
            .expect("bytes-read event");
        assert!(idx_read > names.iter().position(|n| n == event_name::BODY_END).unwrap());
    }
}
