//! DNS probing against a caller-specified server.
//!
//! Unlike ordinary resolution, the probe dials the *target server* directly
//! (UDP or TCP) instead of whatever the host resolver is configured with,
//! and classifies failures into the flags consumers branch on: I/O timeout,
//! no-such-host, or other.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use hickory_resolver::config::{NameServerConfig, Protocol, ResolverConfig, ResolverOpts};
use hickory_resolver::error::ResolveErrorKind;
use hickory_resolver::proto::rr::{Name, RecordType};
use hickory_resolver::TokioAsyncResolver;
use serde::{Deserialize, Serialize};

use crate::error::{ProbeError, Result};
use crate::probe::icmp::unix_millis;

/// Transport used to reach the DNS server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DnsTransport {
    Udp,
    Tcp,
}

/// Query type issued by the probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DnsQueryType {
    A,
    Aaaa,
    Cname,
}

impl DnsQueryType {
    fn record_type(self) -> RecordType {
        match self {
            DnsQueryType::A => RecordType::A,
            DnsQueryType::Aaaa => RecordType::AAAA,
            DnsQueryType::Cname => RecordType::CNAME,
        }
    }
}

/// One DNS probe request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DnsLookupRequest {
    /// Server to probe, `ip:port`.
    pub addr_port: String,
    /// Name to query.
    pub target: String,
    pub timeout_ms: u64,
    pub transport: DnsTransport,
    pub query_type: DnsQueryType,
}

/// Probe outcome. Classified errors land here as flags with the raw error
/// text preserved; only malformed requests fail the call itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DnsQueryResult {
    pub server: String,
    pub target: String,
    pub query_type: DnsQueryType,
    /// Answers rendered per query type: addresses for A/AAAA, the
    /// canonical name for CNAME.
    pub answers: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub io_timeout: bool,
    pub no_such_host: bool,
    pub elapsed_ms: u64,
    pub started_at_ms: u64,
    pub timeout_specified_ms: u64,
}

/// Run one probe. `Err` is reserved for unusable requests (bad server
/// address); lookup failures come back classified in the result.
pub async fn lookup_dns(request: &DnsLookupRequest) -> Result<DnsQueryResult> {
    let server: SocketAddr = request
        .addr_port
        .parse()
        .map_err(|_| ProbeError::InvalidRequest(format!("bad addrPort {:?}", request.addr_port)))?;

    let protocol = match request.transport {
        DnsTransport::Udp => Protocol::Udp,
        DnsTransport::Tcp => Protocol::Tcp,
    };

    let mut config = ResolverConfig::new();
    config.add_name_server(NameServerConfig::new(server, protocol));

    let timeout = Duration::from_millis(request.timeout_ms);
    let mut opts = ResolverOpts::default();
    opts.timeout = timeout;
    opts.attempts = 1;
    // Probe exactly what was asked; never chase search domains.
    opts.ndots = 0;

    let resolver = TokioAsyncResolver::tokio(config, opts);

    let mut result = DnsQueryResult {
        server: request.addr_port.clone(),
        target: request.target.clone(),
        query_type: request.query_type,
        answers: Vec::new(),
        error: None,
        io_timeout: false,
        no_such_host: false,
        elapsed_ms: 0,
        started_at_ms: unix_millis(),
        timeout_specified_ms: request.timeout_ms,
    };

    let started = std::time::Instant::now();
    let lookup = resolver
        .lookup(
            Name::from_str(&request.target).map_err(|e| {
                ProbeError::InvalidRequest(format!("bad target {:?}: {e}", request.target))
            })?,
            request.query_type.record_type(),
        )
        .await;
    result.elapsed_ms = started.elapsed().as_millis() as u64;

    match lookup {
        Ok(answers) => {
            for record in answers.record_iter() {
                if let Some(data) = record.data() {
                    result.answers.push(data.to_string());
                }
            }
        }
        Err(e) => {
            classify_error(&e.kind().to_string(), e.kind(), &mut result);
            result.error = Some(e.to_string());
        }
    }

    Ok(result)
}

fn classify_error(rendered: &str, kind: &ResolveErrorKind, result: &mut DnsQueryResult) {
    match kind {
        ResolveErrorKind::NoRecordsFound { .. } => {
            result.no_such_host = true;
        }
        ResolveErrorKind::Timeout => {
            result.io_timeout = true;
        }
        ResolveErrorKind::Io(_) | ResolveErrorKind::Proto(_) => {
            // Protocol stacks sometimes wrap deadline errors; recover the
            // timeout classification from the rendering.
            if rendered.contains("timed out") || rendered.contains("deadline") {
                result.io_timeout = true;
            }
        }
        _ => {}
    }
}
