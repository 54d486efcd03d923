//! Probe execution: request types, raw transceivers, trackers, and the
//! uniform event-stream dispatchers.

pub mod dns;
pub mod http;
pub mod icmp;
pub mod pinger;
pub mod raw;
pub mod tcp;
pub mod tracker;

use serde::{Deserialize, Serialize};

use crate::error::{ProbeError, Result};
use crate::types::InetFamilyPreference;

/// L4 flavor selected on simple ping requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum L4PacketType {
    Icmp,
    Udp,
    Tcp,
}

/// L7 flavor selected on simple ping requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum L7PacketType {
    Dns,
}

/// A ping task as posted by the hub (or a direct API caller).
///
/// The same shape serves ICMP/UDP ("simple") and TCP SYN tasks; DNS and
/// HTTP tasks carry their own request lists.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SimplePingRequest {
    /// Target, `host` or `host:port` (a port is required for TCP).
    pub destination: String,

    /// Node names the hub should run this task from.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub from: Vec<String>,

    /// Interval between packets, milliseconds.
    pub intv_ms: Option<u64>,

    /// Per-packet timeout, milliseconds.
    pub pkt_timeout_ms: Option<u64>,

    /// Number of packets to send.
    pub total_pkts: Option<u32>,

    pub prefer_v4: Option<bool>,
    pub prefer_v6: Option<bool>,

    /// Fixed TTL; unset means the default for pings and a 1..=total sweep
    /// for traceroutes.
    pub ttl: Option<u8>,

    pub l4_packet_type: Option<L4PacketType>,
    pub l7_packet_type: Option<L7PacketType>,

    /// DNS probe parameters, when `l7_packet_type` is `dns`.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub dns_targets: Vec<dns::DnsLookupRequest>,

    /// Named IP metadata provider to annotate replies with.
    pub ipinfo_provider: Option<String>,
}

impl SimplePingRequest {
    pub fn family_preference(&self) -> InetFamilyPreference {
        InetFamilyPreference::from_flags(self.prefer_v4, self.prefer_v6)
    }

    pub fn interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.intv_ms.unwrap_or(1000))
    }

    pub fn pkt_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.pkt_timeout_ms.unwrap_or(3000))
    }

    pub fn total(&self) -> u32 {
        self.total_pkts.unwrap_or(3).max(1)
    }

    /// Split `destination` into host and required port.
    pub fn host_port(&self) -> Result<(String, u16)> {
        split_host_port(&self.destination).ok_or_else(|| {
            ProbeError::InvalidRequest(format!(
                "destination {:?} is not host:port",
                self.destination
            ))
            .into()
        })
    }

    /// The host part of `destination`, tolerating a missing port.
    pub fn host(&self) -> String {
        split_host_port(&self.destination)
            .map_or_else(|| self.destination.clone(), |(host, _)| host)
    }
}

/// Split `host:port`, handling bracketed IPv6 literals. A bare IPv6
/// literal (no brackets, no port) passes through as a plain host.
pub fn split_host_port(s: &str) -> Option<(String, u16)> {
    if let Some(rest) = s.strip_prefix('[') {
        let (host, tail) = rest.split_once(']')?;
        let port = tail.strip_prefix(':')?.parse().ok()?;
        return Some((host.to_string(), port));
    }

    // More than one colon without brackets is an IPv6 literal, not a port.
    if s.matches(':').count() == 1 {
        let (host, port) = s.split_once(':')?;
        let port = port.parse().ok()?;
        return Some((host.to_string(), port));
    }

    None
}

/// A task frame dispatched from hub to agent over the session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ProbeRequest {
    /// ICMP echo ping or ICMP/UDP traceroute.
    Simple(SimplePingRequest),
    /// TCP SYN ping.
    Tcping(SimplePingRequest),
    /// DNS probe fan-out.
    Dnsprobe { targets: Vec<dns::DnsLookupRequest> },
    /// HTTP probe fan-out.
    Httpprobe { probes: Vec<http::HttpProbeRequest> },
}
