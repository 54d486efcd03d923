//! Probe dispatchers with a uniform event-stream contract.
//!
//! Every pinger exposes `ping(cancel) -> receiver of PingEvent`. Fan-out
//! goes through the shared rate-limiter adapter: the limiter alone paces
//! admission, and concurrent probes never block each other — each admitted
//! request forwards its own events into the shared output, which closes
//! when every spawned task has finished.

use std::collections::HashMap;
use std::sync::Arc;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::Result;
use crate::ipinfo::AutoIpInfoDispatcher;
use crate::probe::dns::{lookup_dns, DnsLookupRequest, DnsQueryResult};
use crate::probe::http::{do_probe, HttpEvent, HttpProbeRequest};
use crate::probe::icmp::{
    event_buffer_size, spawn_for, IcmpProbeEvent, IcmpReceiveReply, IcmpSendRequest,
    IcmpTransceiverConfig, ProbeMode,
};
use crate::probe::tcp::{
    FilterRequirements, TcpSynReceipt, TcpSynRequest, TcpSynSender, TcpTracker,
};
use crate::probe::tracker::{TrackerConfig, TrackerEventKind};
use crate::probe::{L4PacketType, SimplePingRequest};
use crate::ratelimit::{throttled, RateLimiter};
use crate::types::IpVersion;
use crate::util::{select_dst_ip, ProbeResolver};
use crate::{BASE_DST_PORT, DEFAULT_TTL};

/// Event kind on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PingEventKind {
    Data,
    Error,
}

/// The closed payload sum carried by ping events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PingData {
    Icmp(IcmpReceiveReply),
    IcmpTimeout(IcmpTimeoutReport),
    Tcp(TcpPingReport),
    Dns(DnsQueryResult),
    Http(HttpEvent),
}

/// Terminal event for an ICMP/UDP probe that got no reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IcmpTimeoutReport {
    pub seq: u16,
    pub timeout: bool,
    /// Set instead of `timeout` when the parent context was cancelled.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub cancelled: bool,
}

/// One resolution of a TCP SYN probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TcpPingReport {
    /// `received`, `timeout`, or `cancelled`.
    pub event: String,
    pub seq: u64,
    pub src: String,
    pub src_port: u16,
    pub dst: String,
    pub dst_port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rtt_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_syn: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_ack: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_rst: Option<bool>,
}

impl TcpPingReport {
    fn from_receipt(kind: TrackerEventKind, seq: u64, receipt: &TcpSynReceipt) -> Self {
        let event = match kind {
            TrackerEventKind::Received => "received",
            TrackerEventKind::Timeout => "timeout",
            TrackerEventKind::Cancelled => "cancelled",
        };
        Self {
            event: event.to_string(),
            seq,
            src: receipt.src_ip.to_string(),
            src_port: receipt.src_port,
            dst: receipt.dst_ip.to_string(),
            dst_port: receipt.dst_port,
            rtt_ms: receipt.rtt.map(|d| d.as_secs_f64() * 1000.0),
            reply_syn: receipt.received.as_ref().map(|pkt| pkt.tcp.syn),
            reply_ack: receipt.received.as_ref().map(|pkt| pkt.tcp.ack),
            reply_rst: receipt.received.as_ref().map(|pkt| pkt.tcp.rst),
        }
    }
}

/// The uniform event wrapper streamed back to the hub.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingEvent {
    #[serde(rename = "type")]
    pub kind: PingEventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<PingData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

impl PingEvent {
    pub fn data(data: PingData, metadata: &HashMap<String, String>) -> Self {
        Self {
            kind: PingEventKind::Data,
            data: Some(data),
            err: None,
            metadata: metadata.clone(),
        }
    }

    pub fn error(err: impl Into<String>, metadata: &HashMap<String, String>) -> Self {
        Self {
            kind: PingEventKind::Error,
            data: None,
            err: Some(err.into()),
            metadata: metadata.clone(),
        }
    }
}

/// Uniform probe contract.
pub trait Pinger: Send + Sync {
    /// Start the probe; events arrive until the stream closes. Every
    /// dispatched probe yields at least one terminal event before close.
    fn ping(&self, cancel: CancellationToken) -> mpsc::Receiver<PingEvent>;
}

/// Shared plumbing injected into pingers.
#[derive(Clone)]
pub struct PingerContext {
    pub rate_limiter: Option<Arc<RateLimiter>>,
    pub respond_range: Arc<Vec<IpNet>>,
    pub resolver: Arc<ProbeResolver>,
    pub ipinfo: Option<Arc<AutoIpInfoDispatcher>>,
    /// Attached to every emitted event (`from` = node name, …).
    pub metadata: HashMap<String, String>,
}

// ---------------------------------------------------------------------------
// ICMP / UDP ("simple") pinger
// ---------------------------------------------------------------------------

/// ICMP echo ping and ICMP/UDP traceroute.
pub struct SimplePinger {
    pub request: SimplePingRequest,
    pub ctx: PingerContext,
}

impl Pinger for SimplePinger {
    fn ping(&self, cancel: CancellationToken) -> mpsc::Receiver<PingEvent> {
        let (out_tx, out_rx) = mpsc::channel(1);
        let request = self.request.clone();
        let ctx = self.ctx.clone();

        tokio::spawn(async move {
            if let Err(e) = run_simple(request, ctx.clone(), cancel, out_tx.clone()).await {
                let _ = out_tx.send(PingEvent::error(e.to_string(), &ctx.metadata)).await;
            }
        });

        out_rx
    }
}

async fn run_simple(
    request: SimplePingRequest,
    ctx: PingerContext,
    cancel: CancellationToken,
    out_tx: mpsc::Sender<PingEvent>,
) -> Result<()> {
    let dst = select_dst_ip(
        &ctx.resolver,
        &request.host(),
        request.family_preference(),
        &ctx.respond_range,
    )
    .await?;

    let timeout = request.pkt_timeout();
    let interval = request.interval();
    let total = request.total();
    let traceroute = request.l4_packet_type == Some(L4PacketType::Udp);

    let mode = if traceroute {
        ProbeMode::UdpProbe {
            base_dst_port: BASE_DST_PORT,
        }
    } else {
        ProbeMode::Echo
    };

    let probe_cancel = cancel.child_token();
    let config = IcmpTransceiverConfig::with_random_id(
        timeout,
        mode,
        event_buffer_size(timeout, interval, 2),
    );
    let mut transceiver = spawn_for(dst, config, probe_cancel.clone())?;
    let mut events = transceiver
        .take_events()
        .expect("fresh transceiver has its event stream");
    let send_tx = transceiver.sender();

    // Sender: one packet per sequence, paced by the interval and the
    // shared rate limiter. For traceroutes the TTL sweeps with the
    // sequence unless the request pins it.
    let limiter = ctx.rate_limiter.clone();
    let sender_cancel = probe_cancel.clone();
    let fixed_ttl = request.ttl;
    let mut sender = tokio::spawn(async move {
        let mut sent = 0u32;
        for i in 0..total {
            let seq = (i + 1) as u16;
            if let Some(ref limiter) = limiter {
                if limiter.admit("", &sender_cancel).await.is_err() {
                    break;
                }
            }

            let ttl = fixed_ttl.unwrap_or(if traceroute {
                seq.min(255) as u8
            } else {
                DEFAULT_TTL
            });
            let send = IcmpSendRequest {
                dst,
                seq,
                ttl,
                payload: vec![0u8; 56],
                pmtu_hint: None,
            };
            if send_tx.send(send).await.is_err() {
                break;
            }
            sent += 1;

            if i + 1 < total {
                tokio::select! {
                    () = sender_cancel.cancelled() => break,
                    () = tokio::time::sleep(interval) => {}
                }
            }
        }
        sent
    });

    // Event pump: one terminal event per sent packet.
    let mut resolved = 0u32;
    let mut sent_final: Option<u32> = None;

    loop {
        if let Some(sent) = sent_final {
            if resolved >= sent {
                break;
            }
        }

        tokio::select! {
            sent = &mut sender, if sent_final.is_none() => {
                sent_final = Some(sent.unwrap_or(0));
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                resolved += 1;
                let data = match event {
                    IcmpProbeEvent::Reply(mut reply) => {
                        enrich_reply(&ctx, &mut reply).await;
                        PingData::Icmp(reply)
                    }
                    IcmpProbeEvent::Timeout { seq } => PingData::IcmpTimeout(IcmpTimeoutReport {
                        seq,
                        timeout: true,
                        cancelled: false,
                    }),
                    IcmpProbeEvent::Cancelled { seq } => PingData::IcmpTimeout(IcmpTimeoutReport {
                        seq,
                        timeout: false,
                        cancelled: true,
                    }),
                };
                if out_tx.send(PingEvent::data(data, &ctx.metadata)).await.is_err() {
                    break;
                }
            }
        }
    }

    probe_cancel.cancel();
    Ok(())
}

async fn enrich_reply(ctx: &PingerContext, reply: &mut IcmpReceiveReply) {
    let (Some(dispatcher), Some(peer)) = (&ctx.ipinfo, reply.peer_addr) else {
        return;
    };
    match dispatcher.get_ip_info(peer).await {
        Ok(info) => {
            reply.peer_asn = info.asn;
            reply.peer_location = info.location;
            reply.peer_isp = info.isp;
            reply.peer_exact_location = info.exact_location;
        }
        Err(e) => debug!("ipinfo lookup for {peer} failed: {e}"),
    }
}

// ---------------------------------------------------------------------------
// TCP SYN pinger
// ---------------------------------------------------------------------------

/// TCP SYN ping against `host:port`.
pub struct TcpSynPinger {
    pub request: SimplePingRequest,
    pub ctx: PingerContext,
}

impl Pinger for TcpSynPinger {
    fn ping(&self, cancel: CancellationToken) -> mpsc::Receiver<PingEvent> {
        let (out_tx, out_rx) = mpsc::channel(1);
        let request = self.request.clone();
        let ctx = self.ctx.clone();

        tokio::spawn(async move {
            if let Err(e) = run_tcp_syn(request, ctx.clone(), cancel, out_tx.clone()).await {
                let _ = out_tx.send(PingEvent::error(e.to_string(), &ctx.metadata)).await;
            }
        });

        out_rx
    }
}

async fn run_tcp_syn(
    request: SimplePingRequest,
    ctx: PingerContext,
    cancel: CancellationToken,
    out_tx: mpsc::Sender<PingEvent>,
) -> Result<()> {
    let (host, dst_port) = request.host_port()?;
    let dst = select_dst_ip(
        &ctx.resolver,
        &host,
        request.family_preference(),
        &ctx.respond_range,
    )
    .await?;

    let timeout = request.pkt_timeout();
    let interval = request.interval();
    let total = request.total();

    let probe_cancel = cancel.child_token();
    let (tracker, mut events) = TcpTracker::spawn(
        TrackerConfig {
            event_buffer: event_buffer_size(timeout, interval, 2),
            initial_seq: 0,
        },
        probe_cancel.clone(),
    );
    let sender = TcpSynSender::spawn(
        IpVersion::of(dst),
        tracker.clone(),
        FilterRequirements::syn_ack_from(dst_port),
        probe_cancel.clone(),
    )?;

    let limiter = ctx.rate_limiter.clone();
    let send_cancel = probe_cancel.clone();
    let syn_sender = sender.clone();
    let ttl = request.ttl;
    let mut send_task = tokio::spawn(async move {
        let mut sent = 0u32;
        for i in 0..total {
            if let Some(ref limiter) = limiter {
                if limiter.admit("", &send_cancel).await.is_err() {
                    break;
                }
            }

            match syn_sender
                .send_syn(TcpSynRequest {
                    dst,
                    dst_port,
                    timeout,
                    ttl,
                })
                .await
            {
                Ok(_) => sent += 1,
                Err(e) => {
                    warn!("TCP SYN send failed: {e}");
                    break;
                }
            }

            if i + 1 < total {
                tokio::select! {
                    () = send_cancel.cancelled() => break,
                    () = tokio::time::sleep(interval) => {}
                }
            }
        }
        sent
    });

    let mut resolved = 0u32;
    let mut sent_final: Option<u32> = None;

    loop {
        if let Some(sent) = sent_final {
            if resolved >= sent {
                break;
            }
        }

        tokio::select! {
            sent = &mut send_task, if sent_final.is_none() => {
                sent_final = Some(sent.unwrap_or(0));
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                resolved += 1;

                // Tear down the half-open connection behind any reply.
                if event.kind == TrackerEventKind::Received {
                    if let Some(pkt) = event.value.received.clone() {
                        sender.send_rst(pkt, ttl.unwrap_or(DEFAULT_TTL)).await;
                    }
                }

                let report =
                    TcpPingReport::from_receipt(event.kind, event.seq, &event.value);
                if out_tx
                    .send(PingEvent::data(PingData::Tcp(report), &ctx.metadata))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        }
    }

    probe_cancel.cancel();
    Ok(())
}

// ---------------------------------------------------------------------------
// DNS pinger
// ---------------------------------------------------------------------------

/// Fan-out of DNS probes through the shared rate limiter.
pub struct DnsPinger {
    pub requests: Vec<DnsLookupRequest>,
    pub ctx: PingerContext,
}

impl Pinger for DnsPinger {
    fn ping(&self, cancel: CancellationToken) -> mpsc::Receiver<PingEvent> {
        let (out_tx, out_rx) = mpsc::channel(1);
        let requests = self.requests.clone();
        let ctx = self.ctx.clone();

        tokio::spawn(async move {
            let mut admitted = throttled(
                requests,
                ctx.rate_limiter.clone(),
                |_| String::new(),
                cancel.clone(),
            );

            let mut tasks = tokio::task::JoinSet::new();
            while let Some(request) = admitted.recv().await {
                let out_tx = out_tx.clone();
                let metadata = ctx.metadata.clone();
                tasks.spawn(async move {
                    let event = match lookup_dns(&request).await {
                        Ok(result) => PingEvent::data(PingData::Dns(result), &metadata),
                        Err(e) => PingEvent::error(e.to_string(), &metadata),
                    };
                    let _ = out_tx.send(event).await;
                });
            }
            // Output closes when the last task drops its sender clone.
            drop(out_tx);
            while tasks.join_next().await.is_some() {}
        });

        out_rx
    }
}

// ---------------------------------------------------------------------------
// HTTP pinger
// ---------------------------------------------------------------------------

/// Fan-out of HTTP probes. Each admitted probe runs in its own task so a
/// slow exchange never stalls its neighbours; consumers pair events with
/// requests via the correlation id.
pub struct HttpPinger {
    pub requests: Vec<HttpProbeRequest>,
    pub ctx: PingerContext,
}

impl Pinger for HttpPinger {
    fn ping(&self, cancel: CancellationToken) -> mpsc::Receiver<PingEvent> {
        let (out_tx, out_rx) = mpsc::channel(1);
        let requests = self.requests.clone();
        let ctx = self.ctx.clone();

        tokio::spawn(async move {
            let mut admitted = throttled(
                requests,
                ctx.rate_limiter.clone(),
                |_| String::new(),
                cancel.clone(),
            );

            let mut tasks = tokio::task::JoinSet::new();
            while let Some(request) = admitted.recv().await {
                let out_tx = out_tx.clone();
                let metadata = ctx.metadata.clone();
                let probe_cancel = cancel.child_token();
                tasks.spawn(async move {
                    let mut events = do_probe(request, probe_cancel);
                    while let Some(event) = events.recv().await {
                        let wrapped = PingEvent::data(PingData::Http(event), &metadata);
                        if out_tx.send(wrapped).await.is_err() {
                            return;
                        }
                    }
                });
            }
            drop(out_tx);
            while tasks.join_next().await.is_some() {}
        });

        out_rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ping_event_wire_shape() {
        let metadata = HashMap::from([("from".to_string(), "node-a".to_string())]);
        let event = PingEvent::data(
            PingData::IcmpTimeout(IcmpTimeoutReport {
                seq: 4,
                timeout: true,
                cancelled: false,
            }),
            &metadata,
        );

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "data");
        assert_eq!(json["data"]["seq"], 4);
        assert_eq!(json["data"]["timeout"], true);
        assert_eq!(json["metadata"]["from"], "node-a");
        assert!(json.get("err").is_none());
    }

    #[test]
    fn test_error_event_wire_shape() {
        let event = PingEvent::error("no route", &HashMap::new());
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["err"], "no route");
        assert!(json.get("data").is_none());
    }

    #[test]
    fn test_tcp_report_from_receipt() {
        let receipt = TcpSynReceipt {
            src_ip: "192.0.2.1".parse().unwrap(),
            src_port: 40000,
            dst_ip: "192.0.2.9".parse().unwrap(),
            dst_port: 22,
            sent_at: std::time::Instant::now(),
            received_at: None,
            rtt: Some(std::time::Duration::from_millis(12)),
            received: None,
        };
        let report = TcpPingReport::from_receipt(TrackerEventKind::Timeout, 3, &receipt);
        assert_eq!(report.event, "timeout");
        assert_eq!(report.seq, 3);
        assert_eq!(report.dst_port, 22);
        assert_eq!(report.rtt_ms, Some(12.0));
    }

    #[tokio::test]
    async fn test_dns_pinger_emits_one_event_per_request() {
        // Malformed server addresses resolve as error events, keeping the
        // one-terminal-event-per-request guarantee without network access.
        let requests = vec![
            DnsLookupRequest {
                addr_port: "bogus".into(),
                target: "example.com".into(),
                timeout_ms: 100,
                transport: crate::probe::dns::DnsTransport::Udp,
                query_type: crate::probe::dns::DnsQueryType::A,
            };
            3
        ];
        let pinger = DnsPinger {
            requests,
            ctx: PingerContext {
                rate_limiter: None,
                respond_range: Arc::new(vec![]),
                resolver: Arc::new(
                    ProbeResolver::new(Some("203.0.113.1:53"), std::time::Duration::from_millis(50))
                        .unwrap(),
                ),
                ipinfo: None,
                metadata: HashMap::new(),
            },
        };

        let mut events = pinger.ping(CancellationToken::new());
        let mut count = 0;
        while let Some(event) = events.recv().await {
            assert_eq!(event.kind, PingEventKind::Error);
            count += 1;
        }
        assert_eq!(count, 3);
    }
}
