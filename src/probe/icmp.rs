//! ICMPv4/v6 transceivers.
//!
//! A transceiver owns one raw ICMP socket, a fixed 16-bit identifier drawn
//! at construction, an outgoing-request channel, and an internal tracker
//! keyed by `(ip_proto, id, seq)`. The receive loop is the sole owner of
//! the socket; send requests are serialised into it over the channel.
//!
//! Echo mode sends ICMP echo requests. UDP mode sends UDP probes that pack
//! the identifier into the source port and `base_dst_port + seq` into the
//! destination port, so ICMP errors quoting the probe can be correlated.

use std::net::IpAddr;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::Result;
use crate::ipinfo::ExactLocation;
use crate::packet::icmp::{
    build_echo_request_v4, build_echo_request_v6, parse_reply_v4, parse_reply_v6,
};
use crate::packet::{self, udp};
use crate::probe::raw::RawSocket;
use crate::probe::tracker::{Tracker, TrackerConfig, TrackerEvent, TrackerEventKind};
use crate::types::{IpVersion, L4Proto};
use crate::util::{max_payload_len, maximum_mtu, source_ip_for};
use crate::{BASE_DST_PORT, Error};

/// An outbound probe request. Immutable once submitted.
#[derive(Debug, Clone)]
pub struct IcmpSendRequest {
    pub dst: IpAddr,
    /// Caller-assigned sequence, unique within one transceiver lifetime.
    pub seq: u16,
    pub ttl: u8,
    /// Padding; clamped to the per-version/per-protocol maximum.
    pub payload: Vec<u8>,
    /// Path-MTU hint shrinking the payload clamp further.
    pub pmtu_hint: Option<usize>,
}

/// What the transceiver sends on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeMode {
    /// ICMP echo requests.
    Echo,
    /// UDP probes with id/seq packed into the ports.
    UdpProbe { base_dst_port: u16 },
}

impl ProbeMode {
    fn sent_proto(self, version: IpVersion) -> L4Proto {
        match (self, version) {
            (ProbeMode::Echo, IpVersion::V4) => L4Proto::Icmp,
            (ProbeMode::Echo, IpVersion::V6) => L4Proto::Icmpv6,
            (ProbeMode::UdpProbe { .. }, _) => L4Proto::Udp,
        }
    }

    fn base_dst_port(self) -> u16 {
        match self {
            ProbeMode::Echo => BASE_DST_PORT,
            ProbeMode::UdpProbe { base_dst_port } => base_dst_port,
        }
    }
}

/// Transceiver configuration.
#[derive(Debug, Clone)]
pub struct IcmpTransceiverConfig {
    /// The 16-bit identifier carried by every probe.
    pub id: u16,
    /// Per-request timeout.
    pub timeout: Duration,
    pub mode: ProbeMode,
    /// Tracker event buffer; size ≥ timeout/interval × redundancy factor.
    pub event_buffer: usize,
}

impl IcmpTransceiverConfig {
    /// A config with a freshly drawn random identifier.
    pub fn with_random_id(timeout: Duration, mode: ProbeMode, event_buffer: usize) -> Self {
        Self {
            id: rand::random::<u16>(),
            timeout,
            mode,
            event_buffer,
        }
    }
}

/// A reply (or error message) correlated to a sent probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IcmpReceiveReply {
    pub id: u16,
    pub seq: u16,
    /// TTL of the reply packet. Zero when the family cannot report it
    /// without ancillary data (IPv6).
    pub ttl: u8,
    /// Reply size in bytes as read from the socket.
    pub size: usize,
    /// Source of the reply, rendered.
    pub peer: String,
    #[serde(skip)]
    pub peer_addr: Option<IpAddr>,
    /// True when the reply comes from the probed destination itself.
    pub last_hop: bool,
    /// 4 or 6.
    pub inet_family: u8,
    pub icmp_type: Option<u8>,
    pub icmp_code: Option<u8>,
    /// IANA protocol number of the packet that was *sent* (re-derived from
    /// the quoted packet when the reply is an error).
    pub ip_proto: u8,
    /// Present only on Packet Too Big / Fragmentation Needed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub set_mtu_to: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer_rdns: Option<Vec<String>>,
    /// Unix milliseconds.
    pub received_at: u64,

    // Filled by the IP metadata dispatcher, when one is configured.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer_asn: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer_location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer_isp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer_exact_location: Option<ExactLocation>,
}

/// Events surfaced on the public receive channel.
#[derive(Debug)]
pub enum IcmpProbeEvent {
    Reply(IcmpReceiveReply),
    Timeout { seq: u16 },
    Cancelled { seq: u16 },
}

type IcmpKey = (u8, u16, u16);

struct PendingProbe {
    sent_at: Instant,
    reply: Option<IcmpReceiveReply>,
}

/// Capability set shared by the v4 and v6 transceivers.
pub trait IcmpTransceiver: Send {
    /// Channel for submitting probe requests.
    fn sender(&self) -> mpsc::Sender<IcmpSendRequest>;
    /// Take the public event stream. Yields `None` after the first call.
    fn take_events(&mut self) -> Option<mpsc::Receiver<IcmpProbeEvent>>;
    /// The transceiver's fixed identifier.
    fn id(&self) -> u16;
}

/// Spawn the transceiver matching the destination's address family.
pub fn spawn_for(
    dst: IpAddr,
    config: IcmpTransceiverConfig,
    cancel: CancellationToken,
) -> Result<Box<dyn IcmpTransceiver>> {
    match dst {
        IpAddr::V4(_) => Ok(Box::new(Icmp4Transceiver::spawn(config, cancel)?)),
        IpAddr::V6(_) => Ok(Box::new(Icmp6Transceiver::spawn(config, cancel)?)),
    }
}

macro_rules! impl_transceiver {
    ($ty:ty) => {
        impl IcmpTransceiver for $ty {
            fn sender(&self) -> mpsc::Sender<IcmpSendRequest> {
                self.send_tx.clone()
            }

            fn take_events(&mut self) -> Option<mpsc::Receiver<IcmpProbeEvent>> {
                self.events.take()
            }

            fn id(&self) -> u16 {
                self.id
            }
        }
    };
}

/// IPv4 transceiver: one raw ICMP socket with `IP_HDRINCL`, so both echo
/// and UDP probes go out with a caller-built IP header carrying the TTL
/// and the DF bit.
pub struct Icmp4Transceiver {
    id: u16,
    send_tx: mpsc::Sender<IcmpSendRequest>,
    events: Option<mpsc::Receiver<IcmpProbeEvent>>,
}

impl_transceiver!(Icmp4Transceiver);

impl Icmp4Transceiver {
    pub fn spawn(config: IcmpTransceiverConfig, cancel: CancellationToken) -> Result<Self> {
        let socket = RawSocket::open(IpVersion::V4, L4Proto::Icmp, true)?;

        let (send_tx, send_rx) = mpsc::channel(16);
        let (tracker, tracker_events) = Tracker::<IcmpKey, PendingProbe>::spawn(
            TrackerConfig {
                event_buffer: config.event_buffer,
                initial_seq: 0,
            },
            cancel.clone(),
        );

        let events = spawn_event_forwarder(tracker_events, config.event_buffer);
        let id = config.id;

        tokio::spawn(owner_loop_v4(socket, config, tracker, send_rx, cancel));

        Ok(Self {
            id,
            send_tx,
            events: Some(events),
        })
    }
}

/// IPv6 transceiver: a raw ICMPv6 socket (kernel checksums echoes and
/// strips reply IP headers), plus a raw UDP socket when in UDP probe mode.
/// Hop limits are applied through the socket option right before each
/// serialized send.
pub struct Icmp6Transceiver {
    id: u16,
    send_tx: mpsc::Sender<IcmpSendRequest>,
    events: Option<mpsc::Receiver<IcmpProbeEvent>>,
}

impl_transceiver!(Icmp6Transceiver);

impl Icmp6Transceiver {
    pub fn spawn(config: IcmpTransceiverConfig, cancel: CancellationToken) -> Result<Self> {
        let socket = RawSocket::open(IpVersion::V6, L4Proto::Icmpv6, false)?;
        let udp_socket = match config.mode {
            ProbeMode::UdpProbe { .. } => {
                Some(RawSocket::open(IpVersion::V6, L4Proto::Udp, false)?)
            }
            ProbeMode::Echo => None,
        };

        let (send_tx, send_rx) = mpsc::channel(16);
        let (tracker, tracker_events) = Tracker::<IcmpKey, PendingProbe>::spawn(
            TrackerConfig {
                event_buffer: config.event_buffer,
                initial_seq: 0,
            },
            cancel.clone(),
        );

        let events = spawn_event_forwarder(tracker_events, config.event_buffer);
        let id = config.id;

        tokio::spawn(owner_loop_v6(
            socket, udp_socket, config, tracker, send_rx, cancel,
        ));

        Ok(Self {
            id,
            send_tx,
            events: Some(events),
        })
    }
}

/// Map internal tracker events onto the public event stream.
fn spawn_event_forwarder(
    mut tracker_events: mpsc::Receiver<TrackerEvent<IcmpKey, PendingProbe>>,
    buffer: usize,
) -> mpsc::Receiver<IcmpProbeEvent> {
    let (tx, rx) = mpsc::channel(buffer.max(1));

    tokio::spawn(async move {
        while let Some(event) = tracker_events.recv().await {
            let (_, _, seq) = event.key;
            let mapped = match event.kind {
                TrackerEventKind::Received => match event.value.reply {
                    Some(reply) => {
                        debug!(seq, rtt = ?event.value.sent_at.elapsed(), "reply correlated");
                        IcmpProbeEvent::Reply(reply)
                    }
                    None => continue,
                },
                TrackerEventKind::Timeout => IcmpProbeEvent::Timeout { seq },
                TrackerEventKind::Cancelled => IcmpProbeEvent::Cancelled { seq },
            };
            if tx.send(mapped).await.is_err() {
                return;
            }
        }
    });

    rx
}

async fn owner_loop_v4(
    socket: RawSocket,
    config: IcmpTransceiverConfig,
    tracker: Tracker<IcmpKey, PendingProbe>,
    mut send_rx: mpsc::Receiver<IcmpSendRequest>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; maximum_mtu()];

    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            request = send_rx.recv() => {
                let Some(request) = request else { return };
                if let Err(e) = send_v4(&socket, &config, &tracker, request).await {
                    if e.is_message_too_long() {
                        warn!("probe exceeds path MTU, dropped (retry with a smaller payload)");
                        continue;
                    }
                    error!("fatal send error on ICMPv4 socket: {e}");
                    return;
                }
            }
            received = socket.recv_from(&mut buf) => {
                match received {
                    Ok((n, peer)) => {
                        handle_received_v4(&config, &tracker, &buf[..n], peer).await;
                    }
                    Err(e) => {
                        error!("ICMPv4 receive loop failed: {e}");
                        return;
                    }
                }
            }
        }
    }
}

async fn send_v4(
    socket: &RawSocket,
    config: &IcmpTransceiverConfig,
    tracker: &Tracker<IcmpKey, PendingProbe>,
    mut request: IcmpSendRequest,
) -> Result<()> {
    let src = source_ip_for(request.dst)?;
    let (IpAddr::V4(src4), IpAddr::V4(dst4)) = (src, request.dst) else {
        warn!("skipping non-v4 destination {} on v4 transceiver", request.dst);
        return Ok(());
    };

    let sent_proto = config.mode.sent_proto(IpVersion::V4);
    let clamp = max_payload_len(IpVersion::V4, sent_proto, request.pmtu_hint);
    request.payload.truncate(clamp);

    let l4_bytes = match config.mode {
        ProbeMode::Echo => build_echo_request_v4(config.id, request.seq, &request.payload),
        ProbeMode::UdpProbe { base_dst_port } => udp::build_datagram(
            src,
            config.id,
            request.dst,
            base_dst_port.wrapping_add(request.seq),
            &request.payload,
        )?,
    };

    let header = packet::build_ipv4_header(
        src4,
        dst4,
        sent_proto.protocol_number(),
        request.ttl,
        l4_bytes.len(),
        true,
    );

    let mut wire = Vec::with_capacity(header.len() + l4_bytes.len());
    wire.extend_from_slice(&header);
    wire.extend_from_slice(&l4_bytes);

    let key = (sent_proto.protocol_number(), config.id, request.seq);
    let dst = request.dst;
    tracker
        .mark_sent(
            key,
            PendingProbe {
                sent_at: Instant::now(),
                reply: None,
            },
            config.timeout,
        )
        .await?;

    socket.send_to(&wire, dst).await?;
    Ok(())
}

async fn handle_received_v4(
    config: &IcmpTransceiverConfig,
    tracker: &Tracker<IcmpKey, PendingProbe>,
    datagram: &[u8],
    peer: Option<IpAddr>,
) {
    let ip = match packet::parse_ipv4_header(datagram) {
        Ok(ip) => ip,
        Err(e) => {
            debug!("skipping unparseable packet: {e}");
            return;
        }
    };
    if ip.protocol != L4Proto::Icmp.protocol_number() {
        return;
    }

    let ident = match parse_reply_v4(&datagram[ip.header_len..], config.mode.base_dst_port()) {
        Ok(ident) => ident,
        Err(e) => {
            debug!("skipping unparseable ICMPv4 reply: {e}");
            return;
        }
    };
    if ident.id != config.id {
        return;
    }

    let peer_addr = peer.or(Some(IpAddr::V4(ip.src)));
    let reply = build_reply(ident, peer_addr, ip.ttl, datagram.len(), IpVersion::V4);

    let key = (ident.ip_proto.protocol_number(), ident.id, ident.seq);
    let _ = tracker
        .mark_received(key, move |pending| pending.reply = Some(reply))
        .await;
}

async fn owner_loop_v6(
    socket: RawSocket,
    udp_socket: Option<RawSocket>,
    config: IcmpTransceiverConfig,
    tracker: Tracker<IcmpKey, PendingProbe>,
    mut send_rx: mpsc::Receiver<IcmpSendRequest>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; maximum_mtu()];

    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            request = send_rx.recv() => {
                let Some(request) = request else { return };
                if let Err(e) = send_v6(&socket, udp_socket.as_ref(), &config, &tracker, request).await {
                    if e.is_message_too_long() {
                        warn!("probe exceeds path MTU, dropped (retry with a smaller payload)");
                        continue;
                    }
                    error!("fatal send error on ICMPv6 socket: {e}");
                    return;
                }
            }
            received = socket.recv_from(&mut buf) => {
                match received {
                    Ok((n, peer)) => {
                        handle_received_v6(&config, &tracker, &buf[..n], peer).await;
                    }
                    Err(e) => {
                        error!("ICMPv6 receive loop failed: {e}");
                        return;
                    }
                }
            }
        }
    }
}

async fn send_v6(
    socket: &RawSocket,
    udp_socket: Option<&RawSocket>,
    config: &IcmpTransceiverConfig,
    tracker: &Tracker<IcmpKey, PendingProbe>,
    mut request: IcmpSendRequest,
) -> Result<()> {
    if !request.dst.is_ipv6() {
        warn!("skipping non-v6 destination {} on v6 transceiver", request.dst);
        return Ok(());
    }

    let sent_proto = config.mode.sent_proto(IpVersion::V6);
    let clamp = max_payload_len(IpVersion::V6, sent_proto, request.pmtu_hint);
    request.payload.truncate(clamp);

    let key = (sent_proto.protocol_number(), config.id, request.seq);
    let dst = request.dst;
    let ttl = request.ttl;

    match config.mode {
        ProbeMode::Echo => {
            let msg = build_echo_request_v6(config.id, request.seq, &request.payload);
            tracker
                .mark_sent(key, PendingProbe { sent_at: Instant::now(), reply: None }, config.timeout)
                .await?;
            socket.set_hop_limit(ttl)?;
            socket.send_to(&msg, dst).await?;
        }
        ProbeMode::UdpProbe { base_dst_port } => {
            let udp_socket = udp_socket
                .ok_or_else(|| Error::Internal("v6 transceiver missing UDP socket".into()))?;
            let src = source_ip_for(dst)?;
            let datagram = udp::build_datagram(
                src,
                config.id,
                dst,
                base_dst_port.wrapping_add(request.seq),
                &request.payload,
            )?;
            tracker
                .mark_sent(key, PendingProbe { sent_at: Instant::now(), reply: None }, config.timeout)
                .await?;
            udp_socket.set_hop_limit(ttl)?;
            udp_socket.send_to(&datagram, dst).await?;
        }
    }

    Ok(())
}

async fn handle_received_v6(
    config: &IcmpTransceiverConfig,
    tracker: &Tracker<IcmpKey, PendingProbe>,
    msg: &[u8],
    peer: Option<IpAddr>,
) {
    // The kernel strips the IPv6 header on ICMPv6 sockets.
    let ident = match parse_reply_v6(msg, config.mode.base_dst_port()) {
        Ok(ident) => ident,
        Err(e) => {
            debug!("skipping unparseable ICMPv6 message: {e}");
            return;
        }
    };
    if ident.id != config.id {
        return;
    }

    // Reply hop limit would need ancillary data; reported as zero.
    let reply = build_reply(ident, peer, 0, msg.len(), IpVersion::V6);

    let key = (ident.ip_proto.protocol_number(), ident.id, ident.seq);
    let _ = tracker
        .mark_received(key, move |pending| pending.reply = Some(reply))
        .await;
}

fn build_reply(
    ident: crate::packet::icmp::PacketIdentifier,
    peer: Option<IpAddr>,
    ttl: u8,
    size: usize,
    version: IpVersion,
) -> IcmpReceiveReply {
    IcmpReceiveReply {
        id: ident.id,
        seq: ident.seq,
        ttl,
        size,
        peer: peer.map(|p| p.to_string()).unwrap_or_default(),
        peer_addr: peer,
        last_hop: ident.last_hop,
        inet_family: version.family(),
        icmp_type: Some(ident.icmp_type),
        icmp_code: Some(ident.icmp_code),
        ip_proto: ident.ip_proto.protocol_number(),
        set_mtu_to: ident.pmtu,
        peer_rdns: None,
        received_at: unix_millis(),
        peer_asn: None,
        peer_location: None,
        peer_isp: None,
        peer_exact_location: None,
    }
}

pub(crate) fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Sizing rule for tracker event buffers: enough slots that a full timeout
/// window of in-flight probes cannot overflow the channel.
pub fn event_buffer_size(timeout: Duration, interval: Duration, redundancy: usize) -> usize {
    let per_window = timeout.as_secs_f64() / interval.as_secs_f64().max(1.0);
    (per_window.ceil() as usize).max(1) * redundancy.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_buffer_size() {
        assert_eq!(
            event_buffer_size(Duration::from_secs(3), Duration::from_secs(1), 2),
            6
        );
        // Sub-second intervals clamp to one second, as the original sizing
        // rule did.
        assert_eq!(
            event_buffer_size(Duration::from_secs(3), Duration::from_millis(100), 2),
            6
        );
        assert!(event_buffer_size(Duration::ZERO, Duration::from_secs(1), 0) >= 1);
    }

    #[test]
    fn test_mode_sent_proto() {
        assert_eq!(ProbeMode::Echo.sent_proto(IpVersion::V4), L4Proto::Icmp);
        assert_eq!(ProbeMode::Echo.sent_proto(IpVersion::V6), L4Proto::Icmpv6);
        assert_eq!(
            ProbeMode::UdpProbe { base_dst_port: 33433 }.sent_proto(IpVersion::V6),
            L4Proto::Udp
        );
    }

    #[test]
    fn test_reply_serialization_shape() {
        let reply = build_reply(
            crate::packet::icmp::PacketIdentifier {
                id: 9,
                seq: 2,
                ip_proto: L4Proto::Udp,
                last_hop: false,
                pmtu: Some(1400),
                icmp_type: 11,
                icmp_code: 0,
            },
            Some("192.0.2.1".parse().unwrap()),
            63,
            96,
            IpVersion::V4,
        );

        let json = serde_json::to_value(&reply).unwrap();
        assert_eq!(json["seq"], 2);
        assert_eq!(json["inet_family"], 4);
        assert_eq!(json["set_mtu_to"], 1400);
        assert_eq!(json["peer"], "192.0.2.1");
        // Unfilled metadata fields stay off the wire.
        assert!(json.get("peer_asn").is_none());
    }
}
