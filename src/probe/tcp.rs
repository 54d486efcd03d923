//! TCP SYN pinger: raw-IP SYN send, SYN|ACK/RST capture, RST teardown.
//!
//! A kernel TCP listener is opened on an ephemeral port purely to *reserve*
//! the port number; it is held for the lifetime of the receipt so the
//! kernel cannot hand the port to anyone else while the probe is in flight.
//! The raw socket itself is owned by a single task; SYN and RST sends are
//! serialised into it over the command channel.

use std::net::{IpAddr, TcpListener};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::{Error, Result};
use crate::packet::tcp::{build_segment, parse_segment, TcpInfo};
use crate::packet::{self};
use crate::probe::raw::RawSocket;
use crate::probe::tracker::{build_endpoint_key, Tracker};
use crate::types::{IpVersion, L4Proto};
use crate::util::{maximum_mtu, source_ip_for};
use crate::DEFAULT_TTL;

/// Initial sequence number on probe SYNs and teardown RSTs.
pub const PROBE_SEQ: u32 = 1000;

/// A TCP SYN ping request.
#[derive(Debug, Clone)]
pub struct TcpSynRequest {
    pub dst: IpAddr,
    pub dst_port: u16,
    pub timeout: Duration,
    pub ttl: Option<u8>,
}

/// A captured reply segment with its addressing.
#[derive(Debug, Clone)]
pub struct TcpPacketInfo {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub tcp: TcpInfo,
}

/// Per-request state carried through the tracker.
#[derive(Debug)]
pub struct TcpSynReceipt {
    pub src_ip: IpAddr,
    pub src_port: u16,
    pub dst_ip: IpAddr,
    pub dst_port: u16,
    pub sent_at: Instant,
    pub received_at: Option<Instant>,
    pub rtt: Option<Duration>,
    pub received: Option<TcpPacketInfo>,
}

/// Reply filter ahead of the tracker: anything not matching is dropped
/// before it can pollute the key space (adjacent ephemeral-port traffic,
/// unrelated flows on the same host).
#[derive(Debug, Clone, Copy, Default)]
pub struct FilterRequirements {
    pub syn: Option<bool>,
    pub ack: Option<bool>,
    /// Reply source port must equal the request's destination port.
    pub src_port: Option<u16>,
}

impl FilterRequirements {
    /// The filter used by a SYN ping against one destination port: replies
    /// must be SYN|ACK (or RST|ACK) from that port.
    pub fn syn_ack_from(port: u16) -> Self {
        Self {
            syn: None,
            ack: Some(true),
            src_port: Some(port),
        }
    }

    fn matches(&self, tcp: &TcpInfo) -> bool {
        if let Some(required) = self.syn {
            if tcp.syn != required {
                return false;
            }
        }
        if let Some(required) = self.ack {
            if tcp.ack != required {
                return false;
            }
        }
        if let Some(required) = self.src_port {
            if tcp.src_port != required {
                return false;
            }
        }
        true
    }
}

/// Tracker specialisation for the TCP path: keys are packed big-endian
/// `src_ip ‖ src_port ‖ dst_ip ‖ dst_port`.
pub type TcpTracker = Tracker<Vec<u8>, TcpSynReceipt>;

/// Addressing assigned to a sent SYN.
#[derive(Debug, Clone)]
pub struct TcpSynSent {
    pub src_ip: IpAddr,
    pub src_port: u16,
    pub key: Vec<u8>,
}

enum SenderCmd {
    SendSyn {
        request: TcpSynRequest,
        reply: oneshot::Sender<Result<TcpSynSent>>,
    },
    SendRst {
        pkt: TcpPacketInfo,
        ttl: u8,
    },
}

/// Handle to the raw-socket owner task.
#[derive(Clone)]
pub struct TcpSynSender {
    cmd_tx: mpsc::Sender<SenderCmd>,
}

impl TcpSynSender {
    /// Spawn the sender for the destination's address family.
    pub fn spawn(
        family: IpVersion,
        tracker: TcpTracker,
        filter: FilterRequirements,
        cancel: CancellationToken,
    ) -> Result<Self> {
        // v4 builds its own IP header (TTL, DF); v6 lets the kernel build
        // it and steers the hop limit through the socket option.
        let socket = RawSocket::open(family, L4Proto::Tcp, true)?;

        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        tokio::spawn(owner_loop(socket, family, tracker, filter, cmd_rx, cancel));

        Ok(Self { cmd_tx })
    }

    /// Send one SYN and register it with the tracker. The reply or timeout
    /// surfaces on the tracker's event stream.
    pub async fn send_syn(&self, request: TcpSynRequest) -> Result<TcpSynSent> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(SenderCmd::SendSyn {
                request,
                reply: reply_tx,
            })
            .await
            .map_err(|_| Error::Internal("TCP SYN sender is closed".into()))?;
        reply_rx
            .await
            .map_err(|_| Error::Internal("TCP SYN sender dropped a reply".into()))?
    }

    /// Tear down the half-open connection behind a captured SYN|ACK.
    /// Best-effort: failures are logged by the owner, never surfaced.
    pub async fn send_rst(&self, pkt: TcpPacketInfo, ttl: u8) {
        let _ = self.cmd_tx.send(SenderCmd::SendRst { pkt, ttl }).await;
    }
}

async fn owner_loop(
    socket: RawSocket,
    family: IpVersion,
    tracker: TcpTracker,
    filter: FilterRequirements,
    mut cmd_rx: mpsc::Receiver<SenderCmd>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; maximum_mtu()];

    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(SenderCmd::SendSyn { request, reply }) => {
                        let result = send_syn(&socket, family, &tracker, request).await;
                        let _ = reply.send(result);
                    }
                    Some(SenderCmd::SendRst { pkt, ttl }) => {
                        if let Err(e) = send_rst(&socket, family, &pkt, ttl).await {
                            warn!("failed to send teardown RST: {e}");
                        }
                    }
                    None => return,
                }
            }
            received = socket.recv_from(&mut buf) => {
                match received {
                    Ok((n, peer)) => {
                        handle_received(family, &tracker, &filter, &buf[..n], peer).await;
                    }
                    Err(e) => {
                        error!("TCP receive loop failed: {e}");
                        return;
                    }
                }
            }
        }
    }
}

async fn send_syn(
    socket: &RawSocket,
    family: IpVersion,
    tracker: &TcpTracker,
    request: TcpSynRequest,
) -> Result<TcpSynSent> {
    let src_ip = source_ip_for(request.dst)?;
    let ttl = request.ttl.unwrap_or(DEFAULT_TTL);

    // Reserve a local port with a kernel listener; held for the receipt's
    // lifetime so the port cannot be reused underneath the probe.
    let listener = TcpListener::bind(match family {
        IpVersion::V4 => "0.0.0.0:0",
        IpVersion::V6 => "[::]:0",
    })?;
    let src_port = listener.local_addr()?.port();

    let segment = build_segment(
        src_ip,
        src_port,
        request.dst,
        request.dst_port,
        PROBE_SEQ,
        0,
        true,
        false,
    )?;

    let key = build_endpoint_key(src_ip, src_port, request.dst, request.dst_port);
    let receipt = TcpSynReceipt {
        src_ip,
        src_port,
        dst_ip: request.dst,
        dst_port: request.dst_port,
        sent_at: Instant::now(),
        received_at: None,
        rtt: None,
        received: None,
    };
    tracker
        .mark_sent(key.clone(), receipt, request.timeout)
        .await?;

    match family {
        IpVersion::V4 => {
            let (IpAddr::V4(src4), IpAddr::V4(dst4)) = (src_ip, request.dst) else {
                return Err(Error::InvalidAddress(request.dst.to_string()));
            };
            let header = packet::build_ipv4_header(
                src4,
                dst4,
                L4Proto::Tcp.protocol_number(),
                ttl,
                segment.len(),
                true,
            );
            let mut wire = Vec::with_capacity(header.len() + segment.len());
            wire.extend_from_slice(&header);
            wire.extend_from_slice(&segment);
            socket.send_to(&wire, request.dst).await?;
        }
        IpVersion::V6 => {
            socket.set_hop_limit(ttl)?;
            socket.send_to(&segment, request.dst).await?;
        }
    }

    // Hold the port reservation until the request resolves one way or the
    // other.
    let hold = request.timeout + Duration::from_millis(100);
    tokio::spawn(async move {
        tokio::time::sleep(hold).await;
        drop(listener);
    });

    Ok(TcpSynSent {
        src_ip,
        src_port,
        key,
    })
}

async fn send_rst(
    socket: &RawSocket,
    family: IpVersion,
    pkt: &TcpPacketInfo,
    ttl: u8,
) -> Result<()> {
    // Addressed back to the peer: our endpoint is the reply's destination.
    let segment = build_segment(
        pkt.dst,
        pkt.tcp.dst_port,
        pkt.src,
        pkt.tcp.src_port,
        PROBE_SEQ,
        0,
        false,
        true,
    )?;

    match family {
        IpVersion::V4 => {
            let (IpAddr::V4(src4), IpAddr::V4(dst4)) = (pkt.dst, pkt.src) else {
                return Err(Error::InvalidAddress(pkt.src.to_string()));
            };
            let header = packet::build_ipv4_header(
                src4,
                dst4,
                L4Proto::Tcp.protocol_number(),
                ttl,
                segment.len(),
                true,
            );
            let mut wire = Vec::with_capacity(header.len() + segment.len());
            wire.extend_from_slice(&header);
            wire.extend_from_slice(&segment);
            socket.send_to(&wire, pkt.src).await?;
        }
        IpVersion::V6 => {
            socket.set_hop_limit(ttl)?;
            socket.send_to(&segment, pkt.src).await?;
        }
    }

    Ok(())
}

async fn handle_received(
    family: IpVersion,
    tracker: &TcpTracker,
    filter: &FilterRequirements,
    datagram: &[u8],
    peer: Option<IpAddr>,
) {
    let pkt = match family {
        IpVersion::V4 => {
            let ip = match packet::parse_ipv4_header(datagram) {
                Ok(ip) => ip,
                Err(e) => {
                    debug!("skipping unparseable packet: {e}");
                    return;
                }
            };
            if ip.protocol != L4Proto::Tcp.protocol_number() {
                return;
            }
            let tcp = match parse_segment(&datagram[ip.header_len..]) {
                Ok(tcp) => tcp,
                Err(e) => {
                    debug!("skipping unparseable TCP segment: {e}");
                    return;
                }
            };
            TcpPacketInfo {
                src: IpAddr::V4(ip.src),
                dst: IpAddr::V4(ip.dst),
                tcp,
            }
        }
        IpVersion::V6 => {
            // v6 raw sockets deliver the bare segment. The local address is
            // re-derived from the same route lookup the send used, keeping
            // the key construction symmetric.
            let Some(src) = peer else { return };
            let tcp = match parse_segment(datagram) {
                Ok(tcp) => tcp,
                Err(e) => {
                    debug!("skipping unparseable TCP segment: {e}");
                    return;
                }
            };
            let Ok(dst) = source_ip_for(src) else { return };
            TcpPacketInfo { src, dst, tcp }
        }
    };

    if !filter.matches(&pkt.tcp) {
        return;
    }

    // The reply's src/dst are the sent dst/src: reverse before lookup.
    let key = build_endpoint_key(pkt.dst, pkt.tcp.dst_port, pkt.src, pkt.tcp.src_port);
    let received_at = Instant::now();
    let _ = tracker
        .mark_received(key, move |receipt| {
            receipt.received_at = Some(received_at);
            receipt.rtt = Some(received_at.duration_since(receipt.sent_at));
            receipt.received = Some(pkt);
        })
        .await;
}
