//! End-to-end probes over real raw sockets.
//!
//! These require CAP_NET_RAW (or root) and a loopback interface, so they
//! are ignored by default:
//!
//!     sudo -E cargo test --test raw_probe_e2e -- --ignored

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use globalping::probe::pinger::{
    PingData, PingEvent, Pinger, PingerContext, SimplePinger, TcpSynPinger,
};
use globalping::probe::{L4PacketType, SimplePingRequest};
use globalping::util::ProbeResolver;
use tokio_util::sync::CancellationToken;

fn context() -> PingerContext {
    PingerContext {
        rate_limiter: None,
        respond_range: Arc::new(vec![]),
        resolver: Arc::new(ProbeResolver::new(None, Duration::from_secs(5)).unwrap()),
        ipinfo: None,
        metadata: HashMap::new(),
    }
}

async fn collect(pinger: &dyn Pinger) -> Vec<PingEvent> {
    let cancel = CancellationToken::new();
    let mut events = pinger.ping(cancel);
    let mut collected = Vec::new();
    while let Some(event) = events.recv().await {
        collected.push(event);
    }
    collected
}

#[tokio::test]
#[ignore = "requires CAP_NET_RAW"]
async fn icmp_echo_to_loopback_is_last_hop() {
    let pinger = SimplePinger {
        request: SimplePingRequest {
            destination: "127.0.0.1".into(),
            total_pkts: Some(1),
            pkt_timeout_ms: Some(2000),
            ..Default::default()
        },
        ctx: context(),
    };

    let events = collect(&pinger).await;
    assert_eq!(events.len(), 1);
    match &events[0].data {
        Some(PingData::Icmp(reply)) => {
            assert!(reply.last_hop);
            assert_eq!(reply.seq, 1);
            assert_eq!(reply.peer, "127.0.0.1");
            assert_eq!(reply.icmp_type, Some(0));
            assert_eq!(reply.inet_family, 4);
        }
        other => panic!("expected an echo reply, got {other:?}"),
    }
}

#[tokio::test]
#[ignore = "requires CAP_NET_RAW and an open local TCP port"]
async fn tcp_ping_open_port_yields_syn_ack_and_no_leftover_entry() {
    // Bind a local listener to guarantee an open port.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let pinger = TcpSynPinger {
        request: SimplePingRequest {
            destination: format!("127.0.0.1:{port}"),
            total_pkts: Some(1),
            pkt_timeout_ms: Some(1000),
            l4_packet_type: Some(L4PacketType::Tcp),
            ..Default::default()
        },
        ctx: context(),
    };

    let events = collect(&pinger).await;
    assert_eq!(events.len(), 1);
    match &events[0].data {
        Some(PingData::Tcp(report)) => {
            assert_eq!(report.event, "received");
            assert_eq!(report.reply_syn, Some(true));
            assert_eq!(report.reply_ack, Some(true));
            assert!(report.rtt_ms.is_some());
        }
        other => panic!("expected a TCP report, got {other:?}"),
    }
}

#[tokio::test]
#[ignore = "requires CAP_NET_RAW"]
async fn tcp_ping_closed_port_resolves_without_hanging() {
    // A closed port answers RST (reported as received) or stays silent
    // behind a filter (reported as timeout); both are terminal.
    let pinger = TcpSynPinger {
        request: SimplePingRequest {
            destination: "127.0.0.1:65533".into(),
            total_pkts: Some(1),
            pkt_timeout_ms: Some(1000),
            l4_packet_type: Some(L4PacketType::Tcp),
            ..Default::default()
        },
        ctx: context(),
    };

    let events = collect(&pinger).await;
    assert_eq!(events.len(), 1);
    match &events[0].data {
        Some(PingData::Tcp(report)) => {
            assert!(
                report.event == "received" || report.event == "timeout",
                "unexpected event {:?}",
                report.event
            );
            if report.event == "received" {
                assert_eq!(report.reply_rst, Some(true));
            }
        }
        other => panic!("expected a TCP report, got {other:?}"),
    }
}

#[tokio::test]
#[ignore = "requires CAP_NET_RAW and internet reachability"]
async fn udp_traceroute_first_hop_is_not_last() {
    let pinger = SimplePinger {
        request: SimplePingRequest {
            destination: "1.1.1.1".into(),
            total_pkts: Some(1),
            ttl: Some(1),
            pkt_timeout_ms: Some(3000),
            l4_packet_type: Some(L4PacketType::Udp),
            ..Default::default()
        },
        ctx: context(),
    };

    let events = collect(&pinger).await;
    assert_eq!(events.len(), 1);
    match &events[0].data {
        Some(PingData::Icmp(reply)) => {
            // Time Exceeded from the first hop.
            assert!(!reply.last_hop);
            assert_eq!(reply.seq, 1);
            assert_eq!(reply.icmp_type, Some(11));
        }
        Some(PingData::IcmpTimeout(report)) => {
            // Some gateways drop TTL-1 probes silently; a timeout is the
            // documented alternative outcome.
            assert!(report.timeout);
        }
        other => panic!("expected a hop reply or timeout, got {other:?}"),
    }
}
