//! ICMPv4/v6 message building and reply parsing.
//!
//! Echo requests carry the transceiver identifier and the request sequence.
//! Error replies (Time Exceeded, Destination Unreachable, Packet Too Big /
//! Fragmentation Needed) quote the packet that triggered them; the parser
//! digs the identifier and sequence back out of that quoted packet, for both
//! quoted ICMP echoes and quoted UDP probes (where the sender packed
//! `src_port = id` and `dst_port = base_dst_port + seq`).

use crate::error::{ProtocolError, Result};
use crate::packet::{internet_checksum, parse_ipv4_header, parse_ipv6_header};
use crate::types::L4Proto;

/// ICMP header length (type, code, checksum, rest-of-header).
pub const ICMP_HEADER_LEN: usize = 8;

// ICMPv4 types
pub const ICMP4_ECHO_REPLY: u8 = 0;
pub const ICMP4_DEST_UNREACHABLE: u8 = 3;
pub const ICMP4_ECHO_REQUEST: u8 = 8;
pub const ICMP4_TIME_EXCEEDED: u8 = 11;

// ICMPv4 destination-unreachable codes
pub const ICMP4_CODE_PORT_UNREACHABLE: u8 = 3;
pub const ICMP4_CODE_FRAGMENTATION_NEEDED: u8 = 4;

// ICMPv6 types
pub const ICMP6_DEST_UNREACHABLE: u8 = 1;
pub const ICMP6_PACKET_TOO_BIG: u8 = 2;
pub const ICMP6_TIME_EXCEEDED: u8 = 3;
pub const ICMP6_ECHO_REQUEST: u8 = 128;
pub const ICMP6_ECHO_REPLY: u8 = 129;

// ICMPv6 destination-unreachable codes
pub const ICMP6_CODE_PORT_UNREACHABLE: u8 = 4;

/// What could be extracted from a reply: either directly from an echo reply
/// header, or from the origin packet quoted inside an error message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketIdentifier {
    pub id: u16,
    pub seq: u16,
    /// Protocol of the packet that was *sent* (the quoted packet for
    /// errors; ICMP itself for echo replies).
    pub ip_proto: L4Proto,
    /// True when the reply comes from the probed destination itself.
    pub last_hop: bool,
    /// Next-hop MTU from Fragmentation Needed / Packet Too Big.
    pub pmtu: Option<u32>,
    pub icmp_type: u8,
    pub icmp_code: u8,
}

/// Build an ICMPv4 echo request. The checksum covers the whole message.
pub fn build_echo_request_v4(id: u16, seq: u16, payload: &[u8]) -> Vec<u8> {
    let mut msg = echo_message(ICMP4_ECHO_REQUEST, id, seq, payload);
    let checksum = internet_checksum(&msg, 0);
    msg[2..4].copy_from_slice(&checksum.to_be_bytes());
    msg
}

/// Build an ICMPv6 echo request. The checksum is left zero: on `ICMPv6` raw
/// sockets the kernel computes it over the pseudo-header.
pub fn build_echo_request_v6(id: u16, seq: u16, payload: &[u8]) -> Vec<u8> {
    echo_message(ICMP6_ECHO_REQUEST, id, seq, payload)
}

fn echo_message(icmp_type: u8, id: u16, seq: u16, payload: &[u8]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(ICMP_HEADER_LEN + payload.len());
    msg.push(icmp_type);
    msg.push(0); // code
    msg.extend_from_slice(&[0, 0]); // checksum placeholder
    msg.extend_from_slice(&id.to_be_bytes());
    msg.extend_from_slice(&seq.to_be_bytes());
    msg.extend_from_slice(payload);
    msg
}

/// Parse an ICMPv4 reply PDU (IP header already stripped by the caller).
pub fn parse_reply_v4(msg: &[u8], base_dst_port: u16) -> Result<PacketIdentifier> {
    if msg.len() < ICMP_HEADER_LEN {
        return Err(ProtocolError::MalformedPacket("ICMPv4 reply too short".into()).into());
    }

    let icmp_type = msg[0];
    let icmp_code = msg[1];

    match icmp_type {
        ICMP4_ECHO_REPLY => Ok(PacketIdentifier {
            id: u16::from_be_bytes([msg[4], msg[5]]),
            seq: u16::from_be_bytes([msg[6], msg[7]]),
            ip_proto: L4Proto::Icmp,
            last_hop: true,
            pmtu: None,
            icmp_type,
            icmp_code,
        }),
        ICMP4_TIME_EXCEEDED => {
            let (id, seq, ip_proto) =
                extract_embedded_v4(&msg[ICMP_HEADER_LEN..], base_dst_port)?;
            Ok(PacketIdentifier {
                id,
                seq,
                ip_proto,
                last_hop: false,
                pmtu: None,
                icmp_type,
                icmp_code,
            })
        }
        ICMP4_DEST_UNREACHABLE => {
            // Fragmentation Needed carries the next-hop MTU in bytes 6..8.
            let pmtu = (icmp_code == ICMP4_CODE_FRAGMENTATION_NEEDED)
                .then(|| u32::from(u16::from_be_bytes([msg[6], msg[7]])));

            let (id, seq, ip_proto) =
                extract_embedded_v4(&msg[ICMP_HEADER_LEN..], base_dst_port)?;
            // Port Unreachable from the traced UDP destination is the
            // terminal hop of a UDP traceroute.
            let last_hop =
                ip_proto == L4Proto::Udp && icmp_code == ICMP4_CODE_PORT_UNREACHABLE;
            Ok(PacketIdentifier {
                id,
                seq,
                ip_proto,
                last_hop,
                pmtu,
                icmp_type,
                icmp_code,
            })
        }
        other => Err(ProtocolError::UnknownIcmpType(other).into()),
    }
}

/// Parse an ICMPv6 reply PDU (the kernel strips the IPv6 header on ICMPv6
/// sockets).
pub fn parse_reply_v6(msg: &[u8], base_dst_port: u16) -> Result<PacketIdentifier> {
    if msg.len() < ICMP_HEADER_LEN {
        return Err(ProtocolError::MalformedPacket("ICMPv6 reply too short".into()).into());
    }

    let icmp_type = msg[0];
    let icmp_code = msg[1];

    match icmp_type {
        ICMP6_ECHO_REPLY => Ok(PacketIdentifier {
            id: u16::from_be_bytes([msg[4], msg[5]]),
            seq: u16::from_be_bytes([msg[6], msg[7]]),
            ip_proto: L4Proto::Icmpv6,
            last_hop: true,
            pmtu: None,
            icmp_type,
            icmp_code,
        }),
        ICMP6_TIME_EXCEEDED => {
            let (id, seq, ip_proto) =
                extract_embedded_v6(&msg[ICMP_HEADER_LEN..], base_dst_port)?;
            Ok(PacketIdentifier {
                id,
                seq,
                ip_proto,
                last_hop: false,
                pmtu: None,
                icmp_type,
                icmp_code,
            })
        }
        ICMP6_PACKET_TOO_BIG => {
            // MTU field occupies bytes 4..8.
            let pmtu = u32::from_be_bytes([msg[4], msg[5], msg[6], msg[7]]);
            let (id, seq, ip_proto) =
                extract_embedded_v6(&msg[ICMP_HEADER_LEN..], base_dst_port)?;
            Ok(PacketIdentifier {
                id,
                seq,
                ip_proto,
                last_hop: false,
                pmtu: Some(pmtu),
                icmp_type,
                icmp_code,
            })
        }
        ICMP6_DEST_UNREACHABLE => {
            let (id, seq, ip_proto) =
                extract_embedded_v6(&msg[ICMP_HEADER_LEN..], base_dst_port)?;
            let last_hop =
                ip_proto == L4Proto::Udp && icmp_code == ICMP6_CODE_PORT_UNREACHABLE;
            Ok(PacketIdentifier {
                id,
                seq,
                ip_proto,
                last_hop,
                pmtu: None,
                icmp_type,
                icmp_code,
            })
        }
        other => Err(ProtocolError::UnknownIcmpType(other).into()),
    }
}

/// Extract (id, seq, proto) from the quoted IPv4 packet of an error message.
fn extract_embedded_v4(embedded: &[u8], base_dst_port: u16) -> Result<(u16, u16, L4Proto)> {
    let ip = parse_ipv4_header(embedded)?;
    let l4 = embedded
        .get(ip.header_len..)
        .ok_or_else(|| ProtocolError::MalformedPacket("quoted packet truncated".into()))?;

    extract_embedded_l4(ip.protocol, l4, base_dst_port, L4Proto::Icmp)
}

/// Extract (id, seq, proto) from the quoted IPv6 packet of an error message.
fn extract_embedded_v6(embedded: &[u8], base_dst_port: u16) -> Result<(u16, u16, L4Proto)> {
    let ip = parse_ipv6_header(embedded)?;
    let l4 = &embedded[crate::packet::IPV6_HEADER_LEN..];

    extract_embedded_l4(ip.next_header, l4, base_dst_port, L4Proto::Icmpv6)
}

fn extract_embedded_l4(
    proto: u8,
    l4: &[u8],
    base_dst_port: u16,
    icmp_flavor: L4Proto,
) -> Result<(u16, u16, L4Proto)> {
    if l4.len() < 8 {
        return Err(ProtocolError::MalformedPacket("quoted L4 header truncated".into()).into());
    }

    match L4Proto::from_protocol_number(proto) {
        Some(p @ (L4Proto::Icmp | L4Proto::Icmpv6)) if p == icmp_flavor => {
            // Quoted echo request: id and seq sit in the ICMP header.
            let id = u16::from_be_bytes([l4[4], l4[5]]);
            let seq = u16::from_be_bytes([l4[6], l4[7]]);
            Ok((id, seq, p))
        }
        Some(L4Proto::Udp) => {
            // Quoted UDP probe: the sender packed id/seq into the ports.
            let src_port = u16::from_be_bytes([l4[0], l4[1]]);
            let dst_port = u16::from_be_bytes([l4[2], l4[3]]);
            Ok((src_port, dst_port.wrapping_sub(base_dst_port), L4Proto::Udp))
        }
        _ => Err(ProtocolError::UnknownEmbeddedProtocol(proto).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// ICMPv4 Time Exceeded quoting an ICMP echo request, captured from a
    /// real TTL-1 trace (ethernet and outer IP headers stripped).
    const TIME_EXCEEDED_EMBEDDED_ICMP: &[u8] = &[
        0x0b, 0x00, 0xf4, 0xff, 0x00, 0x00, 0x00, 0x00, // ICMP: type 11 code 0
        0x45, 0x00, 0x00, 0x40, 0x68, 0xb2, 0x00, 0x00, // quoted IPv4
        0x01, 0x01, 0x80, 0x40, 0xc0, 0xa8, 0x04, 0x17, // ttl 1, proto 1
        0x08, 0x08, 0x04, 0x04, // dst 8.8.4.4
        0x08, 0x00, 0x16, 0x53, 0x60, 0xc4, 0x80, 0xe8, // quoted echo request
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    ];

    /// ICMPv4 Time Exceeded quoting a UDP traceroute probe
    /// (src_port 57594, dst_port 33435), same capture origin.
    const TIME_EXCEEDED_EMBEDDED_UDP: &[u8] = &[
        0x0b, 0x00, 0xc5, 0xf0, 0x00, 0x00, 0x00, 0x00, // ICMP: type 11 code 0
        0x45, 0x00, 0x00, 0x28, 0xe0, 0xfb, 0x00, 0x00, // quoted IPv4
        0x01, 0x11, 0x07, 0xff, 0xc0, 0xa8, 0x04, 0x17, // ttl 1, proto 17
        0x08, 0x08, 0x04, 0x04, // dst 8.8.4.4
        0xe0, 0xfa, 0x82, 0x9b, 0x00, 0x14, 0xcb, 0x64, // quoted UDP header
    ];

    #[test]
    fn test_echo_request_v4_checksum_verifies() {
        let msg = build_echo_request_v4(0x1234, 7, &[0xaa; 16]);
        assert_eq!(msg[0], ICMP4_ECHO_REQUEST);
        assert_eq!(internet_checksum(&msg, 0), 0);
        assert_eq!(u16::from_be_bytes([msg[4], msg[5]]), 0x1234);
        assert_eq!(u16::from_be_bytes([msg[6], msg[7]]), 7);
    }

    #[test]
    fn test_echo_request_v6_leaves_checksum_to_kernel() {
        let msg = build_echo_request_v6(9, 1, &[]);
        assert_eq!(msg[0], ICMP6_ECHO_REQUEST);
        assert_eq!(&msg[2..4], &[0, 0]);
    }

    #[test]
    fn test_echo_reply_parses_from_outer_header() {
        let mut msg = build_echo_request_v4(42, 5, &[]);
        msg[0] = ICMP4_ECHO_REPLY;
        let ident = parse_reply_v4(&msg, crate::BASE_DST_PORT).unwrap();
        assert!(ident.last_hop);
        assert_eq!(ident.id, 42);
        assert_eq!(ident.seq, 5);
        assert_eq!(ident.ip_proto, L4Proto::Icmp);
    }

    #[test]
    fn test_time_exceeded_with_quoted_echo() {
        let ident = parse_reply_v4(TIME_EXCEEDED_EMBEDDED_ICMP, crate::BASE_DST_PORT).unwrap();
        assert_eq!(ident.icmp_type, ICMP4_TIME_EXCEEDED);
        assert!(!ident.last_hop);
        assert_eq!(ident.ip_proto, L4Proto::Icmp);
        assert_eq!(ident.id, 0x60c4);
        assert_eq!(ident.seq, 0x80e8);
    }

    #[test]
    fn test_time_exceeded_with_quoted_udp() {
        let ident = parse_reply_v4(TIME_EXCEEDED_EMBEDDED_UDP, 33433).unwrap();
        assert!(!ident.last_hop);
        assert_eq!(ident.ip_proto, L4Proto::Udp);
        assert_eq!(ident.id, 57594); // quoted src port
        assert_eq!(ident.seq, 2); // 33435 - 33433
    }

    #[test]
    fn test_port_unreachable_is_last_hop_for_udp() {
        let mut msg = TIME_EXCEEDED_EMBEDDED_UDP.to_vec();
        msg[0] = ICMP4_DEST_UNREACHABLE;
        msg[1] = ICMP4_CODE_PORT_UNREACHABLE;
        let ident = parse_reply_v4(&msg, 33433).unwrap();
        assert!(ident.last_hop);
        assert_eq!(ident.pmtu, None);
    }

    #[test]
    fn test_fragmentation_needed_carries_pmtu() {
        let mut msg = TIME_EXCEEDED_EMBEDDED_UDP.to_vec();
        msg[0] = ICMP4_DEST_UNREACHABLE;
        msg[1] = ICMP4_CODE_FRAGMENTATION_NEEDED;
        msg[6..8].copy_from_slice(&1400u16.to_be_bytes());
        let ident = parse_reply_v4(&msg, 33433).unwrap();
        assert_eq!(ident.pmtu, Some(1400));
        assert!(!ident.last_hop); // frag-needed, not port-unreachable
    }

    #[test]
    fn test_packet_too_big_v6() {
        // Packet Too Big quoting an IPv6 echo request.
        let mut msg = vec![ICMP6_PACKET_TOO_BIG, 0, 0, 0];
        msg.extend_from_slice(&1280u32.to_be_bytes());
        // Quoted IPv6 header: version 6, next header 58, hop limit 64.
        let mut quoted = vec![0x60, 0, 0, 0, 0, 16, 58, 64];
        quoted.extend_from_slice(&[0u8; 32]); // src + dst
        quoted.extend_from_slice(&build_echo_request_v6(77, 3, &[0u8; 8]));
        msg.extend_from_slice(&quoted);

        let ident = parse_reply_v6(&msg, crate::BASE_DST_PORT).unwrap();
        assert_eq!(ident.pmtu, Some(1280));
        assert_eq!(ident.id, 77);
        assert_eq!(ident.seq, 3);
        assert_eq!(ident.ip_proto, L4Proto::Icmpv6);
    }

    #[test]
    fn test_v6_port_unreachable_code_four() {
        // Dest Unreachable (port) quoting a UDP probe.
        let mut msg = vec![ICMP6_DEST_UNREACHABLE, ICMP6_CODE_PORT_UNREACHABLE, 0, 0, 0, 0, 0, 0];
        let mut quoted = vec![0x60, 0, 0, 0, 0, 8, 17, 64];
        quoted.extend_from_slice(&[0u8; 32]);
        quoted.extend_from_slice(&51000u16.to_be_bytes()); // src port = id
        quoted.extend_from_slice(&(33433u16 + 9).to_be_bytes()); // dst port
        quoted.extend_from_slice(&[0, 8, 0, 0]);
        msg.extend_from_slice(&quoted);

        let ident = parse_reply_v6(&msg, 33433).unwrap();
        assert!(ident.last_hop);
        assert_eq!(ident.id, 51000);
        assert_eq!(ident.seq, 9);
    }

    #[test]
    fn test_unknown_type_is_an_error() {
        let msg = [0x2a, 0, 0, 0, 0, 0, 0, 0];
        assert!(parse_reply_v4(&msg, 33433).is_err());
    }

    #[test]
    fn test_udp_port_trick_round_trip() {
        // For any id and any seq below 65536 - base, the port packing
        // recovers (id, seq) exactly.
        for (id, seq) in [(0u16, 0u16), (65535, 1), (700, 32102), (1, 65535 - 33433)] {
            let mut msg = vec![ICMP4_TIME_EXCEEDED, 0, 0, 0, 0, 0, 0, 0];
            let mut quoted = vec![
                0x45, 0x00, 0x00, 0x28, 0x00, 0x00, 0x00, 0x00, 0x01, 0x11, 0x00, 0x00,
            ];
            quoted.extend_from_slice(&[192, 0, 2, 1, 192, 0, 2, 2]);
            quoted.extend_from_slice(&id.to_be_bytes());
            quoted.extend_from_slice(&(33433 + seq).to_be_bytes());
            quoted.extend_from_slice(&[0, 8, 0, 0]);
            msg.extend_from_slice(&quoted);

            let ident = parse_reply_v4(&msg, 33433).unwrap();
            assert_eq!((ident.id, ident.seq), (id, seq));
        }
    }
}
