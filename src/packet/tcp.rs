//! TCP segment building and parsing for the SYN pinger.
//!
//! Only bare 20-byte segments are built (SYN to open, RST to tear down);
//! parsing covers what the reply filter needs: ports, flags, seq/ack.

use std::net::IpAddr;

use crate::error::{ProtocolError, Result};
use crate::packet::{internet_checksum, pseudo_header_sum};
use crate::types::L4Proto;

/// TCP header length in 32-bit words (no options).
pub const TCP_HEADER_WORDS: u8 = 5;

/// TCP header length in bytes (no options).
pub const TCP_HEADER_LEN: usize = TCP_HEADER_WORDS as usize * 4;

const FLAG_FIN: u8 = 0x01;
const FLAG_SYN: u8 = 0x02;
const FLAG_RST: u8 = 0x04;
const FLAG_ACK: u8 = 0x10;

/// Advertised receive window on built segments.
const WINDOW: u16 = 65535;

/// Build a bare TCP segment with the checksum computed over the
/// v4/v6 pseudo-header.
#[allow(clippy::too_many_arguments)]
pub fn build_segment(
    src: IpAddr,
    src_port: u16,
    dst: IpAddr,
    dst_port: u16,
    seq: u32,
    ack: u32,
    syn: bool,
    rst: bool,
) -> Result<Vec<u8>> {
    let mut segment = vec![0u8; TCP_HEADER_LEN];
    segment[0..2].copy_from_slice(&src_port.to_be_bytes());
    segment[2..4].copy_from_slice(&dst_port.to_be_bytes());
    segment[4..8].copy_from_slice(&seq.to_be_bytes());
    segment[8..12].copy_from_slice(&ack.to_be_bytes());
    segment[12] = TCP_HEADER_WORDS << 4;

    let mut flags = 0u8;
    if syn {
        flags |= FLAG_SYN;
    }
    if rst {
        flags |= FLAG_RST;
    }
    if ack != 0 {
        flags |= FLAG_ACK;
    }
    segment[13] = flags;
    segment[14..16].copy_from_slice(&WINDOW.to_be_bytes());

    let pseudo = pseudo_header_sum(src, dst, L4Proto::Tcp.protocol_number(), segment.len())?;
    let checksum = internet_checksum(&segment, pseudo);
    segment[16..18].copy_from_slice(&checksum.to_be_bytes());

    Ok(segment)
}

/// Parsed fields of a received TCP segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpInfo {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack_no: u32,
    pub syn: bool,
    pub ack: bool,
    pub rst: bool,
    pub fin: bool,
}

/// Parse a TCP header at the start of `data`.
pub fn parse_segment(data: &[u8]) -> Result<TcpInfo> {
    if data.len() < TCP_HEADER_LEN {
        return Err(ProtocolError::MalformedPacket("TCP segment too short".into()).into());
    }

    let data_offset = usize::from(data[12] >> 4) * 4;
    if data_offset < TCP_HEADER_LEN || data.len() < data_offset {
        return Err(ProtocolError::MalformedPacket("TCP data offset invalid".into()).into());
    }

    let flags = data[13];
    Ok(TcpInfo {
        src_port: u16::from_be_bytes([data[0], data[1]]),
        dst_port: u16::from_be_bytes([data[2], data[3]]),
        seq: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
        ack_no: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
        syn: flags & FLAG_SYN != 0,
        ack: flags & FLAG_ACK != 0,
        rst: flags & FLAG_RST != 0,
        fin: flags & FLAG_FIN != 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_syn_round_trip() {
        let segment = build_segment(
            v4("192.0.2.1"),
            40000,
            v4("192.0.2.2"),
            22,
            1000,
            0,
            true,
            false,
        )
        .unwrap();
        assert_eq!(segment.len(), TCP_HEADER_LEN);

        let info = parse_segment(&segment).unwrap();
        assert_eq!(info.src_port, 40000);
        assert_eq!(info.dst_port, 22);
        assert_eq!(info.seq, 1000);
        assert!(info.syn);
        assert!(!info.ack);
        assert!(!info.rst);
    }

    #[test]
    fn test_checksum_verifies_over_pseudo_header() {
        let src = v4("10.0.0.1");
        let dst = v4("10.0.0.2");
        let segment = build_segment(src, 1234, dst, 80, 1000, 0, true, false).unwrap();

        let pseudo = pseudo_header_sum(src, dst, 6, segment.len()).unwrap();
        assert_eq!(internet_checksum(&segment, pseudo), 0);
    }

    #[test]
    fn test_v6_checksum_verifies() {
        let src: IpAddr = "2001:db8::1".parse().unwrap();
        let dst: IpAddr = "2001:db8::2".parse().unwrap();
        let segment = build_segment(src, 1234, dst, 443, 1000, 0, true, false).unwrap();

        let pseudo = pseudo_header_sum(src, dst, 6, segment.len()).unwrap();
        assert_eq!(internet_checksum(&segment, pseudo), 0);
    }

    #[test]
    fn test_rst_flags() {
        let segment = build_segment(
            v4("192.0.2.1"),
            40000,
            v4("192.0.2.2"),
            22,
            1000,
            0,
            false,
            true,
        )
        .unwrap();
        let info = parse_segment(&segment).unwrap();
        assert!(info.rst);
        assert!(!info.syn);
    }

    #[test]
    fn test_synack_reply_shape() {
        // What a listener answers: SYN|ACK acking our seq + 1.
        let segment = build_segment(
            v4("192.0.2.2"),
            22,
            v4("192.0.2.1"),
            40000,
            777,
            1001,
            true,
            false,
        )
        .unwrap();
        let info = parse_segment(&segment).unwrap();
        assert!(info.syn && info.ack);
        assert_eq!(info.ack_no, 1001);
    }

    #[test]
    fn test_parse_rejects_short_input() {
        assert!(parse_segment(&[0u8; 10]).is_err());

        let mut bad_offset = [0u8; TCP_HEADER_LEN];
        bad_offset[12] = 0x10; // data offset 1 word
        assert!(parse_segment(&bad_offset).is_err());
    }
}
