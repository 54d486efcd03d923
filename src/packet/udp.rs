//! UDP probe datagram building.
//!
//! UDP traceroute probes encode the transceiver identifier as the source
//! port and `base_dst_port + seq` as the destination port, so routers
//! quoting the probe in an ICMP error let the receiver recover (id, seq).

use std::net::IpAddr;

use crate::error::Result;
use crate::packet::{internet_checksum, pseudo_header_sum};
use crate::types::L4Proto;

/// UDP header length.
pub const UDP_HEADER_LEN: usize = 8;

/// Build a UDP datagram with the checksum computed over the pseudo-header.
pub fn build_datagram(
    src: IpAddr,
    src_port: u16,
    dst: IpAddr,
    dst_port: u16,
    payload: &[u8],
) -> Result<Vec<u8>> {
    let len = (UDP_HEADER_LEN + payload.len()) as u16;
    let mut datagram = Vec::with_capacity(UDP_HEADER_LEN + payload.len());
    datagram.extend_from_slice(&src_port.to_be_bytes());
    datagram.extend_from_slice(&dst_port.to_be_bytes());
    datagram.extend_from_slice(&len.to_be_bytes());
    datagram.extend_from_slice(&[0, 0]); // checksum placeholder
    datagram.extend_from_slice(payload);

    let pseudo = pseudo_header_sum(src, dst, L4Proto::Udp.protocol_number(), datagram.len())?;
    let mut checksum = internet_checksum(&datagram, pseudo);
    // An all-zero checksum means "no checksum" on the wire; transmit the
    // equivalent all-ones form instead.
    if checksum == 0 {
        checksum = 0xffff;
    }
    datagram[6..8].copy_from_slice(&checksum.to_be_bytes());

    Ok(datagram)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_datagram_layout() {
        let src: IpAddr = "192.0.2.1".parse().unwrap();
        let dst: IpAddr = "192.0.2.2".parse().unwrap();
        let datagram = build_datagram(src, 51000, dst, 33435, &[0u8; 12]).unwrap();

        assert_eq!(datagram.len(), UDP_HEADER_LEN + 12);
        assert_eq!(u16::from_be_bytes([datagram[0], datagram[1]]), 51000);
        assert_eq!(u16::from_be_bytes([datagram[2], datagram[3]]), 33435);
        assert_eq!(u16::from_be_bytes([datagram[4], datagram[5]]), 20);
    }

    #[test]
    fn test_checksum_verifies() {
        let src: IpAddr = "2001:db8::1".parse().unwrap();
        let dst: IpAddr = "2001:db8::2".parse().unwrap();
        let datagram = build_datagram(src, 1, dst, 2, b"probe").unwrap();

        let pseudo = pseudo_header_sum(src, dst, 17, datagram.len()).unwrap();
        // A transmitted non-zero checksum verifies to 0 or, for the
        // 0xffff-substituted case, to 0xffff's complement fold.
        let folded = internet_checksum(&datagram, pseudo);
        assert!(folded == 0 || folded == 0xffff);
    }
}
