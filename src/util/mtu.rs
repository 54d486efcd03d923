//! Network interface MTU discovery.
//!
//! The minimum MTU across local interfaces caps probe payload sizes; the
//! maximum MTU sizes raw-socket receive buffers.

use crate::types::{IpVersion, L4Proto};
use crate::STANDARD_MTU;

/// Enumerate the MTUs of all local interfaces.
#[cfg(target_os = "linux")]
fn interface_mtus() -> Vec<usize> {
    use std::fs;

    let mut mtus = Vec::new();
    let Ok(entries) = fs::read_dir("/sys/class/net") else {
        return mtus;
    };

    for entry in entries.flatten() {
        if let Some(mtu) = fs::read_to_string(entry.path().join("mtu"))
            .ok()
            .and_then(|s| s.trim().parse::<usize>().ok())
        {
            mtus.push(mtu);
        }
    }

    mtus
}

#[cfg(not(target_os = "linux"))]
fn interface_mtus() -> Vec<usize> {
    use std::ffi::CStr;
    use std::mem::MaybeUninit;
    use std::net::UdpSocket;
    use std::os::fd::AsRawFd;

    let mut mtus = Vec::new();

    // Walk interfaces via getifaddrs, then query each MTU with SIOCGIFMTU.
    let Ok(socket) = UdpSocket::bind("0.0.0.0:0") else {
        return mtus;
    };
    let fd = socket.as_raw_fd();

    unsafe {
        let mut ifaddrs: *mut libc::ifaddrs = std::ptr::null_mut();
        if libc::getifaddrs(std::ptr::addr_of_mut!(ifaddrs)) != 0 {
            return mtus;
        }

        let mut current = ifaddrs;
        while !current.is_null() {
            let ifa = &*current;
            if !ifa.ifa_name.is_null() {
                let name = CStr::from_ptr(ifa.ifa_name);
                let mut ifr: libc::ifreq = MaybeUninit::zeroed().assume_init();
                let copy_len = name.to_bytes().len().min(libc::IFNAMSIZ - 1);
                std::ptr::copy_nonoverlapping(
                    name.as_ptr(),
                    ifr.ifr_name.as_mut_ptr(),
                    copy_len,
                );
                if libc::ioctl(fd, libc::SIOCGIFMTU, &mut ifr) == 0 {
                    mtus.push(ifr.ifr_ifru.ifru_mtu as usize);
                }
            }
            current = ifa.ifa_next;
        }

        libc::freeifaddrs(ifaddrs);
    }

    mtus
}

/// The smallest MTU among local interfaces, or the standard 1500 when
/// enumeration yields nothing.
pub fn minimum_mtu() -> usize {
    interface_mtus().into_iter().min().unwrap_or(STANDARD_MTU)
}

/// The largest MTU among local interfaces, or the standard 1500 when
/// enumeration yields nothing. Used to size receive buffers.
pub fn maximum_mtu() -> usize {
    interface_mtus().into_iter().max().unwrap_or(STANDARD_MTU)
}

/// Largest probe payload that fits a single unfragmented packet for the
/// given IP version and L4 protocol.
///
/// A PMTU hint below the local interface minimum takes precedence, so a
/// path-limited probe shrinks further than the local links would require.
pub fn max_payload_len(ip_version: IpVersion, l4: L4Proto, pmtu_hint: Option<usize>) -> usize {
    let mut mtu = minimum_mtu();
    if let Some(pmtu) = pmtu_hint {
        if pmtu < mtu {
            mtu = pmtu;
        }
    }

    mtu.saturating_sub(ip_version.header_len() + l4.header_len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimum_not_above_maximum() {
        assert!(minimum_mtu() <= maximum_mtu());
    }

    #[test]
    fn test_max_payload_len_subtracts_headers() {
        // With an explicit hint below any plausible interface MTU, the
        // arithmetic is deterministic.
        assert_eq!(
            max_payload_len(IpVersion::V4, L4Proto::Icmp, Some(576)),
            576 - 20 - 8
        );
        assert_eq!(
            max_payload_len(IpVersion::V6, L4Proto::Udp, Some(1280)),
            1280 - 40 - 8
        );
        assert_eq!(
            max_payload_len(IpVersion::V4, L4Proto::Udp, Some(576)),
            576 - 20 - 8
        );
    }

    #[test]
    fn test_tiny_pmtu_saturates_to_zero() {
        assert_eq!(max_payload_len(IpVersion::V6, L4Proto::Icmpv6, Some(20)), 0);
    }

    #[test]
    fn test_pmtu_hint_above_minimum_is_ignored() {
        let unhinted = max_payload_len(IpVersion::V4, L4Proto::Icmp, None);
        let hinted = max_payload_len(IpVersion::V4, L4Proto::Icmp, Some(1_000_000));
        assert_eq!(unhinted, hinted);
    }
}
