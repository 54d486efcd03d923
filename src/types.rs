//! Shared vocabulary types.

use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// IP version tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpVersion {
    V4,
    V6,
}

impl IpVersion {
    pub fn of(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => IpVersion::V4,
            IpAddr::V6(_) => IpVersion::V6,
        }
    }

    /// Numeric family tag (4 or 6) as carried on receive replies.
    pub fn family(self) -> u8 {
        match self {
            IpVersion::V4 => 4,
            IpVersion::V6 => 6,
        }
    }

    /// Fixed IP header length for this version (IPv4 without options).
    pub fn header_len(self) -> usize {
        match self {
            IpVersion::V4 => 20,
            IpVersion::V6 => 40,
        }
    }
}

/// Transport-layer protocol of a probe packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum L4Proto {
    Icmp,
    Icmpv6,
    Udp,
    Tcp,
}

impl L4Proto {
    /// IANA protocol number (IPv6 NextHeader value for v6 protocols).
    pub fn protocol_number(self) -> u8 {
        match self {
            L4Proto::Icmp => 1,
            L4Proto::Tcp => 6,
            L4Proto::Udp => 17,
            L4Proto::Icmpv6 => 58,
        }
    }

    pub fn from_protocol_number(n: u8) -> Option<Self> {
        match n {
            1 => Some(L4Proto::Icmp),
            6 => Some(L4Proto::Tcp),
            17 => Some(L4Proto::Udp),
            58 => Some(L4Proto::Icmpv6),
            _ => None,
        }
    }

    /// Header length in bytes (fixed-size headers only).
    pub fn header_len(self) -> usize {
        match self {
            L4Proto::Icmp | L4Proto::Icmpv6 | L4Proto::Udp => 8,
            L4Proto::Tcp => 20,
        }
    }
}

impl fmt::Display for L4Proto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            L4Proto::Icmp => write!(f, "icmp"),
            L4Proto::Icmpv6 => write!(f, "icmpv6"),
            L4Proto::Udp => write!(f, "udp"),
            L4Proto::Tcp => write!(f, "tcp"),
        }
    }
}

/// Address family preference for name resolution, in the `ip`/`ip4`/`ip6`
/// notation used on probe request bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum InetFamilyPreference {
    #[default]
    #[serde(rename = "ip")]
    Dual,
    #[serde(rename = "ip4")]
    V4,
    #[serde(rename = "ip6")]
    V6,
}

impl InetFamilyPreference {
    /// Derive a preference from the optional prefer-v4/prefer-v6 flags,
    /// v6 winning when both are set.
    pub fn from_flags(prefer_v4: Option<bool>, prefer_v6: Option<bool>) -> Self {
        if prefer_v6 == Some(true) {
            InetFamilyPreference::V6
        } else if prefer_v4 == Some(true) {
            InetFamilyPreference::V4
        } else {
            InetFamilyPreference::Dual
        }
    }

    pub fn admits(self, addr: IpAddr) -> bool {
        match self {
            InetFamilyPreference::Dual => true,
            InetFamilyPreference::V4 => addr.is_ipv4(),
            InetFamilyPreference::V6 => addr.is_ipv6(),
        }
    }
}

impl fmt::Display for InetFamilyPreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InetFamilyPreference::Dual => write!(f, "ip"),
            InetFamilyPreference::V4 => write!(f, "ip4"),
            InetFamilyPreference::V6 => write!(f, "ip6"),
        }
    }
}

/// Attribute keys announced by agents and matched by the hub.
pub mod attr {
    pub const NODE_NAME: &str = "node_name";
    pub const HTTP_ENDPOINT: &str = "http_endpoint";
    pub const PING_CAPABILITY: &str = "ping_capability";
    pub const DNS_PROBE_CAPABILITY: &str = "dnsprobe_capability";
    pub const EXACT_LOCATION: &str = "exact_location";
    pub const COUNTRY_CODE: &str = "country_code";
    pub const CITY_NAME: &str = "city_name";
    pub const ASN: &str = "asn";
    pub const ISP: &str = "isp";
    pub const DN42_ASN: &str = "dn42_asn";
    pub const DN42_ISP: &str = "dn42_isp";
    pub const RESPOND_RANGE: &str = "respond_range";
    pub const DOMAIN_RESPOND_RANGE: &str = "domain_respond_range";
    pub const SUPPORT_UDP: &str = "support_udp";
    pub const SUPPORT_PMTU: &str = "support_pmtu";
    pub const SUPPORT_TCP: &str = "support_tcp";
    pub const SUPPORT_QUIC_TUNNEL: &str = "support_quic_tunnel";
    pub const VERSION: &str = "version";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_numbers_round_trip() {
        for proto in [L4Proto::Icmp, L4Proto::Tcp, L4Proto::Udp, L4Proto::Icmpv6] {
            assert_eq!(
                L4Proto::from_protocol_number(proto.protocol_number()),
                Some(proto)
            );
        }
        assert_eq!(L4Proto::from_protocol_number(89), None);
    }

    #[test]
    fn test_family_preference_flags() {
        assert_eq!(
            InetFamilyPreference::from_flags(Some(true), None),
            InetFamilyPreference::V4
        );
        assert_eq!(
            InetFamilyPreference::from_flags(Some(true), Some(true)),
            InetFamilyPreference::V6
        );
        assert_eq!(
            InetFamilyPreference::from_flags(None, None),
            InetFamilyPreference::Dual
        );
    }

    #[test]
    fn test_family_preference_serde() {
        let v: InetFamilyPreference = serde_json::from_str("\"ip6\"").unwrap();
        assert_eq!(v, InetFamilyPreference::V6);
        assert_eq!(serde_json::to_string(&InetFamilyPreference::Dual).unwrap(), "\"ip\"");
    }
}
