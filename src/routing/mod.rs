//! Longest-prefix-match routing table.
//!
//! Keys are CIDR prefixes, values are opaque. The v4 and v6 tables are
//! segregated; within each family, routes are grouped by prefix length and
//! groups are probed in descending order, so the first hit is the longest
//! matching prefix. Group and route maps are `BTreeMap`s, which makes the
//! probe order deterministic by key bytes.

use std::collections::BTreeMap;
use std::net::IpAddr;

use ipnet::IpNet;

use crate::error::{Error, Result};

/// Routes of one prefix length, keyed by the masked prefix bytes.
type RouteGroup<V> = BTreeMap<Vec<u8>, V>;

/// A longest-prefix router from CIDR prefixes to opaque values.
///
/// Inserting the same prefix twice overwrites the previous value.
#[derive(Debug, Clone, Default)]
pub struct PrefixRouter<V> {
    /// IPv4 route groups, keyed by prefix length.
    groups_v4: BTreeMap<u8, RouteGroup<V>>,
    /// IPv6 route groups, keyed by prefix length.
    groups_v6: BTreeMap<u8, RouteGroup<V>>,
}

impl<V> PrefixRouter<V> {
    pub fn new() -> Self {
        Self {
            groups_v4: BTreeMap::new(),
            groups_v6: BTreeMap::new(),
        }
    }

    /// Register `value` under the CIDR prefix. The host bits of the input
    /// are masked off before insertion.
    pub fn add_route(&mut self, cidr: &str, value: V) -> Result<()> {
        let net: IpNet = cidr
            .parse()
            .map_err(|_| Error::InvalidCidr(cidr.to_string()))?;

        let prefix_len = net.prefix_len();
        let key = masked_bytes(net.network(), prefix_len);

        let groups = match net {
            IpNet::V4(_) => &mut self.groups_v4,
            IpNet::V6(_) => &mut self.groups_v6,
        };

        groups.entry(prefix_len).or_default().insert(key, value);
        Ok(())
    }

    /// Look up the value registered under the longest prefix matching `ip`.
    pub fn get_route(&self, ip: &str) -> Result<Option<&V>> {
        let addr: IpAddr = ip
            .parse()
            .map_err(|_| Error::InvalidAddress(ip.to_string()))?;
        Ok(self.lookup(addr))
    }

    /// Like [`get_route`](Self::get_route) for an already-parsed address.
    pub fn lookup(&self, addr: IpAddr) -> Option<&V> {
        let groups = match addr {
            IpAddr::V4(_) => &self.groups_v4,
            IpAddr::V6(_) => &self.groups_v6,
        };

        for (&prefix_len, group) in groups.iter().rev() {
            let key = masked_bytes(addr, prefix_len);
            if let Some(value) = group.get(&key) {
                return Some(value);
            }
        }
        None
    }

    /// Total number of registered routes across both families.
    pub fn len(&self) -> usize {
        self.groups_v4
            .values()
            .chain(self.groups_v6.values())
            .map(BTreeMap::len)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Address bytes with everything past `prefix_len` bits zeroed.
fn masked_bytes(addr: IpAddr, prefix_len: u8) -> Vec<u8> {
    let mut bytes = match addr {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    };

    let full_bytes = usize::from(prefix_len / 8);
    let remaining_bits = prefix_len % 8;

    if full_bytes < bytes.len() {
        if remaining_bits > 0 {
            bytes[full_bytes] &= 0xff << (8 - remaining_bits);
            for b in &mut bytes[full_bytes + 1..] {
                *b = 0;
            }
        } else {
            for b in &mut bytes[full_bytes..] {
                *b = 0;
            }
        }
    }

    bytes
}
