//! Property tests for the longest-prefix router.

use std::net::{IpAddr, Ipv4Addr};

use globalping::routing::PrefixRouter;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Reference longest-prefix match over a plain list of (net, value).
fn reference_lookup(routes: &[(ipnet::Ipv4Net, u32)], ip: Ipv4Addr) -> Option<u32> {
    routes
        .iter()
        .filter(|(net, _)| net.contains(&ip))
        .max_by_key(|(net, _)| net.prefix_len())
        .map(|(_, value)| *value)
}

#[test]
fn random_route_sets_agree_with_reference() {
    let mut rng = StdRng::seed_from_u64(0x6c70_6d72);

    for _ in 0..50 {
        let mut router = PrefixRouter::new();
        let mut routes: Vec<(ipnet::Ipv4Net, u32)> = Vec::new();

        for value in 0..64u32 {
            let addr = Ipv4Addr::from(rng.gen::<u32>());
            let prefix_len = rng.gen_range(0..=32u8);
            let net = ipnet::Ipv4Net::new(addr, prefix_len).unwrap().trunc();

            router.add_route(&net.to_string(), value).unwrap();
            // Same prefix inserted again: the reference list keeps only the
            // latest value, matching overwrite semantics.
            routes.retain(|(existing, _)| existing != &net);
            routes.push((net, value));
        }

        // Probe with addresses derived from the routes (guaranteed hits)
        // and fully random ones (mostly misses unless a short prefix
        // covers them).
        let mut probes: Vec<Ipv4Addr> = routes
            .iter()
            .map(|(net, _)| {
                let base = u32::from(net.network());
                Ipv4Addr::from(base | (rng.gen::<u32>() & u32::from(net.hostmask())))
            })
            .collect();
        probes.extend((0..64).map(|_| Ipv4Addr::from(rng.gen::<u32>())));

        for ip in probes {
            let expected = reference_lookup(&routes, ip);
            let actual = router.lookup(IpAddr::V4(ip)).copied();
            assert_eq!(actual, expected, "lookup mismatch for {ip}");
        }
    }
}

#[test]
fn add_route_is_idempotent_with_latest_value() {
    let mut rng = StdRng::seed_from_u64(7);

    for _ in 0..20 {
        let addr = Ipv4Addr::from(rng.gen::<u32>());
        let prefix_len = rng.gen_range(8..=30u8);
        let net = ipnet::Ipv4Net::new(addr, prefix_len).unwrap().trunc();
        let cidr = net.to_string();

        let mut once = PrefixRouter::new();
        once.add_route(&cidr, 2u32).unwrap();

        let mut twice = PrefixRouter::new();
        twice.add_route(&cidr, 1u32).unwrap();
        twice.add_route(&cidr, 2u32).unwrap();

        assert_eq!(once.len(), twice.len());
        let probe = IpAddr::V4(net.network());
        assert_eq!(once.lookup(probe), twice.lookup(probe));
    }
}

#[test]
fn v6_longest_prefix_selection() {
    let mut router = PrefixRouter::new();
    router.add_route("::/0", "default").unwrap();
    router.add_route("2001:db8::/32", "doc").unwrap();
    router.add_route("2001:db8:aaaa::/48", "doc-aaaa").unwrap();

    assert_eq!(
        router.get_route("2001:db8:aaaa::1").unwrap(),
        Some(&"doc-aaaa")
    );
    assert_eq!(router.get_route("2001:db8:bbbb::1").unwrap(), Some(&"doc"));
    assert_eq!(router.get_route("2600::1").unwrap(), Some(&"default"));
}
