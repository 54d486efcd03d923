//! Destination selection and source address derivation.

use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::time::Duration;

use hickory_resolver::config::{
    LookupIpStrategy, NameServerConfig, Protocol, ResolverConfig, ResolverOpts,
};
use hickory_resolver::TokioAsyncResolver;
use ipnet::IpNet;

use crate::error::{Error, ProbeError, Result};
use crate::types::InetFamilyPreference;

/// Name resolver used by probes. Wraps either the system resolver or a
/// caller-specified server so tasks can pin the resolver per request.
pub struct ProbeResolver {
    inner: TokioAsyncResolver,
}

impl ProbeResolver {
    /// Build a resolver. `server` is a `host:port` string (`:53` is assumed
    /// when the port is missing); `None` uses the system configuration.
    pub fn new(server: Option<&str>, timeout: Duration) -> Result<Self> {
        let inner = match server.filter(|s| !s.is_empty()) {
            Some(spec) => {
                let addr = parse_resolver_addr(spec)?;
                let mut config = ResolverConfig::new();
                config.add_name_server(NameServerConfig::new(addr, Protocol::Udp));
                let mut opts = ResolverOpts::default();
                opts.timeout = timeout;
                opts.attempts = 1;
                TokioAsyncResolver::tokio(config, opts)
            }
            None => TokioAsyncResolver::tokio_from_system_conf().map_err(|e| {
                Error::Config(format!("failed to load system resolver config: {e}"))
            })?,
        };

        Ok(Self { inner })
    }

    /// Resolve a host to addresses, honouring the family preference.
    /// A literal IP short-circuits resolution.
    pub async fn lookup(
        &self,
        host: &str,
        pref: InetFamilyPreference,
    ) -> Result<Vec<IpAddr>> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            if pref.admits(ip) {
                return Ok(vec![ip]);
            }
            return Err(ProbeError::NoAddress(host.to_string()).into());
        }

        let strategy = match pref {
            InetFamilyPreference::Dual => LookupIpStrategy::Ipv4AndIpv6,
            InetFamilyPreference::V4 => LookupIpStrategy::Ipv4Only,
            InetFamilyPreference::V6 => LookupIpStrategy::Ipv6Only,
        };

        // The strategy lives on resolver options, so a preference other than
        // the resolver default gets a per-call filter instead.
        let lookup = self.inner.lookup_ip(host).await.map_err(|e| {
            Error::Probe(ProbeError::ResolveFailed {
                host: host.to_string(),
                reason: e.to_string(),
            })
        })?;

        let ips: Vec<IpAddr> = lookup
            .iter()
            .filter(|ip| match strategy {
                LookupIpStrategy::Ipv4Only => ip.is_ipv4(),
                LookupIpStrategy::Ipv6Only => ip.is_ipv6(),
                _ => true,
            })
            .collect();

        if ips.is_empty() {
            return Err(ProbeError::NoAddress(host.to_string()).into());
        }
        Ok(ips)
    }
}

fn parse_resolver_addr(spec: &str) -> Result<SocketAddr> {
    if let Ok(addr) = spec.parse::<SocketAddr>() {
        return Ok(addr);
    }
    // No port: accept a bare IP and assume 53.
    if let Ok(ip) = spec.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, 53));
    }
    Err(Error::InvalidAddress(spec.to_string()))
}

/// Resolve a host and pick the first address admitted by the preference and
/// the respond range.
pub async fn select_dst_ip(
    resolver: &ProbeResolver,
    host: &str,
    pref: InetFamilyPreference,
    respond_range: &[IpNet],
) -> Result<IpAddr> {
    let mut ips = resolver.lookup(host, pref).await?;

    if !respond_range.is_empty() {
        ips.retain(|ip| respond_range.iter().any(|net| net.contains(ip)));
    }

    ips.into_iter()
        .next()
        .ok_or_else(|| ProbeError::NoAddress(host.to_string()).into())
}

/// True iff every destination falls inside at least one of the ranges.
pub fn check_intersect(dst_ips: &[IpAddr], ranges: &[IpNet]) -> bool {
    debug_assert!(!ranges.is_empty(), "check_intersect needs a non-empty range set");
    dst_ips
        .iter()
        .all(|ip| ranges.iter().any(|net| net.contains(ip)))
}

/// Derive the source address the kernel would use to reach `dst`, via a
/// connected (but never written) UDP socket.
pub fn source_ip_for(dst: IpAddr) -> Result<IpAddr> {
    let bind_addr: SocketAddr = if dst.is_ipv6() {
        "[::]:0".parse().expect("valid literal")
    } else {
        "0.0.0.0:0".parse().expect("valid literal")
    };

    let socket = UdpSocket::bind(bind_addr)?;
    socket.connect(SocketAddr::new(dst, 53))?;
    Ok(socket.local_addr()?.ip())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_resolver_addr() {
        assert_eq!(
            parse_resolver_addr("1.1.1.1:53").unwrap(),
            "1.1.1.1:53".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            parse_resolver_addr("8.8.8.8").unwrap(),
            "8.8.8.8:53".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            parse_resolver_addr("[2001:4860:4860::8888]:53").unwrap().port(),
            53
        );
        assert!(parse_resolver_addr("not-an-ip").is_err());
    }

    #[test]
    fn test_check_intersect() {
        let ranges: Vec<IpNet> = vec!["10.0.0.0/8".parse().unwrap()];
        let inside: IpAddr = "10.1.2.3".parse().unwrap();
        let outside: IpAddr = "192.0.2.1".parse().unwrap();

        assert!(check_intersect(&[inside], &ranges));
        assert!(!check_intersect(&[inside, outside], &ranges));
    }

    #[test]
    fn test_source_ip_for_loopback() {
        let src = source_ip_for("127.0.0.1".parse().unwrap()).unwrap();
        assert!(src.is_loopback());
    }

    #[tokio::test]
    async fn test_lookup_literal_ip_bypasses_resolution() {
        let resolver = ProbeResolver::new(Some("203.0.113.1:53"), Duration::from_millis(10))
            .unwrap();
        // A literal never touches the (blackholed) server.
        let ips = resolver
            .lookup("192.0.2.7", InetFamilyPreference::Dual)
            .await
            .unwrap();
        assert_eq!(ips, vec!["192.0.2.7".parse::<IpAddr>().unwrap()]);

        // Family mismatch on a literal is an error, not a fallback.
        assert!(resolver
            .lookup("192.0.2.7", InetFamilyPreference::V6)
            .await
            .is_err());
    }
}
