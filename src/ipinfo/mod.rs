//! IP metadata (geo/ASN) lookup dispatch.
//!
//! Providers implement [`IpInfoProvider`]; the [`AutoIpInfoDispatcher`]
//! holds a longest-prefix table of providers and routes each lookup to the
//! provider registered for the deepest prefix covering the address, so DN42
//! space and the public internet resolve through different backends.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::routing::PrefixRouter;

/// Latitude/longitude pair attached to replies when the provider knows the
/// exact location.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExactLocation {
    pub lat: f64,
    pub lon: f64,
}

/// Metadata a provider can attach to a peer address.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BasicIpInfo {
    pub asn: Option<String>,
    pub location: Option<String>,
    pub isp: Option<String>,
    pub exact_location: Option<ExactLocation>,
}

/// A source of IP metadata.
#[async_trait]
pub trait IpInfoProvider: Send + Sync {
    async fn get_ip_info(&self, addr: IpAddr) -> Result<BasicIpInfo>;
    fn name(&self) -> &str;
}

/// A provider backed by a fixed table. Used for tests and for deployments
/// that ship their own mapping instead of querying an external service.
pub struct StaticIpInfoProvider {
    name: String,
    entries: HashMap<IpAddr, BasicIpInfo>,
}

impl StaticIpInfoProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: HashMap::new(),
        }
    }

    pub fn with_entry(mut self, addr: IpAddr, info: BasicIpInfo) -> Self {
        self.entries.insert(addr, info);
        self
    }
}

#[async_trait]
impl IpInfoProvider for StaticIpInfoProvider {
    async fn get_ip_info(&self, addr: IpAddr) -> Result<BasicIpInfo> {
        Ok(self.entries.get(&addr).cloned().unwrap_or_default())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Dispatches lookups to the provider owning the longest matching prefix.
///
/// The route table is populated once at construction and never mutated
/// afterwards, so lookups need no synchronisation.
pub struct AutoIpInfoDispatcher {
    router: PrefixRouter<Arc<dyn IpInfoProvider>>,
}

impl AutoIpInfoDispatcher {
    pub fn new() -> Self {
        Self {
            router: PrefixRouter::new(),
        }
    }

    /// Register DN42 space against `dn42` and everything else against
    /// `internet`.
    pub fn with_default_routes(
        dn42: Arc<dyn IpInfoProvider>,
        internet: Arc<dyn IpInfoProvider>,
    ) -> Result<Self> {
        let mut dispatcher = Self::new();
        dispatcher.add_route("172.20.0.0/14", Arc::clone(&dn42))?;
        dispatcher.add_route("fd00::/8", Arc::clone(&dn42))?;
        dispatcher.add_route("10.127.0.0/16", dn42)?;
        dispatcher.add_route("0.0.0.0/0", Arc::clone(&internet))?;
        dispatcher.add_route("::/0", internet)?;
        Ok(dispatcher)
    }

    pub fn add_route(&mut self, cidr: &str, provider: Arc<dyn IpInfoProvider>) -> Result<()> {
        self.router.add_route(cidr, provider)
    }

    /// Pick the provider for `addr` and perform the lookup.
    pub async fn get_ip_info(&self, addr: IpAddr) -> Result<BasicIpInfo> {
        let provider = self
            .router
            .lookup(addr)
            .ok_or_else(|| Error::Internal(format!("no ipinfo provider routes {addr}")))?;
        provider.get_ip_info(addr).await
    }

    /// Which provider would serve `addr`, for diagnostics.
    pub fn provider_for(&self, addr: IpAddr) -> Option<&str> {
        self.router.lookup(addr).map(|p| p.name())
    }
}

impl Default for AutoIpInfoDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dispatcher() -> AutoIpInfoDispatcher {
        let dn42: Arc<dyn IpInfoProvider> = Arc::new(StaticIpInfoProvider::new("dn42"));
        let internet: Arc<dyn IpInfoProvider> =
            Arc::new(StaticIpInfoProvider::new("internet").with_entry(
                "1.1.1.1".parse().unwrap(),
                BasicIpInfo {
                    asn: Some("AS13335".into()),
                    location: Some("AU".into()),
                    isp: Some("Cloudflare".into()),
                    exact_location: None,
                },
            ));
        AutoIpInfoDispatcher::with_default_routes(dn42, internet).unwrap()
    }

    #[test]
    fn test_dn42_space_routes_to_dn42_provider() {
        let d = dispatcher();
        assert_eq!(d.provider_for("172.22.0.1".parse().unwrap()), Some("dn42"));
        assert_eq!(d.provider_for("fd42::1".parse().unwrap()), Some("dn42"));
        assert_eq!(d.provider_for("10.127.8.8".parse().unwrap()), Some("dn42"));
        assert_eq!(d.provider_for("9.9.9.9".parse().unwrap()), Some("internet"));
        assert_eq!(
            d.provider_for("2606:4700::1".parse().unwrap()),
            Some("internet")
        );
    }

    #[tokio::test]
    async fn test_lookup_goes_through_routed_provider() {
        let d = dispatcher();
        let info = d.get_ip_info("1.1.1.1".parse().unwrap()).await.unwrap();
        assert_eq!(info.asn.as_deref(), Some("AS13335"));

        // Unknown address on the static provider yields empty metadata.
        let info = d.get_ip_info("8.8.8.8".parse().unwrap()).await.unwrap();
        assert!(info.asn.is_none());
    }
}
