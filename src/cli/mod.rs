//! Command-line interface.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::config::{Config, RespondRangePolicy};

/// Globalping - distributed active network measurement
#[derive(Parser, Debug)]
#[command(
    name = "globalping",
    author,
    version,
    about = "Distributed active network measurement: hub, agents, and local probe tools",
    long_about = r#"
Globalping dispatches measurement tasks (ICMP/UDP traceroute, TCP SYN ping,
HTTP probe, DNS probe) from a central hub to agents on arbitrary networks.
Agents execute the probes over raw sockets and stream structured events
back over QUIC.

QUICK START:
  Hub:    globalping hub --public-http-listen-address 0.0.0.0:8080 \
                         --jwt-quic-listen-address 0.0.0.0:18448
  Agent:  globalping agent --node-name my-node \
                           --hub-addr hub.example.com:18448
  Local:  globalping trace --host www.example.com
"#
)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true, default_value = "info")]
    pub log_level: String,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a measurement agent
    Agent(AgentArgs),

    /// Run the coordination hub
    Hub(HubArgs),

    /// JWT utilities
    Jwt(JwtArgs),

    /// Trace the path to a host locally (ICMP or UDP)
    Trace(TraceArgs),

    /// TCP SYN ping a host:port locally
    Tcping(TcpingArgs),
}

/// Agent command arguments
#[derive(Args, Debug)]
pub struct AgentArgs {
    /// Node name to advertise; empty disables hub registration
    #[arg(long, default_value = "")]
    pub node_name: String,

    /// QUIC endpoint of the hub
    #[arg(long)]
    pub hub_addr: Option<String>,

    /// TLS name used to verify the hub certificate
    #[arg(long)]
    pub server_name: Option<String>,

    /// Address for the mTLS-protected local probe endpoint
    #[arg(long)]
    pub tls_listen_address: Option<SocketAddr>,

    /// Address for plaintext HTTP probes (debugging only)
    #[arg(long)]
    pub http_listen_address: Option<SocketAddr>,

    /// Address for Prometheus metrics, e.g. :2112
    #[arg(long)]
    pub metrics_listen_address: Option<SocketAddr>,

    /// Path of the metrics endpoint
    #[arg(long, default_value = "/metrics")]
    pub metrics_path: String,

    /// CA files used to verify peer certificates (repeatable)
    #[arg(long = "peer-ca")]
    pub peer_ca: Vec<PathBuf>,

    /// Client certificate presented to the hub
    #[arg(long)]
    pub client_cert: Option<PathBuf>,
    #[arg(long)]
    pub client_cert_key: Option<PathBuf>,

    /// Server certificate for the local TLS endpoint
    #[arg(long)]
    pub server_cert: Option<PathBuf>,
    #[arg(long)]
    pub server_cert_key: Option<PathBuf>,

    /// Environment variable holding the JWT bearer token
    #[arg(long, default_value = "JWT_TOKEN")]
    pub jwt_token_from_env: String,

    /// File holding the JWT bearer token
    #[arg(long)]
    pub jwt_token_from_file: Option<PathBuf>,

    /// Interval between registration ticks (minimum 1s)
    #[arg(long, default_value = "5s", value_parser = humantime::parse_duration)]
    pub tick_interval: Duration,

    /// Reconnect when the hub sends no frame within this window
    #[arg(long, default_value = "60s", value_parser = humantime::parse_duration)]
    pub session_timeout: Duration,

    /// CIDRs this agent will respond to (repeatable; empty = all)
    #[arg(long = "respond-range")]
    pub respond_range: Vec<String>,

    /// Regex patterns limiting probed domains (repeatable)
    #[arg(long = "domain-respond-range")]
    pub domain_respond_range: Vec<String>,

    /// Declare support for UDP traceroute
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub support_udp: bool,
    /// Declare support for PMTU discovery
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub support_pmtu: bool,
    /// Declare support for TCP-flavored ping
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub support_tcp: bool,
    /// Declare support for DNS probing
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub support_dns: bool,

    /// Shared outbound rate limit (packets per refresh interval)
    #[arg(long, default_value_t = 100)]
    pub shared_outbound_ratelimit: u32,

    /// Refresh interval of the shared outbound rate limit
    #[arg(long, default_value = "1s", value_parser = humantime::parse_duration)]
    pub shared_outbound_ratelimit_refresh_interval: Duration,

    /// Advertised HTTP endpoint URL
    #[arg(long)]
    pub http_endpoint: Option<String>,

    /// Advertised exact location, `<lat>,<lon>`
    #[arg(long)]
    pub exact_location_lat_lon: Option<String>,

    /// Advertised ISO-3166 alpha-2 country code
    #[arg(long)]
    pub country_code: Option<String>,

    /// Advertised city name
    #[arg(long)]
    pub city_name: Option<String>,

    /// Advertised ASN, e.g. AS65001
    #[arg(long)]
    pub asn: Option<String>,

    /// Advertised ISP name
    #[arg(long)]
    pub isp: Option<String>,

    /// Advertised DN42 ASN
    #[arg(long)]
    pub dn42_asn: Option<String>,

    /// Advertised DN42 ISP
    #[arg(long)]
    pub dn42_isp: Option<String>,
}

impl AgentArgs {
    /// Overlay these arguments onto a loaded configuration.
    pub fn apply(self, config: &mut Config) {
        let agent = &mut config.agent;
        if !self.node_name.is_empty() {
            agent.node_name = self.node_name;
        }
        if self.hub_addr.is_some() {
            agent.hub_addr = self.hub_addr;
        }
        if self.server_name.is_some() {
            agent.server_name = self.server_name;
        }
        if self.tls_listen_address.is_some() {
            agent.tls_listen_addr = self.tls_listen_address;
        }
        if self.http_listen_address.is_some() {
            agent.http_listen_addr = self.http_listen_address;
        }
        if self.metrics_listen_address.is_some() {
            agent.metrics_listen_addr = self.metrics_listen_address;
        }
        agent.metrics_path = self.metrics_path;
        if !self.peer_ca.is_empty() {
            agent.peer_ca = self.peer_ca;
        }
        if self.client_cert.is_some() {
            agent.client_cert = self.client_cert;
        }
        if self.client_cert_key.is_some() {
            agent.client_cert_key = self.client_cert_key;
        }
        if self.server_cert.is_some() {
            agent.server_cert = self.server_cert;
        }
        if self.server_cert_key.is_some() {
            agent.server_cert_key = self.server_cert_key;
        }
        agent.jwt_token_from_env = self.jwt_token_from_env;
        if self.jwt_token_from_file.is_some() {
            agent.jwt_token_from_file = self.jwt_token_from_file;
        }
        agent.tick_interval = self.tick_interval;
        agent.session_timeout = self.session_timeout;
        if !self.respond_range.is_empty() {
            agent.respond_range = self.respond_range;
        }
        if !self.domain_respond_range.is_empty() {
            agent.domain_respond_range = self.domain_respond_range;
        }
        agent.support_udp = self.support_udp;
        agent.support_pmtu = self.support_pmtu;
        agent.support_tcp = self.support_tcp;
        agent.support_dns = self.support_dns;
        if self.http_endpoint.is_some() {
            agent.http_endpoint = self.http_endpoint;
        }
        if self.exact_location_lat_lon.is_some() {
            agent.exact_location = self.exact_location_lat_lon;
        }
        if self.country_code.is_some() {
            agent.country_code = self.country_code;
        }
        if self.city_name.is_some() {
            agent.city_name = self.city_name;
        }
        if self.asn.is_some() {
            agent.asn = self.asn;
        }
        if self.isp.is_some() {
            agent.isp = self.isp;
        }
        if self.dn42_asn.is_some() {
            agent.dn42_asn = self.dn42_asn;
        }
        if self.dn42_isp.is_some() {
            agent.dn42_isp = self.dn42_isp;
        }

        config.ratelimit.tokens_per_key = self.shared_outbound_ratelimit;
        config.ratelimit.refresh_interval = self.shared_outbound_ratelimit_refresh_interval;
    }
}

/// Hub command arguments
#[derive(Args, Debug)]
pub struct HubArgs {
    /// Address for the public HTTP API
    #[arg(long)]
    pub public_http_listen_address: Option<SocketAddr>,

    /// Address for mTLS-authenticated QUIC sessions
    #[arg(long)]
    pub mtls_quic_listen_address: Option<SocketAddr>,

    /// Address for JWT-authenticated QUIC sessions
    #[arg(long)]
    pub jwt_quic_listen_address: Option<SocketAddr>,

    /// Close sessions silent for longer than this
    #[arg(long, default_value = "60s", value_parser = humantime::parse_duration)]
    pub session_timeout: Duration,

    /// Server certificate pair
    #[arg(long)]
    pub server_cert: Option<PathBuf>,
    #[arg(long)]
    pub server_cert_key: Option<PathBuf>,

    /// CA files used to verify agent certificates (repeatable)
    #[arg(long = "peer-ca")]
    pub peer_ca: Vec<PathBuf>,

    /// Environment variable holding the JWT HS256 secret
    #[arg(long)]
    pub jwt_auth_secret_from_env: Option<String>,

    /// File holding the JWT HS256 secret
    #[arg(long)]
    pub jwt_auth_secret_from_file: Option<PathBuf>,

    /// Resolver for expanding task destinations
    #[arg(long)]
    pub resolver_address: Option<String>,

    /// Policy for targets outside an agent's respond range
    #[arg(long, value_enum, default_value = "allow")]
    pub out_of_respond_range_policy: PolicyArg,

    /// Minimum packet interval enforced on tasks
    #[arg(long, value_parser = humantime::parse_duration)]
    pub min_pkt_interval: Option<Duration>,

    /// Maximum packet timeout enforced on tasks
    #[arg(long, value_parser = humantime::parse_duration)]
    pub max_pkt_timeout: Option<Duration>,

    /// Maximum packets per task
    #[arg(long)]
    pub pkt_count_clamp: Option<u32>,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
pub enum PolicyArg {
    Allow,
    Deny,
}

impl HubArgs {
    pub fn apply(self, config: &mut Config) {
        let hub = &mut config.hub;
        if self.public_http_listen_address.is_some() {
            hub.public_http_listen_addr = self.public_http_listen_address;
        }
        if self.mtls_quic_listen_address.is_some() {
            hub.quic_mtls_listen_addr = self.mtls_quic_listen_address;
        }
        if self.jwt_quic_listen_address.is_some() {
            hub.quic_jwt_listen_addr = self.jwt_quic_listen_address;
        }
        hub.session_timeout = self.session_timeout;
        if self.server_cert.is_some() {
            hub.server_cert = self.server_cert;
        }
        if self.server_cert_key.is_some() {
            hub.server_cert_key = self.server_cert_key;
        }
        if !self.peer_ca.is_empty() {
            hub.peer_ca = self.peer_ca;
        }
        if self.jwt_auth_secret_from_env.is_some() {
            hub.jwt_secret_from_env = self.jwt_auth_secret_from_env;
        }
        if self.jwt_auth_secret_from_file.is_some() {
            hub.jwt_secret_from_file = self.jwt_auth_secret_from_file;
        }
        if self.resolver_address.is_some() {
            hub.resolver_addr = self.resolver_address;
        }
        hub.out_of_respond_range_policy = match self.out_of_respond_range_policy {
            PolicyArg::Allow => RespondRangePolicy::Allow,
            PolicyArg::Deny => RespondRangePolicy::Deny,
        };
        if self.min_pkt_interval.is_some() {
            hub.min_pkt_interval = self.min_pkt_interval;
        }
        if self.max_pkt_timeout.is_some() {
            hub.max_pkt_timeout = self.max_pkt_timeout;
        }
        if self.pkt_count_clamp.is_some() {
            hub.pkt_count_clamp = self.pkt_count_clamp;
        }
    }
}

/// JWT utilities
#[derive(Args, Debug)]
pub struct JwtArgs {
    #[command(subcommand)]
    pub command: JwtCommands,
}

#[derive(Subcommand, Debug)]
pub enum JwtCommands {
    /// Sign a token with the shared secret
    Sign(JwtSignArgs),
}

#[derive(Args, Debug)]
pub struct JwtSignArgs {
    /// Token issuer
    #[arg(long, default_value = "globalping-hub")]
    pub issuer: String,

    /// Token subject
    #[arg(long, default_value = "administrator")]
    pub subject: String,

    /// Environment variable holding the secret
    #[arg(long, default_value = "JWT_SECRET")]
    pub jwt_auth_secret_from_env: String,

    /// File holding the secret
    #[arg(long)]
    pub jwt_auth_secret_from_file: Option<PathBuf>,
}

/// Local traceroute arguments
#[derive(Args, Debug)]
pub struct TraceArgs {
    /// Host to trace
    #[arg(long, default_value = "www.google.com")]
    pub host: String,

    /// Prefer IPv4
    #[arg(long)]
    pub prefer_v4: bool,

    /// Prefer IPv6
    #[arg(long)]
    pub prefer_v6: bool,

    /// Send UDP probes instead of ICMP echoes
    #[arg(long)]
    pub udp: bool,

    /// Maximum hops to probe
    #[arg(long, default_value_t = 30)]
    pub max_hops: u32,

    /// Per-packet timeout
    #[arg(long, default_value = "3s", value_parser = humantime::parse_duration)]
    pub pkt_timeout: Duration,

    /// Interval between probes
    #[arg(long, default_value = "1s", value_parser = humantime::parse_duration)]
    pub interval: Duration,
}

/// Local TCP SYN ping arguments
#[derive(Args, Debug)]
pub struct TcpingArgs {
    /// host:port to ping
    #[arg(long, default_value = "127.0.0.1:80")]
    pub hostport: String,

    /// Interval between pings
    #[arg(long, default_value = "1s", value_parser = humantime::parse_duration)]
    pub interval: Duration,

    /// Per-packet timeout
    #[arg(long, default_value = "3s", value_parser = humantime::parse_duration)]
    pub pkt_timeout: Duration,

    /// Number of SYNs to send
    #[arg(long, default_value_t = 4)]
    pub count: u32,

    /// Prefer IPv4
    #[arg(long)]
    pub prefer_v4: bool,

    /// Prefer IPv6
    #[arg(long)]
    pub prefer_v6: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_args_overlay() {
        let cli = Cli::parse_from([
            "globalping",
            "agent",
            "--node-name",
            "node-a",
            "--hub-addr",
            "hub.example.com:18448",
            "--respond-range",
            "10.0.0.0/8",
            "--respond-range",
            "172.20.0.0/14",
            "--shared-outbound-ratelimit",
            "50",
        ]);

        let Commands::Agent(args) = cli.command else {
            panic!("expected agent command");
        };

        let mut config = Config::default();
        args.apply(&mut config);
        assert_eq!(config.agent.node_name, "node-a");
        assert_eq!(config.agent.respond_range.len(), 2);
        assert_eq!(config.ratelimit.tokens_per_key, 50);
        assert_eq!(config.agent.tick_interval, Duration::from_secs(5));
        assert_eq!(config.agent.session_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_hub_args_overlay() {
        let cli = Cli::parse_from([
            "globalping",
            "hub",
            "--jwt-quic-listen-address",
            "0.0.0.0:18448",
            "--out-of-respond-range-policy",
            "deny",
            "--pkt-count-clamp",
            "20",
        ]);

        let Commands::Hub(args) = cli.command else {
            panic!("expected hub command");
        };

        let mut config = Config::default();
        args.apply(&mut config);
        assert_eq!(
            config.hub.quic_jwt_listen_addr,
            Some("0.0.0.0:18448".parse().unwrap())
        );
        assert_eq!(
            config.hub.out_of_respond_range_policy,
            RespondRangePolicy::Deny
        );
        assert_eq!(config.hub.pkt_count_clamp, Some(20));
    }

    #[test]
    fn test_trace_defaults() {
        let cli = Cli::parse_from(["globalping", "trace", "--host", "1.1.1.1", "--udp"]);
        let Commands::Trace(args) = cli.command else {
            panic!("expected trace command");
        };
        assert!(args.udp);
        assert_eq!(args.max_hops, 30);
    }
}
