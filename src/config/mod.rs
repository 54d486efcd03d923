//! Configuration management for Globalping.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Agent configuration.
    #[serde(default)]
    pub agent: AgentConfig,

    /// Hub configuration.
    #[serde(default)]
    pub hub: HubConfig,

    /// Shared outbound rate limit configuration.
    #[serde(default)]
    pub ratelimit: RateLimitConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("Failed to read config: {e}")))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path.as_ref(), content)
            .map_err(|e| Error::Config(format!("Failed to write config: {e}")))?;

        Ok(())
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.ratelimit.tokens_per_key == 0 {
            return Err(Error::InvalidConfig(
                "ratelimit.tokens_per_key must be at least 1".into(),
            ));
        }

        if self.ratelimit.refresh_interval.is_zero() {
            return Err(Error::InvalidConfig(
                "ratelimit.refresh_interval must be non-zero".into(),
            ));
        }

        if self.agent.tick_interval < MIN_TICK_INTERVAL {
            return Err(Error::InvalidConfig(format!(
                "agent.tick_interval must be at least {MIN_TICK_INTERVAL:?}"
            )));
        }

        Ok(())
    }
}

/// Lower bound for the agent registration tick.
pub const MIN_TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Node name to advertise to the hub; empty means do not register.
    #[serde(default)]
    pub node_name: String,

    /// QUIC endpoint of the hub.
    pub hub_addr: Option<String>,

    /// TLS server name used to verify the hub certificate.
    pub server_name: Option<String>,

    /// Address for the local TLS service endpoint.
    pub tls_listen_addr: Option<SocketAddr>,

    /// Address for the plaintext HTTP endpoint (debugging only).
    pub http_listen_addr: Option<SocketAddr>,

    /// Address for the Prometheus metrics endpoint.
    pub metrics_listen_addr: Option<SocketAddr>,

    /// Path of the Prometheus metrics endpoint.
    #[serde(default = "default_metrics_path")]
    pub metrics_path: String,

    /// CAs used to verify peer certificates.
    #[serde(default)]
    pub peer_ca: Vec<PathBuf>,

    /// Client certificate presented to the hub (mTLS).
    pub client_cert: Option<PathBuf>,
    pub client_cert_key: Option<PathBuf>,

    /// Server certificate for the local TLS endpoint.
    pub server_cert: Option<PathBuf>,
    pub server_cert_key: Option<PathBuf>,

    /// Environment variable holding the JWT bearer token.
    #[serde(default = "default_jwt_env")]
    pub jwt_token_from_env: String,

    /// File holding the JWT bearer token.
    pub jwt_token_from_file: Option<PathBuf>,

    /// Interval between registration agent ticks.
    #[serde(default = "default_tick_interval", with = "humantime_serde")]
    pub tick_interval: Duration,

    /// Watchdog: reconnect when the hub sends no frame within this window.
    #[serde(default = "default_session_timeout", with = "humantime_serde")]
    pub session_timeout: Duration,

    /// CIDR ranges this agent will respond to; empty means all.
    #[serde(default)]
    pub respond_range: Vec<String>,

    /// Regex patterns limiting the domains this agent will probe.
    #[serde(default)]
    pub domain_respond_range: Vec<String>,

    /// Capability flags.
    #[serde(default = "default_true")]
    pub support_udp: bool,
    #[serde(default = "default_true")]
    pub support_pmtu: bool,
    #[serde(default = "default_true")]
    pub support_tcp: bool,
    #[serde(default = "default_true")]
    pub support_dns: bool,

    /// Advertised location/identity attributes.
    pub http_endpoint: Option<String>,
    pub exact_location: Option<String>,
    pub country_code: Option<String>,
    pub city_name: Option<String>,
    pub asn: Option<String>,
    pub isp: Option<String>,
    pub dn42_asn: Option<String>,
    pub dn42_isp: Option<String>,
}

fn default_metrics_path() -> String {
    "/metrics".into()
}
fn default_jwt_env() -> String {
    "JWT_TOKEN".into()
}
fn default_tick_interval() -> Duration {
    Duration::from_secs(5)
}
fn default_true() -> bool {
    true
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            node_name: String::new(),
            hub_addr: None,
            server_name: None,
            tls_listen_addr: None,
            http_listen_addr: None,
            metrics_listen_addr: None,
            metrics_path: default_metrics_path(),
            peer_ca: vec![],
            client_cert: None,
            client_cert_key: None,
            server_cert: None,
            server_cert_key: None,
            jwt_token_from_env: default_jwt_env(),
            jwt_token_from_file: None,
            tick_interval: default_tick_interval(),
            session_timeout: default_session_timeout(),
            respond_range: vec![],
            domain_respond_range: vec![],
            support_udp: true,
            support_pmtu: true,
            support_tcp: true,
            support_dns: true,
            http_endpoint: None,
            exact_location: None,
            country_code: None,
            city_name: None,
            asn: None,
            isp: None,
            dn42_asn: None,
            dn42_isp: None,
        }
    }
}

/// Hub configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    /// Public (unauthenticated) HTTP API listen address.
    pub public_http_listen_addr: Option<SocketAddr>,

    /// mTLS-authenticated QUIC listen address.
    pub quic_mtls_listen_addr: Option<SocketAddr>,

    /// JWT-authenticated QUIC listen address.
    pub quic_jwt_listen_addr: Option<SocketAddr>,

    /// Watchdog timeout: close sessions with no frame within this window.
    #[serde(default = "default_session_timeout", with = "humantime_serde")]
    pub session_timeout: Duration,

    /// Server certificate pair.
    pub server_cert: Option<PathBuf>,
    pub server_cert_key: Option<PathBuf>,

    /// CAs used to verify agent client certificates.
    #[serde(default)]
    pub peer_ca: Vec<PathBuf>,

    /// Environment variable / file holding the JWT HS256 secret.
    pub jwt_secret_from_env: Option<String>,
    pub jwt_secret_from_file: Option<PathBuf>,

    /// Resolver used when expanding task destinations.
    pub resolver_addr: Option<String>,

    /// Policy when a task target is outside an agent's respond range.
    #[serde(default)]
    pub out_of_respond_range_policy: RespondRangePolicy,

    /// Clamps applied to dispatched tasks.
    #[serde(
        default,
        with = "humantime_serde::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub min_pkt_interval: Option<Duration>,
    #[serde(
        default,
        with = "humantime_serde::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub max_pkt_timeout: Option<Duration>,
    pub pkt_count_clamp: Option<u32>,
}

fn default_session_timeout() -> Duration {
    Duration::from_secs(60)
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            public_http_listen_addr: None,
            quic_mtls_listen_addr: None,
            quic_jwt_listen_addr: None,
            session_timeout: default_session_timeout(),
            server_cert: None,
            server_cert_key: None,
            peer_ca: vec![],
            jwt_secret_from_env: None,
            jwt_secret_from_file: None,
            resolver_addr: None,
            out_of_respond_range_policy: RespondRangePolicy::default(),
            min_pkt_interval: None,
            max_pkt_timeout: None,
            pkt_count_clamp: None,
        }
    }
}

/// What the hub does when a task target falls outside the chosen agent's
/// advertised respond range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RespondRangePolicy {
    #[default]
    Allow,
    Deny,
}

/// Shared outbound rate limit configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Tokens granted per key per refresh interval.
    #[serde(default = "default_tokens_per_key")]
    pub tokens_per_key: u32,

    /// Quota refresh interval.
    #[serde(default = "default_refresh_interval", with = "humantime_serde")]
    pub refresh_interval: Duration,
}

fn default_tokens_per_key() -> u32 {
    100
}
fn default_refresh_interval() -> Duration {
    Duration::from_secs(1)
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            tokens_per_key: default_tokens_per_key(),
            refresh_interval: default_refresh_interval(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (text or json).
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Enable colored output.
    #[serde(default = "default_color")]
    pub color: bool,
}

fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "text".into()
}
fn default_color() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            color: default_color(),
        }
    }
}

/// Initialize logging.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.format == "json" {
        subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| Error::Config(format!("Failed to init logging: {e}")))?;
    } else {
        subscriber
            .with(fmt::layer().with_ansi(config.color))
            .try_init()
            .map_err(|e| Error::Config(format!("Failed to init logging: {e}")))?;
    }

    Ok(())
}
