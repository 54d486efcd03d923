//! # Globalping
//!
//! Distributed active-network-measurement platform.
//!
//! A central hub dispatches measurement tasks (ICMP/UDP traceroute, TCP SYN
//! ping, HTTP probe, DNS probe) to a fleet of agents on arbitrary networks;
//! each agent executes the measurement against a target host using raw or
//! cooked sockets and streams structured events back over QUIC.
//!
//! ## Architecture
//!
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         Hub HTTP API                            │
//! ├─────────────────────────────────────────────────────────────────┤
//! │            Connection Registry / Attribute Search               │
//! ├─────────────────────────────────────────────────────────────────┤
//! │          QUIC Session (mTLS / JWT, symmetric streams)           │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                     Probe Dispatcher                            │
//! │  ┌──────────┐  ┌──────────┐  ┌──────────┐  ┌──────────┐         │
//! │  │ ICMP/UDP │  │ TCP SYN  │  │   DNS    │  │   HTTP   │         │
//! │  │  trace   │  │   ping   │  │  probe   │  │  probe   │         │
//! │  └──────────┘  └──────────┘  └──────────┘  └──────────┘         │
//! ├─────────────────────────────────────────────────────────────────┤
//! │        In-flight Tracker / Shared Token Rate Limiter            │
//! ├─────────────────────────────────────────────────────────────────┤
//! │               Raw Sockets (ICMPv4/v6, TCP over IP)              │
//! └─────────────────────────────────────────────────────────────────┘

#![warn(clippy::all, clippy::pedantic)]
// Allow stylistic lints that don't affect correctness
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::cast_possible_truncation)] // Header fields are range-checked before narrowing
#![allow(clippy::cast_sign_loss)]           // Timestamps and sizes are non-negative
#![allow(clippy::cast_precision_loss)]      // Acceptable for metrics
#![allow(clippy::doc_markdown)]             // ASCII diagrams in docs
#![allow(clippy::similar_names)]            // src/dst pairs are intentionally named
#![allow(clippy::too_many_lines)]           // Complete packet parsers
#![allow(clippy::struct_excessive_bools)]   // Capability flags are appropriate

pub mod agent;
pub mod cli;
pub mod config;
pub mod error;
pub mod hub;
pub mod ipinfo;
pub mod metrics;
pub mod packet;
pub mod probe;
pub mod ratelimit;
pub mod routing;
pub mod session;
pub mod types;
pub mod util;

pub use config::Config;
pub use error::{Error, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Fallback MTU when interface enumeration yields nothing
pub const STANDARD_MTU: usize = 1500;

/// Default UDP traceroute destination port base
pub const BASE_DST_PORT: u16 = 33433;

/// Default TTL for probe packets when the request leaves it unset
pub const DEFAULT_TTL: u8 = 64;

/// ALPN protocol for the hub/agent QUIC session
pub const ALPN_H3: &[u8] = b"h3";

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{Error, Result};
    pub use crate::probe::pinger::{PingEvent, PingEventKind, Pinger};
    pub use crate::probe::ProbeRequest;
    pub use crate::ratelimit::{RateLimitPool, RateLimiter};
    pub use crate::routing::PrefixRouter;
    pub use crate::types::{InetFamilyPreference, IpVersion, L4Proto};
}
