//! Error types for Globalping.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Result type alias for Globalping operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Globalping.
#[derive(Error, Debug)]
pub enum Error {
    // Transport errors
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("connection failed to {addr}: {reason}")]
    ConnectionFailed { addr: SocketAddr, reason: String },

    #[error("connection closed")]
    ConnectionClosed,

    #[error("connection timeout")]
    ConnectionTimeout,

    // Protocol errors
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    // Probe errors
    #[error("probe error: {0}")]
    Probe(#[from] ProbeError),

    // Input / validation errors
    #[error("invalid CIDR: {0}")]
    InvalidCidr(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    // Authentication errors
    #[error("authentication failed: {0}")]
    Authentication(String),

    // Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // General errors
    #[error("internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Transport layer errors.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("bind failed on {addr}: {reason}")]
    BindFailed { addr: SocketAddr, reason: String },

    #[error("raw socket open failed: {0}")]
    RawSocketOpen(String),

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    #[error("socket error: {0}")]
    SocketError(String),

    #[error("QUIC error: {0}")]
    Quic(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("MTU exceeded: packet size {size}, max {max}")]
    MtuExceeded { size: usize, max: usize },
}

/// Wire format parsing and session protocol errors.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    #[error("unknown IP version: {0}")]
    UnknownIpVersion(u8),

    #[error("unknown ICMP type: {0}")]
    UnknownIcmpType(u8),

    #[error("unknown embedded protocol: {0}")]
    UnknownEmbeddedProtocol(u8),

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("unexpected frame: expected {expected}, got {got}")]
    UnexpectedFrame { expected: String, got: String },

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Probe execution errors.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("no IP available for host: {0}")]
    NoAddress(String),

    #[error("resolve failed for {host}: {reason}")]
    ResolveFailed { host: String, reason: String },

    #[error("destination {0} is outside the respond range")]
    OutOfRespondRange(String),

    #[error("domain {0} does not match any respond pattern")]
    DomainNotAllowed(String),

    #[error("no agent matches the requested attributes")]
    NoMatchingAgent,

    #[error("probe request invalid: {0}")]
    InvalidRequest(String),

    #[error("HTTP transport failed: {0}")]
    HttpTransport(String),

    #[error("DNS lookup failed: {0}")]
    DnsLookup(String),
}

impl Error {
    /// A send failure that the caller may retry with a smaller payload.
    pub fn is_message_too_long(&self) -> bool {
        match self {
            Error::Io(e) => e
                .raw_os_error()
                .is_some_and(|code| code == libc::EMSGSIZE),
            Error::Transport(TransportError::SendFailed(msg)) => {
                msg.contains("message too long")
            }
            _ => false,
        }
    }

    /// Check if the session should be re-established on the next tick.
    pub fn should_reconnect(&self) -> bool {
        matches!(
            self,
            Error::ConnectionClosed
                | Error::ConnectionTimeout
                | Error::ConnectionFailed { .. }
                | Error::Transport(TransportError::Quic(_))
                | Error::Protocol(ProtocolError::UnexpectedFrame { .. })
        )
    }
}
