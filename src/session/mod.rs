//! Agent↔Hub QUIC session.
//!
//! One QUIC connection (ALPN `h3`) carries symmetric request streams: the
//! agent opens the long-lived registration stream, the hub opens one
//! bidirectional stream per dispatched task. Frames on every stream are
//! newline-delimited JSON. Authentication is either mTLS (the peer
//! certificate is validated against the configured CA pool) or a JWT
//! bearer presented as the first registration frame.

pub mod auth;
pub mod frames;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use quinn::crypto::rustls::{QuicClientConfig, QuicServerConfig};
use rustls::server::WebPkiClientVerifier;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::codec::{FramedRead, LinesCodec};

use crate::error::{Error, ProtocolError, Result, TransportError};
use crate::ALPN_H3;

/// Frames above this size are protocol violations.
const MAX_FRAME_LEN: usize = 1024 * 1024;

/// QUIC keep-alive; well under the 60 s session watchdog.
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(10);

/// Connection idle limit enforced by the transport itself.
const MAX_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// How the hub authenticates connecting agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerAuthMode {
    /// Require and verify a client certificate.
    Mtls,
    /// No client certificate; a JWT must arrive on the registration stream.
    Jwt,
}

fn transport_config() -> Arc<quinn::TransportConfig> {
    let mut transport = quinn::TransportConfig::default();
    transport
        .keep_alive_interval(Some(KEEP_ALIVE_INTERVAL))
        .max_idle_timeout(Some(
            quinn::IdleTimeout::try_from(MAX_IDLE_TIMEOUT).expect("valid idle timeout"),
        ));
    Arc::new(transport)
}

/// Build a client endpoint. `peer_ca` verifies the hub's certificate
/// (webpki roots when empty); `client_cert` is presented for mTLS.
pub fn client_endpoint(
    peer_ca: &[PathBuf],
    client_cert: Option<(&std::path::Path, &std::path::Path)>,
    ipv6: bool,
) -> Result<quinn::Endpoint> {
    let roots = if peer_ca.is_empty() {
        let mut store = rustls::RootCertStore::empty();
        store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        store
    } else {
        auth::load_ca_pool(peer_ca)?
    };

    let builder = rustls::ClientConfig::builder().with_root_certificates(roots);
    let mut tls = match client_cert {
        Some((cert_path, key_path)) => {
            let (certs, key) = auth::load_cert_pair(cert_path, key_path)?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| TransportError::Tls(format!("client cert rejected: {e}")))?
        }
        None => builder.with_no_client_auth(),
    };
    tls.alpn_protocols = vec![ALPN_H3.to_vec()];

    let quic_tls = QuicClientConfig::try_from(tls)
        .map_err(|e| TransportError::Tls(format!("quic client config: {e}")))?;
    let mut client_config = quinn::ClientConfig::new(Arc::new(quic_tls));
    client_config.transport_config(transport_config());

    let bind: SocketAddr = if ipv6 {
        "[::]:0".parse().expect("valid literal")
    } else {
        "0.0.0.0:0".parse().expect("valid literal")
    };
    let mut endpoint = quinn::Endpoint::client(bind)
        .map_err(|e| TransportError::Quic(format!("client endpoint: {e}")))?;
    endpoint.set_default_client_config(client_config);
    Ok(endpoint)
}

/// Connect to the hub and wait for the handshake.
pub async fn connect(
    endpoint: &quinn::Endpoint,
    addr: SocketAddr,
    server_name: &str,
) -> Result<quinn::Connection> {
    endpoint
        .connect(addr, server_name)
        .map_err(|e| Error::Transport(TransportError::Quic(format!("connect: {e}"))))?
        .await
        .map_err(|e| Error::ConnectionFailed {
            addr,
            reason: e.to_string(),
        })
}

/// Build a server endpoint bound to `listen`. Without configured
/// certificates a self-signed one is generated (useful for tests and
/// trial deployments; agents then need the matching CA or a pinned cert).
pub fn server_endpoint(
    listen: SocketAddr,
    cert_pair: Option<(&std::path::Path, &std::path::Path)>,
    peer_ca: &[PathBuf],
    mode: ServerAuthMode,
) -> Result<quinn::Endpoint> {
    let (certs, key) = match cert_pair {
        Some((cert_path, key_path)) => auth::load_cert_pair(cert_path, key_path)?,
        None => auth::self_signed_cert(vec!["localhost".into()])?,
    };

    let builder = rustls::ServerConfig::builder();
    let mut tls = match mode {
        ServerAuthMode::Mtls => {
            let roots = auth::load_ca_pool(peer_ca)?;
            let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
                .build()
                .map_err(|e| TransportError::Tls(format!("client verifier: {e}")))?;
            builder
                .with_client_cert_verifier(verifier)
                .with_single_cert(certs, key)
                .map_err(|e| TransportError::Tls(format!("server cert rejected: {e}")))?
        }
        ServerAuthMode::Jwt => builder
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| TransportError::Tls(format!("server cert rejected: {e}")))?,
    };
    tls.alpn_protocols = vec![ALPN_H3.to_vec()];

    let quic_tls = QuicServerConfig::try_from(tls)
        .map_err(|e| TransportError::Tls(format!("quic server config: {e}")))?;
    let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(quic_tls));
    server_config.transport_config(transport_config());

    quinn::Endpoint::server(server_config, listen)
        .map_err(|e| TransportError::BindFailed {
            addr: listen,
            reason: e.to_string(),
        }.into())
}

/// Write one value as a JSON line and flush it, so the peer can relay
/// incrementally.
pub async fn write_frame<T: Serialize>(
    send: &mut quinn::SendStream,
    value: &T,
) -> Result<()> {
    let mut line = serde_json::to_vec(value)
        .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
    line.push(b'\n');
    send.write_all(&line)
        .await
        .map_err(|e| TransportError::SendFailed(e.to_string()))?;
    Ok(())
}

/// Line-framed reader over a QUIC receive stream.
pub struct FrameReader {
    framed: FramedRead<quinn::RecvStream, LinesCodec>,
}

impl FrameReader {
    pub fn new(recv: quinn::RecvStream) -> Self {
        Self {
            framed: FramedRead::new(recv, LinesCodec::new_with_max_length(MAX_FRAME_LEN)),
        }
    }

    /// Next raw line; `None` when the stream finished cleanly.
    pub async fn next_line(&mut self) -> Result<Option<String>> {
        match self.framed.next().await {
            Some(Ok(line)) => Ok(Some(line)),
            Some(Err(e)) => Err(ProtocolError::MalformedFrame(e.to_string()).into()),
            None => Ok(None),
        }
    }

    /// Next line decoded as `T`. Empty lines are skipped.
    pub async fn next_frame<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        loop {
            let Some(line) = self.next_line().await? else {
                return Ok(None);
            };
            if line.trim().is_empty() {
                continue;
            }
            return serde_json::from_str(&line)
                .map(Some)
                .map_err(|e| ProtocolError::MalformedFrame(e.to_string()).into());
        }
    }
}
