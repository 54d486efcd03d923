//! Hub: accepts agent sessions over QUIC, tracks them in the registry,
//! and dispatches probe tasks.

pub mod api;
pub mod registry;

use std::time::Duration;

use quinn::Connection;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::HubConfig;
use crate::error::{Error, ProtocolError, Result};
use crate::probe::icmp::unix_millis;
use crate::probe::ProbeRequest;
use crate::session::frames::{EchoDirection, MessagePayload};
use crate::session::{self, auth, FrameReader, ServerAuthMode};

pub use registry::{ConnRegistry, ConnRegistryData};

/// Run the hub until cancelled: QUIC listeners (mTLS and/or JWT) plus the
/// public HTTP API.
pub async fn run_hub(config: HubConfig, cancel: CancellationToken) -> Result<()> {
    let registry = ConnRegistry::spawn(cancel.child_token());

    let jwt_secret = match (&config.jwt_secret_from_env, &config.jwt_secret_from_file) {
        (None, None) => None,
        (env, file) => Some(auth::secret_from(env.as_deref(), file.as_deref())?),
    };

    if config.quic_jwt_listen_addr.is_some() && jwt_secret.is_none() {
        return Err(Error::InvalidConfig(
            "JWT QUIC listener requires a configured JWT secret".into(),
        ));
    }

    let cert_pair = match (&config.server_cert, &config.server_cert_key) {
        (Some(cert), Some(key)) => Some((cert.clone(), key.clone())),
        _ => None,
    };

    let listeners = [
        (config.quic_mtls_listen_addr, ServerAuthMode::Mtls),
        (config.quic_jwt_listen_addr, ServerAuthMode::Jwt),
    ];
    for (listen, mode) in listeners {
        let Some(listen) = listen else { continue };
        let endpoint = session::server_endpoint(
            listen,
            cert_pair
                .as_ref()
                .map(|(cert, key)| (cert.as_path(), key.as_path())),
            &config.peer_ca,
            mode,
        )?;
        info!("hub listening on {listen} ({mode:?} auth)");

        let secret = match mode {
            ServerAuthMode::Jwt => jwt_secret.clone(),
            ServerAuthMode::Mtls => None,
        };
        tokio::spawn(accept_loop(
            endpoint,
            registry.clone(),
            config.session_timeout,
            secret,
            cancel.child_token(),
        ));
    }

    // An API listener failure is fatal; QUIC endpoints already bound above.
    let (err_tx, mut err_rx) = tokio::sync::mpsc::channel::<Error>(1);
    if let Some(listen) = config.public_http_listen_addr {
        let api = api::serve(
            listen,
            api::ApiState::new(registry.clone(), config.clone()),
            cancel.child_token(),
        );
        tokio::spawn(async move {
            if let Err(e) = api.await {
                let _ = err_tx.send(e).await;
            }
        });
    } else {
        drop(err_tx);
    }

    tokio::select! {
        () = cancel.cancelled() => Ok(()),
        failed = err_rx.recv() => match failed {
            Some(e) => {
                cancel.cancel();
                Err(e)
            }
            None => {
                cancel.cancelled().await;
                Ok(())
            }
        },
    }
}

async fn accept_loop(
    endpoint: quinn::Endpoint,
    registry: ConnRegistry,
    session_timeout: Duration,
    jwt_secret: Option<Vec<u8>>,
    cancel: CancellationToken,
) {
    loop {
        let incoming = tokio::select! {
            () = cancel.cancelled() => return,
            incoming = endpoint.accept() => match incoming {
                Some(incoming) => incoming,
                None => return,
            },
        };

        let registry = registry.clone();
        let jwt_secret = jwt_secret.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let connection = match incoming.await {
                Ok(connection) => connection,
                Err(e) => {
                    warn!("QUIC handshake failed: {e}");
                    return;
                }
            };
            handle_connection(connection, registry, session_timeout, jwt_secret, cancel).await;
        });
    }
}

async fn handle_connection(
    connection: Connection,
    registry: ConnRegistry,
    session_timeout: Duration,
    jwt_secret: Option<Vec<u8>>,
    cancel: CancellationToken,
) {
    let key = Uuid::new_v4().to_string();
    let remote = connection.remote_address();
    info!("agent connected from {remote} as {key}");

    if registry.open(&key, Some(connection.clone())).await.is_err() {
        return;
    }

    let result = serve_registration(
        &connection,
        &registry,
        &key,
        session_timeout,
        jwt_secret.as_deref(),
        &cancel,
    )
    .await;

    match result {
        Ok(()) => info!("session {key} closed"),
        Err(e) => warn!("session {key} closed: {e}"),
    }

    let _ = registry.close(&key).await;
    connection.close(0u32.into(), b"session closed");
}

/// Drive the agent-opened registration stream: handle frames, answer echo
/// pings, and enforce the no-frame watchdog.
async fn serve_registration(
    connection: &Connection,
    registry: &ConnRegistry,
    key: &str,
    session_timeout: Duration,
    jwt_secret: Option<&[u8]>,
    cancel: &CancellationToken,
) -> Result<()> {
    let (mut send, recv) = connection
        .accept_bi()
        .await
        .map_err(|e| Error::ConnectionFailed {
            addr: connection.remote_address(),
            reason: e.to_string(),
        })?;
    let mut reader = FrameReader::new(recv);

    // In JWT mode nothing is trusted until a valid bearer arrives.
    let mut authenticated = jwt_secret.is_none();

    let watchdog = tokio::time::sleep(session_timeout);
    tokio::pin!(watchdog);

    loop {
        let payload = tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            () = &mut watchdog => return Err(Error::ConnectionTimeout),
            frame = reader.next_frame::<MessagePayload>() => match frame? {
                Some(payload) => payload,
                None => return Ok(()),
            },
        };
        watchdog
            .as_mut()
            .reset(tokio::time::Instant::now() + session_timeout);

        if let Some(auth_payload) = &payload.auth {
            let Some(secret) = jwt_secret else {
                // Bearer frames on an mTLS listener are harmless; ignore.
                continue;
            };
            auth::verify_token(secret, &auth_payload.bearer)?;
            authenticated = true;
            continue;
        }

        if !authenticated {
            return Err(ProtocolError::UnexpectedFrame {
                expected: "auth".into(),
                got: "unauthenticated payload".into(),
            }
            .into());
        }

        if let Some(register) = &payload.register {
            registry.register(key, &register.node_name).await?;
        }

        if let Some(echo) = &payload.echo {
            if echo.direction == EchoDirection::Ping {
                registry.update_heartbeat(key).await?;
                let pong = MessagePayload::echo(echo.pong(unix_millis()));
                session::write_frame(&mut send, &pong).await?;
            }
        }

        if let Some(announcement) = payload.attributes_announcement {
            registry.set_attributes(key, announcement).await?;
        }
    }
}

/// Open a dispatch stream on an agent session: one request line out, a
/// newline-JSON `PingEvent` stream back.
pub async fn dispatch_probe(
    connection: &Connection,
    request: &ProbeRequest,
) -> Result<FrameReader> {
    let (mut send, recv) = connection
        .open_bi()
        .await
        .map_err(|e| Error::ConnectionFailed {
            addr: connection.remote_address(),
            reason: e.to_string(),
        })?;

    session::write_frame(&mut send, request).await?;
    // No more request data; the agent streams events until it closes.
    let _ = send.finish();

    Ok(FrameReader::new(recv))
}
