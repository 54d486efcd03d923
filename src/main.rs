//! Globalping CLI: hub, agent, and local probe tools.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;

use globalping::cli::{Cli, Commands, JwtCommands, TcpingArgs, TraceArgs};
use globalping::config::{init_logging, Config, LoggingConfig};
use globalping::error::Result;
use globalping::probe::pinger::{Pinger, PingerContext, SimplePinger, TcpSynPinger};
use globalping::probe::{L4PacketType, SimplePingRequest};
use globalping::session::auth;
use globalping::util::ProbeResolver;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_config = LoggingConfig {
        level: cli.log_level.clone(),
        color: !cli.no_color,
        ..Default::default()
    };
    init_logging(&log_config)?;

    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    match cli.command {
        Commands::Agent(args) => {
            args.apply(&mut config);
            config.validate()?;

            let cancel = CancellationToken::new();
            tokio::spawn(shutdown_on_signal(cancel.clone()));
            globalping::agent::run_agent(config, cancel).await?;
            info!("agent shut down cleanly");
            Ok(())
        }
        Commands::Hub(args) => {
            args.apply(&mut config);
            config.validate()?;

            let cancel = CancellationToken::new();
            tokio::spawn(shutdown_on_signal(cancel.clone()));
            globalping::hub::run_hub(config.hub, cancel).await?;
            info!("hub shut down cleanly");
            Ok(())
        }
        Commands::Jwt(args) => match args.command {
            JwtCommands::Sign(sign) => {
                let secret = auth::secret_from(
                    Some(sign.jwt_auth_secret_from_env.as_str()),
                    sign.jwt_auth_secret_from_file.as_deref(),
                )?;
                let token = auth::sign_token(&secret, &sign.issuer, &sign.subject)?;
                println!("{token}");
                Ok(())
            }
        },
        Commands::Trace(args) => Ok(run_trace(args).await?),
        Commands::Tcping(args) => Ok(run_tcping(args).await?),
    }
}

/// Cancel the root context on SIGINT/SIGTERM; exit code stays zero.
async fn shutdown_on_signal(cancel: CancellationToken) {
    let ctrl_c = signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => info!("received SIGINT, shutting down"),
            _ = terminate.recv() => info!("received SIGTERM, shutting down"),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
        info!("received interrupt, shutting down");
    }

    cancel.cancel();
}

fn local_context() -> Result<PingerContext> {
    Ok(PingerContext {
        rate_limiter: None,
        respond_range: Arc::new(vec![]),
        resolver: Arc::new(ProbeResolver::new(None, Duration::from_secs(10))?),
        ipinfo: None,
        metadata: HashMap::new(),
    })
}

/// Local traceroute: print each event as one JSON line.
async fn run_trace(args: TraceArgs) -> Result<()> {
    let request = SimplePingRequest {
        destination: args.host,
        intv_ms: Some(args.interval.as_millis() as u64),
        pkt_timeout_ms: Some(args.pkt_timeout.as_millis() as u64),
        total_pkts: Some(args.max_hops),
        prefer_v4: args.prefer_v4.then_some(true),
        prefer_v6: args.prefer_v6.then_some(true),
        l4_packet_type: args.udp.then_some(L4PacketType::Udp),
        ..Default::default()
    };

    let pinger = SimplePinger {
        request,
        ctx: local_context()?,
    };
    print_events(&pinger).await
}

/// Local TCP SYN ping: print each event as one JSON line.
async fn run_tcping(args: TcpingArgs) -> Result<()> {
    let request = SimplePingRequest {
        destination: args.hostport,
        intv_ms: Some(args.interval.as_millis() as u64),
        pkt_timeout_ms: Some(args.pkt_timeout.as_millis() as u64),
        total_pkts: Some(args.count),
        prefer_v4: args.prefer_v4.then_some(true),
        prefer_v6: args.prefer_v6.then_some(true),
        l4_packet_type: Some(L4PacketType::Tcp),
        ..Default::default()
    };

    let pinger = TcpSynPinger {
        request,
        ctx: local_context()?,
    };
    print_events(&pinger).await
}

async fn print_events(pinger: &dyn Pinger) -> Result<()> {
    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_on_signal(cancel.clone()));

    let mut events = pinger.ping(cancel);
    while let Some(event) = events.recv().await {
        match serde_json::to_string(&event) {
            Ok(line) => println!("{line}"),
            Err(e) => eprintln!("failed to render event: {e}"),
        }
    }
    Ok(())
}
