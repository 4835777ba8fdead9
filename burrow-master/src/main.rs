#![forbid(unsafe_code)]

//! Rendezvous server binary.

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use burrow_core::config::MasterConfig;
use burrow_master::{MasterServer, MasterServerConfig};
use burrow_transport::reactor::Reactor;

#[derive(Parser, Debug)]
#[command(name = "burrow-master", about = "Burrow rendezvous server")]
struct Args {
    /// TCP service port (UDP observation uses the same port and the next).
    #[arg(long)]
    port: Option<u16>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    log_level: Option<String>,

    /// Cap on concurrent connection requests per client.
    #[arg(long)]
    max_connections_for_client: Option<u32>,

    /// Optional TOML configuration file; flags override its values.
    #[arg(long)]
    config: Option<String>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut cfg = match &args.config {
        Some(path) => MasterConfig::from_file(path).context("cannot load configuration")?,
        None => MasterConfig::default(),
    };
    if let Some(port) = args.port {
        cfg.port = port;
    }
    if let Some(level) = &args.log_level {
        cfg.log_level = Some(level.clone());
    }
    if let Some(cap) = args.max_connections_for_client {
        cfg.max_connections_for_client = cap;
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(cfg.log_level.clone().unwrap_or_else(|| "info".into()))
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut reactor = Reactor::new().context("cannot create reactor")?;
    let handle = reactor.handle();

    let server = MasterServer::start(
        handle.clone(),
        MasterServerConfig {
            port: cfg.port,
            max_connections_for_client: cfg.max_connections_for_client,
        },
    )
    .context("cannot start rendezvous server")?;

    {
        let handle = handle.clone();
        ctrl_c_handler(move || {
            info!("shutdown requested");
            handle.stop();
        })?;
    }

    reactor.run();
    server.stop();
    info!("done");
    Ok(())
}

/// Minimal ctrl-c hook on a helper thread; the reactor owns the runtime.
fn ctrl_c_handler<F: FnOnce() + Send + 'static>(f: F) -> anyhow::Result<()> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .build()?;
    std::thread::Builder::new()
        .name("burrow-signals".into())
        .spawn(move || {
            let _ = rt.block_on(tokio::signal::ctrl_c());
            f();
        })?;
    Ok(())
}
