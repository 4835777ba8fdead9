#![forbid(unsafe_code)]

//! Burrow node daemon.
//!
//! Brings up the reactor, the stream plane, and the rendezvous client,
//! registers with the rendezvous server, and serves punched streams. The
//! TUN device bridge and the UDP gateway are external collaborators; their
//! configuration is validated and held here so the surrounding tooling has
//! one source of truth.

use std::net::{Ipv4Addr, SocketAddrV4, ToSocketAddrs};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use burrow_core::config::DaemonConfig;
use burrow_core::consts::DEFAULT_MASTER_PORT;
use burrow_core::NodeId;
use burrow_rendezvous::{ControlClient, ControlClientConfig, PortAllocator};
use burrow_stream::StreamManager;
use burrow_transport::reactor::Reactor;

#[derive(Parser, Debug)]
#[command(name = "burrow-daemon", about = "Burrow tunneling node")]
struct Args {
    /// Optional TOML configuration file; flags override its values.
    #[arg(long)]
    config: Option<String>,

    /// Rendezvous server, host:port (port defaults to 2345).
    #[arg(long)]
    server_addr: Option<String>,

    /// Node identifier; random when omitted.
    #[arg(long)]
    node_id: Option<u32>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    log_level: Option<String>,

    // -- TUN front (bridged by an external collaborator) --
    /// TUN device name.
    #[arg(long)]
    tundev: Option<String>,

    /// Interface address of the TUN device.
    #[arg(long)]
    netif_ipaddr: Option<Ipv4Addr>,

    /// Netmask of the TUN device.
    #[arg(long)]
    netif_netmask: Option<Ipv4Addr>,

    /// Nameserver presented to the TUN side.
    #[arg(long)]
    tun_ns: Option<Ipv4Addr>,

    /// Optional IPv6 interface address of the TUN device.
    #[arg(long)]
    netif_ip6addr: Option<String>,

    /// Upstream authentication.
    #[arg(long)]
    username: Option<String>,

    #[arg(long)]
    password: Option<String>,

    #[arg(long)]
    password_file: Option<String>,

    #[arg(long, default_value_t = false)]
    append_source_to_username: bool,

    // -- udpgw sub-module --
    #[arg(long)]
    max_connections_for_client: Option<u32>,

    /// `ip:port count` specs forwarded to the UDP gateway.
    #[arg(long)]
    local_udp_addrs: Vec<String>,

    #[arg(long)]
    local_udp_ip6_addrs: Vec<String>,

    #[arg(long, default_value_t = false)]
    unique_local_ports: bool,
}

fn merge(args: Args, mut cfg: DaemonConfig) -> DaemonConfig {
    if let Some(v) = args.server_addr {
        cfg.server_addr = Some(v);
    }
    if let Some(v) = args.node_id {
        cfg.node_id = Some(v);
    }
    if let Some(v) = args.log_level {
        cfg.log_level = Some(v);
    }
    if let Some(v) = args.tundev {
        cfg.tun.tundev = Some(v);
    }
    if let Some(v) = args.netif_ipaddr {
        cfg.tun.netif_ipaddr = Some(v);
    }
    if let Some(v) = args.netif_netmask {
        cfg.tun.netif_netmask = Some(v);
    }
    if let Some(v) = args.tun_ns {
        cfg.tun.tun_ns = Some(v);
    }
    if let Some(v) = args.netif_ip6addr {
        cfg.tun.netif_ip6addr = Some(v);
    }
    if let Some(v) = args.username {
        cfg.auth.username = Some(v);
    }
    if let Some(v) = args.password {
        cfg.auth.password = Some(v);
    }
    if let Some(v) = args.password_file {
        cfg.auth.password_file = Some(v);
    }
    if args.append_source_to_username {
        cfg.auth.append_source_to_username = true;
    }
    if let Some(v) = args.max_connections_for_client {
        cfg.udpgw.max_connections_for_client = v;
    }
    if !args.local_udp_addrs.is_empty() {
        cfg.udpgw.local_udp_addrs = args.local_udp_addrs;
    }
    if !args.local_udp_ip6_addrs.is_empty() {
        cfg.udpgw.local_udp_ip6_addrs = args.local_udp_ip6_addrs;
    }
    if args.unique_local_ports {
        cfg.udpgw.unique_local_ports = true;
    }
    cfg
}

fn resolve_v4(addr: &str, default_port: u16) -> anyhow::Result<SocketAddrV4> {
    let candidates: Vec<_> = if addr.contains(':') {
        addr.to_socket_addrs().context("cannot resolve server address")?.collect()
    } else {
        (addr, default_port)
            .to_socket_addrs()
            .context("cannot resolve server address")?
            .collect()
    };
    for c in candidates {
        if let std::net::SocketAddr::V4(v4) = c {
            return Ok(v4);
        }
    }
    bail!("server address did not resolve to an IPv4 endpoint");
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let cfg = match &args.config {
        Some(path) => DaemonConfig::from_file(path).context("cannot load configuration")?,
        None => DaemonConfig::default(),
    };
    let cfg = merge(args, cfg);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(cfg.log_level.clone().unwrap_or_else(|| "info".into()))
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // The TUN front is mandatory configuration even though the bridge
    // itself lives outside this process.
    cfg.tun.validate().context("invalid TUN configuration")?;
    let _password = cfg.auth.password().context("cannot read password file")?;

    let Some(server_addr) = cfg.server_addr.clone() else {
        bail!("server-addr is required");
    };
    let server_tcp = resolve_v4(&server_addr, DEFAULT_MASTER_PORT)?;
    let server_udp = server_tcp;
    let probe_udp = SocketAddrV4::new(*server_tcp.ip(), server_tcp.port() + 1);

    let node_id = cfg
        .node_id
        .map(NodeId)
        .unwrap_or_else(NodeId::random);
    info!("starting node {node_id} against {server_tcp}");

    let reactor = Reactor::new().context("cannot create reactor")?;
    let handle = reactor.handle();
    let rt = reactor.spawn_thread();

    let stream_mgr = StreamManager::new(handle.clone());
    stream_mgr.start();

    let allocator = PortAllocator::new(
        handle.clone(),
        cfg.ports.symm_ports,
        cfg.ports.fast_ports,
        std::time::Duration::from_millis(cfg.ports.decay_ms),
    );

    let client = ControlClient::new(
        handle.clone(),
        stream_mgr.clone(),
        allocator.clone(),
        ControlClientConfig {
            node_id,
            server_tcp,
            server_udp,
            probe_udp,
            best_effort_reservations: true,
        },
    );

    // The packet bridge consumes streams from here; until one is attached,
    // accepted tunnels are parked so the peer side stays up.
    let parked = Arc::new(std::sync::Mutex::new(Vec::new()));
    {
        let parked = parked.clone();
        client.set_accept_handler(move |stream| {
            match stream.peer_addr() {
                Ok(peer) => info!("tunnel stream accepted from {peer}"),
                Err(_) => info!("tunnel stream accepted"),
            }
            if let Ok(mut parked) = parked.lock() {
                parked.push(stream);
            }
        });
    }

    let (tx, rx) = std::sync::mpsc::channel();
    {
        let tx = tx.clone();
        client.start(move |res| {
            let _ = tx.send(res);
        });
    }
    match rx.recv() {
        Ok(Ok(())) => info!("registered with rendezvous server"),
        Ok(Err(e)) => {
            drop(rt);
            bail!("registration failed: {e}");
        }
        Err(_) => bail!("reactor died during startup"),
    }

    wait_for_ctrl_c()?;
    info!("shutdown requested");

    client.shutdown();
    stream_mgr.shutdown();
    allocator.shutdown();
    drop(rt);
    info!("done");
    Ok(())
}

fn wait_for_ctrl_c() -> anyhow::Result<()> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .build()?;
    rt.block_on(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("signal wait failed: {e}");
        }
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_surface_is_wellformed() {
        Args::command().debug_assert();
    }

    #[test]
    fn tun_flags_are_required_for_validation() {
        let args = Args::parse_from([
            "burrow-daemon",
            "--server-addr",
            "127.0.0.1:2345",
            "--netif-ipaddr",
            "10.0.0.2",
            "--netif-netmask",
            "255.255.255.0",
            "--tun-ns",
            "8.8.8.8",
        ]);
        let cfg = merge(args, DaemonConfig::default());
        cfg.tun.validate().unwrap();

        let args = Args::parse_from(["burrow-daemon", "--server-addr", "127.0.0.1:2345"]);
        let cfg = merge(args, DaemonConfig::default());
        assert!(cfg.tun.validate().is_err());
    }

    #[test]
    fn udpgw_flags_land_in_config() {
        let args = Args::parse_from([
            "burrow-daemon",
            "--max-connections-for-client",
            "7",
            "--local-udp-addrs",
            "127.0.0.1:53 5",
            "--unique-local-ports",
        ]);
        let cfg = merge(args, DaemonConfig::default());
        assert_eq!(cfg.udpgw.max_connections_for_client, 7);
        assert_eq!(cfg.udpgw.local_udp_addrs, vec!["127.0.0.1:53 5"]);
        assert!(cfg.udpgw.unique_local_ports);
    }

    #[test]
    fn server_addr_gets_default_port() {
        let addr = resolve_v4("127.0.0.1", DEFAULT_MASTER_PORT).unwrap();
        assert_eq!(addr.port(), DEFAULT_MASTER_PORT);
        let addr = resolve_v4("127.0.0.1:9999", DEFAULT_MASTER_PORT).unwrap();
        assert_eq!(addr.port(), 9999);
    }
}
