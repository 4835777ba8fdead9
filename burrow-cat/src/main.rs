#![forbid(unsafe_code)]

//! Throughput test tool for the stream layer.
//!
//! Server role sinks (or, with `--reverse`, sources) bytes on an accepted
//! stream; client role does the opposite. Rate is logged once a second.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{bail, Context};
use bytes::Bytes;
use clap::Parser;
use tracing::{error, info, trace};
use tracing_subscriber::EnvFilter;

use burrow_stream::{AnyConnection, AnyHandle, StreamManager};
use burrow_transport::reactor::Reactor;

const WRITE_CHUNK: usize = 4 * 1024;
const READ_CHUNK: usize = 128 * 1024;
/// Writes kept in flight by the sourcing side.
const WRITE_DEPTH: usize = 16;

static WRITE_BUF: [u8; WRITE_CHUNK] = [0u8; WRITE_CHUNK];

#[derive(Parser, Debug)]
#[command(name = "burrow-cat", about = "Stream-layer throughput test")]
struct Args {
    /// Server role: accept one stream on this port.
    #[arg(long)]
    listen_port: Option<u16>,

    /// Client role: local UDP port to bind.
    #[arg(long)]
    local_port: Option<u16>,

    /// Client role: server address.
    #[arg(long)]
    target_ip: Option<Ipv4Addr>,

    /// Client role: server port.
    #[arg(long)]
    target_port: Option<u16>,

    /// Swap the read/write direction.
    #[arg(long, default_value_t = false)]
    reverse: bool,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long, default_value = "info")]
    log_level: String,
}

struct Rate {
    bytes: AtomicUsize,
    since: Mutex<Instant>,
}

impl Rate {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            bytes: AtomicUsize::new(0),
            since: Mutex::new(Instant::now()),
        })
    }

    fn add(&self, n: usize) {
        let total = self.bytes.fetch_add(n, Ordering::Relaxed) + n;
        let Ok(mut since) = self.since.lock() else {
            return;
        };
        let elapsed = since.elapsed();
        if elapsed.as_micros() >= 1_000_000 {
            let kb = (total as f64 / elapsed.as_secs_f64() / 1000.0) as u64;
            info!("rate = {kb} kB/s");
            *since = Instant::now();
            self.bytes.store(0, Ordering::Relaxed);
        }
    }
}

fn pump_write(conn: Arc<AnyConnection>, rate: Arc<Rate>) {
    let c = conn.clone();
    conn.write(Bytes::from_static(&WRITE_BUF), move |res| match res {
        Ok(()) => {
            rate.add(WRITE_CHUNK);
            pump_write(c, rate);
        }
        Err(e) => {
            if !e.is_closed() {
                error!("write failed: {e}");
            }
        }
    });
}

fn pump_read(conn: Arc<AnyConnection>, rate: Arc<Rate>) {
    let c = conn.clone();
    conn.read(READ_CHUNK, move |res| match res {
        Ok(data) if data.is_empty() => info!("peer finished"),
        Ok(data) => {
            trace!("read {} bytes", data.len());
            rate.add(data.len());
            pump_read(c, rate);
        }
        Err(e) => {
            if !e.is_closed() {
                error!("read failed: {e}");
            }
        }
    });
}

fn run_connected(conn: AnyConnection, source: bool) {
    let conn = Arc::new(conn);
    let rate = Rate::new();
    if source {
        for _ in 0..WRITE_DEPTH {
            pump_write(conn.clone(), rate.clone());
        }
    } else {
        pump_read(conn, rate);
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let reactor = Reactor::new().context("cannot create reactor")?;
    let handle = reactor.handle();
    let rt = reactor.spawn_thread();

    let mgr = StreamManager::new(handle.clone());
    mgr.start();

    let reverse = args.reverse;

    if let Some(listen_port) = args.listen_port {
        let server = AnyHandle::Stream(mgr.create_stream_handle());
        server
            .bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, listen_port))
            .context("cannot bind listen port")?;
        let acceptor = server.into_acceptor(&handle);
        let reactor_handle = handle.clone();
        acceptor
            .listen(10, move |h| {
                info!("stream accepted");
                // Server sinks by default; --reverse turns it into the
                // source.
                match h.into_connection(&reactor_handle) {
                    Ok(conn) => run_connected(conn, reverse),
                    Err(e) => error!("accepted handle unusable: {e}"),
                }
            })
            .context("cannot listen")?;
        info!("server ready on port {listen_port}");
        wait_for_ctrl_c();
        acceptor.close();
    } else {
        let (Some(target_ip), Some(target_port)) = (args.target_ip, args.target_port) else {
            bail!("client role needs --target-ip and --target-port");
        };
        let local_port = args.local_port.unwrap_or(0);
        let client = AnyHandle::Stream(mgr.create_stream_handle());
        client
            .bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, local_port))
            .context("cannot bind local port")?;
        let target = SocketAddrV4::new(target_ip, target_port);
        let stream = match &client {
            AnyHandle::Stream(h) => h.clone(),
            AnyHandle::Kernel(_) => bail!("client socket is not a stream handle"),
        };
        let connector = client.into_connector(&handle);
        info!("connecting to {target} from local port {local_port}");
        connector
            .connect(target, move |res| match res {
                Ok(()) => {
                    info!("connected");
                    run_connected(
                        AnyConnection::Stream(stream.into_connection()),
                        !reverse,
                    );
                }
                Err(e) => error!("connect failed: {e}"),
            })
            .context("cannot start connect")?;
        wait_for_ctrl_c();
        connector.close();
    }

    mgr.shutdown();
    drop(rt);
    info!("done");
    Ok(())
}

fn wait_for_ctrl_c() {
    if let Ok(rt) = tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .build()
    {
        let _ = rt.block_on(tokio::signal::ctrl_c());
    }
}
