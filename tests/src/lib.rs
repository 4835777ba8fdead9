#![forbid(unsafe_code)]

//! Shared scaffolding for the integration suite: one reactor thread, a
//! stream manager, an in-process rendezvous server, and client builders on
//! non-conflicting ports.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use burrow_core::NodeId;
use burrow_master::{MasterServer, MasterServerConfig};
use burrow_rendezvous::{ControlClient, ControlClientConfig, PortAllocator};
use burrow_stream::StreamManager;
use burrow_transport::reactor::{Reactor, ReactorHandle, ReactorThread};

/// Sequential high ports, offset by pid so parallel suites stay apart.
static NEXT_PORT: AtomicU16 = AtomicU16::new(0);

pub fn pick_port() -> u16 {
    let base = 20_000 + (std::process::id() % 500) as u16 * 20;
    base + NEXT_PORT.fetch_add(2, Ordering::Relaxed)
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// A reactor, stream plane, and rendezvous server wired together.
pub struct TestNet {
    rt: ReactorThread,
    pub mgr: Arc<StreamManager>,
    pub server: Arc<MasterServer>,
    pub server_port: u16,
}

impl TestNet {
    pub fn start() -> Self {
        init_tracing();
        let reactor = Reactor::new().expect("reactor");
        let handle = reactor.handle();
        let rt = reactor.spawn_thread();
        let mgr = StreamManager::new(handle.clone());
        mgr.start();
        let server_port = pick_port();
        let server = MasterServer::start(
            handle,
            MasterServerConfig {
                port: server_port,
                max_connections_for_client: 16,
            },
        )
        .expect("master server");
        Self {
            rt,
            mgr,
            server,
            server_port,
        }
    }

    pub fn handle(&self) -> ReactorHandle {
        self.rt.handle()
    }

    /// A registered control client for `node_id`, with its own allocator.
    pub fn client(&self, node_id: u32) -> (Arc<ControlClient>, Arc<PortAllocator>) {
        let allocator = PortAllocator::new(self.handle(), 4, 16, Duration::from_millis(500));
        let server = SocketAddrV4::new(Ipv4Addr::LOCALHOST, self.server_port);
        let client = ControlClient::new(
            self.handle(),
            self.mgr.clone(),
            allocator.clone(),
            ControlClientConfig {
                node_id: NodeId(node_id),
                server_tcp: server,
                server_udp: server,
                probe_udp: SocketAddrV4::new(Ipv4Addr::LOCALHOST, self.server_port + 1),
                best_effort_reservations: false,
            },
        );
        (client, allocator)
    }

    /// Block until `n` nodes hold live control sessions.
    pub fn wait_registered(&self, n: usize, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        while self.server.registered_nodes() < n {
            assert!(
                Instant::now() < deadline,
                "only {}/{n} nodes registered in time",
                self.server.registered_nodes()
            );
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    pub fn shutdown(self) {
        self.server.stop();
        self.mgr.shutdown();
        drop(self.rt);
    }
}

/// Deterministic payload for transfer checks.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}
