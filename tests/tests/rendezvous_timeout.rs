// Unreachable peer: the rendezvous callback fires exactly once within
// the 18 s watchdog with an error, and every reservation the session
// held returns to the pool after one decay interval.
//
// The "server" here registers the node and answers the connection request
// with CONN_OK, then goes silent: the fast session reserves its ports and
// waits for a peer endpoint that never comes.

use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddrV4, TcpListener, UdpSocket};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use burrow_core::NodeId;
use burrow_integration_tests::{init_tracing, pick_port};
use burrow_rendezvous::protocol::{Message, Role};
use burrow_rendezvous::{ControlClient, ControlClientConfig, PortAllocator};
use burrow_stream::StreamManager;
use burrow_transport::reactor::Reactor;
use bytes::BytesMut;

/// Serve the two observation sockets: echo ProbeResult for everything.
fn spawn_observation_echo(port: u16) {
    for p in [port, port + 1] {
        let sock = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, p)).unwrap();
        std::thread::spawn(move || {
            let mut buf = [0u8; 2048];
            while let Ok((_, src)) = sock.recv_from(&mut buf) {
                let std::net::SocketAddr::V4(src) = src else {
                    continue;
                };
                let echo = Message::ProbeResult {
                    src_ip: *src.ip(),
                    src_port: src.port(),
                };
                let _ = sock.send_to(&echo.to_bytes(), src);
            }
        });
    }
}

/// A control endpoint that accepts registration and immediately green-lights
/// any request, then never says another word.
fn spawn_silent_pairing_server(port: u16) {
    let listener = TcpListener::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)).unwrap();
    std::thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else {
                continue;
            };
            std::thread::spawn(move || {
                let mut acc = BytesMut::new();
                let mut buf = [0u8; 1024];
                loop {
                    let n = match stream.read(&mut buf) {
                        Ok(0) | Err(_) => return,
                        Ok(n) => n,
                    };
                    acc.extend_from_slice(&buf[..n]);
                    while let Ok(Some(msg)) = Message::decode(&mut acc) {
                        if let Message::HelloConn { conn_id, .. } = msg {
                            let ok = Message::ConnOk {
                                conn_id,
                                dst_ip: Ipv4Addr::LOCALHOST,
                                dst_port: 9,
                                role: Role::Conn,
                            };
                            let _ = stream.write_all(&ok.to_bytes());
                        }
                    }
                }
            });
        }
    });
}

#[test]
fn watchdog_fires_exactly_once_and_ports_decay_back() {
    init_tracing();
    let port = pick_port();
    spawn_observation_echo(port);
    spawn_silent_pairing_server(port);

    let reactor = Reactor::new().unwrap();
    let handle = reactor.handle();
    let rt = reactor.spawn_thread();
    let mgr = StreamManager::new(handle.clone());
    mgr.start();

    let decay = Duration::from_millis(500);
    let allocator = PortAllocator::new(handle.clone(), 0, 2, decay);
    let server = SocketAddrV4::new(Ipv4Addr::LOCALHOST, port);
    let client = ControlClient::new(
        handle,
        mgr.clone(),
        allocator.clone(),
        ControlClientConfig {
            node_id: NodeId(42),
            server_tcp: server,
            server_udp: server,
            probe_udp: SocketAddrV4::new(Ipv4Addr::LOCALHOST, port + 1),
            best_effort_reservations: false,
        },
    );

    let (ready_tx, ready_rx) = mpsc::channel();
    client.start(move |res| {
        let _ = ready_tx.send(res);
    });
    ready_rx
        .recv_timeout(Duration::from_secs(10))
        .expect("startup completion")
        .expect("registration");

    let started = Instant::now();
    let (tx, rx) = mpsc::channel();
    client.request_connect(NodeId(43), move |res| {
        let _ = tx.send(res.err());
    });

    // The session reserves its Fast port pair while it waits.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if allocator.reserved_counts().1 == 2 {
            break;
        }
        assert!(Instant::now() < deadline, "session never reserved ports");
        std::thread::sleep(Duration::from_millis(20));
    }

    let err = rx
        .recv_timeout(Duration::from_secs(20))
        .expect("watchdog completion");
    assert!(err.is_some(), "rendezvous must fail");
    let elapsed = started.elapsed();
    assert!(
        elapsed >= Duration::from_secs(17) && elapsed <= Duration::from_secs(19),
        "watchdog fired after {elapsed:?}"
    );
    // Exactly once.
    assert!(rx.recv_timeout(Duration::from_millis(500)).is_err());

    // Reservations return to Free and, one decay interval later, the pool
    // is fully reusable.
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        if allocator.reserved_counts() == (0, 0) {
            break;
        }
        assert!(Instant::now() < deadline, "ports never returned");
        std::thread::sleep(Duration::from_millis(20));
    }
    std::thread::sleep(decay + Duration::from_millis(200));
    let res = allocator.reserve_fast_ports(2).expect("pool reusable");
    drop(res);

    client.shutdown();
    mgr.shutdown();
    allocator.shutdown();
    drop(rt);
}
