// Byte-stream fidelity over the multiplexed UDP transport on loopback:
// everything written on one side arrives on the other byte-identical and
// in order, under the 208 KiB per-direction buffering.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use burrow_integration_tests::{init_tracing, pattern};
use burrow_stream::{StreamConnection, StreamManager};
use burrow_transport::reactor::Reactor;
use bytes::Bytes;

const TRANSFER: usize = 1024 * 1024;
const CHUNK: usize = 64 * 1024;

fn sink_into(
    conn: Arc<StreamConnection>,
    acc: Arc<Mutex<Vec<u8>>>,
    done: mpsc::Sender<()>,
    want: usize,
) {
    let c = conn.clone();
    conn.read(128 * 1024, move |res| {
        let data = res.expect("read");
        if data.is_empty() {
            return;
        }
        let total = {
            let mut acc = acc.lock().unwrap();
            acc.extend_from_slice(&data);
            acc.len()
        };
        if total >= want {
            let _ = done.send(());
        } else {
            sink_into(c, acc, done, want);
        }
    });
}

fn source_from(conn: Arc<StreamConnection>, data: Arc<Vec<u8>>, off: usize) {
    if off >= data.len() {
        return;
    }
    let end = (off + CHUNK).min(data.len());
    let chunk = Bytes::copy_from_slice(&data[off..end]);
    let c = conn.clone();
    conn.write(chunk, move |res| {
        res.expect("write");
        source_from(c, data, end);
    });
}

#[test]
fn one_mebibyte_arrives_in_order() {
    init_tracing();
    let reactor = Reactor::new().unwrap();
    let handle = reactor.handle();
    let rt = reactor.spawn_thread();

    let mgr = StreamManager::new(handle);
    mgr.start();

    // Server side: bind, listen, sink everything.
    let server = mgr.create_stream_handle();
    server
        .bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))
        .unwrap();
    let server_port = server.local_addr().unwrap().port();

    let received = Arc::new(Mutex::new(Vec::new()));
    let (done_tx, done_rx) = mpsc::channel();
    let acceptor = server.clone().into_acceptor();
    {
        let received = received.clone();
        acceptor
            .listen(move |stream| {
                sink_into(
                    Arc::new(stream.into_connection()),
                    received.clone(),
                    done_tx.clone(),
                    TRANSFER,
                );
            })
            .unwrap();
    }

    // Client side: connect across loopback and source the pattern.
    let payload = Arc::new(pattern(TRANSFER));
    let client = mgr.create_stream_handle();
    let connector = client.clone().into_connector();
    let (conn_tx, conn_rx) = mpsc::channel();
    connector
        .connect(
            SocketAddrV4::new(Ipv4Addr::LOCALHOST, server_port),
            move |res| {
                let _ = conn_tx.send(res);
            },
        )
        .unwrap();
    conn_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("connect completion")
        .expect("connect");

    source_from(
        Arc::new(client.clone().into_connection()),
        payload.clone(),
        0,
    );

    done_rx
        .recv_timeout(Duration::from_secs(30))
        .expect("transfer finished");
    assert_eq!(&*received.lock().unwrap(), &*payload);

    // The peer address reflects the mapped actual port.
    let peer = client.peer_addr().unwrap();
    assert_eq!(peer.port(), server_port);

    // Explicit handles: ours plus the accepted one.
    assert_eq!(mgr.alive_handles(), 3);

    client.close();
    acceptor.close();
    mgr.shutdown();
    drop(rt);
}

#[test]
fn two_streams_share_one_udp_port_without_crosstalk() {
    init_tracing();
    let reactor = Reactor::new().unwrap();
    let handle = reactor.handle();
    let rt = reactor.spawn_thread();

    let mgr = StreamManager::new(handle);
    mgr.start();

    let server = mgr.create_stream_handle();
    server
        .bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))
        .unwrap();
    let server_port = server.local_addr().unwrap().port();

    // Every accepted stream sinks into its own buffer.
    let sinks: Arc<Mutex<Vec<Arc<Mutex<Vec<u8>>>>>> = Arc::new(Mutex::new(Vec::new()));
    let (done_tx, done_rx) = mpsc::channel();
    let acceptor = server.clone().into_acceptor();
    {
        let sinks = sinks.clone();
        acceptor
            .listen(move |stream| {
                let acc = Arc::new(Mutex::new(Vec::new()));
                sinks.lock().unwrap().push(acc.clone());
                sink_into(
                    Arc::new(stream.into_connection()),
                    acc,
                    done_tx.clone(),
                    30_000,
                );
            })
            .unwrap();
    }

    // Two client handles multiplexed onto the same local UDP port.
    let first = mgr.create_stream_handle();
    first
        .bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))
        .unwrap();
    let shared_port = first.local_addr().unwrap().port();
    let second = mgr.create_stream_handle();
    second
        .bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, shared_port))
        .unwrap();
    assert_eq!(second.local_addr().unwrap().port(), shared_port);

    let target = SocketAddrV4::new(Ipv4Addr::LOCALHOST, server_port);
    for client in [&first, &second] {
        let (tx, rx) = mpsc::channel();
        client
            .clone()
            .into_connector()
            .connect(target, move |res| {
                let _ = tx.send(res);
            })
            .unwrap();
        rx.recv_timeout(Duration::from_secs(5))
            .expect("connect completion")
            .expect("connect");
    }

    let payload_a = Arc::new(pattern(30_000));
    let payload_b = Arc::new(vec![0x42u8; 30_000]);
    source_from(
        Arc::new(first.clone().into_connection()),
        payload_a.clone(),
        0,
    );
    source_from(
        Arc::new(second.clone().into_connection()),
        payload_b.clone(),
        0,
    );

    for _ in 0..2 {
        done_rx
            .recv_timeout(Duration::from_secs(30))
            .expect("one stream finished");
    }
    let got: Vec<Vec<u8>> = sinks
        .lock()
        .unwrap()
        .iter()
        .map(|s| s.lock().unwrap().clone())
        .collect();
    assert_eq!(got.len(), 2);
    assert!(got.contains(&*payload_a) && got.contains(&*payload_b));

    first.close();
    second.close();
    acceptor.close();
    mgr.shutdown();
    drop(rt);
}

#[test]
fn both_directions_carry_independent_streams() {
    init_tracing();
    let reactor = Reactor::new().unwrap();
    let handle = reactor.handle();
    let rt = reactor.spawn_thread();

    let mgr = StreamManager::new(handle);
    mgr.start();

    let server = mgr.create_stream_handle();
    server
        .bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))
        .unwrap();
    let server_port = server.local_addr().unwrap().port();

    let upstream = Arc::new(Mutex::new(Vec::new()));
    let (up_tx, up_rx) = mpsc::channel();
    let reply = Arc::new(pattern(200_000));
    let acceptor = server.clone().into_acceptor();
    {
        let upstream = upstream.clone();
        let reply = reply.clone();
        acceptor
            .listen(move |stream| {
                let conn = Arc::new(stream.into_connection());
                sink_into(conn.clone(), upstream.clone(), up_tx.clone(), 100_000);
                source_from(conn, reply.clone(), 0);
            })
            .unwrap();
    }

    let client = mgr.create_stream_handle();
    let connector = client.clone().into_connector();
    let (conn_tx, conn_rx) = mpsc::channel();
    connector
        .connect(
            SocketAddrV4::new(Ipv4Addr::LOCALHOST, server_port),
            move |res| {
                let _ = conn_tx.send(res);
            },
        )
        .unwrap();
    conn_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("connect completion")
        .expect("connect");

    let sent = Arc::new(pattern(100_000));
    let downstream = Arc::new(Mutex::new(Vec::new()));
    let (down_tx, down_rx) = mpsc::channel();
    let conn = Arc::new(client.clone().into_connection());
    sink_into(conn.clone(), downstream.clone(), down_tx, 200_000);
    source_from(conn, sent.clone(), 0);

    up_rx
        .recv_timeout(Duration::from_secs(30))
        .expect("upstream finished");
    down_rx
        .recv_timeout(Duration::from_secs(30))
        .expect("downstream finished");
    assert_eq!(&*upstream.lock().unwrap(), &*sent);
    assert_eq!(&*downstream.lock().unwrap(), &*reply);

    client.close();
    acceptor.close();
    mgr.shutdown();
    drop(rt);
}
