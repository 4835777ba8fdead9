// Loopback end-to-end rendezvous: two nodes register with an in-process
// server, one requests a connection, both punch, and a mebibyte crosses the
// resulting stream byte-identical.

use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use burrow_core::NodeId;
use burrow_integration_tests::{pattern, TestNet};
use burrow_stream::StreamConnection;
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
fn loopback_connect_carries_a_mebibyte() {
    let net = TestNet::start();
    let (alice, _alice_ports) = net.client(1);
    let (bob, _bob_ports) = net.client(2);

    // Bob serves: accepted streams land on a channel.
    let (accept_tx, accept_rx) = mpsc::channel();
    bob.set_accept_handler(move |stream| {
        let _ = accept_tx.send(stream);
    });

    let (ready_tx, ready_rx) = mpsc::channel();
    {
        let tx = ready_tx.clone();
        alice.start(move |res| {
            let _ = tx.send(res);
        });
    }
    {
        let tx = ready_tx;
        bob.start(move |res| {
            let _ = tx.send(res);
        });
    }
    for _ in 0..2 {
        ready_rx
            .recv_timeout(Duration::from_secs(10))
            .expect("startup completion")
            .expect("registration");
    }
    net.wait_registered(2, Duration::from_secs(5));

    // Alice dials Bob.
    let (conn_tx, conn_rx) = mpsc::channel();
    alice.request_connect(NodeId(2), move |res| {
        let _ = conn_tx.send(res);
    });

    let alice_stream = conn_rx
        .recv_timeout(Duration::from_secs(15))
        .expect("rendezvous completion")
        .expect("rendezvous");
    let bob_stream = accept_rx
        .recv_timeout(Duration::from_secs(15))
        .expect("accepted stream");

    // A mebibyte must arrive byte-identical.
    let payload = Arc::new(pattern(TRANSFER));
    let received = Arc::new(Mutex::new(Vec::new()));
    let (done_tx, done_rx) = mpsc::channel();
    sink_into(
        Arc::new(bob_stream.into_connection()),
        received.clone(),
        done_tx,
        TRANSFER,
    );
    source_from(
        Arc::new(alice_stream.clone().into_connection()),
        payload.clone(),
        0,
    );

    done_rx
        .recv_timeout(Duration::from_secs(60))
        .expect("transfer finished");
    assert_eq!(&*received.lock().unwrap(), &*payload);

    alice.shutdown();
    bob.shutdown();
    net.shutdown();
}

#[test]
fn cancelled_request_fails_exactly_once() {
    let net = TestNet::start();
    let (alice, _a) = net.client(21);
    let (bob, _b) = net.client(22);

    let (ready_tx, ready_rx) = mpsc::channel();
    {
        let tx = ready_tx.clone();
        alice.start(move |res| {
            let _ = tx.send(res);
        });
    }
    {
        let tx = ready_tx;
        bob.start(move |res| {
            let _ = tx.send(res);
        });
    }
    for _ in 0..2 {
        ready_rx
            .recv_timeout(Duration::from_secs(10))
            .expect("startup completion")
            .expect("registration");
    }
    net.wait_registered(2, Duration::from_secs(5));

    let (tx, rx) = mpsc::channel();
    let conn_id = alice.request_connect(NodeId(22), move |res| {
        let _ = tx.send(res.is_err());
    });
    alice.cancel(conn_id);

    assert!(rx
        .recv_timeout(Duration::from_secs(5))
        .expect("cancellation surfaces"));
    assert!(rx.recv_timeout(Duration::from_secs(1)).is_err());

    alice.shutdown();
    bob.shutdown();
    net.shutdown();
}

#[test]
fn two_symmetric_peers_are_rejected_with_symm() {
    let net = TestNet::start();
    let (alice, _a) = net.client(11);
    let (bob, _b) = net.client(12);

    let (ready_tx, ready_rx) = mpsc::channel();
    {
        let tx = ready_tx.clone();
        alice.start(move |res| {
            let _ = tx.send(res);
        });
    }
    {
        let tx = ready_tx;
        bob.start(move |res| {
            let _ = tx.send(res);
        });
    }
    for _ in 0..2 {
        ready_rx
            .recv_timeout(Duration::from_secs(10))
            .expect("startup completion")
            .expect("registration");
    }
    net.wait_registered(2, Duration::from_secs(5));

    // Forge observations that make both nodes look symmetric: their two
    // observation-port mappings disagree when each probe leg comes from a
    // different source socket.
    use burrow_rendezvous::protocol::Message;
    for node in [11u32, 12] {
        for (slot, port) in [(0u16, net.server_port), (1, net.server_port + 1)] {
            let sock = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
            let hello = Message::Hello {
                node_id: NodeId(node),
                probe_ip: std::net::Ipv4Addr::UNSPECIFIED,
                probe_port: slot,
            };
            sock.send_to(&hello.to_bytes(), ("127.0.0.1", port)).unwrap();
        }
    }
    std::thread::sleep(Duration::from_millis(300));

    let (tx, rx) = mpsc::channel();
    alice.request_connect(NodeId(12), move |res| {
        let _ = tx.send(res.err());
    });
    let err = rx
        .recv_timeout(Duration::from_secs(5))
        .expect("rejection arrives")
        .expect("must fail");
    assert!(
        matches!(err, burrow_core::Error::Rendezvous(3)),
        "expected the symmetric-pair code, got {err}"
    );

    alice.shutdown();
    bob.shutdown();
    net.shutdown();
}

#[test]
fn unknown_peer_is_rejected_exactly_once() {
    let net = TestNet::start();
    let (alice, _ports) = net.client(7);

    let (ready_tx, ready_rx) = mpsc::channel();
    alice.start(move |res| {
        let _ = ready_tx.send(res);
    });
    ready_rx
        .recv_timeout(Duration::from_secs(10))
        .expect("startup completion")
        .expect("registration");

    let (tx, rx) = mpsc::channel();
    alice.request_connect(NodeId(0xdead), move |res| {
        let _ = tx.send(res.is_err());
    });
    assert!(rx
        .recv_timeout(Duration::from_secs(5))
        .expect("rejection arrives"));
    // Exactly once: nothing else may arrive.
    assert!(rx.recv_timeout(Duration::from_millis(500)).is_err());

    alice.shutdown();
    net.shutdown();
}
