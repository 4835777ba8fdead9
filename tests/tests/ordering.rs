// Per-handle FIFO: completions of queued reads and writes are delivered in
// submission order, and the drain-mode burst ends with the sentinel.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use burrow_integration_tests::init_tracing;
use burrow_transport::conn::Connection;
use burrow_transport::handle::KernelHandle;
use burrow_transport::reactor::Reactor;
use bytes::Bytes;

#[test]
fn read_completions_are_fifo() {
    init_tracing();
    let reactor = Reactor::new().unwrap();
    let handle = reactor.handle();
    let rt = reactor.spawn_thread();

    let receiver = KernelHandle::udp().unwrap();
    receiver
        .bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0))
        .unwrap();
    let dst = receiver.local_addr().unwrap();
    let conn = Connection::new(&handle, receiver).unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));
    let (done_tx, done_rx) = mpsc::channel();
    for i in 0..5u8 {
        let order = order.clone();
        let done_tx = done_tx.clone();
        conn.read_from(64, false, move |res| {
            let datagram = res.expect("read");
            order.lock().unwrap().push((i, datagram.data[0]));
            if i == 4 {
                let _ = done_tx.send(());
            }
        });
    }

    // Loopback UDP preserves send order; completions must then match both
    // the submission order and the datagram order.
    let sender = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    for i in 0..5u8 {
        sender.send_to(&[i], dst).unwrap();
    }

    done_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("all reads completed");
    let order = order.lock().unwrap();
    assert_eq!(*order, vec![(0, 0), (1, 1), (2, 2), (3, 3), (4, 4)]);

    conn.close();
    drop(rt);
}

#[test]
fn write_completions_are_fifo() {
    init_tracing();
    let reactor = Reactor::new().unwrap();
    let handle = reactor.handle();
    let rt = reactor.spawn_thread();

    let sink = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    let dst = match sink.local_addr().unwrap() {
        std::net::SocketAddr::V4(v4) => v4,
        _ => unreachable!(),
    };

    let sender = KernelHandle::udp().unwrap();
    sender
        .bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0))
        .unwrap();
    let conn = Connection::new(&handle, sender).unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));
    let (done_tx, done_rx) = mpsc::channel();
    for i in 0..8u8 {
        let order = order.clone();
        let done_tx = done_tx.clone();
        conn.write_to(Bytes::from(vec![i; 16]), dst, move |res| {
            res.expect("write");
            order.lock().unwrap().push(i);
            if i == 7 {
                let _ = done_tx.send(());
            }
        });
    }
    done_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("all writes completed");
    assert_eq!(*order.lock().unwrap(), (0..8).collect::<Vec<u8>>());

    conn.close();
    drop(rt);
}

#[test]
fn drain_burst_ends_with_sentinel() {
    init_tracing();
    let reactor = Reactor::new().unwrap();
    let handle = reactor.handle();
    let rt = reactor.spawn_thread();

    let receiver = KernelHandle::udp().unwrap();
    receiver
        .bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0))
        .unwrap();
    let dst = receiver.local_addr().unwrap();
    let conn = Connection::new(&handle, receiver).unwrap();

    let sender = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    for i in 0..3u8 {
        sender.send_to(&[i; 8], dst).unwrap();
    }
    // Let the datagrams land before arming the drain.
    std::thread::sleep(Duration::from_millis(100));

    let (tx, rx) = mpsc::channel();
    fn arm(conn: Arc<Connection>, tx: mpsc::Sender<Option<u8>>) {
        let c = conn.clone();
        conn.read_from(64, true, move |res| {
            let datagram = res.expect("drain read");
            if datagram.is_drain_sentinel() {
                let _ = tx.send(None);
            } else {
                let _ = tx.send(Some(datagram.data[0]));
                arm(c, tx);
            }
        });
    }
    arm(conn.clone(), tx);

    let mut got = Vec::new();
    loop {
        match rx.recv_timeout(Duration::from_secs(5)).expect("burst item") {
            Some(b) => got.push(b),
            None => break,
        }
    }
    assert_eq!(got, vec![0, 1, 2]);

    conn.close();
    drop(rt);
}
