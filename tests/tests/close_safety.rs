// Thread A submits reads, thread B closes the connection. A cross-thread
// close() is a completion barrier: by the time it returns, every pending
// read has been failed with the closed error, and no completion of that
// connection runs afterwards. Submissions after close fail synchronously.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use burrow_core::Error;
use burrow_integration_tests::init_tracing;
use burrow_transport::conn::Connection;
use burrow_transport::handle::KernelHandle;
use burrow_transport::reactor::Reactor;

const PENDING_READS: usize = 50;

#[test]
fn cross_thread_close_is_a_completion_barrier() {
    init_tracing();
    let reactor = Reactor::new().unwrap();
    let handle = reactor.handle();
    let rt = reactor.spawn_thread();

    for _round in 0..20 {
        let sock = KernelHandle::udp().unwrap();
        sock.bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0))
            .unwrap();
        let conn = Connection::new(&handle, sock).unwrap();

        let completed = Arc::new(AtomicUsize::new(0));
        let closed_errors = Arc::new(AtomicUsize::new(0));

        // Thread A: queue reads that can never be satisfied (nobody sends).
        let submitter = {
            let conn = conn.clone();
            let completed = completed.clone();
            let closed_errors = closed_errors.clone();
            std::thread::spawn(move || {
                for _ in 0..PENDING_READS {
                    let completed = completed.clone();
                    let closed_errors = closed_errors.clone();
                    conn.read_from(64, false, move |res| {
                        completed.fetch_add(1, Ordering::SeqCst);
                        if matches!(res, Err(ref e) if e.is_closed()) {
                            closed_errors.fetch_add(1, Ordering::SeqCst);
                        }
                    });
                }
            })
        };
        submitter.join().unwrap();

        // Thread B closes; the call must not return before every pending
        // read completed with the closed error.
        let barrier = {
            let conn = conn.clone();
            let completed = completed.clone();
            std::thread::spawn(move || {
                conn.close();
                completed.load(Ordering::SeqCst)
            })
        };
        let completed_at_close = barrier.join().unwrap();

        assert_eq!(
            completed_at_close, PENDING_READS,
            "close() returned before pending reads completed"
        );
        assert_eq!(closed_errors.load(Ordering::SeqCst), PENDING_READS);

        // Nothing further may complete.
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(completed.load(Ordering::SeqCst), PENDING_READS);

        // Late submissions fail synchronously with the closed sentinel.
        let (tx, rx) = mpsc::channel();
        conn.read_from(64, false, move |res| {
            let _ = tx.send(matches!(res, Err(Error::Closed)));
        });
        assert!(rx.try_recv().unwrap_or(false), "late submission must fail inline");
    }

    drop(rt);
}
