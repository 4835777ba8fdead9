//! Transient hello session.
//!
//! Sends one control message as a UDP datagram through a *specific* socket
//! (the one being punched) to the server's observation endpoint, so the
//! server sees the mapped 4-tuple of exactly that socket. Completes when the
//! server's `ProbeResult` echo arrives, reporting our observed source port;
//! the socket is then released back to the caller for the punch itself.
//!
//! The echo is retransmission-driven: the hello is repeated twice a second
//! until the echo lands or the owner's watch closes. Peer pings that arrive
//! early on the same socket are ignored here and re-sent by the peer later.

use std::net::SocketAddrV4;
use std::os::fd::OwnedFd;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use burrow_core::Result;
use bytes::BytesMut;
use tracing::{trace, warn};

use burrow_transport::conn::{Connection, Datagram};
use burrow_transport::handle::KernelHandle;
use burrow_transport::opwatch::OpWatch;
use burrow_transport::reactor::ReactorHandle;

use crate::protocol::Message;

const RESEND_INTERVAL: Duration = Duration::from_millis(500);
const RECV_BUF: usize = 1024;

type HelloCallback = Box<dyn FnOnce(Result<SocketAddrV4>) + Send + 'static>;

struct HelloState {
    conn: Option<Arc<Connection>>,
    callback: Option<HelloCallback>,
}

/// One in-flight observation hello.
pub struct HelloSession {
    reactor: ReactorHandle,
    server: SocketAddrV4,
    msg: Message,
    state: Mutex<HelloState>,
    watch: OpWatch,
}

impl HelloSession {
    /// Start the exchange on a duplicate of the punched socket. The
    /// callback reports our server-observed `(ip, port)` exactly once, or an
    /// error if the socket dies first.
    pub fn start<F>(
        reactor: &ReactorHandle,
        fd: OwnedFd,
        server: SocketAddrV4,
        msg: Message,
        cb: F,
    ) -> Result<Arc<Self>>
    where
        F: FnOnce(Result<SocketAddrV4>) + Send + 'static,
    {
        let handle = KernelHandle::udp_from_fd(fd)?;
        let conn = Connection::new(reactor, handle)?;
        let session = Arc::new(Self {
            reactor: reactor.clone(),
            server,
            msg,
            state: Mutex::new(HelloState {
                conn: Some(conn),
                callback: Some(Box::new(cb)),
            }),
            watch: OpWatch::new(),
        });
        session.arm_recv();
        session.send_hello();
        Ok(session)
    }

    /// Abandon the exchange; the callback never fires after this returns.
    pub fn close(&self) {
        self.watch.close();
        let conn = self
            .state
            .lock()
            .ok()
            .and_then(|mut st| st.conn.take());
        if let Some(conn) = conn {
            conn.close();
        }
        if let Ok(mut st) = self.state.lock() {
            st.callback = None;
        }
    }

    fn send_hello(self: &Arc<Self>) {
        let conn = match self.state.lock() {
            Ok(st) => st.conn.clone(),
            Err(_) => None,
        };
        let Some(conn) = conn else {
            return;
        };
        let mut buf = BytesMut::new();
        self.msg.encode(&mut buf);
        trace!("observation hello to {}", self.server);
        let this = self.clone();
        conn.write_to(
            buf.freeze(),
            self.server,
            self.watch.wrap1(move |res: Result<()>| {
                if let Err(e) = res {
                    this.finish(Err(e));
                }
            }),
        );
        // Retransmit until the echo arrives.
        let this = self.clone();
        self.reactor
            .post(self.watch.wrap(move || this.send_hello()), RESEND_INTERVAL);
    }

    fn arm_recv(self: &Arc<Self>) {
        let conn = match self.state.lock() {
            Ok(st) => st.conn.clone(),
            Err(_) => None,
        };
        let Some(conn) = conn else {
            return;
        };
        let this = self.clone();
        conn.read_from(
            RECV_BUF,
            false,
            self.watch.wrap1(move |res: Result<Datagram>| {
                this.on_recv(res);
            }),
        );
    }

    fn on_recv(self: &Arc<Self>, res: Result<Datagram>) {
        let datagram = match res {
            Ok(d) => d,
            Err(e) => {
                self.finish(Err(e));
                return;
            }
        };
        if datagram.src != self.server {
            // Early peer traffic; the punch path will see it again.
            self.arm_recv();
            return;
        }
        let mut buf = BytesMut::from(&datagram.data[..]);
        match Message::decode(&mut buf) {
            Ok(Some(Message::ProbeResult { src_ip, src_port })) => {
                self.finish(Ok(SocketAddrV4::new(src_ip, src_port)));
            }
            Ok(_) => {
                self.arm_recv();
            }
            Err(e) => {
                warn!("undecodable observation echo: {e}");
                self.arm_recv();
            }
        }
    }

    fn finish(self: &Arc<Self>, res: Result<SocketAddrV4>) {
        let (cb, conn) = {
            let Ok(mut st) = self.state.lock() else {
                return;
            };
            (st.callback.take(), st.conn.take())
        };
        let Some(cb) = cb else {
            return;
        };
        self.watch.close();
        if let Some(conn) = conn {
            conn.close();
        }
        cb(res);
    }
}

impl Drop for HelloSession {
    fn drop(&mut self) {
        self.watch.close();
    }
}

impl std::fmt::Debug for HelloSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HelloSession")
            .field("server", &self.server)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burrow_transport::handle::ANY_ADDR;
    use burrow_transport::reactor::Reactor;
    use std::sync::mpsc;

    /// A fake observation endpoint that echoes ProbeResult for anything it
    /// receives.
    fn fake_server(reactor: &ReactorHandle) -> (Arc<Connection>, SocketAddrV4) {
        let handle = KernelHandle::udp().unwrap();
        handle.bind(SocketAddrV4::new(std::net::Ipv4Addr::LOCALHOST, 0)).unwrap();
        let addr = handle.local_addr().unwrap();
        let conn = Connection::new(reactor, handle).unwrap();
        arm_echo(conn.clone());
        (conn, addr)
    }

    fn arm_echo(conn: Arc<Connection>) {
        let c = conn.clone();
        conn.read_from(1024, false, move |res| {
            if let Ok(d) = res {
                let reply = Message::ProbeResult {
                    src_ip: *d.src.ip(),
                    src_port: d.src.port(),
                }
                .to_bytes();
                let src = d.src;
                c.write_to(reply, src, |_| {});
                arm_echo(c.clone());
            }
        });
    }

    #[test]
    fn hello_reports_observed_endpoint() {
        let rt = Reactor::new().unwrap().spawn_thread();
        let (server_conn, server_addr) = fake_server(&rt.handle());

        let sock = KernelHandle::udp().unwrap();
        sock.bind(SocketAddrV4::new(std::net::Ipv4Addr::LOCALHOST, 0)).unwrap();
        let local = sock.local_addr().unwrap();
        let fd = sock.duplicate().unwrap();

        let (tx, rx) = mpsc::channel();
        let _session = HelloSession::start(
            &rt.handle(),
            fd,
            server_addr,
            Message::Probe,
            move |res| {
                let _ = tx.send(res);
            },
        )
        .unwrap();

        let observed = rx
            .recv_timeout(Duration::from_secs(2))
            .expect("echo")
            .expect("observed endpoint");
        assert_eq!(observed.port(), local.port());
        server_conn.close();
    }

    #[test]
    fn closed_session_never_completes() {
        let rt = Reactor::new().unwrap().spawn_thread();
        let sock = KernelHandle::udp().unwrap();
        sock.bind(ANY_ADDR).unwrap();
        let fd = sock.duplicate().unwrap();
        let (tx, rx) = mpsc::channel();
        // Nobody answers on this address.
        let server = SocketAddrV4::new(std::net::Ipv4Addr::LOCALHOST, 9);
        let session = HelloSession::start(&rt.handle(), fd, server, Message::Probe, move |res| {
            let _ = tx.send(res);
        })
        .unwrap();
        session.close();
        assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());
    }
}
