//! Symmetric rendezvous, sweeping side.
//!
//! Runs on the peer behind the symmetric NAT, whose mapped source port the
//! other side cannot predict. Per window it binds a fresh UDP socket (a
//! fresh NAT mapping), lets the server observe it, then bursts one magic
//! ping at each of 601 candidate destination ports starting at
//! `1024 + step * 601`. The stationary side answers from whichever pool
//! socket got hit; the reply's source port is the discovered path. Three
//! final `AA BB CC EE` pings confirm the choice before the socket is handed
//! out.
//!
//! Window turnarounds also ping every previously punched handle once, so
//! their NAT mappings do not expire, and re-observe our mapped port against
//! the probe endpoint to detect drift ("port changed") or collisions with a
//! live tunnel ("port stolen").

use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::fd::OwnedFd;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use burrow_core::consts::{SYMM_BASE_PORT, SYMM_WINDOW};
use burrow_core::{ConnId, Error, NodeId, Result};
use tracing::{debug, error, trace, warn};

use burrow_transport::conn::{Connection, Datagram};
use burrow_transport::handle::KernelHandle;
use burrow_transport::opwatch::OpWatch;
use burrow_transport::reactor::ReactorHandle;

use crate::allocator::PortReservation;
use crate::hello::HelloSession;
use crate::protocol::Message;
use crate::session::{
    send_control, support_ping, support_ping_final, RendezvousResult, SessionCallback,
    SessionState,
};

const CHECK_START_INTERVAL: Duration = Duration::from_millis(250);
const WINDOW_TURNAROUND: Duration = Duration::from_secs(1);
const FINAL_PING_INTERVAL: Duration = Duration::from_millis(150);
const FINAL_PING_COUNT: u32 = 3;
const RECV_BUF: usize = 1024;

/// A previously punched path kept alive across sweep windows.
#[derive(Clone)]
pub struct KeepaliveEntry {
    pub handle: Arc<KernelHandle>,
    pub dest: SocketAddrV4,
    pub src_port: u16,
}

struct AccInner {
    state: SessionState,
    step_idx: i32,
    num_ping_sent: u16,
    dest_discovered_port: u16,
    src_port: u16,
    ping_conn: Option<Arc<Connection>>,
    /// Socket retained across the turnaround re-observation.
    parked_fd: Option<OwnedFd>,
    hello: Option<Arc<HelloSession>>,
    hello_done: bool,
    callback: Option<SessionCallback>,
    reservation: Option<Arc<PortReservation>>,
    keepalive: Vec<KeepaliveEntry>,
    watch: OpWatch,
}

pub struct SymmAccSession {
    reactor: ReactorHandle,
    node_id: NodeId,
    conn_id: ConnId,
    owner: bool,
    dst_node: NodeId,
    dest_ip: Ipv4Addr,
    server_udp: SocketAddrV4,
    probe_udp: SocketAddrV4,
    server_conn: Arc<Connection>,
    inner: Mutex<AccInner>,
}

impl SymmAccSession {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        reactor: ReactorHandle,
        node_id: NodeId,
        dst_node: NodeId,
        conn_id: ConnId,
        dest_ip: Ipv4Addr,
        server_udp: SocketAddrV4,
        probe_udp: SocketAddrV4,
        server_conn: Arc<Connection>,
        reservation: Option<Arc<PortReservation>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            reactor,
            node_id,
            conn_id,
            owner: conn_id.node_id == node_id,
            dst_node,
            dest_ip,
            server_udp,
            probe_udp,
            server_conn,
            inner: Mutex::new(AccInner {
                state: SessionState::Unstarted,
                step_idx: 0,
                num_ping_sent: 0,
                dest_discovered_port: 0,
                src_port: 0,
                ping_conn: None,
                parked_fd: None,
                hello: None,
                hello_done: false,
                callback: None,
                reservation,
                keepalive: Vec::new(),
                watch: OpWatch::new(),
            }),
        })
    }

    pub fn conn_id(&self) -> ConnId {
        self.conn_id
    }

    pub fn state(&self) -> SessionState {
        self.inner
            .lock()
            .map(|i| i.state)
            .unwrap_or(SessionState::Failed)
    }

    /// Candidate destination port for sweep position `sent` of `step`.
    fn sweep_port(step: i32, sent: u16) -> Option<u16> {
        let port = SYMM_BASE_PORT as u32 + (step.max(0) as u32) * SYMM_WINDOW as u32 + sent as u32;
        u16::try_from(port).ok()
    }

    pub fn start(self: &Arc<Self>, keepalive: Vec<KeepaliveEntry>, callback: SessionCallback) -> bool {
        {
            let Ok(mut inner) = self.inner.lock() else {
                return false;
            };
            inner.state = SessionState::Preparing;
            inner.callback = Some(callback);
            inner.keepalive = keepalive;
        }
        if self.owner {
            // The stationary side's SYMM_NEXT kicks off the first window.
            return true;
        }
        self.new_window()
    }

    pub fn on_msg(self: &Arc<Self>, msg: &Message) {
        match msg {
            Message::SymmNext { port, .. } => self.on_symm_next(*port),
            _ => trace!("ignoring control msg {:#04x} in sweep", msg.code()),
        }
    }

    fn on_symm_next(self: &Arc<Self>, echoed_port: u16) {
        let has_conn = {
            let Ok(mut inner) = self.inner.lock() else {
                return;
            };
            if inner.callback.is_none() {
                return;
            }
            if echoed_port != 0 && inner.dest_discovered_port == 0 {
                debug!("stationary side echoed discovered port {echoed_port}");
                inner.dest_discovered_port = echoed_port;
            }
            inner.ping_conn.is_some()
        };

        if has_conn {
            self.reobserve_mapping();
        } else {
            let delay = {
                let Ok(inner) = self.inner.lock() else {
                    return;
                };
                if inner.step_idx == 0 {
                    Duration::ZERO
                } else {
                    WINDOW_TURNAROUND
                }
            };
            let this = self.clone();
            self.reactor
                .post(self.wrap(move || this.on_window_turnaround()), delay);
        }
    }

    /// Re-hello against the probe endpoint with the current socket: a
    /// symmetric NAT gives that destination its own mapping, revealing
    /// drift.
    fn reobserve_mapping(self: &Arc<Self>) {
        let conn = {
            let Ok(mut inner) = self.inner.lock() else {
                return;
            };
            match inner.ping_conn.take() {
                Some(conn) => conn,
                None => return,
            }
        };
        let bye_fd = conn.handle().duplicate();
        let keep_fd = conn.handle().duplicate();
        conn.close();
        let bye_fd = match (bye_fd, keep_fd) {
            (Ok(b), Ok(k)) => {
                if let Ok(mut inner) = self.inner.lock() {
                    inner.parked_fd = Some(k);
                }
                b
            }
            _ => {
                self.fail(Error::Closed);
                return;
            }
        };
        let msg = Message::HelloSymmNext {
            src_node: self.node_id,
            dst_node: self.dst_node,
            conn_id: self.conn_id,
            failed: false,
        };
        let this = self.clone();
        match HelloSession::start(
            &self.reactor,
            bye_fd,
            self.probe_udp,
            msg,
            self.wrap1(move |res: Result<SocketAddrV4>| this.on_reobserved(res)),
        ) {
            Ok(hello) => {
                if let Ok(mut inner) = self.inner.lock() {
                    inner.hello = Some(hello);
                }
            }
            Err(e) => self.fail(e),
        }
    }

    fn on_reobserved(self: &Arc<Self>, res: Result<SocketAddrV4>) {
        let observed = match res {
            Ok(o) => o,
            Err(e) => {
                self.fail(e);
                return;
            }
        };
        let delay = {
            let Ok(mut inner) = self.inner.lock() else {
                return;
            };
            inner.hello = None;
            if inner.src_port != 0 && observed.port() != inner.src_port {
                error!("mapped port changed: {} -> {}", inner.src_port, observed.port());
            }
            inner.src_port = observed.port();
            if inner.keepalive.iter().any(|k| k.src_port == observed.port()) {
                error!("mapped port stolen from a live tunnel");
            }
            // Rebuild the ping connection on the parked descriptor.
            if let Some(fd) = inner.parked_fd.take() {
                match KernelHandle::udp_from_fd(fd)
                    .and_then(|h| Connection::new(&self.reactor, h))
                {
                    Ok(conn) => inner.ping_conn = Some(conn),
                    Err(e) => {
                        drop(inner);
                        self.fail(e);
                        return;
                    }
                }
            }
            if inner.step_idx == 0 {
                Duration::ZERO
            } else {
                WINDOW_TURNAROUND
            }
        };
        let this = self.clone();
        self.reactor
            .post(self.wrap(move || this.on_window_turnaround()), delay);
    }

    fn on_window_turnaround(self: &Arc<Self>) {
        let discovered = {
            let Ok(mut inner) = self.inner.lock() else {
                return;
            };
            if inner.callback.is_none() {
                return;
            }
            if inner.dest_discovered_port != 0 {
                inner.step_idx = -1;
                inner.state = SessionState::Punching;
                true
            } else {
                let old = inner.ping_conn.take();
                if let Some(c) = old {
                    drop(inner);
                    c.close();
                }
                false
            }
        };
        if discovered {
            let this = self.clone();
            self.reactor
                .post(self.wrap(move || this.on_send_final(FINAL_PING_COUNT)), Duration::ZERO);
        } else {
            self.new_window();
        }
    }

    /// Fresh socket, fresh NAT mapping, fresh observation, then the burst.
    fn new_window(self: &Arc<Self>) -> bool {
        let step = {
            let Ok(inner) = self.inner.lock() else {
                return false;
            };
            inner.step_idx
        };
        if Self::sweep_port(step, 0).is_none() {
            warn!("no more ports to sweep for {}", self.conn_id);
            self.fail(Error::Rendezvous(1));
            return false;
        }

        let built = (|| -> Result<(Arc<Connection>, OwnedFd)> {
            let (handle, hello_fd) = crate::session::punch_socket()?;
            let conn = Connection::new(&self.reactor, handle)?;
            Ok((conn, hello_fd))
        })();
        let (conn, hello_fd) = match built {
            Ok(v) => v,
            Err(e) => {
                self.fail(e);
                return false;
            }
        };

        let msg = if step == 0 {
            Message::HelloAcc {
                src_node: self.node_id,
                dst_node: self.dst_node,
                conn_id: self.conn_id,
            }
        } else {
            Message::HelloSymmNext {
                src_node: self.node_id,
                dst_node: self.dst_node,
                conn_id: self.conn_id,
                failed: true,
            }
        };
        let this = self.clone();
        let hello = match HelloSession::start(
            &self.reactor,
            hello_fd,
            self.server_udp,
            msg,
            self.wrap1(move |res: Result<SocketAddrV4>| this.on_hello_done(res)),
        ) {
            Ok(h) => h,
            Err(e) => {
                self.fail(e);
                return false;
            }
        };

        {
            let Ok(mut inner) = self.inner.lock() else {
                return false;
            };
            if let Some(res) = &inner.reservation {
                res.use_now();
            }
            inner.ping_conn = Some(conn);
            inner.hello = Some(hello);
            inner.hello_done = false;
            inner.num_ping_sent = 0;
        }

        let this = self.clone();
        self.reactor
            .post(self.wrap(move || this.on_check_start()), Duration::ZERO);
        true
    }

    fn on_hello_done(self: &Arc<Self>, res: Result<SocketAddrV4>) {
        match res {
            Ok(observed) => {
                let Ok(mut inner) = self.inner.lock() else {
                    return;
                };
                if inner.src_port != 0 && observed.port() != inner.src_port {
                    trace!(
                        "window mapping moved: {} -> {}",
                        inner.src_port,
                        observed.port()
                    );
                }
                inner.src_port = observed.port();
                if inner.keepalive.iter().any(|k| k.src_port == observed.port()) {
                    error!("mapped port stolen from a live tunnel");
                }
                inner.hello = None;
                inner.hello_done = true;
            }
            Err(e) => self.fail(e),
        }
    }

    fn on_check_start(self: &Arc<Self>) {
        let ready = {
            let Ok(inner) = self.inner.lock() else {
                return;
            };
            if inner.callback.is_none() {
                return;
            }
            inner.hello_done && inner.ping_conn.is_some()
        };
        if ready {
            if let Ok(mut inner) = self.inner.lock() {
                inner.state = SessionState::Punching;
            }
            self.arm_recv();
            self.send_next_sweep_ping();
        } else {
            let this = self.clone();
            self.reactor
                .post(self.wrap(move || this.on_check_start()), CHECK_START_INTERVAL);
        }
    }

    fn arm_recv(self: &Arc<Self>) {
        let conn = match self.inner.lock() {
            Ok(inner) => inner.ping_conn.clone(),
            Err(_) => None,
        };
        let Some(conn) = conn else {
            return;
        };
        let this = self.clone();
        conn.read_from(
            RECV_BUF,
            false,
            self.wrap1(move |res: Result<Datagram>| this.on_recv_ping(res)),
        );
    }

    fn on_recv_ping(self: &Arc<Self>, res: Result<Datagram>) {
        let datagram = match res {
            Ok(d) => d,
            Err(e) => {
                if !e.is_closed() {
                    self.fail(e);
                }
                return;
            }
        };
        {
            let Ok(mut inner) = self.inner.lock() else {
                return;
            };
            if inner.callback.is_none() {
                return;
            }
            if datagram.data.len() == 4
                && datagram.data[..] == burrow_core::consts::SUPPORT_PING
                && *datagram.src.ip() == self.dest_ip
            {
                debug!("sweep reply from {}", datagram.src);
                inner.dest_discovered_port = datagram.src.port();
            } else if *datagram.src.ip() == self.dest_ip {
                trace!("non-ping traffic from peer during sweep");
            } else {
                warn!("unexpected datagram from {} during sweep", datagram.src);
            }
        }
        self.arm_recv();
    }

    /// The burst: one ping per candidate port, chained on send completion.
    fn send_next_sweep_ping(self: &Arc<Self>) {
        let (conn, dest) = {
            let Ok(inner) = self.inner.lock() else {
                return;
            };
            if inner.callback.is_none() {
                return;
            }
            let Some(conn) = inner.ping_conn.clone() else {
                return;
            };
            let Some(port) = Self::sweep_port(inner.step_idx, inner.num_ping_sent) else {
                drop(inner);
                self.finish_window();
                return;
            };
            (conn, SocketAddrV4::new(self.dest_ip, port))
        };
        let this = self.clone();
        conn.write_to(
            support_ping(),
            dest,
            self.wrap1(move |res: Result<()>| this.on_sweep_ping_sent(res)),
        );
    }

    fn on_sweep_ping_sent(self: &Arc<Self>, res: Result<()>) {
        if let Err(e) = res {
            if !e.is_closed() {
                self.fail(e);
            }
            return;
        }
        let window_done = {
            let Ok(mut inner) = self.inner.lock() else {
                return;
            };
            if inner.callback.is_none() {
                return;
            }
            inner.num_ping_sent += 1;
            inner.num_ping_sent >= SYMM_WINDOW
                || Self::sweep_port(inner.step_idx, inner.num_ping_sent).is_none()
        };
        if window_done {
            self.finish_window();
        } else {
            self.send_next_sweep_ping();
        }
    }

    fn finish_window(self: &Arc<Self>) {
        let keepalive = {
            let Ok(mut inner) = self.inner.lock() else {
                return;
            };
            if inner.callback.is_none() {
                return;
            }
            inner.step_idx += 1;
            inner.keepalive.clone()
        };
        // Keep the NAT mappings of every established tunnel warm once per
        // step.
        for entry in &keepalive {
            entry.handle.ping(entry.dest);
        }
        send_control(
            &self.server_conn,
            &Message::SymmNext {
                conn_id: self.conn_id,
                port: 0,
            },
        );
    }

    fn on_send_final(self: &Arc<Self>, remaining: u32) {
        if remaining == 0 {
            self.complete();
            return;
        }
        let (conn, dest) = {
            let Ok(inner) = self.inner.lock() else {
                return;
            };
            if inner.callback.is_none() {
                return;
            }
            let Some(conn) = inner.ping_conn.clone() else {
                return;
            };
            (
                conn,
                SocketAddrV4::new(self.dest_ip, inner.dest_discovered_port),
            )
        };
        trace!("final confirmation ping to {dest}");
        conn.write_to(support_ping_final(), dest, |res| {
            if let Err(e) = res {
                trace!("final ping failed: {e}");
            }
        });
        let this = self.clone();
        self.reactor.post(
            self.wrap(move || this.on_send_final(remaining - 1)),
            FINAL_PING_INTERVAL,
        );
    }

    fn complete(self: &Arc<Self>) {
        let (cb, conn, reservation, peer, src_port) = {
            let Ok(mut inner) = self.inner.lock() else {
                return;
            };
            let Some(cb) = inner.callback.take() else {
                return;
            };
            inner.state = SessionState::Established;
            (
                cb,
                inner.ping_conn.take(),
                inner.reservation.take(),
                SocketAddrV4::new(self.dest_ip, inner.dest_discovered_port),
                inner.src_port,
            )
        };
        if let Some(res) = &reservation {
            res.keepalive();
        }
        send_control(
            &self.server_conn,
            &Message::SymmDoneOut {
                dst_node: self.dst_node,
                conn_id: self.conn_id,
            },
        );
        let Some(conn) = conn else {
            cb(Err(Error::Closed));
            return;
        };
        let fd = conn.handle().duplicate();
        conn.close();
        match fd {
            Ok(fd) => {
                debug!("symmetric punch done for {} via {peer}", self.conn_id);
                cb(Ok(RendezvousResult {
                    fd,
                    peer,
                    src_port,
                    reservation,
                }));
            }
            Err(e) => cb(Err(e)),
        }
    }

    pub fn fail(self: &Arc<Self>, err: Error) {
        let (cb, hello, conn) = {
            let Ok(mut inner) = self.inner.lock() else {
                return;
            };
            let Some(cb) = inner.callback.take() else {
                return;
            };
            inner.state = SessionState::Failed;
            inner.reservation = None;
            inner.parked_fd = None;
            (cb, inner.hello.take(), inner.ping_conn.take())
        };
        if let Some(h) = hello {
            h.close();
        }
        if let Some(c) = conn {
            c.close();
        }
        cb(Err(err));
    }

    fn wrap<F: FnOnce() + Send + 'static>(&self, f: F) -> impl FnOnce() + Send + 'static {
        let watch = self
            .inner
            .lock()
            .map(|i| i.watch.clone())
            .unwrap_or_default();
        watch.wrap(f)
    }

    fn wrap1<T, F>(&self, f: F) -> impl FnOnce(T) + Send + 'static
    where
        T: Send + 'static,
        F: FnOnce(T) + Send + 'static,
    {
        let watch = self
            .inner
            .lock()
            .map(|i| i.watch.clone())
            .unwrap_or_default();
        watch.wrap1(f)
    }
}

impl Drop for SymmAccSession {
    fn drop(&mut self) {
        let watch = self.inner.lock().map(|i| i.watch.clone());
        if let Ok(watch) = watch {
            watch.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sweep_ports_walk_windows() {
        assert_eq!(SymmAccSession::sweep_port(0, 0), Some(1024));
        assert_eq!(SymmAccSession::sweep_port(0, 600), Some(1624));
        assert_eq!(SymmAccSession::sweep_port(1, 0), Some(1024 + 601));
        assert_eq!(SymmAccSession::sweep_port(2, 5), Some(1024 + 2 * 601 + 5));
    }

    #[test]
    fn sweep_runs_out_of_ports() {
        // Step 108 starts above 65535 and must end the sweep.
        assert!(SymmAccSession::sweep_port(108, 0).is_none());
        assert!(SymmAccSession::sweep_port(107, 0).is_some());
    }
}
