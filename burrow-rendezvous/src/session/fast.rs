//! Fast rendezvous: at least one side is behind a non-symmetric NAT.
//!
//! Both sides reserve two Fast ports, bind a UDP socket, and let the server
//! observe its mapped 4-tuple through a transient hello; the server echoes
//! each side's external endpoint to the other via `FAST`. Each side then
//! probes the peer with the 4-byte magic, TTL starting at 2 and climbing one
//! step every 25 ms (paced by the peer's `NEXT` acknowledgments) up to 64. A
//! matching reply completes the session. The owner restarts the whole round
//! with fresh ports (at most twice) when a TTL ramp runs dry.

use std::net::SocketAddrV4;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use burrow_core::consts::{PUNCH_MAX_STEPS, PUNCH_STEP, PUNCH_TTL_END, PUNCH_TTL_START};
use burrow_core::{ConnId, Error, NodeId, Result};
use tracing::{debug, trace, warn};

use burrow_transport::conn::{Connection, Datagram};
use burrow_transport::opwatch::OpWatch;
use burrow_transport::reactor::ReactorHandle;

use crate::allocator::{PortAllocator, PortReservation};
use crate::hello::HelloSession;
use crate::protocol::Message;
use crate::session::{
    punch_socket, send_control, support_ping, RendezvousResult, SessionCallback, SessionState,
};

/// Interval of the hello-completion poll while waiting to start pinging.
const CHECK_START_INTERVAL: Duration = Duration::from_millis(250);
const PING_RECV_BUF: usize = 4096;

struct FastInner {
    state: SessionState,
    ready: bool,
    step_idx: u32,
    ttl: u32,
    /// Peer acknowledged our last probe; we may send the next one.
    next_ok: bool,
    dest: Option<SocketAddrV4>,
    orig_ttl: u32,
    reservation: Option<Arc<PortReservation>>,
    /// Fresh pair for the next round once the current ramp fails.
    reservation_next: Option<Arc<PortReservation>>,
    ping_conn: Option<Arc<Connection>>,
    hello: Option<Arc<HelloSession>>,
    hello_done: bool,
    callback: Option<SessionCallback>,
    watch: OpWatch,
}

pub struct FastSession {
    reactor: ReactorHandle,
    allocator: Arc<PortAllocator>,
    node_id: NodeId,
    conn_id: ConnId,
    owner: bool,
    best_effort: bool,
    dst_node: NodeId,
    server_udp: SocketAddrV4,
    server_conn: Arc<Connection>,
    inner: Mutex<FastInner>,
}

impl FastSession {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        reactor: ReactorHandle,
        allocator: Arc<PortAllocator>,
        node_id: NodeId,
        dst_node: NodeId,
        conn_id: ConnId,
        server_udp: SocketAddrV4,
        server_conn: Arc<Connection>,
        best_effort: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            reactor,
            allocator,
            node_id,
            conn_id,
            owner: conn_id.node_id == node_id,
            best_effort,
            dst_node,
            server_udp,
            server_conn,
            inner: Mutex::new(FastInner {
                state: SessionState::Unstarted,
                ready: false,
                step_idx: 0,
                ttl: PUNCH_TTL_START,
                next_ok: true,
                dest: None,
                orig_ttl: 64,
                reservation: None,
                reservation_next: None,
                ping_conn: None,
                hello: None,
                hello_done: false,
                callback: None,
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

    /// Begin the punch. The owner reserves its port pair and announces
    /// READY; the non-owner waits for the relayed READY first.
    pub fn start(self: &Arc<Self>, callback: SessionCallback) -> bool {
        let ready;
        {
            let Ok(mut inner) = self.inner.lock() else {
                return false;
            };
            inner.state = SessionState::Preparing;
            inner.callback = Some(callback);
            ready = inner.ready;
        }

        if self.owner {
            if self.best_effort {
                let this = self.clone();
                let res = self
                    .allocator
                    .reserve_fast_ports_best_effort(2, self.wrap(move || this.on_port_reservation()));
                if let Ok(mut inner) = self.inner.lock() {
                    inner.reservation = Some(res);
                }
                return true;
            }
            let Some(res) = self.allocator.reserve_fast_ports(2) else {
                return false;
            };
            {
                let Ok(mut inner) = self.inner.lock() else {
                    return false;
                };
                inner.reservation = Some(res);
                inner.ready = true;
            }
            send_control(&self.server_conn, &Message::Ready { conn_id: self.conn_id });
            return true;
        }

        // Non-owner: a READY may already have been relayed before start.
        if ready {
            self.reserve_and_go();
        }
        true
    }

    /// Control-channel traffic relayed to this session by conn id.
    pub fn on_msg(self: &Arc<Self>, msg: &Message) {
        match msg {
            Message::Ready { .. } => self.on_ready(),
            Message::Fast {
                node_ip, node_port, ..
            } => {
                let dest = SocketAddrV4::new(*node_ip, *node_port);
                debug!("peer endpoint for {}: {dest}", self.conn_id);
                let fire = {
                    let Ok(mut inner) = self.inner.lock() else {
                        return;
                    };
                    if inner.callback.is_none() {
                        return;
                    }
                    inner.dest = Some(dest);
                    // A relayed duplicate (the peer re-announced itself) only
                    // refreshes the endpoint; the punch socket stays.
                    self.owner && inner.reservation.is_some() && inner.ping_conn.is_none()
                };
                if fire {
                    self.on_port_reservation();
                }
            }
            Message::Next { .. } => {
                if let Ok(mut inner) = self.inner.lock() {
                    inner.next_ok = true;
                }
            }
            _ => {}
        }
    }

    fn on_ready(self: &Arc<Self>) {
        let restart = {
            let Ok(mut inner) = self.inner.lock() else {
                return;
            };
            inner.ready = true;
            if inner.state == SessionState::Unstarted || inner.callback.is_none() {
                return;
            }
            !self.owner && inner.reservation.is_some()
        };

        if restart {
            // The owner gave up on the previous round; scrap its state and
            // rebuild with fresh ports.
            warn!("restarting punch round for {}", self.conn_id);
            let Ok(mut inner) = self.inner.lock() else {
                return;
            };
            inner.step_idx += 1;
            inner.ttl = PUNCH_TTL_START;
            inner.next_ok = true;
            inner.dest = None;
            inner.hello_done = false;
            let old_watch = std::mem::replace(&mut inner.watch, OpWatch::new());
            let old_hello = inner.hello.take();
            let old_ping = inner.ping_conn.take();
            inner.reservation = None;
            drop(inner);
            old_watch.close();
            if let Some(h) = old_hello {
                h.close();
            }
            if let Some(c) = old_ping {
                c.close();
            }
        }

        self.reserve_and_go();
    }

    fn reserve_and_go(self: &Arc<Self>) {
        if self.best_effort {
            let this = self.clone();
            let res = self
                .allocator
                .reserve_fast_ports_best_effort(2, self.wrap(move || this.on_port_reservation()));
            if let Ok(mut inner) = self.inner.lock() {
                inner.reservation = Some(res);
            }
            return;
        }
        match self.allocator.reserve_fast_ports(2) {
            Some(res) => {
                if let Ok(mut inner) = self.inner.lock() {
                    inner.reservation = Some(res);
                }
                self.on_port_reservation();
            }
            None => self.fail(Error::Rendezvous(1)),
        }
    }

    /// Ports are in hand: bind the punch socket, let the server observe it,
    /// and start polling for readiness to ping.
    fn on_port_reservation(self: &Arc<Self>) {
        {
            let Ok(mut inner) = self.inner.lock() else {
                return;
            };
            if inner.callback.is_none() {
                return;
            }
            if !inner.ready {
                // Owner's deferred reservation arrived first; announce READY
                // and wait for the peer's endpoint.
                inner.ready = true;
                drop(inner);
                send_control(&self.server_conn, &Message::Ready { conn_id: self.conn_id });
                return;
            }
            if self.owner && inner.reservation_next.is_some() {
                // A failed ramp queued the next round: swap reservations and
                // re-announce.
                inner.step_idx += 1;
                inner.ttl = PUNCH_TTL_START;
                inner.next_ok = true;
                inner.dest = None;
                inner.hello_done = false;
                inner.reservation = inner.reservation_next.take();
                let old_hello = inner.hello.take();
                let old_ping = inner.ping_conn.take();
                if let Some(res) = &inner.reservation {
                    res.use_now();
                }
                drop(inner);
                if let Some(h) = old_hello {
                    h.close();
                }
                if let Some(c) = old_ping {
                    c.close();
                }
                send_control(&self.server_conn, &Message::Ready { conn_id: self.conn_id });
                return;
            }
        }

        if let Err(e) = self.open_punch_socket() {
            self.fail(e);
        }
    }

    fn open_punch_socket(self: &Arc<Self>) -> Result<()> {
        let (handle, hello_fd) = punch_socket()?;
        let orig_ttl = handle.ttl().unwrap_or(64).max(1);
        let ping_conn = Connection::new(&self.reactor, handle)?;

        let hello_msg = if self.owner {
            Message::HelloConn {
                src_node: self.node_id,
                dst_node: self.dst_node,
                conn_id: self.conn_id,
                remote_ip: *self.server_udp.ip(),
                remote_port: self.server_udp.port(),
            }
        } else {
            Message::HelloAcc {
                src_node: self.node_id,
                dst_node: self.dst_node,
                conn_id: self.conn_id,
            }
        };

        let this = self.clone();
        let hello = HelloSession::start(
            &self.reactor,
            hello_fd,
            self.server_udp,
            hello_msg,
            self.wrap1(move |res: Result<SocketAddrV4>| this.on_hello_done(res)),
        )?;

        {
            let Ok(mut inner) = self.inner.lock() else {
                return Err(Error::Closed);
            };
            if let Some(res) = &inner.reservation {
                res.use_now();
            }
            inner.orig_ttl = orig_ttl;
            inner.ping_conn = Some(ping_conn);
            inner.hello = Some(hello);
            inner.state = SessionState::Preparing;
        }

        let this = self.clone();
        self.reactor
            .post(self.wrap(move || this.on_check_start()), Duration::ZERO);
        Ok(())
    }

    fn on_hello_done(self: &Arc<Self>, res: Result<SocketAddrV4>) {
        match res {
            Ok(observed) => {
                trace!("server observed us at {observed} for {}", self.conn_id);
                if let Ok(mut inner) = self.inner.lock() {
                    inner.hello_done = true;
                    inner.hello = None;
                }
            }
            Err(e) => self.fail(e),
        }
    }

    /// Poll until both the peer endpoint and our hello echo are in; then
    /// arm the ping reader and the TTL ramp.
    fn on_check_start(self: &Arc<Self>) {
        let go = {
            let Ok(inner) = self.inner.lock() else {
                return;
            };
            if inner.callback.is_none() {
                return;
            }
            inner.dest.is_some() && inner.hello_done
        };
        if go {
            if let Ok(mut inner) = self.inner.lock() {
                inner.state = SessionState::Punching;
            }
            self.arm_ping_recv();
            let this = self.clone();
            self.reactor
                .post(self.wrap(move || this.on_ping_timer()), Duration::ZERO);
        } else {
            let this = self.clone();
            self.reactor
                .post(self.wrap(move || this.on_check_start()), CHECK_START_INTERVAL);
        }
    }

    fn arm_ping_recv(self: &Arc<Self>) {
        let conn = match self.inner.lock() {
            Ok(inner) => inner.ping_conn.clone(),
            Err(_) => None,
        };
        let Some(conn) = conn else {
            return;
        };
        let this = self.clone();
        conn.read_from(
            PING_RECV_BUF,
            false,
            self.wrap1(move |res: Result<Datagram>| this.on_recv_ping(res)),
        );
    }

    fn on_recv_ping(self: &Arc<Self>, res: Result<Datagram>) {
        let datagram = match res {
            Ok(d) => d,
            Err(e) => {
                self.fail(e);
                return;
            }
        };
        let dest = {
            let Ok(inner) = self.inner.lock() else {
                return;
            };
            if inner.callback.is_none() {
                return;
            }
            match inner.dest {
                Some(d) => d,
                None => return,
            }
        };

        if datagram.data.len() != 4 {
            if datagram.src == dest {
                // Could be an early stream SYN from the peer's side; our own
                // stream endpoint will answer it after the handoff.
                trace!("non-ping traffic from peer during punch");
            } else {
                warn!("bad ping length {} from {}", datagram.data.len(), datagram.src);
            }
            self.arm_ping_recv();
            return;
        }
        if datagram.data[..] != burrow_core::consts::SUPPORT_PING {
            warn!("bad ping magic from {}", datagram.src);
            self.arm_ping_recv();
            return;
        }
        if datagram.src != dest {
            warn!("ping from unexpected source {} (want {dest})", datagram.src);
            self.arm_ping_recv();
            return;
        }

        self.complete(datagram.src);
    }

    /// The TTL ramp: one probe per 25 ms step, gated on the peer's NEXT.
    fn on_ping_timer(self: &Arc<Self>) {
        enum RampEnd {
            Keep,
            NextRound,
            Fail,
        }
        let (conn, dest, ramp) = {
            let Ok(mut inner) = self.inner.lock() else {
                return;
            };
            if inner.callback.is_none() {
                return;
            }
            let (Some(dest), Some(conn)) = (inner.dest, inner.ping_conn.clone()) else {
                return;
            };
            if !inner.next_ok {
                drop(inner);
                let this = self.clone();
                self.reactor
                    .post(self.wrap(move || this.on_ping_timer()), PUNCH_STEP);
                return;
            }
            inner.next_ok = false;
            let ttl = inner.ttl.min(PUNCH_TTL_END - 1);
            if let Some(c) = &inner.ping_conn {
                let _ = c.handle().set_ttl(ttl);
            }
            if let Some(res) = &inner.reservation {
                res.use_now();
            }
            inner.ttl += 1;
            let ramp = if self.owner && inner.ttl == PUNCH_TTL_END {
                if inner.step_idx >= PUNCH_MAX_STEPS {
                    RampEnd::Fail
                } else {
                    RampEnd::NextRound
                }
            } else {
                RampEnd::Keep
            };
            (conn, dest, ramp)
        };

        trace!("punch ping to {dest} for {}", self.conn_id);
        let this = self.clone();
        conn.write_to(
            support_ping(),
            dest,
            self.wrap1(move |res: Result<()>| this.on_ping_sent(res)),
        );

        match ramp {
            RampEnd::Keep => {
                let this = self.clone();
                self.reactor
                    .post(self.wrap(move || this.on_ping_timer()), PUNCH_STEP);
            }
            RampEnd::NextRound => {
                warn!(
                    "ttl ramp exhausted for {}, moving to the next round",
                    self.conn_id
                );
                if self.best_effort {
                    let this = self.clone();
                    let res = self.allocator.reserve_fast_ports_best_effort(
                        2,
                        self.wrap(move || this.on_port_reservation()),
                    );
                    if let Ok(mut inner) = self.inner.lock() {
                        inner.reservation_next = Some(res);
                    }
                } else {
                    match self.allocator.reserve_fast_ports(2) {
                        Some(res) => {
                            if let Ok(mut inner) = self.inner.lock() {
                                inner.reservation_next = Some(res);
                            }
                            self.on_port_reservation();
                        }
                        None => self.fail(Error::Rendezvous(1)),
                    }
                }
            }
            RampEnd::Fail => {
                warn!("punch failed for {}", self.conn_id);
                self.fail(Error::Rendezvous(1));
            }
        }
    }

    fn on_ping_sent(self: &Arc<Self>, res: Result<()>) {
        match res {
            // Our probe is out; let the peer take its next step.
            Ok(()) => send_control(&self.server_conn, &Message::Next { conn_id: self.conn_id }),
            Err(e) => {
                if !e.is_closed() {
                    self.fail(e);
                }
            }
        }
    }

    fn complete(self: &Arc<Self>, peer: SocketAddrV4) {
        let (cb, conn, reservation, orig_ttl) = {
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
                inner.orig_ttl,
            )
        };
        if let Some(res) = &reservation {
            res.keepalive();
        }
        let Some(conn) = conn else {
            cb(Err(Error::Closed));
            return;
        };
        let _ = conn.handle().set_ttl(orig_ttl);
        let fd = conn.handle().duplicate();
        conn.close();
        match fd {
            Ok(fd) => {
                debug!("punched {} via {peer}", self.conn_id);
                cb(Ok(RendezvousResult {
                    fd,
                    peer,
                    src_port: 0,
                    reservation,
                }));
            }
            Err(e) => cb(Err(e)),
        }
    }

    /// Fail exactly once: every error path and the outer watchdog land here.
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
            inner.reservation_next = None;
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

impl Drop for FastSession {
    fn drop(&mut self) {
        if let Ok(inner) = self.inner.lock() {
            inner.watch.close();
        }
    }
}
