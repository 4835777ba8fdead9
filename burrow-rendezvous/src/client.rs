//! Control-plane client.
//!
//! Owns the persistent TCP connection to the rendezvous server and the
//! per-connection punch sessions. On startup it probes the server's two UDP
//! observation ports from one socket: differing mapped ports mean we sit
//! behind a symmetric NAT, which the server uses for role assignment. Once a
//! session yields a punched socket, the client binds a stream endpoint to it
//! and either connects across the punched 4-tuple (connector side) or
//! listens for the peer's stream (acceptor side).

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use burrow_core::consts::RENDEZVOUS_TIMEOUT;
use burrow_core::{ConnId, Error, NodeId, Result};
use bytes::{Bytes, BytesMut};
use tracing::{debug, info, trace, warn};

use burrow_stream::{StreamAcceptor, StreamHandle, StreamManager};
use burrow_transport::conn::Connection;
use burrow_transport::connector::Connector;
use burrow_transport::handle::{KernelHandle, ANY_ADDR};
use burrow_transport::opwatch::OpWatch;
use burrow_transport::reactor::ReactorHandle;

use crate::allocator::PortAllocator;
use crate::hello::HelloSession;
use crate::protocol::{ErrorCode, Message, Role};
use crate::session::{
    FastSession, KeepaliveEntry, RendezvousResult, SymmAccSession, SymmConnSession,
};

/// How long the startup probes may take before we assume a quiet,
/// non-symmetric path.
const PROBE_TIMEOUT: Duration = Duration::from_secs(3);
const READ_CHUNK: usize = 4096;

pub type ConnectCallback = Box<dyn FnOnce(Result<StreamHandle>) + Send + 'static>;
pub type AcceptHandler = Box<dyn FnMut(StreamHandle) + Send + 'static>;
type ReadyCallback = Box<dyn FnOnce(Result<()>) + Send + 'static>;

#[derive(Debug, Clone)]
pub struct ControlClientConfig {
    pub node_id: NodeId,
    pub server_tcp: SocketAddrV4,
    /// UDP observation endpoint (same port as TCP by convention).
    pub server_udp: SocketAddrV4,
    /// Second observation port for symmetric-NAT detection.
    pub probe_udp: SocketAddrV4,
    /// Queue for Fast ports instead of failing when the pool is tight.
    pub best_effort_reservations: bool,
}

enum SessionKind {
    Fast(Arc<FastSession>),
    SymmAcc(Arc<SymmAccSession>),
    SymmConn(Arc<SymmConnSession>),
}

impl SessionKind {
    fn on_msg(&self, msg: &Message) {
        match self {
            SessionKind::Fast(s) => s.on_msg(msg),
            SessionKind::SymmAcc(s) => s.on_msg(msg),
            SessionKind::SymmConn(s) => s.on_msg(msg),
        }
    }

    fn fail(&self, err: Error) {
        match self {
            SessionKind::Fast(s) => s.fail(err),
            SessionKind::SymmAcc(s) => s.fail(err),
            SessionKind::SymmConn(s) => s.fail(err),
        }
    }
}

struct SessionEntry {
    kind: SessionKind,
}

struct Pending {
    dst_node: NodeId,
    callback: Option<ConnectCallback>,
}

struct ClientState {
    conn: Option<Arc<Connection>>,
    connector: Option<Arc<Connector>>,
    recv_acc: BytesMut,
    next_idx: u32,
    /// Requests awaiting CONN_OK / CONN_ERR.
    pending: HashMap<ConnId, Pending>,
    sessions: HashMap<ConnId, SessionEntry>,
    accept_handler: Option<AcceptHandler>,
    acceptors: Vec<StreamAcceptor>,
    keepalive: Vec<KeepaliveEntry>,
    reservations: Vec<Arc<crate::allocator::PortReservation>>,
    probe_sessions: Vec<Arc<HelloSession>>,
    probe_first: Option<SocketAddrV4>,
    probe_second: Option<SocketAddrV4>,
    probe_decided: bool,
    symmetric: bool,
    mapped: Option<SocketAddrV4>,
    ready_cb: Option<ReadyCallback>,
    registered: bool,
}

pub struct ControlClient {
    reactor: ReactorHandle,
    stream_mgr: Arc<StreamManager>,
    allocator: Arc<PortAllocator>,
    config: ControlClientConfig,
    state: Mutex<ClientState>,
    watch: OpWatch,
}

impl ControlClient {
    pub fn new(
        reactor: ReactorHandle,
        stream_mgr: Arc<StreamManager>,
        allocator: Arc<PortAllocator>,
        config: ControlClientConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            reactor,
            stream_mgr,
            allocator,
            config,
            state: Mutex::new(ClientState {
                conn: None,
                connector: None,
                recv_acc: BytesMut::new(),
                next_idx: 1,
                pending: HashMap::new(),
                sessions: HashMap::new(),
                accept_handler: None,
                acceptors: Vec::new(),
                keepalive: Vec::new(),
                reservations: Vec::new(),
                probe_sessions: Vec::new(),
                probe_first: None,
                probe_second: None,
                probe_decided: false,
                symmetric: false,
                mapped: None,
                ready_cb: None,
                registered: false,
            }),
            watch: OpWatch::new(),
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.config.node_id
    }

    /// NAT classification from the startup probes.
    pub fn is_symmetric(&self) -> bool {
        self.state.lock().map(|st| st.symmetric).unwrap_or(false)
    }

    /// Streams accepted from punching peers land here.
    pub fn set_accept_handler<F>(&self, handler: F)
    where
        F: FnMut(StreamHandle) + Send + 'static,
    {
        if let Ok(mut st) = self.state.lock() {
            st.accept_handler = Some(Box::new(handler));
        }
    }

    /// Probe, connect, register. `on_ready` fires once the HELLO went out
    /// (or with the startup error).
    pub fn start<F>(self: &Arc<Self>, on_ready: F)
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        {
            let Ok(mut st) = self.state.lock() else {
                on_ready(Err(Error::Closed));
                return;
            };
            st.ready_cb = Some(Box::new(on_ready));
        }
        self.start_probes();
    }

    fn start_probes(self: &Arc<Self>) {
        let built = (|| -> Result<_> {
            let sock = KernelHandle::udp()?;
            sock.bind(ANY_ADDR)?;
            let fd1 = sock.duplicate()?;
            let fd2 = sock.duplicate()?;
            sock.close();
            Ok((fd1, fd2))
        })();
        let (fd1, fd2) = match built {
            Ok(v) => v,
            Err(e) => {
                self.finish_ready(Err(e));
                return;
            }
        };

        // Identified probes: the server records both observations per node
        // and derives the symmetric flag on its side as well.
        let probe_msg = Message::Hello {
            node_id: self.config.node_id,
            probe_ip: Ipv4Addr::UNSPECIFIED,
            probe_port: 0,
        };
        let this = self.clone();
        let first = HelloSession::start(
            &self.reactor,
            fd1,
            self.config.server_udp,
            probe_msg.clone(),
            self.watch.wrap1(move |res: Result<SocketAddrV4>| {
                this.on_probe_result(true, res);
            }),
        );
        let this = self.clone();
        let second = HelloSession::start(
            &self.reactor,
            fd2,
            self.config.probe_udp,
            probe_msg,
            self.watch.wrap1(move |res: Result<SocketAddrV4>| {
                this.on_probe_result(false, res);
            }),
        );
        {
            let Ok(mut st) = self.state.lock() else {
                return;
            };
            if let Ok(s) = first {
                st.probe_sessions.push(s);
            }
            if let Ok(s) = second {
                st.probe_sessions.push(s);
            }
        }
        let this = self.clone();
        self.reactor.post(
            self.watch.wrap(move || this.decide_nat(true)),
            PROBE_TIMEOUT,
        );
    }

    fn on_probe_result(self: &Arc<Self>, first: bool, res: Result<SocketAddrV4>) {
        let both = {
            let Ok(mut st) = self.state.lock() else {
                return;
            };
            match res {
                Ok(addr) => {
                    if first {
                        st.probe_first = Some(addr);
                    } else {
                        st.probe_second = Some(addr);
                    }
                }
                Err(e) => trace!("probe leg failed: {e}"),
            }
            st.probe_first.is_some() && st.probe_second.is_some()
        };
        if both {
            self.decide_nat(false);
        }
    }

    fn decide_nat(self: &Arc<Self>, timed_out: bool) {
        let proceed = {
            let Ok(mut st) = self.state.lock() else {
                return;
            };
            if st.probe_decided {
                false
            } else {
                st.probe_decided = true;
                for s in st.probe_sessions.drain(..) {
                    s.close();
                }
                st.mapped = st.probe_first;
                st.symmetric = match (st.probe_first, st.probe_second) {
                    (Some(a), Some(b)) => a.port() != b.port(),
                    // One or both probes unanswered: assume the friendlier
                    // kind and let punching find out.
                    _ => false,
                };
                if timed_out {
                    debug!("probe timeout, assuming non-symmetric NAT");
                }
                info!(
                    "nat probe: mapped={:?} symmetric={}",
                    st.mapped, st.symmetric
                );
                true
            }
        };
        if proceed {
            self.connect_control();
        }
    }

    fn connect_control(self: &Arc<Self>) {
        let built = KernelHandle::tcp().map(|h| Connector::new(&self.reactor, h));
        let connector = match built {
            Ok(c) => c,
            Err(e) => {
                self.finish_ready(Err(e));
                return;
            }
        };
        if let Ok(mut st) = self.state.lock() {
            st.connector = Some(connector.clone());
        }
        let this = self.clone();
        let res = connector.connect(
            self.config.server_tcp,
            self.watch.wrap1(move |res: Result<()>| {
                this.on_control_connected(res);
            }),
        );
        if let Err(e) = res {
            self.finish_ready(Err(e));
        }
    }

    fn on_control_connected(self: &Arc<Self>, res: Result<()>) {
        if let Err(e) = res {
            warn!("cannot reach rendezvous server: {e}");
            self.finish_ready(Err(e));
            return;
        }
        let conn = {
            let Ok(mut st) = self.state.lock() else {
                return;
            };
            let Some(connector) = st.connector.take() else {
                return;
            };
            let handle = connector.handle().clone();
            connector.close();
            match Connection::new(&self.reactor, handle) {
                Ok(conn) => {
                    st.conn = Some(conn.clone());
                    conn
                }
                Err(e) => {
                    drop(st);
                    self.finish_ready(Err(e));
                    return;
                }
            }
        };
        let mapped = self
            .state
            .lock()
            .ok()
            .and_then(|st| st.mapped)
            .unwrap_or(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0));
        let hello = Message::Hello {
            node_id: self.config.node_id,
            probe_ip: *mapped.ip(),
            probe_port: mapped.port(),
        };
        let this = self.clone();
        conn.write(
            hello.to_bytes(),
            self.watch.wrap1(move |res: Result<()>| match res {
                Ok(()) => {
                    info!("registered with rendezvous server");
                    if let Ok(mut st) = this.state.lock() {
                        st.registered = true;
                    }
                    this.finish_ready(Ok(()));
                    this.arm_control_read();
                }
                Err(e) => this.finish_ready(Err(e)),
            }),
        );
    }

    fn finish_ready(self: &Arc<Self>, res: Result<()>) {
        let cb = self.state.lock().ok().and_then(|mut st| st.ready_cb.take());
        if let Some(cb) = cb {
            cb(res);
        }
    }

    fn arm_control_read(self: &Arc<Self>) {
        let conn = self.state.lock().ok().and_then(|st| st.conn.clone());
        let Some(conn) = conn else {
            return;
        };
        let this = self.clone();
        conn.read(
            READ_CHUNK,
            false,
            self.watch.wrap1(move |res: Result<Bytes>| {
                this.on_control_read(res);
            }),
        );
    }

    fn on_control_read(self: &Arc<Self>, res: Result<Bytes>) {
        let chunk = match res {
            Ok(c) if !c.is_empty() => c,
            Ok(_) => {
                warn!("rendezvous server closed the control channel");
                self.on_control_lost(Error::Closed);
                return;
            }
            Err(e) => {
                if !e.is_closed() {
                    warn!("control channel read failed: {e}");
                }
                self.on_control_lost(e);
                return;
            }
        };

        let mut msgs = Vec::new();
        {
            let Ok(mut st) = self.state.lock() else {
                return;
            };
            st.recv_acc.extend_from_slice(&chunk);
            loop {
                match Message::decode(&mut st.recv_acc) {
                    Ok(Some(msg)) => msgs.push(msg),
                    Ok(None) => break,
                    Err(e) => {
                        drop(st);
                        warn!("protocol error on control channel: {e}");
                        self.on_control_lost(e);
                        return;
                    }
                }
            }
        }
        for msg in msgs {
            self.dispatch(msg);
        }
        self.arm_control_read();
    }

    /// The control channel died: every session and pending request fails.
    fn on_control_lost(self: &Arc<Self>, err: Error) {
        let (conn, sessions, pending) = {
            let Ok(mut st) = self.state.lock() else {
                return;
            };
            (
                st.conn.take(),
                std::mem::take(&mut st.sessions),
                std::mem::take(&mut st.pending),
            )
        };
        if let Some(conn) = conn {
            conn.close();
        }
        for (_, entry) in sessions {
            entry.kind.fail(err.clone());
        }
        for (_, mut p) in pending {
            if let Some(cb) = p.callback.take() {
                cb(Err(err.clone()));
            }
        }
    }

    /// Ask the server for a path to `dst_node`. The callback fires exactly
    /// once with a connected stream handle or the failure.
    pub fn request_connect<F>(self: &Arc<Self>, dst_node: NodeId, callback: F) -> ConnId
    where
        F: FnOnce(Result<StreamHandle>) + Send + 'static,
    {
        let (conn_id, conn) = {
            let Ok(mut st) = self.state.lock() else {
                callback(Err(Error::Closed));
                return ConnId::ZERO;
            };
            if !st.registered || st.conn.is_none() {
                drop(st);
                callback(Err(Error::Closed));
                return ConnId::ZERO;
            }
            let conn_id = ConnId::new(self.config.node_id, st.next_idx);
            st.next_idx += 1;
            st.pending.insert(
                conn_id,
                Pending {
                    dst_node,
                    callback: Some(Box::new(callback)),
                },
            );
            (conn_id, st.conn.clone())
        };
        if let Some(conn) = conn {
            debug!("requesting connection {conn_id} -> {dst_node}");
            crate::session::send_control(
                &conn,
                &Message::HelloConn {
                    src_node: self.config.node_id,
                    dst_node,
                    conn_id,
                    remote_ip: Ipv4Addr::UNSPECIFIED,
                    remote_port: 0,
                },
            );
            self.arm_watchdog(conn_id);
        }
        conn_id
    }

    /// Abandon an attempt. The user callback fires with `Closed` if it has
    /// not completed yet.
    pub fn cancel(self: &Arc<Self>, conn_id: ConnId) {
        let (session, mut pending) = {
            let Ok(mut st) = self.state.lock() else {
                return;
            };
            (st.sessions.remove(&conn_id), st.pending.remove(&conn_id))
        };
        if let Some(entry) = session {
            entry.kind.fail(Error::Closed);
        }
        if let Some(cb) = pending.as_mut().and_then(|p| p.callback.take()) {
            cb(Err(Error::Closed));
        }
    }

    pub fn shutdown(self: &Arc<Self>) {
        self.watch.close();
        self.on_control_lost(Error::Closed);
        let acceptors = {
            let Ok(mut st) = self.state.lock() else {
                return;
            };
            st.reservations.clear();
            std::mem::take(&mut st.acceptors)
        };
        for acc in acceptors {
            acc.close();
        }
    }

    fn arm_watchdog(self: &Arc<Self>, conn_id: ConnId) {
        let this = self.clone();
        self.reactor.post(
            self.watch.wrap(move || this.on_watchdog(conn_id)),
            RENDEZVOUS_TIMEOUT,
        );
    }

    fn on_watchdog(self: &Arc<Self>, conn_id: ConnId) {
        let (session, mut pending) = {
            let Ok(mut st) = self.state.lock() else {
                return;
            };
            (st.sessions.remove(&conn_id), st.pending.remove(&conn_id))
        };
        if session.is_some() || pending.is_some() {
            warn!("rendezvous {conn_id} timed out");
        }
        if let Some(entry) = session {
            entry.kind.fail(Error::Timeout);
        }
        if let Some(cb) = pending.as_mut().and_then(|p| p.callback.take()) {
            cb(Err(Error::Timeout));
        }
    }

    fn dispatch(self: &Arc<Self>, msg: Message) {
        trace!("control msg {:#04x}", msg.code());
        match &msg {
            Message::Conn {
                src_node,
                src_ip,
                conn_id,
                role,
                ..
            } => self.on_conn_request(*src_node, *src_ip, *conn_id, *role),
            Message::ConnOk {
                conn_id,
                dst_ip,
                role,
                ..
            } => self.on_conn_ok(*conn_id, *dst_ip, *role),
            Message::ConnErr { conn_id, err } => self.on_conn_err(*conn_id, *err),
            Message::Ready { conn_id }
            | Message::Next { conn_id }
            | Message::Fast { conn_id, .. }
            | Message::SymmNext { conn_id, .. } => self.route(*conn_id, &msg),
            Message::SymmDoneIn { conn_id, .. } => self.route(*conn_id, &msg),
            other => trace!("ignoring control msg {:#04x}", other.code()),
        }
    }

    fn route(self: &Arc<Self>, conn_id: ConnId, msg: &Message) {
        let session = {
            let Ok(st) = self.state.lock() else {
                return;
            };
            st.sessions.get(&conn_id).map(|e| match &e.kind {
                SessionKind::Fast(s) => SessionKind::Fast(s.clone()),
                SessionKind::SymmAcc(s) => SessionKind::SymmAcc(s.clone()),
                SessionKind::SymmConn(s) => SessionKind::SymmConn(s.clone()),
            })
        };
        match session {
            Some(kind) => kind.on_msg(msg),
            None => trace!("no session for {conn_id}"),
        }
    }

    /// Incoming request: we are the acceptor side.
    fn on_conn_request(
        self: &Arc<Self>,
        src_node: NodeId,
        src_ip: Ipv4Addr,
        conn_id: ConnId,
        role: Role,
    ) {
        info!("incoming rendezvous {conn_id} from {src_node} (role {role:?})");
        let conn = self.state.lock().ok().and_then(|st| st.conn.clone());
        let Some(conn) = conn else {
            return;
        };
        let this = self.clone();
        let done: crate::session::SessionCallback = Box::new(move |res| {
            this.on_session_done(conn_id, false, res);
        });

        let kind = match role {
            Role::Conn | Role::Acc => {
                let session = FastSession::new(
                    self.reactor.clone(),
                    self.allocator.clone(),
                    self.config.node_id,
                    src_node,
                    conn_id,
                    self.config.server_udp,
                    conn,
                    self.config.best_effort_reservations,
                );
                if !session.start(done) {
                    self.fail_conn(conn_id, ErrorCode::Unknown);
                    return;
                }
                SessionKind::Fast(session)
            }
            Role::AccSymm => {
                let reservation = self.allocator.reserve_symm_ports(1);
                let keepalive = self
                    .state
                    .lock()
                    .map(|st| st.keepalive.clone())
                    .unwrap_or_default();
                let session = SymmAccSession::new(
                    self.reactor.clone(),
                    self.config.node_id,
                    src_node,
                    conn_id,
                    src_ip,
                    self.config.server_udp,
                    self.config.probe_udp,
                    conn,
                    reservation,
                );
                if !session.start(keepalive, done) {
                    self.fail_conn(conn_id, ErrorCode::Unknown);
                    return;
                }
                SessionKind::SymmAcc(session)
            }
            Role::ConnSymm => {
                let reservation = self.allocator.reserve_symm_ports(1);
                let session = SymmConnSession::new(
                    self.reactor.clone(),
                    self.config.node_id,
                    conn_id,
                    src_ip,
                    conn,
                    reservation,
                );
                if !session.start(done) {
                    self.fail_conn(conn_id, ErrorCode::Unknown);
                    return;
                }
                SessionKind::SymmConn(session)
            }
        };

        if let Ok(mut st) = self.state.lock() {
            st.sessions.insert(conn_id, SessionEntry { kind });
        }
        self.arm_watchdog(conn_id);
    }

    /// Our request was accepted: we are the connector side.
    fn on_conn_ok(self: &Arc<Self>, conn_id: ConnId, dst_ip: Ipv4Addr, role: Role) {
        let (dst_node, conn) = {
            let Ok(st) = self.state.lock() else {
                return;
            };
            let Some(p) = st.pending.get(&conn_id) else {
                warn!("CONN_OK for unknown {conn_id}");
                return;
            };
            (p.dst_node, st.conn.clone())
        };
        let Some(conn) = conn else {
            return;
        };
        info!("rendezvous {conn_id} accepted (role {role:?})");

        let this = self.clone();
        let done: crate::session::SessionCallback = Box::new(move |res| {
            this.on_session_done(conn_id, true, res);
        });

        let kind = match role {
            Role::Conn | Role::Acc => {
                let session = FastSession::new(
                    self.reactor.clone(),
                    self.allocator.clone(),
                    self.config.node_id,
                    dst_node,
                    conn_id,
                    self.config.server_udp,
                    conn,
                    self.config.best_effort_reservations,
                );
                if !session.start(done) {
                    self.complete_connect(conn_id, Err(Error::Rendezvous(1)));
                    return;
                }
                SessionKind::Fast(session)
            }
            Role::AccSymm => {
                let reservation = self.allocator.reserve_symm_ports(1);
                let keepalive = self
                    .state
                    .lock()
                    .map(|st| st.keepalive.clone())
                    .unwrap_or_default();
                let session = SymmAccSession::new(
                    self.reactor.clone(),
                    self.config.node_id,
                    dst_node,
                    conn_id,
                    dst_ip,
                    self.config.server_udp,
                    self.config.probe_udp,
                    conn,
                    reservation,
                );
                if !session.start(keepalive, done) {
                    self.complete_connect(conn_id, Err(Error::Rendezvous(1)));
                    return;
                }
                SessionKind::SymmAcc(session)
            }
            Role::ConnSymm => {
                let reservation = self.allocator.reserve_symm_ports(1);
                let session = SymmConnSession::new(
                    self.reactor.clone(),
                    self.config.node_id,
                    conn_id,
                    dst_ip,
                    conn,
                    reservation,
                );
                if !session.start(done) {
                    self.complete_connect(conn_id, Err(Error::Rendezvous(1)));
                    return;
                }
                SessionKind::SymmConn(session)
            }
        };

        if let Ok(mut st) = self.state.lock() {
            st.sessions.insert(conn_id, SessionEntry { kind });
        }
    }

    fn on_conn_err(self: &Arc<Self>, conn_id: ConnId, err: ErrorCode) {
        warn!("rendezvous {conn_id} rejected: {err:?}");
        self.complete_connect(conn_id, Err(Error::Rendezvous(err as u32)));
    }

    fn fail_conn(self: &Arc<Self>, conn_id: ConnId, _err: ErrorCode) {
        if let Ok(mut st) = self.state.lock() {
            st.sessions.remove(&conn_id);
        }
        warn!("could not start session for {conn_id}");
    }

    /// A punch session finished; hand the socket to the stream plane.
    fn on_session_done(
        self: &Arc<Self>,
        conn_id: ConnId,
        initiated: bool,
        res: Result<RendezvousResult>,
    ) {
        {
            let Ok(mut st) = self.state.lock() else {
                return;
            };
            st.sessions.remove(&conn_id);
        }
        match res {
            Ok(result) => {
                if initiated {
                    self.connector_handoff(conn_id, result);
                } else {
                    self.acceptor_handoff(conn_id, result);
                }
            }
            Err(e) => {
                if initiated {
                    self.complete_connect(conn_id, Err(e));
                } else {
                    warn!("acceptor-side rendezvous {conn_id} failed: {e}");
                }
            }
        }
    }

    fn connector_handoff(self: &Arc<Self>, conn_id: ConnId, result: RendezvousResult) {
        let peer = result.peer;
        debug!("binding stream over punched path {peer} for {conn_id}");
        if let Some(res) = result.reservation {
            if let Ok(mut st) = self.state.lock() {
                st.reservations.push(res);
            }
        }
        let handle = self.stream_mgr.create_stream_handle();
        if let Err(e) = handle.bind_fd(result.fd) {
            self.complete_connect(conn_id, Err(e));
            return;
        }
        let this = self.clone();
        let stream = handle.clone();
        let connector = handle.clone().into_connector();
        let res = connector.connect(
            peer,
            self.watch.wrap1(move |res: Result<()>| {
                match res {
                    Ok(()) => this.complete_connect(conn_id, Ok(stream.clone())),
                    Err(e) => this.complete_connect(conn_id, Err(e)),
                }
            }),
        );
        if let Err(e) = res {
            self.complete_connect(conn_id, Err(e));
        }
    }

    fn acceptor_handoff(self: &Arc<Self>, conn_id: ConnId, result: RendezvousResult) {
        let keepalive_fd = result.fd.try_clone().ok();
        let handle = self.stream_mgr.create_stream_handle();
        if let Err(e) = handle.bind_fd(result.fd) {
            warn!("cannot bind accepted path for {conn_id}: {e}");
            return;
        }
        if let Some(res) = result.reservation {
            if let Ok(mut st) = self.state.lock() {
                st.reservations.push(res);
            }
        }
        // Keep the punched mapping warm across future symmetric sweeps.
        if result.src_port != 0 {
            if let Some(fd) = keepalive_fd {
                if let Ok(kh) = KernelHandle::udp_from_fd(fd) {
                    if let Ok(mut st) = self.state.lock() {
                        st.keepalive.push(KeepaliveEntry {
                            handle: kh,
                            dest: result.peer,
                            src_port: result.src_port,
                        });
                    }
                }
            }
        }
        let this = self.clone();
        let acceptor = handle.clone().into_acceptor();
        let res = acceptor.listen(move |stream| {
            this.deliver_accept(stream);
        });
        match res {
            Ok(()) => {
                if let Ok(mut st) = self.state.lock() {
                    st.acceptors.push(acceptor);
                }
                debug!("accepting streams on punched path for {conn_id}");
            }
            Err(e) => warn!("cannot listen on punched path for {conn_id}: {e}"),
        }
    }

    fn deliver_accept(self: &Arc<Self>, stream: StreamHandle) {
        let handler = {
            let Ok(mut st) = self.state.lock() else {
                return;
            };
            st.accept_handler.take()
        };
        let Some(mut handler) = handler else {
            warn!("no accept handler installed, dropping stream");
            stream.close_abort();
            return;
        };
        handler(stream);
        if let Ok(mut st) = self.state.lock() {
            if st.accept_handler.is_none() {
                st.accept_handler = Some(handler);
            }
        }
    }

    fn complete_connect(self: &Arc<Self>, conn_id: ConnId, res: Result<StreamHandle>) {
        let cb = {
            let Ok(mut st) = self.state.lock() else {
                return;
            };
            st.pending.remove(&conn_id).and_then(|mut p| p.callback.take())
        };
        match cb {
            Some(cb) => cb(res),
            None => {
                if let Ok(handle) = res {
                    // Completion raced the watchdog; don't leak the stream.
                    handle.close();
                }
            }
        }
    }
}

impl Drop for ControlClient {
    fn drop(&mut self) {
        self.watch.close();
    }
}
