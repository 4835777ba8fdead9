//! The rendezvous directory and relay.
//!
//! Registered nodes are keyed by node id; each connection request becomes a
//! pair record that carries roles, observed endpoints, and relay routing
//! until the peers report success or the record expires. Two UDP sockets
//! (the service port and the probe port right above it) observe mapped
//! 4-tuples and echo them back; a node whose two observations disagree on
//! the port is flagged symmetric.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use burrow_core::{ConnId, Error, NodeId, Result};
use bytes::BytesMut;
use tracing::{debug, info, trace, warn};

use burrow_rendezvous::protocol::{ErrorCode, Message, Role};
use burrow_transport::acceptor::Acceptor;
use burrow_transport::conn::{Connection, Datagram};
use burrow_transport::handle::KernelHandle;
use burrow_transport::opwatch::OpWatch;
use burrow_transport::reactor::ReactorHandle;

use crate::session::{ClientSession, SessionSink};

/// Pair records that never complete are dropped after this long.
const PAIR_EXPIRY: Duration = Duration::from_secs(60);
const UDP_RECV_BUF: usize = 2048;
const LISTEN_BACKLOG: i32 = 10;

#[derive(Debug, Clone)]
pub struct MasterServerConfig {
    pub port: u16,
    /// Cap on concurrent connection requests per registered client.
    pub max_connections_for_client: u32,
}

impl Default for MasterServerConfig {
    fn default() -> Self {
        Self {
            port: burrow_core::consts::DEFAULT_MASTER_PORT,
            max_connections_for_client: 16,
        }
    }
}

struct NodeInfo {
    session: Weak<ClientSession>,
    /// Self-reported mapping from the registration HELLO.
    probe: SocketAddrV4,
    /// Mapping observed on the service socket / the probe socket.
    observed: [Option<SocketAddrV4>; 2],
    symmetric: bool,
}

struct PairState {
    src_node: NodeId,
    dst_node: NodeId,
    /// Fast pairs get endpoint relays (FAST); symmetric pairs do not.
    fast: bool,
}

struct ServerState {
    nodes: HashMap<NodeId, NodeInfo>,
    pairs: HashMap<ConnId, PairState>,
    /// Sessions kept alive until they register or die.
    limbo: Vec<Arc<ClientSession>>,
}

pub struct MasterServer {
    reactor: ReactorHandle,
    config: MasterServerConfig,
    state: Mutex<ServerState>,
    acceptor: Mutex<Option<Arc<Acceptor>>>,
    udp: Mutex<Vec<Arc<Connection>>>,
    watch: OpWatch,
}

impl MasterServer {
    /// Bind the TCP service port and both UDP observation ports and start
    /// serving.
    pub fn start(reactor: ReactorHandle, config: MasterServerConfig) -> Result<Arc<Self>> {
        let server = Arc::new(Self {
            reactor,
            config,
            state: Mutex::new(ServerState {
                nodes: HashMap::new(),
                pairs: HashMap::new(),
                limbo: Vec::new(),
            }),
            acceptor: Mutex::new(None),
            udp: Mutex::new(Vec::new()),
            watch: OpWatch::new(),
        });

        let listen = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, server.config.port);
        let tcp = KernelHandle::tcp()?;
        tcp.bind(listen)?;
        let acceptor = Acceptor::new(&server.reactor, tcp);
        {
            let this = server.clone();
            acceptor.listen(LISTEN_BACKLOG, move |handle| {
                this.on_accept(handle);
            })?;
        }
        *server.acceptor.lock().map_err(|_| Error::Closed)? = Some(acceptor);

        for (slot, port) in [(0u8, server.config.port), (1u8, server.config.port + 1)] {
            let udp = KernelHandle::udp()?;
            udp.bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port))?;
            let conn = Connection::new(&server.reactor, udp)?;
            server.udp.lock().map_err(|_| Error::Closed)?.push(conn.clone());
            server.arm_udp(slot, conn);
        }

        info!("rendezvous server ready on port {}", server.config.port);
        Ok(server)
    }

    pub fn stop(&self) {
        self.watch.close();
        if let Ok(mut acc) = self.acceptor.lock() {
            if let Some(acc) = acc.take() {
                acc.close();
            }
        }
        if let Ok(mut udp) = self.udp.lock() {
            for conn in udp.drain(..) {
                conn.close();
            }
        }
        let sessions: Vec<Arc<ClientSession>> = {
            let Ok(mut st) = self.state.lock() else {
                return;
            };
            let mut all: Vec<_> = st
                .nodes
                .drain()
                .filter_map(|(_, n)| n.session.upgrade())
                .collect();
            all.extend(st.limbo.drain(..));
            st.pairs.clear();
            all
        };
        for s in sessions {
            s.close();
        }
    }

    /// Nodes with a live control session (probe-only entries not counted).
    pub fn registered_nodes(&self) -> usize {
        self.state
            .lock()
            .map(|st| {
                st.nodes
                    .values()
                    .filter(|n| n.session.upgrade().is_some())
                    .count()
            })
            .unwrap_or(0)
    }

    fn on_accept(self: &Arc<Self>, handle: Arc<KernelHandle>) {
        let peer = match handle.peer_addr() {
            Ok(p) => p,
            Err(e) => {
                warn!("accepted session without peer address: {e}");
                return;
            }
        };
        let conn = match Connection::new(&self.reactor, handle) {
            Ok(c) => c,
            Err(e) => {
                warn!("cannot run accepted session: {e}");
                return;
            }
        };
        debug!("control session from {peer}");
        let sink: Arc<dyn SessionSink> = Arc::new(Sink(Arc::downgrade(self)));
        let session = ClientSession::new(conn, peer, sink);
        if let Ok(mut st) = self.state.lock() {
            st.limbo.push(session.clone());
        }
        session.start();
    }

    // -- UDP observation plane --

    fn arm_udp(self: &Arc<Self>, slot: u8, conn: Arc<Connection>) {
        let this = self.clone();
        let again = conn.clone();
        conn.read_from(
            UDP_RECV_BUF,
            true,
            self.watch.wrap1(move |res: Result<Datagram>| {
                match res {
                    Ok(d) => {
                        if !d.is_drain_sentinel() {
                            this.on_udp(slot, &again, &d);
                        }
                        this.arm_udp(slot, again.clone());
                    }
                    Err(e) => {
                        if !e.is_closed() {
                            warn!("observation socket error: {e}");
                        }
                    }
                }
            }),
        );
    }

    fn on_udp(self: &Arc<Self>, slot: u8, conn: &Arc<Connection>, datagram: &Datagram) {
        let mut buf = BytesMut::from(&datagram.data[..]);
        let msg = match Message::decode(&mut buf) {
            Ok(Some(msg)) => msg,
            _ => {
                trace!("undecodable observation datagram from {}", datagram.src);
                return;
            }
        };
        let src = datagram.src;

        // Every observation gets its echo; retransmissions are idempotent.
        let echo = Message::ProbeResult {
            src_ip: *src.ip(),
            src_port: src.port(),
        };
        conn.write_to(echo.to_bytes(), src, |res| {
            if let Err(e) = res {
                trace!("observation echo failed: {e}");
            }
        });

        match msg {
            Message::Probe => {}
            Message::Hello { node_id, .. } => self.record_probe(node_id, slot, src),
            Message::HelloConn {
                src_node, conn_id, ..
            }
            | Message::HelloAcc {
                src_node, conn_id, ..
            } => self.on_punch_observation(src_node, conn_id, src),
            Message::HelloSymmNext {
                src_node,
                conn_id,
                failed,
                ..
            } => {
                trace!(
                    "sweep re-observation from {src_node} for {conn_id} (failed={failed})"
                );
                if slot == 0 {
                    self.on_punch_observation(src_node, conn_id, src);
                }
            }
            other => trace!("unexpected observation msg {:#04x}", other.code()),
        }
    }

    /// Startup probe: two observations of the same socket; differing ports
    /// mean a symmetric NAT.
    fn record_probe(self: &Arc<Self>, node_id: NodeId, slot: u8, src: SocketAddrV4) {
        let Ok(mut st) = self.state.lock() else {
            return;
        };
        let info = st.nodes.entry(node_id).or_insert_with(|| NodeInfo {
            session: Weak::new(),
            probe: SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0),
            observed: [None, None],
            symmetric: false,
        });
        info.observed[slot as usize] = Some(src);
        if let [Some(a), Some(b)] = info.observed {
            let symmetric = a.port() != b.port();
            if symmetric != info.symmetric {
                info!("node {node_id} classified symmetric={symmetric}");
            }
            info.symmetric = symmetric;
        }
    }

    /// A transient hello revealed the mapped endpoint of a punched socket;
    /// fast pairs learn the other side's endpoint through FAST.
    fn on_punch_observation(self: &Arc<Self>, from: NodeId, conn_id: ConnId, src: SocketAddrV4) {
        let target = {
            let Ok(st) = self.state.lock() else {
                return;
            };
            let Some(pair) = st.pairs.get(&conn_id) else {
                trace!("observation for unknown pair {conn_id}");
                return;
            };
            if !pair.fast {
                None
            } else {
                let other = if pair.src_node == from {
                    pair.dst_node
                } else {
                    pair.src_node
                };
                st.nodes.get(&other).and_then(|n| n.session.upgrade())
            }
        };
        if let Some(session) = target {
            debug!("relaying endpoint {src} of {from} for {conn_id}");
            session.send(&Message::Fast {
                conn_id,
                node_ip: *src.ip(),
                node_port: src.port(),
            });
        }
    }

    // -- pairing and relay --

    fn on_conn_request(
        self: &Arc<Self>,
        session: &Arc<ClientSession>,
        src_node: NodeId,
        dst_node: NodeId,
        conn_id: ConnId,
        remote: SocketAddrV4,
    ) {
        let verdict = {
            let Ok(mut st) = self.state.lock() else {
                return;
            };
            let live = st
                .pairs
                .values()
                .filter(|p| p.src_node == src_node)
                .count() as u32;
            if live >= self.config.max_connections_for_client {
                warn!("{src_node} exceeded its connection cap");
                Err(ErrorCode::Unknown)
            } else if st.pairs.contains_key(&conn_id) {
                warn!("{conn_id} already exists");
                Err(ErrorCode::Unknown)
            } else {
                let src_symm = st.nodes.get(&src_node).map(|n| n.symmetric).unwrap_or(false);
                let src_probe = st
                    .nodes
                    .get(&src_node)
                    .map(|n| n.probe)
                    .unwrap_or(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0));
                let dst = st
                    .nodes
                    .get(&dst_node)
                    .map(|d| (d.symmetric, d.session.upgrade(), d.probe));
                match dst {
                    None | Some((_, None, _)) => Err(ErrorCode::NotFound),
                    Some((dst_symm, Some(dst_session), dst_probe)) => {
                        if src_symm && dst_symm {
                            Err(ErrorCode::Symm)
                        } else {
                            // The symmetric side sweeps; the stationary side
                            // opens the listening pool.
                            let (src_role, dst_role) = if dst_symm {
                                (Role::ConnSymm, Role::AccSymm)
                            } else if src_symm {
                                (Role::AccSymm, Role::ConnSymm)
                            } else {
                                (Role::Conn, Role::Acc)
                            };
                            st.pairs.insert(
                                conn_id,
                                PairState {
                                    src_node,
                                    dst_node,
                                    fast: !src_symm && !dst_symm,
                                },
                            );
                            Ok((src_role, dst_role, dst_session, dst_probe, src_probe))
                        }
                    }
                }
            }
        };

        match verdict {
            Err(err) => {
                session.send(&Message::ConnErr { conn_id, err });
            }
            Ok((src_role, dst_role, dst_session, dst_probe, src_probe)) => {
                info!(
                    "pairing {conn_id}: {src_node} ({src_role:?}) -> {dst_node} ({dst_role:?})"
                );
                dst_session.send(&Message::Conn {
                    src_node,
                    src_ip: *src_probe.ip(),
                    src_port: src_probe.port(),
                    conn_id,
                    ip: *remote.ip(),
                    port: remote.port(),
                    role: dst_role,
                });
                session.send(&Message::ConnOk {
                    conn_id,
                    dst_ip: *dst_probe.ip(),
                    dst_port: dst_probe.port(),
                    role: src_role,
                });
                let this = self.clone();
                self.reactor.post(
                    self.watch.wrap(move || this.expire_pair(conn_id)),
                    PAIR_EXPIRY,
                );
            }
        }
    }

    fn expire_pair(self: &Arc<Self>, conn_id: ConnId) {
        if let Ok(mut st) = self.state.lock() {
            if st.pairs.remove(&conn_id).is_some() {
                debug!("pair {conn_id} expired");
            }
        }
    }

    /// Relay a session-scoped message to the other half of its pair.
    fn relay(self: &Arc<Self>, from: NodeId, conn_id: ConnId, msg: &Message) {
        let target = {
            let Ok(st) = self.state.lock() else {
                return;
            };
            let Some(pair) = st.pairs.get(&conn_id) else {
                trace!("relay for unknown pair {conn_id}");
                return;
            };
            let other = if pair.src_node == from {
                pair.dst_node
            } else {
                pair.src_node
            };
            st.nodes.get(&other).and_then(|n| n.session.upgrade())
        };
        match target {
            Some(session) => session.send(msg),
            None => trace!("relay target for {conn_id} is gone"),
        }
    }
}

/// Session callbacks carry a weak reference back to the directory, so a
/// dying server never keeps sessions alive (and vice versa).
struct Sink(Weak<MasterServer>);

impl SessionSink for Sink {
    fn on_hello(&self, session: &Arc<ClientSession>, node_id: NodeId, probe: SocketAddrV4) {
        if let Some(server) = self.0.upgrade() {
            server.handle_hello(session, node_id, probe);
        }
    }

    fn on_message(&self, session: &Arc<ClientSession>, msg: Message) {
        if let Some(server) = self.0.upgrade() {
            server.handle_message(session, msg);
        }
    }

    fn on_error(&self, session: &Arc<ClientSession>, err: Error) {
        if let Some(server) = self.0.upgrade() {
            server.handle_error(session, err);
        }
    }
}

impl MasterServer {
    fn handle_hello(self: &Arc<Self>, session: &Arc<ClientSession>, node_id: NodeId, probe: SocketAddrV4) {
        info!("node {node_id} registered from {} (probe {probe})", session.peer());
        let old = {
            let Ok(mut st) = self.state.lock() else {
                return;
            };
            st.limbo.retain(|s| !Arc::ptr_eq(s, session));
            let info = st.nodes.entry(node_id).or_insert_with(|| NodeInfo {
                session: Weak::new(),
                probe,
                observed: [None, None],
                symmetric: false,
            });
            let old = info.session.upgrade();
            info.session = Arc::downgrade(session);
            info.probe = probe;
            old
        };
        if let Some(old) = old {
            if !Arc::ptr_eq(&old, session) {
                warn!("node {node_id} re-registered, dropping the old session");
                old.close();
            }
        }
    }

    fn handle_message(self: &Arc<Self>, session: &Arc<ClientSession>, msg: Message) {
        let Some(from) = session.node_id() else {
            return;
        };
        match &msg {
            Message::HelloConn {
                src_node,
                dst_node,
                conn_id,
                remote_ip,
                remote_port,
            } => {
                self.on_conn_request(
                    session,
                    *src_node,
                    *dst_node,
                    *conn_id,
                    SocketAddrV4::new(*remote_ip, *remote_port),
                );
            }
            Message::Ready { conn_id }
            | Message::Next { conn_id }
            | Message::SymmNext { conn_id, .. } => {
                self.relay(from, *conn_id, &msg);
            }
            Message::SymmDoneOut { conn_id, .. } => {
                let relayed = Message::SymmDoneIn {
                    src_node: from,
                    conn_id: *conn_id,
                };
                self.relay(from, *conn_id, &relayed);
                // The pair is done; free the slot towards the cap.
                if let Ok(mut st) = self.state.lock() {
                    st.pairs.remove(conn_id);
                }
            }
            other => {
                warn!("unexpected control msg {:#04x} from {from}", other.code());
                session.close();
            }
        }
    }

    fn handle_error(self: &Arc<Self>, session: &Arc<ClientSession>, err: Error) {
        if !err.is_closed() {
            debug!("session {} failed: {err}", session.peer());
        }
        let Ok(mut st) = self.state.lock() else {
            return;
        };
        st.limbo.retain(|s| !Arc::ptr_eq(s, session));
        if let Some(node_id) = session.node_id() {
            let gone = st
                .nodes
                .get(&node_id)
                .map(|n| {
                    n.session
                        .upgrade()
                        .map(|s| Arc::ptr_eq(&s, session))
                        .unwrap_or(true)
                })
                .unwrap_or(false);
            if gone {
                info!("node {node_id} disconnected");
                st.nodes.remove(&node_id);
                st.pairs
                    .retain(|_, p| p.src_node != node_id && p.dst_node != node_id);
            }
        }
    }
}
