//! Stream multiplexer: many logical streams share one UDP socket.
//!
//! Per local UDP port there is one cache entry holding the transport
//! connection (weakly — strong references live in the stream handles bound
//! to the port), the `peer ip -> tag -> actual port` routing table, the live
//! engine sockets, and the handle count. The entry self-destructs once both
//! counts reach zero, after a linger that lets the engine flush.
//!
//! All engine interaction happens under one mutex; engine events and
//! transmits are drained into action lists and executed after the lock is
//! released, so user callbacks never run with multiplexer state held.

use std::collections::{HashMap, HashSet};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use burrow_core::consts::{
    ENGINE_TICK, SUPPORT_PING, SUPPORT_PING_FINAL, TRANSPORT_LINGER_ABORT,
    TRANSPORT_LINGER_GRACEFUL,
};
use burrow_core::{Error, Result};
use bytes::Bytes;
use tracing::{debug, trace, warn};

use burrow_transport::conn::{Connection, Datagram};
use burrow_transport::handle::{KernelHandle, ANY_ADDR};
use burrow_transport::opwatch::OpWatch;
use burrow_transport::reactor::ReactorHandle;

use crate::engine::{Disposition, Engine, EngineEvent, SockId, Tag, MIN_DATAGRAM};
use crate::handle::{HandleShared, StreamHandle};

/// Receive buffer for one datagram on a shared socket.
const RECV_BUF: usize = 8192;

struct PortEntry {
    port: u16,
    active: bool,
}

/// Cache entry for one shared UDP port.
struct ConnInfo {
    conn: Weak<Connection>,
    acceptor: Option<Weak<HandleShared>>,
    peers: HashMap<Ipv4Addr, HashMap<Tag, PortEntry>>,
    socks: HashSet<SockId>,
    num_handles: usize,
}

impl ConnInfo {
    fn lookup_actual_port(&self, ip: Ipv4Addr, tag: &Tag) -> Option<u16> {
        self.peers.get(&ip).and_then(|m| m.get(tag)).map(|e| e.port)
    }

    fn idle(&self) -> bool {
        self.num_handles == 0 && self.socks.is_empty()
    }
}

struct MuxState {
    engine: Engine,
    ports: HashMap<u16, ConnInfo>,
    /// Engine socket -> owning handle, once one is attached.
    bindings: HashMap<SockId, Weak<HandleShared>>,
    /// Events that raced ahead of their handle (an accepted stream's first
    /// data can share a burst with its SYN); replayed on attachment.
    pending_events: HashMap<SockId, Vec<EngineEvent>>,
    started: bool,
}

/// Deferred work produced under the state lock, run after it drops.
enum Action {
    Send {
        conn: Arc<Connection>,
        dst: SocketAddrV4,
        payload: Bytes,
    },
    Connected(Weak<HandleShared>, Result<()>),
    Readable(Weak<HandleShared>, SockId, Bytes),
    Writable(Weak<HandleShared>, SockId),
    Eof(Weak<HandleShared>),
    Failed(Weak<HandleShared>, Error),
    Accepted {
        port: u16,
        sock: SockId,
        peer_ip: Ipv4Addr,
        acceptor: Weak<HandleShared>,
    },
    SockGone {
        port: u16,
    },
}

/// The stream-plane singleton.
pub struct StreamManager {
    reactor: ReactorHandle,
    state: Mutex<MuxState>,
    watch: OpWatch,
    alive_handles: AtomicUsize,
}

impl StreamManager {
    pub fn new(reactor: ReactorHandle) -> Arc<Self> {
        Arc::new(Self {
            reactor,
            state: Mutex::new(MuxState {
                engine: Engine::new(),
                ports: HashMap::new(),
                bindings: HashMap::new(),
                pending_events: HashMap::new(),
                started: false,
            }),
            watch: OpWatch::new(),
            alive_handles: AtomicUsize::new(0),
        })
    }

    pub fn reactor(&self) -> &ReactorHandle {
        &self.reactor
    }

    /// Arm the engine housekeeping tick. Idempotent.
    pub fn start(self: &Arc<Self>) {
        {
            let Ok(mut st) = self.state.lock() else {
                return;
            };
            if st.started {
                return;
            }
            st.started = true;
        }
        self.arm_tick();
    }

    /// Stop timers and close every transport socket. Live streams die with
    /// reset semantics.
    pub fn shutdown(&self) {
        self.watch.close();
        let conns: Vec<Arc<Connection>> = {
            let Ok(mut st) = self.state.lock() else {
                return;
            };
            let conns = st
                .ports
                .values()
                .filter_map(|ci| ci.conn.upgrade())
                .collect();
            st.ports.clear();
            st.bindings.clear();
            st.pending_events.clear();
            conns
        };
        for conn in conns {
            conn.close();
        }
    }

    /// Create a fresh, unbound stream handle.
    pub fn create_stream_handle(self: &Arc<Self>) -> StreamHandle {
        self.alive_handles.fetch_add(1, Ordering::Relaxed);
        StreamHandle::new_unbound(self.clone())
    }

    pub fn alive_handles(&self) -> usize {
        self.alive_handles.load(Ordering::Relaxed)
    }

    /// True when a live transport connection exists on `port`.
    pub fn have_transport(&self, port: u16) -> bool {
        self.state
            .lock()
            .map(|st| {
                st.ports
                    .get(&port)
                    .map(|ci| ci.conn.upgrade().is_some())
                    .unwrap_or(false)
            })
            .unwrap_or(false)
    }

    /// The peer's actual UDP port behind a tag, if known.
    pub fn mapped_peer_port(&self, local_port: u16, ip: Ipv4Addr, tag: &Tag) -> Option<u16> {
        self.state.lock().ok().and_then(|st| {
            st.ports
                .get(&local_port)
                .and_then(|ci| ci.lookup_actual_port(ip, tag))
        })
    }

    pub(crate) fn note_handle_dropped(&self) {
        self.alive_handles.fetch_sub(1, Ordering::Relaxed);
    }

    /// Bind (or share) the transport connection for `port`. De-dupes by
    /// local port: an existing live entry just gains a handle reference.
    /// The returned strong connection reference belongs to the handle.
    pub(crate) fn create_transport(
        self: &Arc<Self>,
        port: u16,
        fd: Option<OwnedFd>,
    ) -> Result<(Arc<Connection>, u16)> {
        let (conn, actual_port, fresh) = {
            let Ok(mut st) = self.state.lock() else {
                return Err(Error::Closed);
            };
            let mut reuse = None;
            if port != 0 {
                if let Some(ci) = st.ports.get_mut(&port) {
                    match ci.conn.upgrade() {
                        Some(conn) => {
                            ci.num_handles += 1;
                            reuse = Some(conn);
                        }
                        // Stale entry whose socket already died.
                        None => {
                            st.ports.remove(&port);
                        }
                    }
                }
            }
            match reuse {
                Some(conn) => (conn, port, false),
                None => {
                    let handle = match fd {
                        Some(fd) => KernelHandle::udp_from_fd(fd)?,
                        None => {
                            let h = KernelHandle::udp()?;
                            h.bind(SocketAddrV4::new(*ANY_ADDR.ip(), port))?;
                            h
                        }
                    };
                    let actual_port = handle.local_addr()?.port();
                    let conn = Connection::new(&self.reactor, handle)?;
                    st.ports.insert(
                        actual_port,
                        ConnInfo {
                            conn: Arc::downgrade(&conn),
                            acceptor: None,
                            peers: HashMap::new(),
                            socks: HashSet::new(),
                            num_handles: 1,
                        },
                    );
                    (conn, actual_port, true)
                }
            }
        };
        if fresh {
            self.arm_recv(actual_port);
        }
        Ok((conn, actual_port))
    }

    fn arm_tick(self: &Arc<Self>) {
        let mgr = self.clone();
        self.reactor.post(
            self.watch.wrap(move || {
                let actions = {
                    let Ok(mut st) = mgr.state.lock() else {
                        return;
                    };
                    st.engine.check_timeouts();
                    collect_actions(&mut st)
                };
                mgr.run_actions(actions);
                mgr.arm_tick();
            }),
            ENGINE_TICK,
        );
    }

    fn arm_recv(self: &Arc<Self>, port: u16) {
        let conn = {
            let Ok(st) = self.state.lock() else {
                return;
            };
            st.ports.get(&port).and_then(|ci| ci.conn.upgrade())
        };
        let Some(conn) = conn else {
            return;
        };
        let mgr = self.clone();
        conn.read_from(
            RECV_BUF,
            true,
            self.watch.wrap1(move |res: Result<Datagram>| {
                mgr.on_recv(port, res);
            }),
        );
    }

    fn on_recv(self: &Arc<Self>, port: u16, res: Result<Datagram>) {
        let datagram = match res {
            Ok(d) => d,
            Err(e) => {
                if !e.is_closed() {
                    warn!("recv error on shared port {port}: {e}");
                }
                return;
            }
        };

        if datagram.is_drain_sentinel() {
            // End of burst: flush deferred acks on every stream of this port.
            let actions = {
                let Ok(mut st) = self.state.lock() else {
                    return;
                };
                let socks: Vec<SockId> = st
                    .ports
                    .get(&port)
                    .map(|ci| ci.socks.iter().copied().collect())
                    .unwrap_or_default();
                for sock in socks {
                    st.engine.issue_deferred_acks(sock);
                }
                collect_actions(&mut st)
            };
            self.run_actions(actions);
        } else if datagram.data.len() == 4 {
            let b = &datagram.data[..];
            if b == SUPPORT_PING || b == SUPPORT_PING_FINAL {
                trace!("support ping from {}", datagram.src);
            } else {
                warn!("bad support ping from {}: {:02x?}", datagram.src, b);
            }
        } else if datagram.data.len() >= MIN_DATAGRAM {
            self.route_datagram(port, &datagram);
        } else {
            warn!(
                "runt datagram on shared port {port}: {} bytes",
                datagram.data.len()
            );
        }

        self.arm_recv(port);
    }

    fn route_datagram(self: &Arc<Self>, port: u16, datagram: &Datagram) {
        let Some(tag) = Tag::from_wire(&datagram.data) else {
            return;
        };
        let src_ip = *datagram.src.ip();
        let src_port = datagram.src.port();
        let actions = {
            let Ok(mut st) = self.state.lock() else {
                return;
            };
            let Some(ci) = st.ports.get_mut(&port) else {
                return;
            };
            // Learn or refresh the tag -> actual-port mapping.
            let peer_map = ci.peers.entry(src_ip).or_default();
            let fresh = match peer_map.get_mut(&tag) {
                None => {
                    peer_map.insert(
                        tag,
                        PortEntry {
                            port: src_port,
                            active: false,
                        },
                    );
                    true
                }
                Some(entry) => {
                    if entry.port != src_port {
                        // NAT rebind: the peer now talks from another port.
                        warn!(
                            "peer {src_ip} port {} remapped to {src_port} (tag {tag:?})",
                            entry.port
                        );
                        entry.port = src_port;
                    }
                    false
                }
            };
            let accept = ci
                .acceptor
                .as_ref()
                .map(|w| w.strong_count() > 0)
                .unwrap_or(false);

            // Hand the datagram (tag in place) to the engine.
            let disposition = st
                .engine
                .process_datagram(port, src_ip, &datagram.data, accept);

            // Probation: drop the mapping again if nothing claimed the tag.
            if let Some(ci) = st.ports.get_mut(&port) {
                match disposition {
                    Disposition::Handled => {
                        if let Some(entry) =
                            ci.peers.get_mut(&src_ip).and_then(|m| m.get_mut(&tag))
                        {
                            entry.active = true;
                        }
                    }
                    Disposition::Accepted(sock) => {
                        if let Some(entry) =
                            ci.peers.get_mut(&src_ip).and_then(|m| m.get_mut(&tag))
                        {
                            entry.active = true;
                        }
                        ci.socks.insert(sock);
                    }
                    Disposition::Unhandled => {
                        if fresh {
                            if let Some(m) = ci.peers.get_mut(&src_ip) {
                                m.remove(&tag);
                                if m.is_empty() {
                                    ci.peers.remove(&src_ip);
                                }
                            }
                        }
                    }
                }
            }
            collect_actions(&mut st)
        };
        self.run_actions(actions);
    }

    fn run_actions(self: &Arc<Self>, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Send { conn, dst, payload } => {
                    conn.write_to(payload, dst, move |res| {
                        if let Err(e) = res {
                            if !e.is_closed() {
                                warn!("transport send to {dst} failed: {e}");
                            }
                        }
                    });
                }
                Action::Connected(h, res) => {
                    if let Some(h) = h.upgrade() {
                        h.complete_connect(res);
                    }
                }
                Action::Writable(h, sock) => {
                    if let Some(h) = h.upgrade() {
                        self.drive_pending_writes(&h, sock);
                    }
                }
                Action::Readable(h, sock, bytes) => {
                    if let Some(h) = h.upgrade() {
                        let consumed = h.push_readable(bytes);
                        if consumed > 0 {
                            self.note_consumed(sock, consumed);
                        }
                    }
                }
                Action::Eof(h) => {
                    if let Some(h) = h.upgrade() {
                        h.set_eof();
                    }
                }
                Action::Failed(h, e) => {
                    if let Some(h) = h.upgrade() {
                        h.fail(e);
                    }
                }
                Action::Accepted {
                    port,
                    sock,
                    peer_ip,
                    acceptor,
                } => {
                    let (acceptor, conn) = {
                        let conn = self
                            .state
                            .lock()
                            .ok()
                            .and_then(|st| st.ports.get(&port).and_then(|ci| ci.conn.upgrade()));
                        (acceptor.upgrade(), conn)
                    };
                    let (Some(acceptor), Some(conn)) = (acceptor, conn) else {
                        // Acceptor or transport vanished in between; refuse.
                        self.abort_sock(sock);
                        continue;
                    };
                    debug!("accepted stream from {peer_ip} on shared port {port}");
                    let handle = StreamHandle::new_accepted(self.clone(), port, sock, conn);
                    let replay = {
                        match self.state.lock() {
                            Ok(mut st) => {
                                st.bindings.insert(sock, Arc::downgrade(handle.shared()));
                                if let Some(ci) = st.ports.get_mut(&port) {
                                    ci.num_handles += 1;
                                }
                                let weak = Arc::downgrade(handle.shared());
                                let mut replay = Vec::new();
                                for ev in st.pending_events.remove(&sock).unwrap_or_default() {
                                    push_event_action(&mut replay, sock, weak.clone(), ev);
                                }
                                replay
                            }
                            Err(_) => Vec::new(),
                        }
                    };
                    self.alive_handles.fetch_add(1, Ordering::Relaxed);
                    acceptor.deliver_accept(handle);
                    self.run_actions(replay);
                }
                Action::SockGone { port } => {
                    self.maybe_release_port(port, TRANSPORT_LINGER_GRACEFUL, None);
                }
            }
        }
    }

    fn abort_sock(self: &Arc<Self>, sock: SockId) {
        let actions = {
            let Ok(mut st) = self.state.lock() else {
                return;
            };
            st.engine.close(sock, true);
            collect_actions(&mut st)
        };
        self.run_actions(actions);
    }

    /// Ring drained by the consumer; widen the engine's advertised window.
    pub(crate) fn note_consumed(self: &Arc<Self>, sock: SockId, n: usize) {
        if let Ok(mut st) = self.state.lock() {
            st.engine.on_read_consumed(sock, n);
        }
    }

    pub(crate) fn drive_pending_writes(self: &Arc<Self>, h: &Arc<HandleShared>, sock: SockId) {
        let (completions, actions) = {
            let Ok(mut st) = self.state.lock() else {
                return;
            };
            let completions = h.pump_writes(&mut st.engine, sock);
            let actions = collect_actions(&mut st);
            (completions, actions)
        };
        for cb in completions {
            cb(Ok(()));
        }
        self.run_actions(actions);
    }

    /// Open a connector stream across the transport bound at `local_port`.
    /// Seeds the tag routing entry for the peer's actual port.
    pub(crate) fn bind_connector(
        self: &Arc<Self>,
        h: &Arc<HandleShared>,
        local_port: u16,
        peer: SocketAddrV4,
    ) -> Result<SockId> {
        let (sock, actions) = {
            let Ok(mut st) = self.state.lock() else {
                return Err(Error::Closed);
            };
            if !st.ports.contains_key(&local_port) {
                return Err(Error::Closed);
            }
            let tag = Tag::for_peer(peer.port());
            let sock = st.engine.connect(local_port, *peer.ip(), tag);
            if let Some(ci) = st.ports.get_mut(&local_port) {
                ci.socks.insert(sock);
                ci.peers.entry(*peer.ip()).or_default().insert(
                    tag,
                    PortEntry {
                        port: peer.port(),
                        active: true,
                    },
                );
            }
            st.bindings.insert(sock, Arc::downgrade(h));
            let actions = collect_actions(&mut st);
            (sock, actions)
        };
        self.run_actions(actions);
        Ok(sock)
    }

    /// Register `h` as the acceptor for its port. One acceptor per port.
    pub(crate) fn bind_acceptor(&self, h: &Arc<HandleShared>, local_port: u16) -> Result<()> {
        let Ok(mut st) = self.state.lock() else {
            return Err(Error::Closed);
        };
        let Some(ci) = st.ports.get_mut(&local_port) else {
            return Err(Error::Closed);
        };
        if ci
            .acceptor
            .as_ref()
            .map(|w| w.strong_count() > 0)
            .unwrap_or(false)
        {
            return Err(Error::protocol("port already has an acceptor"));
        }
        ci.acceptor = Some(Arc::downgrade(h));
        Ok(())
    }

    pub(crate) fn peer_of(&self, sock: SockId) -> Option<(Ipv4Addr, Tag)> {
        self.state
            .lock()
            .ok()
            .and_then(|st| st.engine.peer_of(sock))
    }

    /// Tear down a handle's engine socket and its port reference. The
    /// handle's strong connection reference rides into the linger closure so
    /// the transport socket stays alive while the engine flushes.
    pub(crate) fn close_stream(
        self: &Arc<Self>,
        sock: Option<SockId>,
        port: u16,
        abort: bool,
        conn: Option<Arc<Connection>>,
    ) {
        if let Some(sock) = sock {
            let actions = {
                let Ok(mut st) = self.state.lock() else {
                    return;
                };
                st.engine.close(sock, abort);
                collect_actions(&mut st)
            };
            self.run_actions(actions);
        }
        if port != 0 {
            if let Ok(mut st) = self.state.lock() {
                if let Some(ci) = st.ports.get_mut(&port) {
                    ci.num_handles = ci.num_handles.saturating_sub(1);
                }
            }
            let linger = if abort {
                TRANSPORT_LINGER_ABORT
            } else {
                TRANSPORT_LINGER_GRACEFUL
            };
            self.maybe_release_port(port, linger, conn);
        }
    }

    /// Once no handle and no engine socket references `port`, drop the cache
    /// entry and close the UDP socket — after `linger`, so in-flight
    /// teardown traffic can still go out. `carried` keeps the transport
    /// alive until then.
    fn maybe_release_port(self: &Arc<Self>, port: u16, linger: Duration, carried: Option<Arc<Connection>>) {
        let mgr = self.clone();
        self.reactor.post(
            self.watch.wrap(move || {
                let conn = {
                    let Ok(mut st) = mgr.state.lock() else {
                        return;
                    };
                    let still_idle = st.ports.get(&port).map(|ci| ci.idle()).unwrap_or(false);
                    if !still_idle {
                        return;
                    }
                    st.ports
                        .remove(&port)
                        .and_then(|ci| ci.conn.upgrade())
                        .or(carried)
                };
                if let Some(conn) = conn {
                    debug!("releasing shared UDP port {port}");
                    conn.close();
                }
            }),
            linger,
        );
    }

}

/// Drain engine transmits and events into deferred actions. Free function so
/// it can run while the caller holds the state lock.
fn collect_actions(st: &mut MuxState) -> Vec<Action> {
    let mut actions = Vec::new();
    while let Some(t) = st.engine.poll_transmit() {
        let Some(ci) = st.ports.get(&t.local_port) else {
            trace!("no transport on port {}", t.local_port);
            continue;
        };
        let Some(actual) = ci.lookup_actual_port(t.peer_ip, &t.tag) else {
            trace!("no route for tag {:?} towards {}", t.tag, t.peer_ip);
            continue;
        };
        let Some(conn) = ci.conn.upgrade() else {
            continue;
        };
        actions.push(Action::Send {
            conn,
            dst: SocketAddrV4::new(t.peer_ip, actual),
            payload: t.payload,
        });
    }
    while let Some((sock, ev)) = st.engine.poll_event() {
        match ev {
            EngineEvent::Accepted { sock, peer_ip, .. } => {
                let port = st.engine.local_port_of(sock).unwrap_or(0);
                if let Some(acceptor) = st.ports.get(&port).and_then(|ci| ci.acceptor.clone()) {
                    actions.push(Action::Accepted {
                        port,
                        sock,
                        peer_ip,
                        acceptor,
                    });
                }
            }
            EngineEvent::Destroying => {
                st.bindings.remove(&sock);
                st.pending_events.remove(&sock);
                let mut owner_port = None;
                for (port, ci) in st.ports.iter_mut() {
                    if ci.socks.remove(&sock) {
                        owner_port = Some(*port);
                        break;
                    }
                }
                if let Some(port) = owner_port {
                    actions.push(Action::SockGone { port });
                }
            }
            ev => match st.bindings.get(&sock).cloned() {
                Some(h) => push_event_action(&mut actions, sock, h, ev),
                None => st.pending_events.entry(sock).or_default().push(ev),
            },
        }
    }
    actions
}

/// Turn one handle-scoped engine event into its deferred action.
fn push_event_action(
    actions: &mut Vec<Action>,
    sock: SockId,
    h: Weak<HandleShared>,
    ev: EngineEvent,
) {
    match ev {
        EngineEvent::Connected => actions.push(Action::Connected(h, Ok(()))),
        EngineEvent::Writable | EngineEvent::Sent(_) => {
            actions.push(Action::Writable(h, sock));
        }
        EngineEvent::Readable(bytes) => actions.push(Action::Readable(h, sock, bytes)),
        EngineEvent::Eof => actions.push(Action::Eof(h)),
        EngineEvent::Error(kind) => actions.push(Action::Failed(h, Error::Io(kind.into()))),
        EngineEvent::Accepted { .. } | EngineEvent::Destroying => {}
    }
}
