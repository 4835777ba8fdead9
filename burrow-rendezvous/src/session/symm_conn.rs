//! Symmetric rendezvous, stationary side.
//!
//! Opens a pool of UDP sockets on ephemeral ports, all listening for the
//! sweeping side's magic pings, and triggers the sweep with `SYMM_NEXT`.
//! The first socket hit becomes the winner: it echoes pings back to the
//! source so the sweeper can lock onto it, and the session completes on the
//! sweeper's final `AA BB CC EE` confirmation (or the relayed SYMM_DONE).

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::{Arc, Mutex};

use burrow_core::consts::SYMM_CONN_SOCKETS;
use burrow_core::{ConnId, Error, NodeId, Result};
use tracing::{debug, trace, warn};

use burrow_transport::conn::{Connection, Datagram};
use burrow_transport::handle::{KernelHandle, ANY_ADDR};
use burrow_transport::opwatch::OpWatch;
use burrow_transport::reactor::ReactorHandle;

use crate::allocator::PortReservation;
use crate::protocol::Message;
use crate::session::{
    send_control, support_ping, RendezvousResult, SessionCallback, SessionState,
};

const RECV_BUF: usize = 1024;

struct ConnInner {
    state: SessionState,
    pool: Vec<Arc<Connection>>,
    winner: Option<(usize, SocketAddrV4)>,
    callback: Option<SessionCallback>,
    reservation: Option<Arc<PortReservation>>,
}

pub struct SymmConnSession {
    reactor: ReactorHandle,
    conn_id: ConnId,
    owner: bool,
    dest_ip: Ipv4Addr,
    server_conn: Arc<Connection>,
    inner: Mutex<ConnInner>,
    watch: OpWatch,
}

impl SymmConnSession {
    pub fn new(
        reactor: ReactorHandle,
        node_id: NodeId,
        conn_id: ConnId,
        dest_ip: Ipv4Addr,
        server_conn: Arc<Connection>,
        reservation: Option<Arc<PortReservation>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            reactor,
            conn_id,
            owner: conn_id.node_id == node_id,
            dest_ip,
            server_conn,
            inner: Mutex::new(ConnInner {
                state: SessionState::Unstarted,
                pool: Vec::new(),
                winner: None,
                callback: None,
                reservation,
            }),
            watch: OpWatch::new(),
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

    /// Open the listening pool and (on the non-owning side) trigger the
    /// sweeper's first window.
    pub fn start(self: &Arc<Self>, callback: SessionCallback) -> bool {
        let mut pool = Vec::with_capacity(SYMM_CONN_SOCKETS);
        for _ in 0..SYMM_CONN_SOCKETS {
            let built = KernelHandle::udp().and_then(|h| {
                h.bind(ANY_ADDR)?;
                Connection::new(&self.reactor, h)
            });
            match built {
                Ok(conn) => pool.push(conn),
                Err(e) => {
                    warn!("cannot build listener pool: {e}");
                    for conn in pool {
                        conn.close();
                    }
                    return false;
                }
            }
        }
        {
            let Ok(mut inner) = self.inner.lock() else {
                return false;
            };
            inner.state = SessionState::Punching;
            inner.callback = Some(callback);
            inner.pool = pool.clone();
        }
        for (idx, conn) in pool.iter().enumerate() {
            self.arm_recv(idx, conn.clone());
        }
        if !self.owner {
            send_control(
                &self.server_conn,
                &Message::SymmNext {
                    conn_id: self.conn_id,
                    port: 0,
                },
            );
        }
        true
    }

    pub fn on_msg(self: &Arc<Self>, msg: &Message) {
        match msg {
            Message::SymmNext { .. } => {
                // The sweeper finished a window: acknowledge, echoing the
                // discovered port if one of our sockets was hit.
                let port = self
                    .inner
                    .lock()
                    .ok()
                    .and_then(|i| i.winner.map(|(_, src)| src.port()))
                    .unwrap_or(0);
                send_control(
                    &self.server_conn,
                    &Message::SymmNext {
                        conn_id: self.conn_id,
                        port,
                    },
                );
            }
            Message::SymmDoneIn { .. } => {
                let done = self
                    .inner
                    .lock()
                    .map(|i| i.winner.is_some())
                    .unwrap_or(false);
                if done {
                    self.complete();
                } else {
                    warn!("sweeper reported done but no ping was seen");
                    self.fail(Error::Rendezvous(1));
                }
            }
            _ => trace!("ignoring control msg {:#04x} in pool", msg.code()),
        }
    }

    fn arm_recv(self: &Arc<Self>, idx: usize, conn: Arc<Connection>) {
        let this = self.clone();
        conn.read_from(
            RECV_BUF,
            false,
            self.watch.wrap1(move |res: Result<Datagram>| {
                this.on_recv(idx, res);
            }),
        );
    }

    fn on_recv(self: &Arc<Self>, idx: usize, res: Result<Datagram>) {
        let datagram = match res {
            Ok(d) => d,
            Err(e) => {
                if !e.is_closed() {
                    trace!("pool socket {idx} read error: {e}");
                }
                return;
            }
        };

        let mut echo_to = None;
        let mut finish = false;
        {
            let Ok(mut inner) = self.inner.lock() else {
                return;
            };
            if inner.callback.is_none() {
                return;
            }
            if datagram.data.len() == 4 && *datagram.src.ip() == self.dest_ip {
                let is_ping = datagram.data[..] == burrow_core::consts::SUPPORT_PING;
                let is_final = datagram.data[..] == burrow_core::consts::SUPPORT_PING_FINAL;
                if is_ping || is_final {
                    match inner.winner {
                        None => {
                            debug!("pool socket {idx} won, sweeper at {}", datagram.src);
                            inner.winner = Some((idx, datagram.src));
                        }
                        Some((widx, _)) if widx == idx => {
                            // Refresh the sweeper's current mapping.
                            inner.winner = Some((idx, datagram.src));
                        }
                        Some(_) => {
                            trace!("late sweep hit on socket {idx}");
                        }
                    }
                    if let Some((widx, src)) = inner.winner {
                        if widx == idx {
                            echo_to = Some(src);
                            finish = is_final;
                        }
                    }
                } else {
                    warn!("bad magic from sweeper at {}", datagram.src);
                }
            }
        }

        if let Some(src) = echo_to {
            let conn = {
                let Ok(inner) = self.inner.lock() else {
                    return;
                };
                inner.pool.get(idx).cloned()
            };
            if let Some(conn) = conn {
                conn.write_to(support_ping(), src, |res| {
                    if let Err(e) = res {
                        trace!("sweep echo failed: {e}");
                    }
                });
            }
        }

        if finish {
            self.complete();
        } else {
            let conn = {
                let Ok(inner) = self.inner.lock() else {
                    return;
                };
                inner.pool.get(idx).cloned()
            };
            if let Some(conn) = conn {
                self.arm_recv(idx, conn);
            }
        }
    }

    fn complete(self: &Arc<Self>) {
        let (cb, pool, winner, reservation) = {
            let Ok(mut inner) = self.inner.lock() else {
                return;
            };
            let Some(cb) = inner.callback.take() else {
                return;
            };
            let Some(winner) = inner.winner else {
                inner.callback = Some(cb);
                return;
            };
            inner.state = SessionState::Established;
            (
                cb,
                std::mem::take(&mut inner.pool),
                winner,
                inner.reservation.take(),
            )
        };
        if let Some(res) = &reservation {
            res.keepalive();
        }
        let (idx, peer) = winner;
        let mut fd = None;
        for (i, conn) in pool.into_iter().enumerate() {
            if i == idx {
                fd = conn.handle().duplicate().ok();
            }
            conn.close();
        }
        match fd {
            Some(fd) => {
                debug!("pool side established {} via {peer}", self.conn_id);
                cb(Ok(RendezvousResult {
                    fd,
                    peer,
                    src_port: 0,
                    reservation,
                }));
            }
            None => cb(Err(Error::Closed)),
        }
    }

    pub fn fail(self: &Arc<Self>, err: Error) {
        let (cb, pool) = {
            let Ok(mut inner) = self.inner.lock() else {
                return;
            };
            let Some(cb) = inner.callback.take() else {
                return;
            };
            inner.state = SessionState::Failed;
            inner.reservation = None;
            (cb, std::mem::take(&mut inner.pool))
        };
        for conn in pool {
            conn.close();
        }
        cb(Err(err));
    }
}

impl Drop for SymmConnSession {
    fn drop(&mut self) {
        self.watch.close();
    }
}
