//! Rendezvous punch sessions.
//!
//! Each session takes a `ConnId` and a role and works the NAT until a
//! direct UDP 4-tuple exists, then surfaces the punched socket exactly once
//! through its callback. The owner (the node whose id the `ConnId` carries)
//! drives retries; the other side follows.

pub mod fast;
pub mod symm_acc;
pub mod symm_conn;

use std::net::SocketAddrV4;
use std::os::fd::OwnedFd;
use std::sync::Arc;

use burrow_core::Result;
use bytes::Bytes;
use tracing::trace;

use burrow_transport::conn::Connection;
use burrow_transport::handle::KernelHandle;

use crate::protocol::Message;

pub use fast::FastSession;
pub use symm_acc::{KeepaliveEntry, SymmAccSession};
pub use symm_conn::SymmConnSession;

/// Lifecycle of one punch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unstarted,
    /// Reserving ports and announcing mapped endpoints.
    Preparing,
    /// Magic pings in flight.
    Punching,
    Established,
    Failed,
}

/// The punched path, handed to the stream plane.
pub struct RendezvousResult {
    /// Duplicate of the punched UDP socket.
    pub fd: OwnedFd,
    /// The peer's discovered external endpoint.
    pub peer: SocketAddrV4,
    /// Our server-observed source port (symmetric acceptor only, else 0).
    pub src_port: u16,
    /// Lease kept alive for the lifetime of the connection.
    pub reservation: Option<Arc<crate::allocator::PortReservation>>,
}

impl std::fmt::Debug for RendezvousResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RendezvousResult")
            .field("peer", &self.peer)
            .field("src_port", &self.src_port)
            .finish()
    }
}

pub type SessionCallback = Box<dyn FnOnce(Result<RendezvousResult>) + Send + 'static>;

/// Fire-and-forget control-channel send; errors surface through the
/// channel's own read loop.
pub(crate) fn send_control(conn: &Arc<Connection>, msg: &Message) {
    let bytes = msg.to_bytes();
    trace!("control send: {:#04x}", msg.code());
    conn.write(bytes, |res| {
        if let Err(e) = res {
            trace!("control send failed: {e}");
        }
    });
}

/// Bind a fresh UDP socket for punching and split it: the returned handle
/// drives pings, the fd goes to the observation hello.
pub(crate) fn punch_socket() -> Result<(Arc<KernelHandle>, OwnedFd)> {
    let handle = KernelHandle::udp()?;
    handle.bind(burrow_transport::handle::ANY_ADDR)?;
    let fd = handle.duplicate()?;
    Ok((handle, fd))
}

/// The 4-byte hole-punch magic as a sendable buffer.
pub(crate) fn support_ping() -> Bytes {
    Bytes::from_static(&burrow_core::consts::SUPPORT_PING)
}

pub(crate) fn support_ping_final() -> Bytes {
    Bytes::from_static(&burrow_core::consts::SUPPORT_PING_FINAL)
}
