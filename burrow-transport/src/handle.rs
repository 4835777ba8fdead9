//! Kernel socket handle.
//!
//! One `KernelHandle` owns one non-blocking kernel socket (UDP, TCP stream,
//! or TCP listener). Close is idempotent; every operation after close fails
//! with [`Error::Closed`]. File descriptors cross component boundaries as
//! `OwnedFd`, so duplication and rebinding never need raw-fd plumbing.

use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::sync::{Arc, Mutex};

use burrow_core::consts::SUPPORT_PING;
use burrow_core::{Error, Result};
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    Udp,
    TcpStream,
    TcpListener,
}

#[derive(Debug)]
pub enum KernelSocket {
    Udp(std::net::UdpSocket),
    TcpStream(std::net::TcpStream),
    TcpListener(std::net::TcpListener),
}

impl KernelSocket {
    pub fn kind(&self) -> SocketKind {
        match self {
            KernelSocket::Udp(_) => SocketKind::Udp,
            KernelSocket::TcpStream(_) => SocketKind::TcpStream,
            KernelSocket::TcpListener(_) => SocketKind::TcpListener,
        }
    }

    pub fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            KernelSocket::Udp(s) => s.recv(buf),
            KernelSocket::TcpStream(s) => (&*s).read(buf),
            KernelSocket::TcpListener(_) => Err(io::ErrorKind::InvalidInput.into()),
        }
    }

    pub fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        match self {
            KernelSocket::Udp(s) => s.recv_from(buf),
            _ => Err(io::ErrorKind::InvalidInput.into()),
        }
    }

    pub fn send(&self, buf: &[u8]) -> io::Result<usize> {
        match self {
            KernelSocket::Udp(s) => s.send(buf),
            KernelSocket::TcpStream(s) => (&*s).write(buf),
            KernelSocket::TcpListener(_) => Err(io::ErrorKind::InvalidInput.into()),
        }
    }

    pub fn send_to(&self, buf: &[u8], dst: SocketAddrV4) -> io::Result<usize> {
        match self {
            KernelSocket::Udp(s) => s.send_to(buf, SocketAddr::V4(dst)),
            _ => Err(io::ErrorKind::InvalidInput.into()),
        }
    }

    pub fn accept(&self) -> io::Result<(std::net::TcpStream, SocketAddr)> {
        match self {
            KernelSocket::TcpListener(s) => s.accept(),
            _ => Err(io::ErrorKind::InvalidInput.into()),
        }
    }
}

impl AsRawFd for KernelSocket {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            KernelSocket::Udp(s) => s.as_raw_fd(),
            KernelSocket::TcpStream(s) => s.as_raw_fd(),
            KernelSocket::TcpListener(s) => s.as_raw_fd(),
        }
    }
}

impl AsFd for KernelSocket {
    fn as_fd(&self) -> BorrowedFd<'_> {
        match self {
            KernelSocket::Udp(s) => s.as_fd(),
            KernelSocket::TcpStream(s) => s.as_fd(),
            KernelSocket::TcpListener(s) => s.as_fd(),
        }
    }
}

/// `AsRawFd` adapter so a shared socket can sit inside an `AsyncFd`.
#[derive(Clone)]
pub struct SharedSocket(pub Arc<KernelSocket>);

impl AsRawFd for SharedSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

/// One kernel network endpoint. Exactly one owner controls its lifetime.
pub struct KernelHandle {
    kind: SocketKind,
    sock: Mutex<Option<Arc<KernelSocket>>>,
}

impl KernelHandle {
    /// Fresh unbound non-blocking UDP socket with `SO_REUSEADDR`.
    pub fn udp() -> Result<Arc<Self>> {
        let sock = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        sock.set_nonblocking(true)?;
        sock.set_reuse_address(true)?;
        Ok(Self::wrap(KernelSocket::Udp(sock.into())))
    }

    /// Fresh unbound non-blocking TCP socket with `SO_REUSEADDR`.
    pub fn tcp() -> Result<Arc<Self>> {
        let sock = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
        sock.set_nonblocking(true)?;
        sock.set_reuse_address(true)?;
        Ok(Self::wrap(KernelSocket::TcpStream(sock.into())))
    }

    /// Adopt an already-created UDP socket fd (e.g. a duplicate of a punched
    /// socket).
    pub fn udp_from_fd(fd: OwnedFd) -> Result<Arc<Self>> {
        let sock: std::net::UdpSocket = fd.into();
        sock.set_nonblocking(true)?;
        Ok(Self::wrap(KernelSocket::Udp(sock)))
    }

    pub fn tcp_from_std(stream: std::net::TcpStream) -> Result<Arc<Self>> {
        stream.set_nonblocking(true)?;
        Ok(Self::wrap(KernelSocket::TcpStream(stream)))
    }

    fn wrap(sock: KernelSocket) -> Arc<Self> {
        Arc::new(Self {
            kind: sock.kind(),
            sock: Mutex::new(Some(Arc::new(sock))),
        })
    }

    pub fn kind(&self) -> SocketKind {
        self.kind
    }

    /// The live socket, if not yet closed.
    pub fn socket(&self) -> Result<Arc<KernelSocket>> {
        self.sock
            .lock()
            .ok()
            .and_then(|g| g.clone())
            .ok_or(Error::Closed)
    }

    pub fn is_closed(&self) -> bool {
        self.socket().is_err()
    }

    /// Idempotent close. The descriptor itself is released once the last
    /// in-flight user (the socket driver) drops its reference.
    pub fn close(&self) {
        if let Ok(mut g) = self.sock.lock() {
            if g.take().is_some() {
                trace!("kernel handle closed");
            }
        }
    }

    pub fn bind(&self, addr: SocketAddrV4) -> Result<()> {
        let sock = self.socket()?;
        SockRef::from(&*sock).bind(&SocketAddr::V4(addr).into())?;
        Ok(())
    }

    /// Turn a bound TCP socket into a listener. Re-wraps the descriptor, so
    /// the handle must not have an I/O driver yet.
    pub fn listen(&self, backlog: i32) -> Result<()> {
        let sock = self.socket()?;
        match &*sock {
            KernelSocket::TcpStream(s) => {
                SockRef::from(s).listen(backlog)?;
                let raw: Socket = s.try_clone()?.into();
                let listener: std::net::TcpListener = raw.into();
                if let Ok(mut g) = self.sock.lock() {
                    *g = Some(Arc::new(KernelSocket::TcpListener(listener)));
                }
                Ok(())
            }
            KernelSocket::TcpListener(_) => Ok(()),
            KernelSocket::Udp(_) => Err(Error::Io(io::ErrorKind::InvalidInput.into())),
        }
    }

    /// Initiate a non-blocking connect; completion is observed through
    /// writability plus [`take_error`](Self::take_error).
    pub fn start_connect(&self, addr: SocketAddrV4) -> Result<()> {
        let sock = self.socket()?;
        match SockRef::from(&*sock).connect(&SocketAddr::V4(addr).into()) {
            Ok(()) => Ok(()),
            Err(e)
                if e.raw_os_error() == Some(115) // EINPROGRESS
                    || e.kind() == io::ErrorKind::WouldBlock =>
            {
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Pending `SO_ERROR`, drained.
    pub fn take_error(&self) -> Result<Option<io::Error>> {
        let sock = self.socket()?;
        Ok(SockRef::from(&*sock).take_error()?)
    }

    pub fn local_addr(&self) -> Result<SocketAddrV4> {
        let sock = self.socket()?;
        let addr = match &*sock {
            KernelSocket::Udp(s) => s.local_addr()?,
            KernelSocket::TcpStream(s) => s.local_addr()?,
            KernelSocket::TcpListener(s) => s.local_addr()?,
        };
        into_v4(addr)
    }

    pub fn peer_addr(&self) -> Result<SocketAddrV4> {
        let sock = self.socket()?;
        let addr = match &*sock {
            KernelSocket::Udp(s) => s.peer_addr()?,
            KernelSocket::TcpStream(s) => s.peer_addr()?,
            KernelSocket::TcpListener(_) => {
                return Err(Error::Io(io::ErrorKind::NotConnected.into()))
            }
        };
        into_v4(addr)
    }

    /// Duplicate the descriptor out of the handle.
    pub fn duplicate(&self) -> Result<OwnedFd> {
        let sock = self.socket()?;
        let fd: OwnedFd = match &*sock {
            KernelSocket::Udp(s) => s.try_clone()?.into(),
            KernelSocket::TcpStream(s) => s.try_clone()?.into(),
            KernelSocket::TcpListener(s) => s.try_clone()?.into(),
        };
        Ok(fd)
    }

    pub fn ttl(&self) -> Result<u32> {
        let sock = self.socket()?;
        Ok(SockRef::from(&*sock).ttl()?)
    }

    pub fn set_ttl(&self, ttl: u32) -> Result<()> {
        let sock = self.socket()?;
        SockRef::from(&*sock).set_ttl(ttl)?;
        Ok(())
    }

    /// Fire one 4-byte NAT keepalive magic at `dst`. Errors (including
    /// would-block) are logged and swallowed; a lost keepalive is harmless.
    pub fn ping(&self, dst: SocketAddrV4) {
        let Ok(sock) = self.socket() else {
            return;
        };
        if let Err(e) = sock.send_to(&SUPPORT_PING, dst) {
            trace!("keepalive ping to {dst} failed: {e}");
        }
    }
}

impl std::fmt::Debug for KernelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelHandle")
            .field("kind", &self.kind)
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn into_v4(addr: SocketAddr) -> Result<SocketAddrV4> {
    match addr {
        SocketAddr::V4(v4) => Ok(v4),
        SocketAddr::V6(_) => Err(Error::protocol("IPv6 is not part of the traversal plane")),
    }
}

/// `0.0.0.0:0`, the "any" bind target and the drain sentinel source.
pub const ANY_ADDR: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_is_idempotent() {
        let h = KernelHandle::udp().unwrap();
        h.close();
        h.close();
        assert!(matches!(h.bind(ANY_ADDR), Err(Error::Closed)));
        assert!(matches!(h.local_addr(), Err(Error::Closed)));
    }

    #[test]
    fn any_bind_yields_concrete_port() {
        let h = KernelHandle::udp().unwrap();
        h.bind(ANY_ADDR).unwrap();
        let addr = h.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
    }

    #[test]
    fn duplicate_shares_binding() {
        let h = KernelHandle::udp().unwrap();
        h.bind(ANY_ADDR).unwrap();
        let port = h.local_addr().unwrap().port();
        let fd = h.duplicate().unwrap();
        let h2 = KernelHandle::udp_from_fd(fd).unwrap();
        assert_eq!(h2.local_addr().unwrap().port(), port);
    }

    #[test]
    fn ttl_roundtrip() {
        let h = KernelHandle::udp().unwrap();
        h.set_ttl(7).unwrap();
        assert_eq!(h.ttl().unwrap(), 7);
    }
}
