//! Polymorphic handle family over the two transport planes.
//!
//! Enum variants instead of trait objects, so the hot paths dispatch with a
//! match. The kernel variant wraps the socket handle family from
//! `burrow-transport`; the stream variant wraps the multiplexed endpoints.

use std::net::SocketAddrV4;
use std::os::fd::OwnedFd;
use std::sync::Arc;

use burrow_core::{Error, Result};
use bytes::Bytes;

use burrow_transport::acceptor::Acceptor;
use burrow_transport::conn::Connection;
use burrow_transport::connector::Connector;
use burrow_transport::handle::KernelHandle;
use burrow_transport::reactor::ReactorHandle;

use crate::handle::{StreamAcceptor, StreamConnection, StreamConnector, StreamHandle};

/// One network endpoint on either plane.
#[derive(Clone)]
pub enum AnyHandle {
    Kernel(Arc<KernelHandle>),
    Stream(StreamHandle),
}

impl AnyHandle {
    pub fn bind(&self, addr: SocketAddrV4) -> Result<()> {
        match self {
            AnyHandle::Kernel(h) => h.bind(addr),
            AnyHandle::Stream(h) => h.bind(addr),
        }
    }

    pub fn bind_fd(&self, fd: OwnedFd) -> Result<()> {
        match self {
            AnyHandle::Kernel(_) => Err(Error::protocol(
                "kernel handles adopt descriptors at creation",
            )),
            AnyHandle::Stream(h) => h.bind_fd(fd),
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddrV4> {
        match self {
            AnyHandle::Kernel(h) => h.local_addr(),
            AnyHandle::Stream(h) => h.local_addr(),
        }
    }

    pub fn peer_addr(&self) -> Result<SocketAddrV4> {
        match self {
            AnyHandle::Kernel(h) => h.peer_addr(),
            AnyHandle::Stream(h) => h.peer_addr(),
        }
    }

    pub fn duplicate(&self) -> Result<OwnedFd> {
        match self {
            AnyHandle::Kernel(h) => h.duplicate(),
            AnyHandle::Stream(h) => h.duplicate(),
        }
    }

    pub fn ttl(&self) -> Result<u32> {
        match self {
            AnyHandle::Kernel(h) => h.ttl(),
            AnyHandle::Stream(h) => h.ttl(),
        }
    }

    pub fn set_ttl(&self, ttl: u32) -> Result<()> {
        match self {
            AnyHandle::Kernel(h) => h.set_ttl(ttl),
            AnyHandle::Stream(h) => h.set_ttl(ttl),
        }
    }

    pub fn ping(&self, dst: SocketAddrV4) {
        match self {
            AnyHandle::Kernel(h) => h.ping(dst),
            AnyHandle::Stream(h) => h.ping(dst),
        }
    }

    pub fn can_reuse(&self) -> bool {
        match self {
            AnyHandle::Kernel(h) => h.is_closed(),
            AnyHandle::Stream(h) => h.can_reuse(),
        }
    }

    pub fn close(&self) {
        match self {
            AnyHandle::Kernel(h) => h.close(),
            AnyHandle::Stream(h) => h.close(),
        }
    }

    /// Connector role over this handle. Kernel handles need the reactor.
    pub fn into_connector(self, reactor: &ReactorHandle) -> AnyConnector {
        match self {
            AnyHandle::Kernel(h) => AnyConnector::Kernel(Connector::new(reactor, h)),
            AnyHandle::Stream(h) => AnyConnector::Stream(h.into_connector()),
        }
    }

    pub fn into_acceptor(self, reactor: &ReactorHandle) -> AnyAcceptor {
        match self {
            AnyHandle::Kernel(h) => AnyAcceptor::Kernel(Acceptor::new(reactor, h)),
            AnyHandle::Stream(h) => AnyAcceptor::Stream(h.into_acceptor()),
        }
    }

    pub fn into_connection(self, reactor: &ReactorHandle) -> Result<AnyConnection> {
        match self {
            AnyHandle::Kernel(h) => Ok(AnyConnection::Kernel(Connection::new(reactor, h)?)),
            AnyHandle::Stream(h) => Ok(AnyConnection::Stream(h.into_connection())),
        }
    }
}

pub enum AnyConnector {
    Kernel(Arc<Connector>),
    Stream(StreamConnector),
}

impl AnyConnector {
    pub fn connect<F>(&self, addr: SocketAddrV4, cb: F) -> Result<()>
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        match self {
            AnyConnector::Kernel(c) => c.connect(addr, cb),
            AnyConnector::Stream(c) => c.connect(addr, cb),
        }
    }

    pub fn close(&self) {
        match self {
            AnyConnector::Kernel(c) => c.close(),
            AnyConnector::Stream(c) => c.close(),
        }
    }
}

pub enum AnyAcceptor {
    Kernel(Arc<Acceptor>),
    Stream(StreamAcceptor),
}

impl AnyAcceptor {
    /// Accept connections; each one arrives as a handle of the same plane.
    pub fn listen<F>(&self, backlog: i32, mut cb: F) -> Result<()>
    where
        F: FnMut(AnyHandle) + Send + 'static,
    {
        match self {
            AnyAcceptor::Kernel(a) => a.listen(backlog, move |h| cb(AnyHandle::Kernel(h))),
            AnyAcceptor::Stream(a) => a.listen(move |h| cb(AnyHandle::Stream(h))),
        }
    }

    pub fn close(&self) {
        match self {
            AnyAcceptor::Kernel(a) => a.close(),
            AnyAcceptor::Stream(a) => a.close(),
        }
    }
}

pub enum AnyConnection {
    Kernel(Arc<Connection>),
    Stream(StreamConnection),
}

impl AnyConnection {
    pub fn read<F>(&self, len: usize, cb: F)
    where
        F: FnOnce(Result<Bytes>) + Send + 'static,
    {
        match self {
            AnyConnection::Kernel(c) => c.read(len, false, cb),
            AnyConnection::Stream(c) => c.read(len, cb),
        }
    }

    pub fn write<F>(&self, data: Bytes, cb: F)
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        match self {
            AnyConnection::Kernel(c) => c.write(data, cb),
            AnyConnection::Stream(c) => c.write(data, cb),
        }
    }

    pub fn close(&self) {
        match self {
            AnyConnection::Kernel(c) => c.close(),
            AnyConnection::Stream(c) => c.close(),
        }
    }
}
