//! Stream handles: the stream-plane side of the handle contract.
//!
//! A `StreamHandle` represents one logical endpoint multiplexed onto a
//! shared UDP socket. It exposes the same capability set as the kernel
//! handle (bind by address or fd, duplicate, TTL, ping, role factories) and
//! buffers inbound payload in a ring of [`STREAM_BUFF_SIZE`] bytes.

use std::collections::VecDeque;
use std::net::SocketAddrV4;
use std::os::fd::OwnedFd;
use std::sync::{Arc, Mutex};

use burrow_core::consts::STREAM_BUFF_SIZE;
use burrow_core::{Error, Result};
use bytes::{Bytes, BytesMut};
use tracing::warn;

use burrow_transport::conn::Connection;
use burrow_transport::handle::ANY_ADDR;

use crate::engine::{Engine, SockId};
use crate::manager::StreamManager;

pub(crate) type ConnectCb = Box<dyn FnOnce(Result<()>) + Send + 'static>;
pub(crate) type ReadCb = Box<dyn FnOnce(Result<Bytes>) + Send + 'static>;
pub(crate) type WriteCb = Box<dyn FnOnce(Result<()>) + Send + 'static>;
pub(crate) type AcceptCb = Box<dyn FnMut(StreamHandle) + Send + 'static>;

struct ReadWait {
    len: usize,
    cb: ReadCb,
}

struct WriteWait {
    data: Bytes,
    off: usize,
    cb: WriteCb,
}

struct HandleInner {
    sock: Option<SockId>,
    local_port: u16,
    conn: Option<Arc<Connection>>,
    ring: VecDeque<u8>,
    eof: bool,
    failed: Option<Error>,
    closed: bool,
    connect_cb: Option<ConnectCb>,
    accept_cb: Option<AcceptCb>,
    read_q: VecDeque<ReadWait>,
    write_q: VecDeque<WriteWait>,
}

/// State shared between a [`StreamHandle`] (and its role objects) and the
/// multiplexer's event pump.
pub struct HandleShared {
    inner: Mutex<HandleInner>,
}

impl HandleShared {
    fn new(sock: Option<SockId>, local_port: u16, conn: Option<Arc<Connection>>) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(HandleInner {
                sock,
                local_port,
                conn,
                ring: VecDeque::with_capacity(STREAM_BUFF_SIZE),
                eof: false,
                failed: None,
                closed: false,
                connect_cb: None,
                accept_cb: None,
                read_q: VecDeque::new(),
                write_q: VecDeque::new(),
            }),
        })
    }

    pub(crate) fn complete_connect(&self, res: Result<()>) {
        let cb = match self.inner.lock() {
            Ok(mut inner) => inner.connect_cb.take(),
            Err(_) => None,
        };
        if let Some(cb) = cb {
            cb(res);
        }
    }

    /// Append engine payload to the ring and satisfy queued reads. Returns
    /// the number of ring bytes handed to consumers (window give-back).
    pub(crate) fn push_readable(&self, bytes: Bytes) -> usize {
        let (completions, consumed) = {
            let Ok(mut inner) = self.inner.lock() else {
                return 0;
            };
            if inner.ring.len() + bytes.len() > STREAM_BUFF_SIZE {
                // The engine window accounting should make this impossible.
                warn!("stream ring overflow, dropping {} bytes", bytes.len());
            } else {
                inner.ring.extend(bytes.iter());
            }
            inner.fulfill_reads()
        };
        for (cb, res) in completions {
            cb(res);
        }
        consumed
    }

    pub(crate) fn set_eof(&self) {
        let completions = {
            let Ok(mut inner) = self.inner.lock() else {
                return;
            };
            inner.eof = true;
            inner.fulfill_reads().0
        };
        for (cb, res) in completions {
            cb(res);
        }
    }

    pub(crate) fn fail(&self, e: Error) {
        let (reads, writes, connect) = {
            let Ok(mut inner) = self.inner.lock() else {
                return;
            };
            inner.failed = Some(e.clone());
            (
                inner.read_q.drain(..).collect::<Vec<_>>(),
                inner.write_q.drain(..).collect::<Vec<_>>(),
                inner.connect_cb.take(),
            )
        };
        if let Some(cb) = connect {
            cb(Err(e.clone()));
        }
        for r in reads {
            (r.cb)(Err(e.clone()));
        }
        for w in writes {
            (w.cb)(Err(e.clone()));
        }
    }

    /// Feed queued writes into the engine while it accepts bytes. Runs under
    /// the multiplexer state lock; returns the completed write callbacks.
    pub(crate) fn pump_writes(&self, engine: &mut Engine, sock: SockId) -> Vec<WriteCb> {
        let Ok(mut inner) = self.inner.lock() else {
            return Vec::new();
        };
        let mut done = Vec::new();
        while let Some(head) = inner.write_q.front_mut() {
            let n = engine.write(sock, &head.data[head.off..]);
            head.off += n;
            if head.off < head.data.len() {
                break;
            }
            if let Some(w) = inner.write_q.pop_front() {
                done.push(w.cb);
            }
        }
        done
    }

    pub(crate) fn deliver_accept(&self, handle: StreamHandle) {
        // Take the callback out so user code runs without the lock, then
        // put it back for the next accept.
        let cb = match self.inner.lock() {
            Ok(mut inner) => inner.accept_cb.take(),
            Err(_) => None,
        };
        let Some(mut cb) = cb else {
            warn!("accepted stream dropped: acceptor has no listen callback");
            handle.close_abort();
            return;
        };
        cb(handle);
        if let Ok(mut inner) = self.inner.lock() {
            if inner.accept_cb.is_none() {
                inner.accept_cb = Some(cb);
            }
        }
    }
}

impl HandleInner {
    /// Satisfy queued reads from the ring (and EOF/error states).
    #[allow(clippy::type_complexity)]
    fn fulfill_reads(&mut self) -> (Vec<(ReadCb, Result<Bytes>)>, usize) {
        let mut out = Vec::new();
        let mut consumed = 0;
        loop {
            if self.read_q.is_empty() {
                break;
            }
            if !self.ring.is_empty() {
                let Some(req) = self.read_q.pop_front() else {
                    break;
                };
                let n = req.len.min(self.ring.len());
                let mut buf = BytesMut::with_capacity(n);
                buf.extend(self.ring.drain(..n));
                consumed += n;
                out.push((req.cb, Ok(buf.freeze())));
            } else if let Some(e) = &self.failed {
                let Some(req) = self.read_q.pop_front() else {
                    break;
                };
                out.push((req.cb, Err(e.clone())));
            } else if self.eof {
                let Some(req) = self.read_q.pop_front() else {
                    break;
                };
                // Zero-length read marks end of stream, like the kernel side.
                out.push((req.cb, Ok(Bytes::new())));
            } else {
                break;
            }
        }
        (out, consumed)
    }
}

/// One logical stream endpoint.
#[derive(Clone)]
pub struct StreamHandle {
    mgr: Arc<StreamManager>,
    shared: Arc<HandleShared>,
}

impl StreamHandle {
    pub(crate) fn new_unbound(mgr: Arc<StreamManager>) -> Self {
        Self {
            mgr,
            shared: HandleShared::new(None, 0, None),
        }
    }

    pub(crate) fn new_accepted(
        mgr: Arc<StreamManager>,
        port: u16,
        sock: SockId,
        conn: Arc<Connection>,
    ) -> Self {
        Self {
            mgr,
            shared: HandleShared::new(Some(sock), port, Some(conn)),
        }
    }

    pub(crate) fn shared(&self) -> &Arc<HandleShared> {
        &self.shared
    }

    pub fn manager(&self) -> &Arc<StreamManager> {
        &self.mgr
    }

    /// Bind to a local UDP port (0 picks an ephemeral one). Sharing a port
    /// with other stream handles reuses the same transport socket.
    pub fn bind(&self, addr: SocketAddrV4) -> Result<()> {
        self.bind_inner(addr.port(), None)
    }

    /// Adopt an existing UDP socket (e.g. a punched one).
    pub fn bind_fd(&self, fd: OwnedFd) -> Result<()> {
        self.bind_inner(0, Some(fd))
    }

    fn bind_inner(&self, port: u16, fd: Option<OwnedFd>) -> Result<()> {
        {
            let Ok(inner) = self.shared.inner.lock() else {
                return Err(Error::Closed);
            };
            if inner.closed {
                return Err(Error::Closed);
            }
            if inner.conn.is_some() {
                return Err(Error::protocol("handle is already bound"));
            }
        }
        let (conn, actual) = self.mgr.create_transport(port, fd)?;
        let Ok(mut inner) = self.shared.inner.lock() else {
            return Err(Error::Closed);
        };
        inner.conn = Some(conn);
        inner.local_port = actual;
        Ok(())
    }

    pub fn local_addr(&self) -> Result<SocketAddrV4> {
        let Ok(inner) = self.shared.inner.lock() else {
            return Err(Error::Closed);
        };
        match &inner.conn {
            Some(conn) => conn.local_addr(),
            None => Err(Error::protocol("handle is not bound")),
        }
    }

    /// Peer address with the tag translated to the actual UDP port.
    pub fn peer_addr(&self) -> Result<SocketAddrV4> {
        let (sock, port) = {
            let Ok(inner) = self.shared.inner.lock() else {
                return Err(Error::Closed);
            };
            (inner.sock, inner.local_port)
        };
        let sock = sock.ok_or_else(|| Error::protocol("stream is not connected"))?;
        let (ip, tag) = self
            .mgr
            .peer_of(sock)
            .ok_or_else(|| Error::protocol("stream is not connected"))?;
        let actual = self
            .mgr
            .mapped_peer_port(port, ip, &tag)
            .ok_or_else(|| Error::protocol("peer port unknown"))?;
        Ok(SocketAddrV4::new(ip, actual))
    }

    pub fn ttl(&self) -> Result<u32> {
        self.with_conn(|c| c.handle().ttl())
    }

    pub fn set_ttl(&self, ttl: u32) -> Result<()> {
        self.with_conn(|c| c.handle().set_ttl(ttl))
    }

    /// Duplicate the underlying transport descriptor.
    pub fn duplicate(&self) -> Result<OwnedFd> {
        self.with_conn(|c| c.handle().duplicate())
    }

    /// NAT keepalive through the underlying transport socket.
    pub fn ping(&self, dst: SocketAddrV4) {
        let _ = self.with_conn(|c| {
            c.handle().ping(dst);
            Ok(())
        });
    }

    /// True when the handle is closed and no transport remains on its port,
    /// i.e. the underlying UDP socket is safe to rebind.
    pub fn can_reuse(&self) -> bool {
        let (closed, port) = match self.shared.inner.lock() {
            Ok(inner) => (inner.closed, inner.local_port),
            Err(_) => return false,
        };
        closed && (port == 0 || !self.mgr.have_transport(port))
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Arc<Connection>) -> Result<T>) -> Result<T> {
        let Ok(inner) = self.shared.inner.lock() else {
            return Err(Error::Closed);
        };
        match &inner.conn {
            Some(conn) => f(conn),
            None => Err(Error::protocol("handle is not bound")),
        }
    }

    /// Graceful close: queued data and the stream FIN are flushed within the
    /// release linger.
    pub fn close(&self) {
        self.close_inner(false);
    }

    /// Abortive close: reset the stream and release the transport quickly.
    pub fn close_abort(&self) {
        self.close_inner(true);
    }

    fn close_inner(&self, abort: bool) {
        let (sock, port, conn, first) = {
            let Ok(mut inner) = self.shared.inner.lock() else {
                return;
            };
            let first = !inner.closed;
            inner.closed = true;
            (inner.sock.take(), inner.local_port, inner.conn.take(), first)
        };
        if !first {
            return;
        }
        self.shared.fail(Error::Closed);
        self.mgr.note_handle_dropped();
        self.mgr.close_stream(sock, port, abort, conn);
    }

    /// Connector role: reliable-stream client over the bound (or freshly
    /// ephemeral) transport.
    pub fn into_connector(self) -> StreamConnector {
        StreamConnector { handle: self }
    }

    /// Acceptor role: reliable-stream server on the bound transport.
    pub fn into_acceptor(self) -> StreamAcceptor {
        StreamAcceptor { handle: self }
    }

    /// Connection role for an established (accepted or connected) stream.
    pub fn into_connection(self) -> StreamConnection {
        StreamConnection { handle: self }
    }
}

pub struct StreamConnector {
    handle: StreamHandle,
}

impl StreamConnector {
    pub fn handle(&self) -> &StreamHandle {
        &self.handle
    }

    /// Connect to `peer` (its actual UDP endpoint). The callback fires once
    /// with the handshake result; on success the handle can be turned into a
    /// connection.
    pub fn connect<F>(&self, peer: SocketAddrV4, cb: F) -> Result<()>
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        let bound = {
            let Ok(inner) = self.handle.shared.inner.lock() else {
                return Err(Error::Closed);
            };
            if inner.closed {
                return Err(Error::Closed);
            }
            inner.conn.is_some()
        };
        if !bound {
            self.handle.bind(ANY_ADDR)?;
        }
        let port = self.handle.local_addr()?.port();
        {
            let Ok(mut inner) = self.handle.shared.inner.lock() else {
                return Err(Error::Closed);
            };
            if inner.sock.is_some() {
                return Err(Error::protocol("handle is already connected"));
            }
            inner.connect_cb = Some(Box::new(cb));
        }
        let sock = self
            .handle
            .mgr
            .bind_connector(&self.handle.shared, port, peer)?;
        if let Ok(mut inner) = self.handle.shared.inner.lock() {
            inner.sock = Some(sock);
        }
        Ok(())
    }

    pub fn close(&self) {
        // Role object teardown keeps the handle; mirrors the kernel
        // connector.
    }
}

pub struct StreamAcceptor {
    handle: StreamHandle,
}

impl StreamAcceptor {
    pub fn handle(&self) -> &StreamHandle {
        &self.handle
    }

    /// Accept inbound streams on the bound port. `cb` receives one connected
    /// handle per accepted stream.
    pub fn listen<F>(&self, cb: F) -> Result<()>
    where
        F: FnMut(StreamHandle) + Send + 'static,
    {
        let port = self.handle.local_addr()?.port();
        {
            let Ok(mut inner) = self.handle.shared.inner.lock() else {
                return Err(Error::Closed);
            };
            inner.accept_cb = Some(Box::new(cb));
        }
        self.handle.mgr.bind_acceptor(&self.handle.shared, port)
    }

    pub fn close(&self) {
        self.handle.close();
    }
}

pub struct StreamConnection {
    handle: StreamHandle,
}

impl StreamConnection {
    pub fn handle(&self) -> &StreamHandle {
        &self.handle
    }

    /// Read up to `len` bytes. Completes immediately when ring data, an
    /// error, or EOF (empty result) is available, otherwise queues FIFO.
    pub fn read<F>(&self, len: usize, cb: F)
    where
        F: FnOnce(Result<Bytes>) + Send + 'static,
    {
        let shared = &self.handle.shared;
        let immediate = {
            let Ok(mut inner) = shared.inner.lock() else {
                cb(Err(Error::Closed));
                return;
            };
            if inner.closed {
                Some((Box::new(cb) as ReadCb, Err(Error::Closed), 0))
            } else if !inner.ring.is_empty() && inner.read_q.is_empty() {
                let n = len.min(inner.ring.len());
                let mut buf = BytesMut::with_capacity(n);
                buf.extend(inner.ring.drain(..n));
                Some((Box::new(cb) as ReadCb, Ok(buf.freeze()), n))
            } else if let Some(e) = inner.failed.clone() {
                Some((Box::new(cb) as ReadCb, Err(e), 0))
            } else if inner.eof {
                Some((Box::new(cb) as ReadCb, Ok(Bytes::new()), 0))
            } else {
                inner.read_q.push_back(ReadWait {
                    len,
                    cb: Box::new(cb),
                });
                None
            }
        };
        if let Some((cb, res, consumed)) = immediate {
            let sock = shared.inner.lock().ok().and_then(|i| i.sock);
            cb(res);
            if consumed > 0 {
                if let Some(sock) = sock {
                    self.handle.mgr.note_consumed(sock, consumed);
                }
            }
        }
    }

    /// Write all of `data`; the callback fires once the engine accepted
    /// every byte into its send buffer.
    pub fn write<F>(&self, data: Bytes, cb: F)
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        let shared = &self.handle.shared;
        let sock = {
            let Ok(mut inner) = shared.inner.lock() else {
                cb(Err(Error::Closed));
                return;
            };
            if inner.closed {
                drop(inner);
                cb(Err(Error::Closed));
                return;
            }
            if let Some(e) = inner.failed.clone() {
                drop(inner);
                cb(Err(e));
                return;
            }
            inner.write_q.push_back(WriteWait {
                data,
                off: 0,
                cb: Box::new(cb),
            });
            inner.sock
        };
        if let Some(sock) = sock {
            self.handle
                .mgr
                .drive_pending_writes(&self.handle.shared, sock);
        }
    }

    pub fn close(&self) {
        self.handle.close();
    }

    pub fn close_abort(&self) {
        self.handle.close_abort();
    }
}
