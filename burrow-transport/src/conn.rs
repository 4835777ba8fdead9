//! Queue-driven connection over a kernel socket.
//!
//! Reads and writes are submitted from any thread and enqueued; a driver
//! task on the reactor drives the head of each FIFO whenever the socket is
//! ready, so completions are delivered in submission order, on the reactor
//! thread, never in parallel. Closing fails all pending requests with
//! [`Error::Closed`]; a cross-thread close does not return until that has
//! happened.

use std::collections::VecDeque;
use std::io;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex};

use burrow_core::{Error, Result};
use bytes::{Bytes, BytesMut};
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::sync::Notify;
use tracing::trace;

use crate::handle::{KernelHandle, KernelSocket, SharedSocket, ANY_ADDR};
use crate::reactor::{ReactorHandle, Registration};

/// How a read submission completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// Complete on the first chunk of data.
    One,
    /// Complete only once the buffer is full.
    All,
    /// One datagram with its source address.
    From,
    /// Like `From`, but an empty socket completes with the drain sentinel
    /// instead of waiting.
    Drain,
}

/// A received datagram. The drain sentinel is an empty payload from
/// `0.0.0.0:0`, signalling end-of-burst.
#[derive(Debug, Clone)]
pub struct Datagram {
    pub data: Bytes,
    pub src: SocketAddrV4,
}

impl Datagram {
    pub fn is_drain_sentinel(&self) -> bool {
        self.data.is_empty() && self.src == ANY_ADDR
    }
}

type StreamCb = Box<dyn FnOnce(Result<Bytes>) + Send + 'static>;
type FromCb = Box<dyn FnOnce(Result<Datagram>) + Send + 'static>;
type WriteCb = Box<dyn FnOnce(Result<()>) + Send + 'static>;

struct ReadReq {
    buf: BytesMut,
    filled: usize,
    mode: ReadMode,
    cb: ReadCb,
}

enum ReadCb {
    Stream(StreamCb),
    From(FromCb),
}

struct WriteReq {
    data: Bytes,
    off: usize,
    dst: Option<SocketAddrV4>,
    cb: WriteCb,
}

#[derive(Default)]
struct Queues {
    read: VecDeque<ReadReq>,
    write: VecDeque<WriteReq>,
    closed: bool,
}

struct ConnShared {
    q: Mutex<Queues>,
    wake: Arc<Notify>,
}

impl ConnShared {
    fn interest(&self) -> (bool, bool) {
        match self.q.lock() {
            Ok(q) => (!q.read.is_empty(), !q.write.is_empty()),
            Err(_) => (false, false),
        }
    }
}

/// A connection over one kernel socket (TCP stream or UDP).
pub struct Connection {
    reactor: ReactorHandle,
    handle: Arc<KernelHandle>,
    shared: Arc<ConnShared>,
    cookie: u64,
}

impl Connection {
    pub fn new(reactor: &ReactorHandle, handle: Arc<KernelHandle>) -> Result<Arc<Self>> {
        let sock = handle.socket()?;
        let wake = Arc::new(Notify::new());
        let shared = Arc::new(ConnShared {
            q: Mutex::new(Queues::default()),
            wake: wake.clone(),
        });
        let reg = reactor.register(wake);
        let cookie = reg.cookie;
        reactor.spawn(drive(sock, shared.clone(), reg));
        Ok(Arc::new(Self {
            reactor: reactor.clone(),
            handle,
            shared,
            cookie,
        }))
    }

    pub fn handle(&self) -> &Arc<KernelHandle> {
        &self.handle
    }

    pub fn local_addr(&self) -> Result<SocketAddrV4> {
        self.handle.local_addr()
    }

    /// Submit a stream read of up to (`One`) or exactly (`All`) `len` bytes.
    pub fn read<F>(&self, len: usize, all: bool, cb: F)
    where
        F: FnOnce(Result<Bytes>) + Send + 'static,
    {
        let mode = if all { ReadMode::All } else { ReadMode::One };
        self.submit_read(ReadReq {
            buf: BytesMut::zeroed(len),
            filled: 0,
            mode,
            cb: ReadCb::Stream(Box::new(cb)),
        });
    }

    /// Submit a datagram read. With `drain`, an empty socket completes with
    /// the drain sentinel instead of waiting for the next datagram.
    pub fn read_from<F>(&self, len: usize, drain: bool, cb: F)
    where
        F: FnOnce(Result<Datagram>) + Send + 'static,
    {
        let mode = if drain { ReadMode::Drain } else { ReadMode::From };
        self.submit_read(ReadReq {
            buf: BytesMut::zeroed(len),
            filled: 0,
            mode,
            cb: ReadCb::From(Box::new(cb)),
        });
    }

    /// Submit a write on the connected socket.
    pub fn write<F>(&self, data: Bytes, cb: F)
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        self.submit_write(WriteReq {
            data,
            off: 0,
            dst: None,
            cb: Box::new(cb),
        });
    }

    /// Submit a datagram send to an explicit destination.
    pub fn write_to<F>(&self, data: Bytes, dst: SocketAddrV4, cb: F)
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        self.submit_write(WriteReq {
            data,
            off: 0,
            dst: Some(dst),
            cb: Box::new(cb),
        });
    }

    fn submit_read(&self, req: ReadReq) {
        let rejected = match self.shared.q.lock() {
            Ok(mut q) => {
                if q.closed {
                    Some(req)
                } else {
                    q.read.push_back(req);
                    None
                }
            }
            Err(_) => Some(req),
        };
        match rejected {
            Some(req) => fail_read(req, Error::Closed),
            None => self.reactor.update(self.cookie),
        }
    }

    fn submit_write(&self, req: WriteReq) {
        let rejected = match self.shared.q.lock() {
            Ok(mut q) => {
                if q.closed {
                    Some(req)
                } else {
                    q.write.push_back(req);
                    None
                }
            }
            Err(_) => Some(req),
        };
        match rejected {
            Some(req) => (req.cb)(Err(Error::Closed)),
            None => self.reactor.update(self.cookie),
        }
    }

    /// Close the connection and its handle. After a cross-thread close
    /// returns, no completion of this connection will run again and every
    /// pending request has been failed with [`Error::Closed`].
    pub fn close(&self) {
        let first = match self.shared.q.lock() {
            Ok(mut q) => !std::mem::replace(&mut q.closed, true),
            Err(_) => false,
        };
        if !first {
            return;
        }
        self.reactor.remove(self.cookie);
        self.handle.close();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

fn fail_read(req: ReadReq, err: Error) {
    match req.cb {
        ReadCb::Stream(cb) => cb(Err(err)),
        ReadCb::From(cb) => cb(Err(err)),
    }
}

/// A completion ready to run outside the queue lock.
enum Completion {
    Stream(StreamCb, Result<Bytes>),
    From(FromCb, Result<Datagram>),
    Write(WriteCb, Result<()>),
}

impl Completion {
    fn run(self) {
        match self {
            Completion::Stream(cb, res) => cb(res),
            Completion::From(cb, res) => cb(res),
            Completion::Write(cb, res) => cb(res),
        }
    }
}

enum Step {
    /// Head request completed. `stop` ends the burst (the socket is known
    /// empty), so readiness must be re-awaited.
    Completed { completion: Completion, stop: bool },
    /// Partial progress on the head request.
    Again,
    /// The socket would block.
    Blocked,
    /// Queue empty.
    Idle,
}

#[derive(PartialEq, Eq)]
enum PumpOutcome {
    /// Socket reported would-block; clear readiness before sleeping.
    Blocked,
    /// Stopped with readiness possibly still pending.
    Done,
}

async fn drive(sock: Arc<KernelSocket>, shared: Arc<ConnShared>, reg: Registration) {
    let afd = match AsyncFd::with_interest(
        SharedSocket(sock.clone()),
        Interest::READABLE | Interest::WRITABLE,
    ) {
        Ok(afd) => afd,
        Err(e) => {
            trace!("cannot register socket with reactor: {e}");
            shutdown(&shared, &reg);
            return;
        }
    };

    loop {
        let (want_r, want_w) = shared.interest();
        tokio::select! {
            biased;
            _ = reg.cancel.cancelled() => break,
            _ = shared.wake.notified() => {}
            res = afd.readable(), if want_r => {
                match res {
                    Ok(mut guard) => {
                        if pump(&shared, |q| read_step(&sock, q)) == PumpOutcome::Blocked {
                            guard.clear_ready();
                        }
                    }
                    Err(_) => break,
                }
            }
            res = afd.writable(), if want_w => {
                match res {
                    Ok(mut guard) => {
                        if pump(&shared, |q| write_step(&sock, q)) == PumpOutcome::Blocked {
                            guard.clear_ready();
                        }
                    }
                    Err(_) => break,
                }
            }
        }
    }

    drop(afd);
    shutdown(&shared, &reg);
}

fn shutdown(shared: &ConnShared, reg: &Registration) {
    let (reads, writes) = match shared.q.lock() {
        Ok(mut q) => {
            q.closed = true;
            (
                q.read.drain(..).collect::<Vec<_>>(),
                q.write.drain(..).collect::<Vec<_>>(),
            )
        }
        Err(_) => (Vec::new(), Vec::new()),
    };
    for req in reads {
        fail_read(req, Error::Closed);
    }
    for req in writes {
        (req.cb)(Err(Error::Closed));
    }
    reg.finish();
}

/// Drive head requests until the socket blocks or the queue runs dry.
/// Completions run outside the queue lock, between steps.
fn pump<F>(shared: &ConnShared, mut step: F) -> PumpOutcome
where
    F: FnMut(&mut Queues) -> Step,
{
    loop {
        let outcome = {
            let mut q = match shared.q.lock() {
                Ok(q) => q,
                Err(_) => return PumpOutcome::Done,
            };
            step(&mut q)
        };
        match outcome {
            Step::Completed { completion, stop } => {
                completion.run();
                if stop {
                    return PumpOutcome::Blocked;
                }
            }
            Step::Again => {}
            Step::Blocked => return PumpOutcome::Blocked,
            Step::Idle => return PumpOutcome::Done,
        }
    }
}

fn read_step(sock: &KernelSocket, q: &mut Queues) -> Step {
    let Some(req) = q.read.front_mut() else {
        return Step::Idle;
    };
    match req.mode {
        ReadMode::One | ReadMode::All => {
            let filled = req.filled;
            match sock.recv(&mut req.buf[filled..]) {
                Ok(n) => {
                    req.filled += n;
                    let done = match req.mode {
                        ReadMode::One => true,
                        _ => req.filled == req.buf.len() || n == 0,
                    };
                    if !done {
                        return Step::Again;
                    }
                    let Some(req) = q.read.pop_front() else {
                        return Step::Idle;
                    };
                    // A short `All` read means the peer went away mid-message.
                    let eof = req.mode == ReadMode::All && req.filled < req.buf.len();
                    let res = if eof {
                        Err(Error::Io(io::ErrorKind::UnexpectedEof.into()))
                    } else {
                        let mut buf = req.buf;
                        buf.truncate(req.filled);
                        Ok(buf.freeze())
                    };
                    match req.cb {
                        ReadCb::Stream(cb) => Step::Completed {
                            completion: Completion::Stream(cb, res),
                            stop: false,
                        },
                        ReadCb::From(cb) => Step::Completed {
                            completion: Completion::From(
                                cb,
                                Err(Error::Io(io::ErrorKind::InvalidInput.into())),
                            ),
                            stop: false,
                        },
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => Step::Again,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => Step::Blocked,
                Err(e) => complete_read_err(q, e),
            }
        }
        ReadMode::From | ReadMode::Drain => {
            let filled = req.filled;
            match sock.recv_from(&mut req.buf[filled..]) {
                Ok((n, src)) => {
                    let src = match src {
                        SocketAddr::V4(v4) => v4,
                        // Not part of the traversal plane; skip the datagram.
                        SocketAddr::V6(_) => return Step::Again,
                    };
                    let Some(req) = q.read.pop_front() else {
                        return Step::Idle;
                    };
                    let mut buf = req.buf;
                    buf.truncate(n);
                    let datagram = Datagram {
                        data: buf.freeze(),
                        src,
                    };
                    match req.cb {
                        ReadCb::From(cb) => Step::Completed {
                            completion: Completion::From(cb, Ok(datagram)),
                            stop: false,
                        },
                        ReadCb::Stream(cb) => Step::Completed {
                            completion: Completion::Stream(
                                cb,
                                Err(Error::Io(io::ErrorKind::InvalidInput.into())),
                            ),
                            stop: false,
                        },
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => Step::Again,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if req.mode == ReadMode::From {
                        return Step::Blocked;
                    }
                    // Drain: socket empty, deliver the end-of-burst sentinel.
                    let Some(req) = q.read.pop_front() else {
                        return Step::Idle;
                    };
                    match req.cb {
                        ReadCb::From(cb) => Step::Completed {
                            completion: Completion::From(
                                cb,
                                Ok(Datagram {
                                    data: Bytes::new(),
                                    src: ANY_ADDR,
                                }),
                            ),
                            stop: true,
                        },
                        ReadCb::Stream(cb) => Step::Completed {
                            completion: Completion::Stream(
                                cb,
                                Err(Error::Io(io::ErrorKind::InvalidInput.into())),
                            ),
                            stop: true,
                        },
                    }
                }
                Err(e) => complete_read_err(q, e),
            }
        }
    }
}

fn complete_read_err(q: &mut Queues, e: io::Error) -> Step {
    let Some(req) = q.read.pop_front() else {
        return Step::Idle;
    };
    let completion = match req.cb {
        ReadCb::Stream(cb) => Completion::Stream(cb, Err(Error::Io(e))),
        ReadCb::From(cb) => Completion::From(cb, Err(Error::Io(e))),
    };
    Step::Completed {
        completion,
        stop: false,
    }
}

fn write_step(sock: &KernelSocket, q: &mut Queues) -> Step {
    let Some(req) = q.write.front_mut() else {
        return Step::Idle;
    };
    let res = match req.dst {
        Some(dst) => sock.send_to(&req.data[req.off..], dst),
        None => sock.send(&req.data[req.off..]),
    };
    match res {
        Ok(n) => {
            req.off += n;
            if req.off < req.data.len() {
                return Step::Again;
            }
            let Some(req) = q.write.pop_front() else {
                return Step::Idle;
            };
            Step::Completed {
                completion: Completion::Write(req.cb, Ok(())),
                stop: false,
            }
        }
        Err(e) if e.kind() == io::ErrorKind::Interrupted => Step::Again,
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Step::Blocked,
        Err(e) => {
            let Some(req) = q.write.pop_front() else {
                return Step::Idle;
            };
            Step::Completed {
                completion: Completion::Write(req.cb, Err(Error::Io(e))),
                stop: false,
            }
        }
    }
}
