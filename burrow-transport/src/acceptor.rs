//! Listening-socket driver: accepts kernel TCP connections and hands each
//! one to the listen callback as a fresh non-blocking handle.

use std::io;
use std::sync::{Arc, Mutex};

use burrow_core::Result;
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::sync::Notify;
use tracing::{trace, warn};

use crate::handle::{KernelHandle, SharedSocket};
use crate::reactor::ReactorHandle;

pub struct Acceptor {
    reactor: ReactorHandle,
    handle: Arc<KernelHandle>,
    cookie: Mutex<Option<u64>>,
}

impl Acceptor {
    pub fn new(reactor: &ReactorHandle, handle: Arc<KernelHandle>) -> Arc<Self> {
        Arc::new(Self {
            reactor: reactor.clone(),
            handle,
            cookie: Mutex::new(None),
        })
    }

    pub fn handle(&self) -> &Arc<KernelHandle> {
        &self.handle
    }

    /// Put the socket into listening state and invoke `cb` on the reactor
    /// thread for every accepted connection.
    pub fn listen<F>(&self, backlog: i32, mut cb: F) -> Result<()>
    where
        F: FnMut(Arc<KernelHandle>) + Send + 'static,
    {
        self.handle.listen(backlog)?;
        let sock = self.handle.socket()?;
        let reg = self.reactor.register(Arc::new(Notify::new()));
        if let Ok(mut cookie) = self.cookie.lock() {
            *cookie = Some(reg.cookie);
        }
        self.reactor.spawn(async move {
            let afd = match AsyncFd::with_interest(SharedSocket(sock.clone()), Interest::READABLE) {
                Ok(afd) => afd,
                Err(e) => {
                    warn!("cannot register listener: {e}");
                    reg.finish();
                    return;
                }
            };
            loop {
                tokio::select! {
                    biased;
                    _ = reg.cancel.cancelled() => break,
                    res = afd.readable() => {
                        let mut guard = match res {
                            Ok(g) => g,
                            Err(_) => break,
                        };
                        loop {
                            match sock.accept() {
                                Ok((stream, peer)) => {
                                    trace!("accepted connection from {peer}");
                                    match KernelHandle::tcp_from_std(stream) {
                                        Ok(handle) => cb(handle),
                                        Err(e) => warn!("accepted socket unusable: {e}"),
                                    }
                                }
                                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                                    guard.clear_ready();
                                    break;
                                }
                                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                                Err(e) => {
                                    warn!("accept failed: {e}");
                                    guard.clear_ready();
                                    break;
                                }
                            }
                        }
                    }
                }
            }
            drop(afd);
            reg.finish();
        });
        Ok(())
    }

    /// Deregister the driver and close the listening handle.
    pub fn close(&self) {
        let cookie = self.cookie.lock().ok().and_then(|mut c| c.take());
        if let Some(cookie) = cookie {
            self.reactor.remove(cookie);
        }
        self.handle.close();
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        self.close();
    }
}
