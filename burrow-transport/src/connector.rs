//! Non-blocking connect driver.
//!
//! Initiates a kernel TCP connect and completes the callback once the socket
//! turns writable, with whatever `SO_ERROR` reports at that point. The
//! handle survives `close()` so the caller can hand it to a [`Connection`].
//!
//! [`Connection`]: crate::conn::Connection

use std::net::SocketAddrV4;
use std::sync::{Arc, Mutex};

use burrow_core::{Error, Result};
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::sync::Notify;
use tracing::trace;

use crate::handle::{KernelHandle, SharedSocket};
use crate::reactor::ReactorHandle;

pub struct Connector {
    reactor: ReactorHandle,
    handle: Arc<KernelHandle>,
    cookie: Mutex<Option<u64>>,
}

impl Connector {
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

    /// Start connecting to `addr`. The callback fires exactly once on the
    /// reactor thread with the connect result.
    pub fn connect<F>(&self, addr: SocketAddrV4, cb: F) -> Result<()>
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        let sock = self.handle.socket()?;
        self.handle.start_connect(addr)?;

        let handle = self.handle.clone();
        let reg = self.reactor.register(Arc::new(Notify::new()));
        if let Ok(mut cookie) = self.cookie.lock() {
            *cookie = Some(reg.cookie);
        }
        self.reactor.spawn(async move {
            let afd = match AsyncFd::with_interest(SharedSocket(sock), Interest::WRITABLE) {
                Ok(afd) => afd,
                Err(e) => {
                    cb(Err(Error::Io(e)));
                    reg.finish();
                    return;
                }
            };
            tokio::select! {
                biased;
                _ = reg.cancel.cancelled() => {
                    cb(Err(Error::Closed));
                }
                res = afd.writable() => {
                    let res = res
                        .map_err(Error::Io)
                        .and_then(|_| connect_result(&handle));
                    cb(res);
                }
            }
            drop(afd);
            reg.finish();
        });
        Ok(())
    }

    /// Deregister the driver. The handle stays open for the caller.
    pub fn close(&self) {
        let cookie = self.cookie.lock().ok().and_then(|mut c| c.take());
        if let Some(cookie) = cookie {
            self.reactor.remove(cookie);
        }
    }
}

impl Drop for Connector {
    fn drop(&mut self) {
        self.close();
    }
}

fn connect_result(handle: &KernelHandle) -> Result<()> {
    match handle.take_error()? {
        None => Ok(()),
        Some(e) => {
            trace!("connect failed: {e}");
            Err(Error::Io(e))
        }
    }
}
