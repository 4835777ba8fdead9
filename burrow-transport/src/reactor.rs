//! The reactor: a single dedicated thread that drives every socket driver,
//! timer, and completion callback in the process.
//!
//! Internally this is a current-thread tokio runtime. Socket drivers are
//! tasks on that runtime, so callbacks never execute in parallel. Other
//! threads interact through [`ReactorHandle`]: `post`/`dispatch` feed the
//! command channel (which doubles as the wakeup signal), `register`/
//! `remove`/`update` manage the cookie-keyed driver registry. A cross-thread
//! `remove` blocks until the driver has finished its in-flight callback and
//! wound down, so after it returns no completion of that entry can run.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, ThreadId};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, trace};

type Callback = Box<dyn FnOnce() + Send + 'static>;

enum Command {
    /// Run a callback at `deadline`; `seq` breaks ties FIFO.
    At {
        deadline: Instant,
        seq: u64,
        cb: Callback,
    },
    Stop,
}

struct TimerEntry {
    deadline: Instant,
    seq: u64,
    cb: Callback,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}
impl Eq for TimerEntry {}
impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.deadline, self.seq).cmp(&(other.deadline, other.seq))
    }
}

#[derive(Default)]
struct DoneFlag {
    m: Mutex<bool>,
    cv: Condvar,
}

impl DoneFlag {
    fn finish(&self) {
        if let Ok(mut done) = self.m.lock() {
            *done = true;
        }
        self.cv.notify_all();
    }

    fn wait(&self) {
        let Ok(mut done) = self.m.lock() else {
            return;
        };
        while !*done {
            match self.cv.wait(done) {
                Ok(g) => done = g,
                Err(_) => return,
            }
        }
    }
}

struct Entry {
    cancel: CancellationToken,
    wake: Arc<Notify>,
    done: Arc<DoneFlag>,
}

struct Inner {
    cmd_tx: mpsc::UnboundedSender<Command>,
    rt: tokio::runtime::Handle,
    run_thread: Mutex<Option<ThreadId>>,
    next_cookie: AtomicU64,
    next_seq: AtomicU64,
    entries: Mutex<HashMap<u64, Entry>>,
}

/// Cloneable reference to a running (or about to run) reactor.
#[derive(Clone)]
pub struct ReactorHandle {
    inner: Arc<Inner>,
}

/// Registry slot handed to a socket driver. The driver must call
/// [`Registration::finish`] as the very last thing it does.
pub struct Registration {
    pub cookie: u64,
    pub cancel: CancellationToken,
    pub wake: Arc<Notify>,
    done: Arc<DoneFlag>,
}

impl Registration {
    pub fn finish(&self) {
        self.done.finish();
    }
}

impl ReactorHandle {
    /// Schedule `cb` to run on the reactor thread after `delay`.
    pub fn post<F: FnOnce() + Send + 'static>(&self, cb: F, delay: Duration) {
        let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
        let cmd = Command::At {
            deadline: Instant::now() + delay,
            seq,
            cb: Box::new(cb),
        };
        if self.inner.cmd_tx.send(cmd).is_err() {
            trace!("post after reactor shutdown, dropped");
        }
    }

    /// Run `cb` inline when already on the reactor thread, otherwise post it
    /// with zero delay.
    pub fn dispatch<F: FnOnce() + Send + 'static>(&self, cb: F) {
        if self.is_reactor_thread() {
            cb();
        } else {
            self.post(cb, Duration::ZERO);
        }
    }

    /// Leave the loop. Callable from any thread.
    pub fn stop(&self) {
        let _ = self.inner.cmd_tx.send(Command::Stop);
    }

    /// True when the caller is the reactor thread, or when the loop is not
    /// running at all (in which case nothing can race us).
    pub fn is_reactor_thread(&self) -> bool {
        match self.inner.run_thread.lock() {
            Ok(guard) => match *guard {
                Some(id) => id == thread::current().id(),
                None => true,
            },
            Err(_) => true,
        }
    }

    /// Allocate a cookie and registry slot for a new socket driver. `wake`
    /// is the driver's interest-recompute signal; [`update`](Self::update)
    /// notifies it.
    pub fn register(&self, wake: Arc<Notify>) -> Registration {
        let cookie = self.inner.next_cookie.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let done = Arc::new(DoneFlag::default());
        if let Ok(mut entries) = self.inner.entries.lock() {
            entries.insert(
                cookie,
                Entry {
                    cancel: cancel.clone(),
                    wake: wake.clone(),
                    done: done.clone(),
                },
            );
        }
        Registration {
            cookie,
            cancel,
            wake,
            done,
        }
    }

    /// Deregister a driver. A removed-then-readded socket can never be
    /// confused with its predecessor: the cookie is gone from the map before
    /// cancellation is signalled. Cross-thread callers block until the
    /// driver's in-flight callback has returned and the driver finished.
    pub fn remove(&self, cookie: u64) {
        let entry = match self.inner.entries.lock() {
            Ok(mut entries) => entries.remove(&cookie),
            Err(_) => None,
        };
        let Some(entry) = entry else {
            return;
        };
        entry.cancel.cancel();
        if !self.is_reactor_thread() {
            entry.done.wait();
        }
    }

    /// Ask a driver to recompute its interest set. No-op for unknown
    /// cookies; the driver itself skips re-arming when nothing changed.
    pub fn update(&self, cookie: u64) {
        if let Ok(entries) = self.inner.entries.lock() {
            if let Some(entry) = entries.get(&cookie) {
                entry.wake.notify_one();
            }
        }
    }

    /// Spawn a driver future onto the reactor runtime.
    pub(crate) fn spawn<F>(&self, fut: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.inner.rt.spawn(fut);
    }
}

/// The reactor event loop. Create once, hand out [`ReactorHandle`]s, then
/// either [`run`](Reactor::run) on the current thread or
/// [`spawn_thread`](Reactor::spawn_thread).
pub struct Reactor {
    runtime: tokio::runtime::Runtime,
    handle: ReactorHandle,
    cmd_rx: Option<mpsc::UnboundedReceiver<Command>>,
}

impl Reactor {
    pub fn new() -> std::io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_io()
            .enable_time()
            .build()?;
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            cmd_tx,
            rt: runtime.handle().clone(),
            run_thread: Mutex::new(None),
            next_cookie: AtomicU64::new(0),
            next_seq: AtomicU64::new(0),
            entries: Mutex::new(HashMap::new()),
        });
        Ok(Self {
            runtime,
            handle: ReactorHandle { inner },
            cmd_rx: Some(cmd_rx),
        })
    }

    pub fn handle(&self) -> ReactorHandle {
        self.handle.clone()
    }

    /// Enter the loop on the calling thread until [`ReactorHandle::stop`].
    pub fn run(&mut self) {
        let Some(cmd_rx) = self.cmd_rx.take() else {
            error!("reactor already ran");
            return;
        };
        if let Ok(mut t) = self.handle.inner.run_thread.lock() {
            *t = Some(thread::current().id());
        }
        self.runtime.block_on(main_loop(cmd_rx));
        // Drivers no longer make progress; release anyone blocked in a
        // cross-thread removal.
        if let Ok(mut entries) = self.handle.inner.entries.lock() {
            for (_, entry) in entries.drain() {
                entry.cancel.cancel();
                entry.done.finish();
            }
        }
        if let Ok(mut t) = self.handle.inner.run_thread.lock() {
            *t = None;
        }
    }

    /// Run the loop on a dedicated background thread.
    pub fn spawn_thread(mut self) -> ReactorThread {
        let handle = self.handle();
        let join = thread::Builder::new()
            .name("burrow-reactor".into())
            .spawn(move || self.run())
            .ok();
        ReactorThread { handle, join }
    }
}

/// A reactor running on its own thread; stops and joins on drop.
pub struct ReactorThread {
    handle: ReactorHandle,
    join: Option<thread::JoinHandle<()>>,
}

impl ReactorThread {
    pub fn handle(&self) -> ReactorHandle {
        self.handle.clone()
    }

    /// Wait for the loop to leave on its own (a posted `stop`), without
    /// requesting it.
    pub fn join(mut self) {
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for ReactorThread {
    fn drop(&mut self) {
        self.handle.stop();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

async fn main_loop(mut cmd_rx: mpsc::UnboundedReceiver<Command>) {
    let mut timers: BinaryHeap<Reverse<TimerEntry>> = BinaryHeap::new();
    loop {
        let next = timers.peek().map(|Reverse(t)| t.deadline);
        let sleep_until = next.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    None | Some(Command::Stop) => break,
                    Some(Command::At { deadline, seq, cb }) => {
                        timers.push(Reverse(TimerEntry { deadline, seq, cb }));
                    }
                }
            }
            _ = tokio::time::sleep_until(sleep_until), if next.is_some() => {
                let now = Instant::now();
                while let Some(Reverse(head)) = timers.peek() {
                    if head.deadline > now {
                        break;
                    }
                    if let Some(Reverse(entry)) = timers.pop() {
                        (entry.cb)();
                    }
                }
            }
        }
    }
    // Drain without running anything else; pending timers die with the loop.
    trace!("reactor loop done, {} timers dropped", timers.len());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn timers_fire_in_deadline_order() {
        let reactor = Reactor::new().unwrap();
        let handle = reactor.handle();
        let order = Arc::new(Mutex::new(Vec::new()));
        for (tag, delay) in [(2u32, 30u64), (1, 10), (3, 50)] {
            let order = order.clone();
            handle.post(
                move || order.lock().unwrap().push(tag),
                Duration::from_millis(delay),
            );
        }
        let h2 = handle.clone();
        handle.post(move || h2.stop(), Duration::from_millis(100));
        reactor.spawn_thread().join();
        assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn dispatch_runs_inline_on_reactor_thread() {
        let reactor = Reactor::new().unwrap();
        let handle = reactor.handle();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let h = handle.clone();
        handle.post(
            move || {
                let c2 = c.clone();
                // Inline: must have run before the outer callback returns.
                h.dispatch(move || {
                    c2.fetch_add(1, Ordering::SeqCst);
                });
                assert_eq!(c.load(Ordering::SeqCst), 1);
                h.stop();
            },
            Duration::ZERO,
        );
        reactor.spawn_thread().join();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn remove_unknown_cookie_is_noop() {
        let reactor = Reactor::new().unwrap();
        reactor.handle().remove(12345);
    }

    #[test]
    fn cookies_are_monotonic() {
        let reactor = Reactor::new().unwrap();
        let handle = reactor.handle();
        let a = handle.register(Arc::new(Notify::new()));
        let b = handle.register(Arc::new(Notify::new()));
        assert!(b.cookie > a.cookie);
        handle.remove(a.cookie);
        let c = handle.register(Arc::new(Notify::new()));
        assert!(c.cookie > b.cookie);
    }
}
