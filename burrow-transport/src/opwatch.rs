//! Cancellation guard for callback chains.
//!
//! Sessions wrap every callback that captures their state through an
//! `OpWatch`. Closing the watch guarantees (a) no wrapped callback runs
//! afterwards and (b) once `close()` returns, no wrapped callback is
//! mid-execution. Closing from inside one of the watch's own callbacks is
//! allowed and does not deadlock.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, ThreadId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Active,
    Closing,
    Closed,
}

struct State {
    mode: Mode,
    /// Nesting depth of wrapped callbacks currently on the stack.
    in_flight: u32,
    exec_thread: Option<ThreadId>,
}

struct WatchInner {
    state: Mutex<State>,
    cv: Condvar,
}

#[derive(Clone)]
pub struct OpWatch {
    inner: Arc<WatchInner>,
}

impl Default for OpWatch {
    fn default() -> Self {
        Self::new()
    }
}

impl OpWatch {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(WatchInner {
                state: Mutex::new(State {
                    mode: Mode::Active,
                    in_flight: 0,
                    exec_thread: None,
                }),
                cv: Condvar::new(),
            }),
        }
    }

    /// Transition Active -> Closing -> Closed, waiting (cross-thread) for any
    /// in-flight wrapped callback to return. Returns whether the watch was
    /// still active, so callers can decide whether to also tear down the
    /// underlying handle.
    pub fn close(&self) -> bool {
        let Ok(mut st) = self.inner.state.lock() else {
            return false;
        };
        if st.mode != Mode::Active {
            return false;
        }
        st.mode = Mode::Closing;
        let me = thread::current().id();
        while st.in_flight > 0 && st.exec_thread != Some(me) {
            match self.inner.cv.wait(st) {
                Ok(g) => st = g,
                Err(_) => return true,
            }
        }
        st.mode = Mode::Closed;
        true
    }

    /// Wrap a zero-argument callback.
    pub fn wrap<F>(&self, f: F) -> impl FnOnce() + Send + 'static
    where
        F: FnOnce() + Send + 'static,
    {
        let inner = self.inner.clone();
        move || {
            if !enter(&inner) {
                return;
            }
            f();
            leave(&inner);
        }
    }

    /// Wrap a one-argument callback.
    pub fn wrap1<T, F>(&self, f: F) -> impl FnOnce(T) + Send + 'static
    where
        T: Send + 'static,
        F: FnOnce(T) + Send + 'static,
    {
        let inner = self.inner.clone();
        move |arg: T| {
            if !enter(&inner) {
                return;
            }
            f(arg);
            leave(&inner);
        }
    }

    pub fn is_active(&self) -> bool {
        self.inner
            .state
            .lock()
            .map(|st| st.mode == Mode::Active)
            .unwrap_or(false)
    }
}

fn enter(inner: &WatchInner) -> bool {
    let Ok(mut st) = inner.state.lock() else {
        return false;
    };
    if st.mode != Mode::Active {
        return false;
    }
    st.in_flight += 1;
    st.exec_thread = Some(thread::current().id());
    true
}

fn leave(inner: &WatchInner) {
    let Ok(mut st) = inner.state.lock() else {
        return;
    };
    st.in_flight -= 1;
    if st.in_flight == 0 {
        st.exec_thread = None;
    }
    let signal = st.mode == Mode::Closing;
    drop(st);
    if signal {
        inner.cv.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn closed_watch_suppresses_callbacks() {
        let watch = OpWatch::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let wrapped = watch.wrap(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert!(watch.close());
        wrapped();
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(!watch.close());
    }

    #[test]
    fn close_waits_for_in_flight_callback() {
        let watch = OpWatch::new();
        let running = Arc::new(AtomicUsize::new(0));
        let r = running.clone();
        let wrapped = watch.wrap(move || {
            r.store(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(100));
            r.store(2, Ordering::SeqCst);
        });
        let t = thread::spawn(wrapped);
        while running.load(Ordering::SeqCst) == 0 {
            thread::yield_now();
        }
        assert!(watch.close());
        // close() must not return until the callback body finished.
        assert_eq!(running.load(Ordering::SeqCst), 2);
        t.join().unwrap();
    }

    #[test]
    fn close_from_own_callback_does_not_deadlock() {
        let watch = OpWatch::new();
        let w2 = watch.clone();
        let closed = Arc::new(AtomicUsize::new(0));
        let c = closed.clone();
        let wrapped = watch.wrap(move || {
            if w2.close() {
                c.store(1, Ordering::SeqCst);
            }
        });
        wrapped();
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn wrap1_passes_argument() {
        let watch = OpWatch::new();
        let got = Arc::new(AtomicUsize::new(0));
        let g = got.clone();
        let wrapped = watch.wrap1(move |v: usize| {
            g.store(v, Ordering::SeqCst);
        });
        wrapped(7);
        assert_eq!(got.load(Ordering::SeqCst), 7);
    }
}
