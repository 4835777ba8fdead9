//! Port-identifier leases for hole punching.
//!
//! Two lease classes share one arena of port slots: Symm (class 0) for
//! symmetric sweeps and Fast (class 1) for non-symmetric punches, each with
//! its own quota and FIFO waitlist. A released slot decays for a grace
//! period before it becomes eligible again, so a just-punched hole is never
//! immediately reused. Reservation scan order is `(decay ASC, id ASC)`.

use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use burrow_transport::opwatch::OpWatch;
use burrow_transport::reactor::ReactorHandle;
use tracing::{trace, warn};

pub type PortId = u32;

pub const CLASS_SYMM: usize = 0;
pub const CLASS_FAST: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PortStatus {
    Free,
    ReservedSymm,
    ReservedFast,
}

impl PortStatus {
    fn class(self) -> Option<usize> {
        match self {
            PortStatus::Free => None,
            PortStatus::ReservedSymm => Some(CLASS_SYMM),
            PortStatus::ReservedFast => Some(CLASS_FAST),
        }
    }
}

/// Eligibility of a slot: `Ready` sorts first, decaying slots by deadline,
/// in-use slots (`Never`) last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Decay {
    Ready,
    At(Instant),
    Never,
}

struct PortSlot {
    status: PortStatus,
    decay: Decay,
}

type ReserveCallback = Box<dyn FnOnce() + Send + 'static>;

struct Request {
    num_ports: u32,
    reservation: Weak<PortReservation>,
    callback: ReserveCallback,
}

struct AllocState {
    num_ports: [u32; 2],
    reserved: [u32; 2],
    slots: Vec<PortSlot>,
    /// Scan order for reservation.
    order: BTreeSet<(Decay, PortId)>,
    requests: [VecDeque<Request>; 2],
    decay_running: bool,
}

impl AllocState {
    fn move_decay(&mut self, id: PortId, decay: Decay) {
        let old = self.slots[id as usize].decay;
        self.order.remove(&(old, id));
        self.slots[id as usize].decay = decay;
        self.order.insert((decay, id));
    }

    /// Reserve up to `n` eligible free slots for `class`; all-or-nothing.
    fn reserve_slots(&mut self, n: u32, class: usize) -> Vec<PortId> {
        let now = Instant::now();
        let mut taken = Vec::new();
        for &(decay, id) in self.order.iter() {
            if taken.len() as u32 == n {
                break;
            }
            match decay {
                Decay::Ready => {}
                Decay::At(t) if t <= now => {}
                // Ordered set: everything from here on is still decaying or
                // in use.
                _ => break,
            }
            if self.slots[id as usize].status == PortStatus::Free {
                taken.push(id);
            }
        }
        if taken.len() as u32 != n {
            return Vec::new();
        }
        for &id in &taken {
            self.slots[id as usize].status = if class == CLASS_SYMM {
                PortStatus::ReservedSymm
            } else {
                PortStatus::ReservedFast
            };
            self.move_decay(id, Decay::Never);
        }
        self.reserved[class] += n;
        debug_assert!(self.reserved[class] <= self.num_ports[class]);
        taken
    }
}

/// Hands out port leases; owns the decay timers via the reactor.
pub struct PortAllocator {
    reactor: ReactorHandle,
    decay: Duration,
    state: Mutex<AllocState>,
    watch: OpWatch,
}

impl PortAllocator {
    pub fn new(
        reactor: ReactorHandle,
        num_symm_ports: u32,
        num_fast_ports: u32,
        decay: Duration,
    ) -> Arc<Self> {
        let total = num_symm_ports + num_fast_ports;
        let mut order = BTreeSet::new();
        let mut slots = Vec::with_capacity(total as usize);
        for id in 0..total {
            slots.push(PortSlot {
                status: PortStatus::Free,
                decay: Decay::Ready,
            });
            order.insert((Decay::Ready, id));
        }
        Arc::new(Self {
            reactor,
            decay,
            state: Mutex::new(AllocState {
                num_ports: [num_symm_ports, num_fast_ports],
                reserved: [0, 0],
                slots,
                order,
                requests: [VecDeque::new(), VecDeque::new()],
                decay_running: false,
            }),
            watch: OpWatch::new(),
        })
    }

    /// Stop timers. Outstanding reservations can still be dropped safely.
    pub fn shutdown(&self) {
        self.watch.close();
    }

    pub fn reserve_symm_ports(self: &Arc<Self>, n: u32) -> Option<Arc<PortReservation>> {
        self.reserve_now(n, CLASS_SYMM)
    }

    pub fn reserve_fast_ports(self: &Arc<Self>, n: u32) -> Option<Arc<PortReservation>> {
        self.reserve_now(n, CLASS_FAST)
    }

    /// Queue a reservation that completes through `callback` once capacity
    /// (including decayed slots) becomes available. Dropping the returned
    /// reservation before the callback fired cancels the queue entry.
    pub fn reserve_symm_ports_best_effort<F>(self: &Arc<Self>, n: u32, callback: F) -> Arc<PortReservation>
    where
        F: FnOnce() + Send + 'static,
    {
        self.reserve_deferred(n, CLASS_SYMM, Box::new(callback))
    }

    pub fn reserve_fast_ports_best_effort<F>(self: &Arc<Self>, n: u32, callback: F) -> Arc<PortReservation>
    where
        F: FnOnce() + Send + 'static,
    {
        self.reserve_deferred(n, CLASS_FAST, Box::new(callback))
    }

    /// (reserved symm, reserved fast) — test and diagnostics hook.
    pub fn reserved_counts(&self) -> (u32, u32) {
        self.state
            .lock()
            .map(|st| (st.reserved[CLASS_SYMM], st.reserved[CLASS_FAST]))
            .unwrap_or((0, 0))
    }

    fn reserve_now(self: &Arc<Self>, n: u32, class: usize) -> Option<Arc<PortReservation>> {
        if n == 0 {
            return None;
        }
        let Ok(mut st) = self.state.lock() else {
            return None;
        };
        if n > st.num_ports[class] - st.reserved[class] {
            return None;
        }
        let ports = st.reserve_slots(n, class);
        if ports.is_empty() {
            return None;
        }
        Some(Arc::new(PortReservation {
            alloc: self.clone(),
            ports: Mutex::new(ports),
        }))
    }

    fn reserve_deferred(
        self: &Arc<Self>,
        n: u32,
        class: usize,
        callback: ReserveCallback,
    ) -> Arc<PortReservation> {
        let res = Arc::new(PortReservation {
            alloc: self.clone(),
            ports: Mutex::new(Vec::new()),
        });
        if let Ok(mut st) = self.state.lock() {
            st.requests[class].push_back(Request {
                num_ports: n,
                reservation: Arc::downgrade(&res),
                callback,
            });
        }
        let this = self.clone();
        self.reactor
            .post(self.watch.wrap(move || this.process_requests()), Duration::ZERO);
        res
    }

    /// Mark every port of `reservation` as used: its hole was punched now,
    /// so after release it must decay before reuse.
    fn use_reservation(self: &Arc<Self>, ports: &[PortId]) {
        let deadline = Instant::now() + self.decay;
        let start_decay = {
            let Ok(mut st) = self.state.lock() else {
                return;
            };
            for &id in ports {
                st.move_decay(id, Decay::At(deadline));
            }
            !std::mem::replace(&mut st.decay_running, true)
        };
        if start_decay {
            self.arm_decay(self.decay + Duration::from_millis(1));
        }
    }

    /// Keep only the first port of the reservation (in use indefinitely);
    /// the rest return to the pool in decaying state. Models "probe many,
    /// keep one".
    fn keepalive_reservation(self: &Arc<Self>, ports: &[PortId]) {
        let mut start_decay = false;
        {
            let Ok(mut st) = self.state.lock() else {
                return;
            };
            let Some(&kept) = ports.first() else {
                return;
            };
            let class = match st.slots[kept as usize].status.class() {
                Some(c) => c,
                None => {
                    warn!("keepalive on a free reservation");
                    return;
                }
            };
            let deadline = Instant::now() + self.decay;
            for &id in ports.iter().skip(1) {
                st.slots[id as usize].status = PortStatus::Free;
                st.move_decay(id, Decay::At(deadline));
            }
            st.reserved[class] -= ports.len() as u32 - 1;
            st.move_decay(kept, Decay::Never);
            if ports.len() > 1 && !st.decay_running {
                st.decay_running = true;
                start_decay = true;
            }
        }
        if start_decay {
            self.arm_decay(self.decay + Duration::from_millis(1));
        }
        let this = self.clone();
        self.reactor
            .post(self.watch.wrap(move || this.process_requests()), Duration::ZERO);
    }

    /// Release a reservation: free every port (scheduling decay for ports
    /// that were in use) or, for an unfilled queued reservation, excise the
    /// waitlist entry.
    fn free_reservation(self: &Arc<Self>, reservation: &PortReservation, ports: Vec<PortId>) {
        let mut start_decay = false;
        {
            let Ok(mut st) = self.state.lock() else {
                return;
            };
            if ports.is_empty() {
                for class in [CLASS_SYMM, CLASS_FAST] {
                    if let Some(pos) = st.requests[class]
                        .iter()
                        .position(|r| r.reservation.as_ptr() == reservation as *const _)
                    {
                        st.requests[class].remove(pos);
                        trace!("cancelled queued reservation (class {class})");
                        return;
                    }
                }
                return;
            }
            let deadline = Instant::now() + self.decay;
            let mut class = CLASS_FAST;
            for &id in &ports {
                if let Some(c) = st.slots[id as usize].status.class() {
                    class = c;
                }
                st.slots[id as usize].status = PortStatus::Free;
                st.move_decay(id, Decay::At(deadline));
                start_decay = true;
            }
            st.reserved[class] = st.reserved[class].saturating_sub(ports.len() as u32);
            if start_decay {
                if st.decay_running {
                    start_decay = false;
                } else {
                    st.decay_running = true;
                }
            }
        }
        let this = self.clone();
        self.reactor
            .post(self.watch.wrap(move || this.process_requests()), Duration::ZERO);
        if start_decay {
            self.arm_decay(self.decay + Duration::from_millis(1));
        }
    }

    fn arm_decay(self: &Arc<Self>, delay: Duration) {
        let this = self.clone();
        self.reactor
            .post(self.watch.wrap(move || this.on_decay_timeout()), delay);
    }

    fn on_decay_timeout(self: &Arc<Self>) {
        self.process_requests();
        let next = {
            let Ok(mut st) = self.state.lock() else {
                return;
            };
            st.decay_running = false;
            let now = Instant::now();
            let mut next = None;
            for &(decay, _) in st.order.iter() {
                if let Decay::At(t) = decay {
                    if t > now {
                        next = Some(t - now + Duration::from_millis(1));
                        break;
                    }
                }
            }
            if next.is_some() {
                st.decay_running = true;
            }
            next
        };
        if let Some(delay) = next {
            self.arm_decay(delay);
        }
    }

    /// Satisfy queued requests in FIFO order per class; callbacks run after
    /// the lock is released.
    fn process_requests(self: &Arc<Self>) {
        let mut fired: Vec<ReserveCallback> = Vec::new();
        {
            let Ok(mut st) = self.state.lock() else {
                return;
            };
            for class in [CLASS_SYMM, CLASS_FAST] {
                loop {
                    let Some(req) = st.requests[class].front() else {
                        break;
                    };
                    // A dead reservation means the caller lost interest but
                    // dropped between fill and excision; just discard.
                    let Some(res) = req.reservation.upgrade() else {
                        st.requests[class].pop_front();
                        continue;
                    };
                    if req.num_ports > st.num_ports[class] - st.reserved[class] {
                        break;
                    }
                    let n = req.num_ports;
                    let ports = st.reserve_slots(n, class);
                    if ports.is_empty() {
                        break;
                    }
                    if let Ok(mut p) = res.ports.lock() {
                        *p = ports;
                    }
                    if let Some(req) = st.requests[class].pop_front() {
                        fired.push(req.callback);
                    }
                }
            }
        }
        for cb in fired {
            cb();
        }
    }
}

/// A live lease on one or more port slots. Dropping it returns the slots to
/// the pool (or cancels the queued request).
pub struct PortReservation {
    alloc: Arc<PortAllocator>,
    ports: Mutex<Vec<PortId>>,
}

impl PortReservation {
    pub fn ports(&self) -> Vec<PortId> {
        self.ports.lock().map(|p| p.clone()).unwrap_or_default()
    }

    pub fn is_filled(&self) -> bool {
        !self.ports().is_empty()
    }

    /// The lease's holes were punched now; start their reuse grace clock.
    pub fn use_now(&self) {
        let ports = self.ports();
        if !ports.is_empty() {
            self.alloc.use_reservation(&ports);
        }
    }

    /// Keep the first port, free the rest.
    pub fn keepalive(&self) {
        let ports = self.ports();
        if ports.is_empty() {
            return;
        }
        self.alloc.keepalive_reservation(&ports);
        if let Ok(mut p) = self.ports.lock() {
            p.truncate(1);
        }
    }

    /// Explicit release; also runs on drop.
    pub fn free(&self) {
        let ports = match self.ports.lock() {
            Ok(mut p) => std::mem::take(&mut *p),
            Err(_) => Vec::new(),
        };
        self.alloc.free_reservation(self, ports);
    }
}

impl Drop for PortReservation {
    fn drop(&mut self) {
        self.free();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burrow_transport::reactor::Reactor;
    use std::sync::mpsc;

    fn reactor() -> burrow_transport::reactor::ReactorThread {
        Reactor::new().unwrap().spawn_thread()
    }

    #[test]
    fn zero_pools_always_fail() {
        let rt = reactor();
        let alloc = PortAllocator::new(rt.handle(), 0, 0, Duration::from_secs(30));
        assert!(alloc.reserve_symm_ports(1).is_none());
        assert!(alloc.reserve_fast_ports(1).is_none());
        alloc.shutdown();
    }

    #[test]
    fn quota_is_per_class() {
        let rt = reactor();
        let alloc = PortAllocator::new(rt.handle(), 1, 2, Duration::from_secs(30));
        let fast = alloc.reserve_fast_ports(2).unwrap();
        assert_eq!(fast.ports().len(), 2);
        assert!(alloc.reserve_fast_ports(1).is_none());
        // The symm quota is untouched.
        let symm = alloc.reserve_symm_ports(1).unwrap();
        assert_eq!(alloc.reserved_counts(), (1, 2));
        drop(symm);
        drop(fast);
        alloc.shutdown();
    }

    #[test]
    fn freed_port_decays_before_reuse() {
        let rt = reactor();
        let alloc = PortAllocator::new(rt.handle(), 0, 1, Duration::from_millis(100));
        let res = alloc.reserve_fast_ports(1).unwrap();
        res.free();
        // Nominal capacity is back, but the slot is still decaying.
        assert!(alloc.reserve_fast_ports(1).is_none());
        std::thread::sleep(Duration::from_millis(250));
        assert!(alloc.reserve_fast_ports(1).is_some());
        alloc.shutdown();
    }

    #[test]
    fn waitlist_fires_after_decay() {
        let rt = reactor();
        let alloc = PortAllocator::new(rt.handle(), 0, 1, Duration::from_millis(100));
        let res = alloc.reserve_fast_ports(1).unwrap();
        res.use_now();
        res.free();
        let (tx, rx) = mpsc::channel();
        let started = Instant::now();
        let queued = alloc.reserve_fast_ports_best_effort(1, move || {
            let _ = tx.send(Instant::now());
        });
        let fired_at = rx.recv_timeout(Duration::from_secs(2)).expect("callback");
        assert!(fired_at.duration_since(started) >= Duration::from_millis(80));
        assert!(queued.is_filled());
        alloc.shutdown();
    }

    #[test]
    fn dropping_queued_reservation_cancels_it() {
        let rt = reactor();
        let alloc = PortAllocator::new(rt.handle(), 0, 1, Duration::from_millis(50));
        let held = alloc.reserve_fast_ports(1).unwrap();
        let (tx, rx) = mpsc::channel();
        let queued = alloc.reserve_fast_ports_best_effort(1, move || {
            let _ = tx.send(());
        });
        drop(queued);
        drop(held);
        assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());
        alloc.shutdown();
    }

    #[test]
    fn keepalive_keeps_first_and_frees_rest() {
        let rt = reactor();
        let alloc = PortAllocator::new(rt.handle(), 0, 4, Duration::from_millis(50));
        let res = alloc.reserve_fast_ports(3).unwrap();
        let all = res.ports();
        res.keepalive();
        assert_eq!(res.ports(), vec![all[0]]);
        assert_eq!(alloc.reserved_counts(), (0, 1));
        // The freed pair is decaying; only one untouched slot remains.
        assert!(alloc.reserve_fast_ports(3).is_none());
        std::thread::sleep(Duration::from_millis(150));
        assert!(alloc.reserve_fast_ports(3).is_some());
        alloc.shutdown();
    }
}
