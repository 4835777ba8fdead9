//! Path-MTU discovery over an established tunnel.
//!
//! Binary search between a floor and a ceiling: each candidate size is
//! probed up to six times at the tick interval; a matching reply raises the
//! floor, six straight timeouts lower the ceiling to one below the
//! candidate. Probes carry a caller-supplied transport header plus a
//! monotonically increasing index, so delayed replies are ignored. The
//! search converges once the window is 16 bytes or narrower.
//!
//! Sans-IO: the owner pumps [`MtuDiscovery::on_tick`] from a reactor timer
//! and feeds inbound payloads to [`MtuDiscovery::make_reply`] /
//! [`MtuDiscovery::on_probe_reply`].

use bytes::{BufMut, Bytes, BytesMut};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Delay before the first probe, letting the tunnel settle.
pub const MTU_START_DELAY: Duration = Duration::from_secs(3);
/// Interval between probe attempts.
pub const MTU_TICK: Duration = Duration::from_millis(500);

const NUM_TRIES: u32 = 6;
const CONVERGED_WINDOW: i32 = 16;
const PROBE_INDEX_LEN: usize = 4;
const PAD_BYTE: u8 = 0xAA;

pub enum TickAction {
    /// Send this probe datagram to the peer.
    Probe(Bytes),
    /// Search converged on this MTU; stop ticking.
    Done(u16),
    /// Converged earlier; nothing to do.
    Idle,
}

pub struct MtuDiscovery {
    probe_header: Bytes,
    reply_header: Bytes,
    min: i32,
    max: i32,
    cur: i32,
    cur_index: u32,
    cur_try: u32,
}

impl MtuDiscovery {
    /// `probe_header`/`reply_header` are the transport framings the peer's
    /// demultiplexer routes on; the index and padding follow them.
    pub fn new(probe_header: Bytes, reply_header: Bytes, min_mtu: u16, max_mtu: u16) -> Self {
        Self {
            probe_header,
            reply_header,
            min: min_mtu as i32,
            max: max_mtu as i32,
            cur: min_mtu as i32,
            cur_index: 0,
            cur_try: 0,
        }
    }

    /// The established floor so far.
    pub fn current_mtu(&self) -> u16 {
        self.min as u16
    }

    pub fn is_converged(&self) -> bool {
        self.max - self.min <= CONVERGED_WINDOW
    }

    /// One timer tick: account a timeout for the outstanding probe and emit
    /// the next one, unless the search converged.
    pub fn on_tick(&mut self) -> TickAction {
        if self.cur_try >= NUM_TRIES {
            self.cur_try = 0;
            self.cur_index += 1;
            self.max = self.cur - 1;
            self.cur = (self.min + self.max) / 2;
            if self.is_converged() {
                debug!("mtu search done after timeouts, mtu={}", self.min);
                return TickAction::Done(self.min as u16);
            }
            trace!(
                "mtu probe timed out, window now [{}, {}], next {}",
                self.min,
                self.max,
                self.cur
            );
        } else if self.is_converged() {
            return TickAction::Idle;
        }

        self.cur_try += 1;

        let size = self.cur as usize;
        let mut buf = BytesMut::with_capacity(size);
        buf.extend_from_slice(&self.probe_header);
        buf.put_u32_le(self.cur_index);
        buf.resize(size, PAD_BYTE);
        TickAction::Probe(buf.freeze())
    }

    /// Build the reply for a peer's probe payload (transport header already
    /// stripped). Returns `None` for runts.
    pub fn make_reply(&self, payload: &[u8]) -> Option<Bytes> {
        if payload.len() < PROBE_INDEX_LEN {
            warn!("mtu probe too short: {} bytes", payload.len());
            return None;
        }
        let mut buf = BytesMut::with_capacity(self.reply_header.len() + PROBE_INDEX_LEN);
        buf.extend_from_slice(&self.reply_header);
        buf.extend_from_slice(&payload[..PROBE_INDEX_LEN]);
        Some(buf.freeze())
    }

    /// Process a probe reply payload (transport header already stripped).
    /// Returns the new MTU floor when the reply matched the outstanding
    /// probe.
    pub fn on_probe_reply(&mut self, payload: &[u8]) -> Option<u16> {
        if payload.len() != PROBE_INDEX_LEN {
            warn!("mtu probe reply has bad length: {} bytes", payload.len());
            return None;
        }
        let index = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
        if index != self.cur_index {
            // Delayed reply for an older candidate size.
            return None;
        }
        self.cur_try = 0;
        self.cur_index += 1;
        self.min = self.cur;
        self.cur = (self.min + self.max) / 2;
        if self.is_converged() {
            debug!("mtu search done, mtu={}", self.min);
        }
        Some(self.min as u16)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Run the search against a simulated path that silently drops probes
    /// larger than `path_mtu`. Returns (reported mtu, size attempts).
    fn simulate(min: u16, max: u16, path_mtu: usize) -> (u16, u32) {
        let mut d = MtuDiscovery::new(
            Bytes::from_static(b"ph"),
            Bytes::from_static(b"rh"),
            min,
            max,
        );
        let mut sizes_tried = 0;
        let mut last_size = 0usize;
        for _ in 0..1000 {
            match d.on_tick() {
                TickAction::Probe(p) => {
                    if p.len() != last_size {
                        last_size = p.len();
                        sizes_tried += 1;
                    }
                    if p.len() <= path_mtu {
                        let reply = d.make_reply(&p[2..]).unwrap();
                        d.on_probe_reply(&reply[2..]);
                    }
                }
                TickAction::Done(mtu) => return (mtu, sizes_tried),
                TickAction::Idle => return (d.current_mtu(), sizes_tried),
            }
        }
        (d.current_mtu(), sizes_tried)
    }

    #[test]
    fn converges_near_path_mtu() {
        let (mtu, rounds) = simulate(1200, 1500, 1430);
        // Window at convergence is at most 16 wide and brackets the path.
        assert!(mtu as usize <= 1430, "floor {mtu} above path mtu");
        assert!(mtu as usize + 16 >= 1430, "floor {mtu} too far below path");
        assert!((1421..=1437).contains(&mtu), "floor {mtu} outside window");
        assert!(rounds <= 18, "took {rounds} size rounds");
    }

    #[test]
    fn all_probes_lost_collapses_to_floor() {
        let (mtu, _) = simulate(1200, 1500, 0);
        assert_eq!(mtu, 1200);
    }

    #[test]
    fn unconstrained_path_reaches_ceiling_window() {
        let (mtu, _) = simulate(1200, 1500, 10_000);
        assert!(mtu as i32 >= 1500 - 16);
    }

    #[test]
    fn stale_reply_is_ignored() {
        let mut d = MtuDiscovery::new(Bytes::new(), Bytes::new(), 1200, 1500);
        let TickAction::Probe(_) = d.on_tick() else {
            panic!("expected probe");
        };
        // Reply for a made-up old index.
        assert!(d.on_probe_reply(&99u32.to_le_bytes()).is_none());
        assert_eq!(d.current_mtu(), 1200);
    }

    #[test]
    fn probe_carries_header_index_and_padding() {
        let mut d = MtuDiscovery::new(Bytes::from_static(b"HDR"), Bytes::new(), 100, 200);
        let TickAction::Probe(p) = d.on_tick() else {
            panic!("expected probe");
        };
        assert_eq!(p.len(), 100);
        assert_eq!(&p[..3], b"HDR");
        assert_eq!(&p[3..7], &0u32.to_le_bytes());
        assert!(p[7..].iter().all(|&b| b == PAD_BYTE));
    }
}
