//! Protocol-wide constants.

use std::time::Duration;

/// Length of the opaque per-stream tag that prefixes every engine datagram.
/// The first two bytes mirror the peer's actual UDP source port by engine
/// convention; the remainder is random.
pub const TAG_LEN: usize = 16;

/// 4-byte magic datagram used to punch NAT holes.
pub const SUPPORT_PING: [u8; 4] = [0xAA, 0xBB, 0xCC, 0xDD];

/// 4-byte magic used for the final confirmation pings of a symmetric
/// rendezvous.
pub const SUPPORT_PING_FINAL: [u8; 4] = [0xAA, 0xBB, 0xCC, 0xEE];

/// Per-direction stream buffering (engine receive window and handle ring).
pub const STREAM_BUFF_SIZE: usize = 208 * 1024;

/// Reliable-stream engine housekeeping tick.
pub const ENGINE_TICK: Duration = Duration::from_millis(500);

/// Outer watchdog for one rendezvous session.
pub const RENDEZVOUS_TIMEOUT: Duration = Duration::from_secs(18);

/// Grace period between a port's release and its next eligibility.
pub const DEFAULT_DECAY: Duration = Duration::from_secs(30);

/// Default TCP (and UDP observation) port of the rendezvous server.
pub const DEFAULT_MASTER_PORT: u16 = 2345;

/// Candidate ports probed per symmetric-acceptor window.
pub const SYMM_WINDOW: u16 = 601;

/// First candidate port of the symmetric sweep.
pub const SYMM_BASE_PORT: u16 = 1024;

/// Listening sockets opened by the symmetric connector pool.
pub const SYMM_CONN_SOCKETS: usize = 100;

/// TTL ramp of the fast-session hole punch: start, exclusive end, step delay.
pub const PUNCH_TTL_START: u32 = 2;
pub const PUNCH_TTL_END: u32 = 65;
pub const PUNCH_STEP: Duration = Duration::from_millis(25);

/// Extra fast-session rounds after the first failed one.
pub const PUNCH_MAX_STEPS: u32 = 2;

/// Transport release grace once the last stream handle on a port is gone.
pub const TRANSPORT_LINGER_ABORT: Duration = Duration::from_millis(250);
pub const TRANSPORT_LINGER_GRACEFUL: Duration = Duration::from_secs(1);
