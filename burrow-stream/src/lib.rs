#![forbid(unsafe_code)]

//! Burrow reliable stream layer.
//!
//! Many logical streams share one UDP socket: every datagram is prefixed
//! with a 16-byte connection tag, the [`StreamManager`] routes inbound
//! datagrams by tag, and the sans-IO [`engine`] turns them into ordered,
//! loss-free byte streams. Stream endpoints expose the same handle contract
//! as the kernel plane; [`sum`] unifies the two variants.

pub mod engine;
pub mod handle;
pub mod manager;
pub mod sum;

pub use engine::{Engine, EngineEvent, SockId, Tag};
pub use handle::{StreamAcceptor, StreamConnection, StreamConnector, StreamHandle};
pub use manager::StreamManager;
pub use sum::{AnyAcceptor, AnyConnection, AnyConnector, AnyHandle};
