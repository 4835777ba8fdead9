#![forbid(unsafe_code)]

//! Burrow transport layer.
//!
//! * A reactor: one dedicated thread drives all socket I/O, timers, and
//!   completion callbacks for the process.
//! * The kernel socket handle family (`KernelHandle`, [`Connection`],
//!   [`Connector`], [`Acceptor`]) exposing the queue-driven operation
//!   vocabulary shared with the stream plane.
//! * [`OpWatch`], the cancellation guard every stateful callback routes
//!   through.
//! * Sans-IO MTU discovery.

pub mod acceptor;
pub mod conn;
pub mod connector;
pub mod handle;
pub mod mtu;
pub mod opwatch;
pub mod reactor;

pub use acceptor::Acceptor;
pub use conn::{Connection, Datagram, ReadMode};
pub use connector::Connector;
pub use handle::{KernelHandle, SocketKind};
pub use mtu::MtuDiscovery;
pub use opwatch::OpWatch;
pub use reactor::{Reactor, ReactorHandle};
