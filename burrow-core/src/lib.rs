#![forbid(unsafe_code)]

//! Burrow core utilities: shared identifier types, protocol constants,
//! configuration structures, and the common error type used across the
//! workspace.

pub mod config;
pub mod consts;
pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{ConnId, NodeId};
