//! This module exports a minimal message-passing API, which is encapsulated
//! by a `Communicator` trait. Implementors write tagged `send`, `recv`,
//! `probe` and `try_recv` operations for a given transport layer; an
//! in-process transport over channels and a pure-Rust TCP transport are
//! included. The trait then provides default implementations for broadcast,
//! reduce, and reduce-all operations.
//!

mod backoff;
pub mod comm;
pub mod local;
pub mod mailbox;
pub mod tcp;
pub mod util;

pub use comm::{Communicator, ReduceOp, Tag};
pub use local::LocalCommunicator;
pub use tcp::{TcpCommunicator, TcpHost};
