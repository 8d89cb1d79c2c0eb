//! The cradle shim: one process per container init (and per exec),
//! standing in for the container process on the host.
//!
//! The engine treats the shim's pid as the container's init pid: its stdio
//! is the container's stdio, signals sent to it are forwarded into the
//! guest, and its exit status is the container process's exit status.

pub mod bridge;
pub mod error;
pub mod handoff;
pub mod signals;

pub use error::ShimError;
