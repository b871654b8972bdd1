//! Shared helpers for binaries and backend I/O.

pub mod bootstrap;
pub mod retry;
