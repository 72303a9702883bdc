//! RStudio Desktop Launcher Library
//!
//! Core components for launching per-user RStudio Server instances on a shared
//! host: the port allocator and the server launch step that consumes its result.

pub mod launch;
pub mod ports;
