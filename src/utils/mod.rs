//! Pure utility functions.
//!
//! Process bootstrap and retry helpers shared by the bus and the binary.

pub mod bootstrap;
pub mod retry;
