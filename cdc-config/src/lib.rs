//! Configuration management for the change applier.
//!
//! Provides environment detection, layered configuration loading, and the shared
//! configuration types consumed by the engine and the service binary.

mod environment;
mod load;
pub mod shared;

pub use environment::*;
pub use load::*;
