//! Logging and metrics setup shared by the change applier binaries and tests.

pub mod metrics;
pub mod tracing;
