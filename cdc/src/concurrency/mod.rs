//! Coordination primitives shared by the workers.
//!
//! - [`shutdown`] broadcasts a single shutdown request to every worker.
//! - [`stream`] batches a stream by size and time while watching for shutdown.
//! - [`backoff`] computes retry delays.

pub mod backoff;
pub mod shutdown;
pub mod stream;
