//! Long running tasks of a pipeline.
//!
//! One demux worker runs per transport source. Table workers are spawned lazily into the
//! [`pool::TableWorkerPool`], one per table observed by any demux worker.

pub mod base;
pub mod demux;
pub mod policy;
pub mod pool;
pub mod table;
