//! Stages applying change records to the warehouse.
//!
//! Records are routed by the [`demux`] into one branch per table. Within a branch the
//! [`appender`] persists records to the changelog while the [`scheduler`] periodically triggers
//! the [`merger`], which folds new changelog entries into the replica.

pub mod appender;
pub mod demux;
pub mod merger;
pub mod scheduler;
