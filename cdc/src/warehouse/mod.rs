//! Warehouse sinks holding changelogs, replicas, and merge cursors.

pub mod base;
#[cfg(feature = "bigquery")]
pub mod bigquery;
pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use base::{ChangelogStore, ReplicaStore, Warehouse};
