//! Message transports delivering change records.

pub mod base;
pub mod memory;
pub mod message;
#[cfg(feature = "redis")]
pub mod redis;

pub use base::{ChangeSource, SourceMessage};
