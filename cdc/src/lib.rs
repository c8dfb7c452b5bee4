//! Change-data-capture application engine.
//!
//! Change records flow from a [`transport::ChangeSource`] through the stream demultiplexer into one
//! branch per table. Each branch appends records to an append-only changelog and periodically
//! folds the unmerged tail of that changelog into a replica table, keeping the latest version of
//! every primary key by ordering token.
//!
//! The [`pipeline::Pipeline`] wires everything together:
//!
//! ```ignore
//! let warehouse = MemoryWarehouse::new();
//! let (source, publisher) = MemoryChangeSource::new("orders");
//!
//! let mut pipeline = Pipeline::new(config, warehouse)?;
//! pipeline.start(vec![source]).await?;
//! pipeline.wait().await?;
//! ```

pub mod concurrency;
pub mod descriptor;
pub mod error;
pub mod failpoints;
mod macros;
pub mod metrics;
pub mod pipeline;
pub mod replication;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod transport;
pub mod types;
pub mod warehouse;
pub mod workers;
