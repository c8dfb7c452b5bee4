//! Helpers for testing pipelines against in-memory transports and warehouses.
//!
//! - [`record`] builds change records, bindings, and transport payloads.
//! - [`pipeline`] builds test configurations and pipelines.
//! - [`test_warehouse_wrapper`] wraps a warehouse to observe its activity and inject faults.
//! - [`notify`] waits on conditions with a timeout so broken tests fail instead of hanging.
//! - [`failpoints`] scopes fail point configuration to a test.

pub mod failpoints;
pub mod notify;
pub mod pipeline;
pub mod record;
pub mod test_warehouse_wrapper;
