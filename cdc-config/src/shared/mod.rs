mod applier;
mod base;
mod batch;
mod connection;
mod retry;
mod service;
mod transport;
mod warehouse;

pub use applier::*;
pub use base::*;
pub use batch::*;
pub use connection::*;
pub use retry::*;
pub use service::*;
pub use transport::*;
pub use warehouse::*;
