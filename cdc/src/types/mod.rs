//! Value types shared by every stage of change application.

mod cell;
mod changelog;
mod record;
mod replica;
mod table;

pub use cell::*;
pub use changelog::*;
pub use record::*;
pub use replica::*;
pub use table::*;
