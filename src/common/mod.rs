//! Common utilities and types

pub mod deadline;
pub mod error;
pub mod net;
pub mod socks;
pub mod trojan;

pub use deadline::with_deadline;
pub use error::{Error, IoContext, Result};
pub use net::{Address, Destination, Network};
