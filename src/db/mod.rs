//! Connection handling: attributes, the shared open/close/validity
//! handle, and the periodic health checker.

pub mod checker;
pub mod connection;

pub use checker::{ConnChecker, ConnSupplier, LostConnConsumer};
pub use connection::{Conn, ConnAttrs};
