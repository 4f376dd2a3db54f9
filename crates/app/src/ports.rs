//! Port definitions: traits that adapters implement.
//!
//! Ports are the boundaries between the bus client core and the outside world.
//! They are defined here (in `app`) so that both the core and the adapter
//! layer can depend on them without creating circular dependencies.

pub mod transport;
pub mod uuid_store;

pub use transport::{ReplyHandle, Transport, TransportMessage};
pub use uuid_store::UuidStore;
