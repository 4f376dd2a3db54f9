//! # homebus-app
//!
//! Application layer: the bus client core and **port definitions** (traits).
//!
//! ## Responsibilities
//! - Define **port traits** that adapters must implement:
//!   - `Transport`: broker session, one-way messages, request/reply, inbound fetch
//!   - `UuidStore`: load & save the persisted `internalid -> uuid` map
//! - Provide **in-process infrastructure** shared by transports:
//!   - `Correlator`: one-shot reply slots keyed by a per-connection reply id
//!   - `Inbox`: ordered inbound queue with timeout and shutdown wake-up
//! - Own the **device registry** and the **dispatcher** (command/event routing)
//! - Expose the `Connection` facade used by agents
//!
//! ## Dependency rule
//! Depends on `homebus-domain` only (plus `tokio` for channels, timers and tasks).
//! Never imports adapter crates. Adapters depend on *this* crate, not the reverse.

pub mod connection;
pub mod correlator;
pub mod dispatcher;
pub mod inbox;
pub mod ports;
pub mod registry;
