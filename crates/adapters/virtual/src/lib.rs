//! # homebus-adapter-virtual
//!
//! In-process bus: a [`VirtualBus`] plays the broker, and every
//! [`VirtualBus::connect`] call yields one [`VirtualTransport`] that
//! implements the full [`Transport`](homebus_app::ports::Transport) contract.
//!
//! ## Behaviour
//!
//! | Operation | Effect |
//! |-----------|--------|
//! | `send_message` | Delivered to every started connection, the sender included |
//! | `send_request` | Same fan-out, with a reply address in the sender's namespace |
//! | reply | Routed to the connection whose namespace prefixes the address |
//! | `shutdown` | Detaches the connection and resolves its pending requests |
//!
//! Payloads go through the wire codec on every publish, so handlers see the
//! same content a broker-backed agent would.
//!
//! ## Dependency rule
//!
//! Depends on `homebus-app` (port traits) and `homebus-domain` only.

mod bus;

pub use bus::{VirtualBus, VirtualTransport};
