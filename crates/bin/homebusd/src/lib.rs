//! # homebusd
//!
//! Library half of the daemon: configuration, transport selection and the
//! `eventcontroller` agent. `main.rs` only wires them together, which keeps
//! everything here reachable from the end-to-end tests.

pub mod config;
pub mod controller;
pub mod transport;
