//! # homebus-domain
//!
//! Pure domain model for the homebus control bus.
//!
//! ## Responsibilities
//! - Foundational types: typed identifiers, error conventions
//! - Define the **Envelope** (content + routing metadata) and its JSON codec
//! - Define the **Response** protocol (`result` / `error` maps) and its invariants
//! - Define **command errors** and parameter checks used by command handlers
//! - Define **devices** (`internalid` → stable `uuid`) and the persisted **uuid map**
//!
//! ## Dependency rule
//! This crate has **no internal dependencies**.
//! It must never import anything from `app`, adapters, or IO crates.
//! All IO boundaries are expressed as traits in the `app` crate (ports).

pub mod error;
pub mod id;

pub mod command;
pub mod device;
pub mod envelope;
pub mod response;
pub mod uuid_map;
