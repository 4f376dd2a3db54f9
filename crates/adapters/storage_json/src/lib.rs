//! # homebus-adapter-storage-json
//!
//! Persists the `internalid -> uuid` map as a flat JSON object.
//!
//! ## Responsibilities
//! - Implement the `UuidStore` port defined in `homebus-app::ports`
//! - Rewrite the file atomically (temporary file, fsync, rename)
//! - Set aside unreadable files instead of overwriting them
//!
//! ## Dependency rule
//! Depends on `homebus-app` (for port traits) and `homebus-domain` (for domain types).
//! The `app` and `domain` crates must never reference this adapter.

mod error;
mod store;

pub use error::StorageError;
pub use store::JsonUuidStore;
