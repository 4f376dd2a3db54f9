//! Uuid store port: persistence of the `internalid -> uuid` map.

use homebus_domain::error::BusError;
use homebus_domain::uuid_map::UuidMap;

/// Loads and saves the identity map.
///
/// Calls are synchronous: the registry rewrites the map while holding its
/// lock so that a reported mapping is always a persisted one.
pub trait UuidStore: Send + Sync {
    /// Read the persisted map. A missing store is an empty map.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Storage`] when the store exists but cannot be read.
    fn load(&self) -> Result<UuidMap, BusError>;

    /// Replace the persisted map with `map`, atomically.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Storage`] when the map could not be written.
    fn save(&self, map: &UuidMap) -> Result<(), BusError>;
}

impl<S: UuidStore> UuidStore for std::sync::Arc<S> {
    fn load(&self) -> Result<UuidMap, BusError> {
        (**self).load()
    }

    fn save(&self, map: &UuidMap) -> Result<(), BusError> {
        (**self).save(map)
    }
}
