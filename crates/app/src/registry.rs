//! Device registry: the devices this agent exposes and their stable uuids.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use homebus_domain::device::{DeviceEntry, NewDevice, UuidAssignment};
use homebus_domain::envelope::Content;
use homebus_domain::error::BusError;
use homebus_domain::id::new_device_uuid;
use homebus_domain::uuid_map::UuidMap;

use crate::ports::UuidStore;

#[derive(Default)]
struct RegistryState {
    devices: HashMap<String, DeviceEntry>,
    uuids: UuidMap,
}

/// Registered devices plus the persisted identity map.
///
/// Lookups only resolve devices that are currently registered. The identity
/// map outlives registrations so a device re-added after a restart or a
/// removal gets its old uuid back.
pub struct DeviceRegistry<S> {
    store: S,
    state: Mutex<RegistryState>,
}

impl<S: UuidStore> DeviceRegistry<S> {
    /// Create a registry and merge the persisted map into it.
    pub fn new(store: S) -> Self {
        let registry = Self {
            store,
            state: Mutex::new(RegistryState::default()),
        };
        registry.reload();
        registry
    }

    /// Merge the persisted map into memory. Mappings are never dropped.
    pub fn reload(&self) -> usize {
        match self.store.load() {
            Ok(persisted) => {
                let added = self.lock().uuids.merge(&persisted);
                tracing::debug!(added, "loaded uuid map");
                added
            }
            Err(err) => {
                tracing::warn!(error = %err, "unable to load uuid map, starting empty");
                0
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist(&self, uuids: &UuidMap) {
        if let Err(err) = self.store.save(uuids) {
            tracing::warn!(error = %err, "unable to persist uuid map, keeping it in memory");
        }
    }

    /// Register a device, reusing its persisted uuid when there is one.
    ///
    /// Re-adding a registered device refreshes its type and name and clears
    /// its stale flag.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Validation`] for an invalid request and
    /// [`BusError::UuidMap`] when the chosen uuid already belongs to another
    /// device.
    #[tracing::instrument(skip(self, device), fields(internal_id = %device.internal_id))]
    pub fn add(&self, device: NewDevice) -> Result<DeviceEntry, BusError> {
        device.validate()?;
        let mut state = self.lock();

        let uuid = if let Some(uuid) = state.uuids.get_uuid(&device.internal_id) {
            uuid.to_string()
        } else {
            let uuid = match device.assignment {
                UuidAssignment::Generate => new_device_uuid(),
                UuidAssignment::UseInternalId => device.internal_id.clone(),
            };
            state.uuids.assign(device.internal_id.clone(), uuid.clone())?;
            self.persist(&state.uuids);
            tracing::debug!(%uuid, "assigned new uuid");
            uuid
        };

        let entry = DeviceEntry {
            internal_id: device.internal_id,
            uuid,
            device_type: device.device_type,
            stale: false,
            initial_name: device.initial_name,
            stale_since: None,
        };
        state
            .devices
            .insert(entry.internal_id.clone(), entry.clone());
        Ok(entry)
    }

    /// Unregister a device. Its persisted uuid is kept.
    #[tracing::instrument(skip(self))]
    pub fn remove(&self, internal_id: &str) -> Option<DeviceEntry> {
        self.lock().devices.remove(internal_id)
    }

    /// Unregister a device and erase its persisted uuid.
    #[tracing::instrument(skip(self))]
    pub fn purge(&self, internal_id: &str) -> Option<String> {
        let mut state = self.lock();
        let entry = state.devices.remove(internal_id);
        let uuid = state.uuids.remove(internal_id);
        if uuid.is_some() {
            self.persist(&state.uuids);
        }
        uuid.or(entry.map(|e| e.uuid))
    }

    /// Flag a registered device as stale, returning its uuid.
    pub fn suspend(&self, internal_id: &str) -> Option<String> {
        let mut state = self.lock();
        let entry = state.devices.get_mut(internal_id)?;
        entry.suspend(chrono::Utc::now());
        Some(entry.uuid.clone())
    }

    /// Clear the stale flag of a registered device, returning its uuid.
    pub fn resume(&self, internal_id: &str) -> Option<String> {
        let mut state = self.lock();
        let entry = state.devices.get_mut(internal_id)?;
        entry.resume();
        Some(entry.uuid.clone())
    }

    /// Whether a registered device is stale. Unknown devices are not.
    #[must_use]
    pub fn is_stale(&self, internal_id: &str) -> bool {
        self.lock()
            .devices
            .get(internal_id)
            .is_some_and(|entry| entry.stale)
    }

    #[must_use]
    pub fn device_type(&self, internal_id: &str) -> Option<String> {
        self.lock()
            .devices
            .get(internal_id)
            .map(|entry| entry.device_type.clone())
    }

    #[must_use]
    pub fn get(&self, internal_id: &str) -> Option<DeviceEntry> {
        self.lock().devices.get(internal_id).cloned()
    }

    /// Snapshot of every registered device, sorted by internal id.
    #[must_use]
    pub fn entries(&self) -> Vec<DeviceEntry> {
        let mut entries: Vec<DeviceEntry> = self.lock().devices.values().cloned().collect();
        entries.sort_by(|a, b| a.internal_id.cmp(&b.internal_id));
        entries
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().devices.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().devices.is_empty()
    }

    #[must_use]
    pub fn uuid_to_internal_id(&self, uuid: &str) -> Option<String> {
        let state = self.lock();
        let internal_id = state.uuids.get_internal_id(uuid)?;
        state
            .devices
            .contains_key(internal_id)
            .then(|| internal_id.to_string())
    }

    #[must_use]
    pub fn internal_id_to_uuid(&self, internal_id: &str) -> Option<String> {
        self.lock()
            .devices
            .get(internal_id)
            .map(|entry| entry.uuid.clone())
    }

    /// Resolve the registered device a command targets.
    ///
    /// `uuid` wins over `internalid`. Returns the internal id.
    #[must_use]
    pub fn resolve_target(&self, content: &Content) -> Option<String> {
        if let Some(uuid) = content.get("uuid").and_then(serde_json::Value::as_str) {
            return self.uuid_to_internal_id(uuid);
        }
        let internal_id = content.get("internalid").and_then(serde_json::Value::as_str)?;
        self.lock()
            .devices
            .contains_key(internal_id)
            .then(|| internal_id.to_string())
    }
}
