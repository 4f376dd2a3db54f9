//! Persistent `internal_id -> uuid` mapping with a reverse index.
//!
//! Serialized as a flat JSON object `{ "<internal_id>": "<uuid>" }` with keys
//! in sorted order, so rewrites of an unchanged map are byte-identical.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UuidMapError {
    /// The uuid is already bound to a different internal id.
    #[error("uuid {uuid} is already assigned to {owner}")]
    UuidTaken { uuid: String, owner: String },
}

/// Bidirectional identity map. Mappings only ever grow, except through
/// [`UuidMap::remove`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    try_from = "BTreeMap<String, String>",
    into = "BTreeMap<String, String>"
)]
pub struct UuidMap {
    forward: HashMap<String, String>,
    reverse: HashMap<String, String>,
}

impl UuidMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get_uuid(&self, internal_id: &str) -> Option<&str> {
        self.forward.get(internal_id).map(String::as_str)
    }

    #[must_use]
    pub fn get_internal_id(&self, uuid: &str) -> Option<&str> {
        self.reverse.get(uuid).map(String::as_str)
    }

    /// Bind `internal_id` to `uuid`.
    ///
    /// Returns `true` if the map changed. Re-binding an internal id to a new
    /// uuid replaces the old binding.
    ///
    /// # Errors
    ///
    /// Returns [`UuidMapError::UuidTaken`] if `uuid` belongs to another
    /// internal id.
    pub fn assign(
        &mut self,
        internal_id: impl Into<String>,
        uuid: impl Into<String>,
    ) -> Result<bool, UuidMapError> {
        let internal_id = internal_id.into();
        let uuid = uuid.into();
        match self.reverse.get(&uuid) {
            Some(owner) if *owner == internal_id => return Ok(false),
            Some(owner) => {
                return Err(UuidMapError::UuidTaken {
                    uuid,
                    owner: owner.clone(),
                });
            }
            None => {}
        }
        if let Some(previous) = self.forward.insert(internal_id.clone(), uuid.clone()) {
            self.reverse.remove(&previous);
        }
        self.reverse.insert(uuid, internal_id);
        Ok(true)
    }

    /// Add every mapping of `other` that does not conflict with an existing
    /// one. Existing mappings always win. Returns the number of mappings
    /// added.
    pub fn merge(&mut self, other: &UuidMap) -> usize {
        let mut added = 0;
        for (internal_id, uuid) in other.iter() {
            if self.forward.contains_key(internal_id) || self.reverse.contains_key(uuid) {
                continue;
            }
            self.forward.insert(internal_id.to_string(), uuid.to_string());
            self.reverse.insert(uuid.to_string(), internal_id.to_string());
            added += 1;
        }
        added
    }

    /// Erase the mapping of `internal_id`, returning its uuid.
    pub fn remove(&mut self, internal_id: &str) -> Option<String> {
        let uuid = self.forward.remove(internal_id)?;
        self.reverse.remove(&uuid);
        Some(uuid)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.forward.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }

    /// Iterate `(internal_id, uuid)` pairs in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.forward.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl TryFrom<BTreeMap<String, String>> for UuidMap {
    type Error = UuidMapError;

    fn try_from(entries: BTreeMap<String, String>) -> Result<Self, Self::Error> {
        let mut map = Self::new();
        for (internal_id, uuid) in entries {
            map.assign(internal_id, uuid)?;
        }
        Ok(map)
    }
}

impl From<UuidMap> for BTreeMap<String, String> {
    fn from(map: UuidMap) -> Self {
        map.forward.into_iter().collect()
    }
}
