//! Devices: things an agent exposes on the bus under a stable uuid.
//!
//! An agent knows its devices by a local `internal_id` (a bus address, a
//! serial number...). Other agents only ever see the `uuid` announced for it.

use chrono::{DateTime, Utc};

use crate::error::ValidationError;

/// UTC timestamp used for staleness bookkeeping.
pub type Timestamp = DateTime<Utc>;

/// A device registered by the local agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEntry {
    pub internal_id: String,
    pub uuid: String,
    pub device_type: String,
    pub stale: bool,
    pub initial_name: Option<String>,
    pub stale_since: Option<Timestamp>,
}

impl DeviceEntry {
    /// Flag the device as stale, returning `false` if it already was.
    pub fn suspend(&mut self, at: Timestamp) -> bool {
        if self.stale {
            return false;
        }
        self.stale = true;
        self.stale_since = Some(at);
        true
    }

    /// Clear the stale flag, returning `false` if it was not set.
    pub fn resume(&mut self) -> bool {
        if !self.stale {
            return false;
        }
        self.stale = false;
        self.stale_since = None;
        true
    }
}

/// How the uuid of a newly added device is chosen when no mapping exists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UuidAssignment {
    /// Mint a fresh random uuid.
    #[default]
    Generate,
    /// Use the internal id itself as the uuid (the internal id already is one).
    UseInternalId,
}

/// Request to register a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewDevice {
    pub internal_id: String,
    pub device_type: String,
    pub initial_name: Option<String>,
    pub assignment: UuidAssignment,
}

impl NewDevice {
    /// Create a builder for constructing a [`NewDevice`].
    #[must_use]
    pub fn builder() -> NewDeviceBuilder {
        NewDeviceBuilder::default()
    }

    /// Check domain invariants.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::EmptyInternalId`] or
    /// [`ValidationError::EmptyDeviceType`].
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.internal_id.is_empty() {
            return Err(ValidationError::EmptyInternalId);
        }
        if self.device_type.is_empty() {
            return Err(ValidationError::EmptyDeviceType);
        }
        Ok(())
    }
}

/// Step-by-step builder for [`NewDevice`].
#[derive(Debug, Default)]
pub struct NewDeviceBuilder {
    internal_id: Option<String>,
    device_type: Option<String>,
    initial_name: Option<String>,
    assignment: UuidAssignment,
}

impl NewDeviceBuilder {
    #[must_use]
    pub fn internal_id(mut self, internal_id: impl Into<String>) -> Self {
        self.internal_id = Some(internal_id.into());
        self
    }

    #[must_use]
    pub fn device_type(mut self, device_type: impl Into<String>) -> Self {
        self.device_type = Some(device_type.into());
        self
    }

    #[must_use]
    pub fn initial_name(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.initial_name = (!name.is_empty()).then_some(name);
        self
    }

    #[must_use]
    pub fn assignment(mut self, assignment: UuidAssignment) -> Self {
        self.assignment = assignment;
        self
    }

    /// Consume the builder, validate, and return a [`NewDevice`].
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] if required fields are missing or empty.
    pub fn build(self) -> Result<NewDevice, ValidationError> {
        let device = NewDevice {
            internal_id: self.internal_id.unwrap_or_default(),
            device_type: self.device_type.unwrap_or_default(),
            initial_name: self.initial_name,
            assignment: self.assignment,
        };
        device.validate()?;
        Ok(device)
    }
}
