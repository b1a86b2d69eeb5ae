//! # Capability Handles
//!
//! Registry handles for devices, drivers and locators. The kind of a
//! capability is resolved once, when it is registered, and carried in the
//! handle from then on.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::properties::{Properties, DRIVER_ID};
use crate::catalog::DriverLocator;
use crate::error::DriverError;

/// Match strength at or below which a driver rejects a device.
pub const MATCH_NONE: i32 = 0;

/// Registry-assigned identifier of a capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceId(pub u64);

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The unit that registers and consumes capabilities, identified by its location.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConsumerId(pub String);

impl ConsumerId {
    pub fn new(location: impl Into<String>) -> Self {
        Self(location.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier a driver declares through its `DRIVER_ID` property.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DriverId(pub String);

impl DriverId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DriverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DriverId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CapabilityKind {
    Device,
    Driver,
    Locator,
}

/// A cheap-to-clone reference to a registered capability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRef {
    pub id: ServiceId,
    pub kind: CapabilityKind,
    pub owner: ConsumerId,
    pub properties: Arc<Properties>,
}

impl ServiceRef {
    pub fn new(id: ServiceId, kind: CapabilityKind, owner: ConsumerId, properties: Properties) -> Self {
        Self {
            id,
            kind,
            owner,
            properties: Arc::new(properties),
        }
    }

    /// The `DRIVER_ID` property, if present.
    pub fn driver_id(&self) -> Option<DriverId> {
        self.properties.get_str(DRIVER_ID).map(DriverId::new)
    }
}

impl fmt::Display for ServiceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}{} ({}) {}", self.kind, self.id, self.owner, self.properties)
    }
}

/// Device-side hook.
pub trait Device: Send + Sync {
    /// Called when an attachment session ends without any matching driver.
    fn no_driver_found(&self);
}

/// A driver capability.
pub trait Driver: Send + Sync {
    /// Scores how well this driver fits `device`; `MATCH_NONE` or lower rejects.
    fn match_device(&self, device: &ServiceRef) -> Result<i32, DriverError>;

    /// Attaches to `device`. `Ok(Some(id))` refers the device to another driver.
    fn attach(&self, device: &ServiceRef) -> Result<Option<DriverId>, DriverError>;
}

#[derive(Clone)]
pub struct DeviceHandle {
    pub reference: ServiceRef,
    /// `None` when the registered object does not implement the device hook.
    pub device: Option<Arc<dyn Device>>,
}

impl DeviceHandle {
    pub fn new(reference: ServiceRef, device: Option<Arc<dyn Device>>) -> Self {
        Self { reference, device }
    }

    pub fn id(&self) -> ServiceId {
        self.reference.id
    }
}

impl fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("reference", &self.reference)
            .field("has_hook", &self.device.is_some())
            .finish()
    }
}

#[derive(Clone)]
pub struct DriverHandle {
    pub reference: ServiceRef,
    pub driver: Arc<dyn Driver>,
}

impl DriverHandle {
    pub fn new(reference: ServiceRef, driver: Arc<dyn Driver>) -> Self {
        Self { reference, driver }
    }

    pub fn id(&self) -> ServiceId {
        self.reference.id
    }

    /// Falls back to the owner location when the driver declares no `DRIVER_ID`.
    pub fn driver_id(&self) -> DriverId {
        self.reference
            .driver_id()
            .unwrap_or_else(|| DriverId::new(self.reference.owner.as_str()))
    }
}

impl fmt::Debug for DriverHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverHandle").field("reference", &self.reference).finish()
    }
}

#[derive(Clone)]
pub struct LocatorHandle {
    pub reference: ServiceRef,
    pub locator: Arc<dyn DriverLocator>,
}

impl LocatorHandle {
    pub fn new(reference: ServiceRef, locator: Arc<dyn DriverLocator>) -> Self {
        Self { reference, locator }
    }

    pub fn id(&self) -> ServiceId {
        self.reference.id
    }
}

impl fmt::Debug for LocatorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocatorHandle").field("reference", &self.reference).finish()
    }
}

/// A registered capability together with its kind-specific payload.
#[derive(Debug, Clone)]
pub enum Capability {
    Device(DeviceHandle),
    Driver(DriverHandle),
    Locator(LocatorHandle),
}

impl Capability {
    pub fn kind(&self) -> CapabilityKind {
        match self {
            Capability::Device(_) => CapabilityKind::Device,
            Capability::Driver(_) => CapabilityKind::Driver,
            Capability::Locator(_) => CapabilityKind::Locator,
        }
    }

    pub fn reference(&self) -> &ServiceRef {
        match self {
            Capability::Device(h) => &h.reference,
            Capability::Driver(h) => &h.reference,
            Capability::Locator(h) => &h.reference,
        }
    }
}
