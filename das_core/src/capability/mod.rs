//! # Capability Model
//!
//! Typed property sets, registry handles for devices, drivers and locators,
//! and the registry facade the engine reads from.

/// Property values, property sets and query filters.
pub mod properties;
/// Handles, identifiers and the device/driver traits.
pub mod handle;
/// The registry facade and its in-memory implementation.
pub mod registry;

pub use handle::{
    Capability, CapabilityKind, ConsumerId, Device, DeviceHandle, Driver, DriverHandle, DriverId, LocatorHandle,
    ServiceId, ServiceRef, MATCH_NONE,
};
pub use properties::{
    Filter, Properties, PropertyValue, DEVICE_CATEGORY, DEVICE_DESCRIPTION, DEVICE_SERIAL, DRIVER_ID,
};
pub use registry::{InMemoryRegistry, Registry, RegistryEvent};
