//! # Driver Catalog
//!
//! Discovery and loading of drivers that are not registered yet. The engine
//! talks to a [`DriverCatalog`]; [`LocatorCatalog`] is the default one, which
//! asks the registered [`DriverLocator`]s for driver ids and packages and hands
//! the packages to a [`DriverInstaller`].

/// The locator-backed catalog.
pub mod locator;

use std::sync::Arc;

use crate::capability::{ConsumerId, DriverHandle, DriverId, Properties};
use crate::core::driver_attributes::DriverAttributes;
use crate::error::CatalogError;

pub use locator::{DriverFactory, LocatorCatalog, RegistryInstaller};

/// Location prefix under which dynamically loaded drivers are installed.
pub const DRIVER_LOCATION_PREFIX: &str = "_DD_";

/// An installable driver artifact handed out by a locator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverPackage {
    pub driver_id: DriverId,
    pub payload: Vec<u8>,
}

/// Finds and provides drivers from an external source.
pub trait DriverLocator: Send + Sync {
    /// Driver ids this locator can provide for a device with `props`.
    fn find_drivers(&self, props: &Properties) -> Result<Vec<DriverId>, CatalogError>;

    /// The package for `id`, or `None` if this locator does not know it.
    fn load_driver(&self, id: &DriverId) -> Result<Option<DriverPackage>, CatalogError>;
}

/// Turns a driver package into registered driver capabilities and back.
pub trait DriverInstaller: Send + Sync {
    /// Installs `package` under `location` and returns the drivers it registered.
    fn install(&self, location: &str, package: DriverPackage) -> Result<Vec<DriverHandle>, CatalogError>;

    /// Removes the unit at `owner` and everything it registered.
    fn uninstall(&self, owner: &ConsumerId) -> Result<(), CatalogError>;
}

/// What the engine needs from a driver catalog.
pub trait DriverCatalog: Send + Sync {
    fn find_drivers(
        &self,
        locators: &[Arc<dyn DriverLocator>],
        props: &Properties,
    ) -> Result<Vec<DriverId>, CatalogError>;

    fn load_drivers(
        &self,
        locators: &[Arc<dyn DriverLocator>],
        ids: &[DriverId],
    ) -> Result<Vec<DriverHandle>, CatalogError>;

    fn unload(&self, driver: &DriverAttributes) -> Result<(), CatalogError>;
}

/// `true` if `owner` is a location this catalog installs dynamic drivers at.
pub fn is_dynamic_location(owner: &ConsumerId) -> bool {
    owner.as_str().starts_with(DRIVER_LOCATION_PREFIX)
}

pub fn driver_location(id: &DriverId) -> String {
    format!("{}{}", DRIVER_LOCATION_PREFIX, id)
}
