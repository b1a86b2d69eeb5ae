//! # Locator-Backed Catalog
//!
//! Asks every registered locator for candidate driver ids, fetches packages
//! from the first locator that has them and installs them at
//! `_DD_<driver id>`. A failing locator or a failing install only costs that
//! locator or that id; the rest of the batch still goes through.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::{driver_location, DriverCatalog, DriverInstaller, DriverLocator, DriverPackage};
use crate::capability::{ConsumerId, Driver, DriverHandle, DriverId, InMemoryRegistry, Properties, DRIVER_ID};
use crate::core::driver_attributes::DriverAttributes;
use crate::error::CatalogError;

pub struct LocatorCatalog {
    installer: Arc<dyn DriverInstaller>,
}

impl LocatorCatalog {
    pub fn new(installer: Arc<dyn DriverInstaller>) -> Self {
        Self { installer }
    }

    fn fetch(&self, locators: &[Arc<dyn DriverLocator>], id: &DriverId) -> Option<DriverPackage> {
        for locator in locators {
            match locator.load_driver(id) {
                Ok(Some(package)) => return Some(package),
                Ok(None) => continue,
                Err(e) => warn!(driver = %id, error = %e, "locator failed to load driver"),
            }
        }
        None
    }
}

impl DriverCatalog for LocatorCatalog {
    fn find_drivers(
        &self,
        locators: &[Arc<dyn DriverLocator>],
        props: &Properties,
    ) -> Result<Vec<DriverId>, CatalogError> {
        let mut found: Vec<DriverId> = Vec::new();
        for locator in locators {
            match locator.find_drivers(props) {
                Ok(ids) => {
                    for id in ids {
                        if !found.contains(&id) {
                            found.push(id);
                        }
                    }
                }
                Err(e) => warn!(error = %e, "driver locator failed, skipping it"),
            }
        }
        debug!(count = found.len(), "drivers found by locators");
        Ok(found)
    }

    fn load_drivers(
        &self,
        locators: &[Arc<dyn DriverLocator>],
        ids: &[DriverId],
    ) -> Result<Vec<DriverHandle>, CatalogError> {
        let mut loaded = Vec::new();
        for id in ids {
            let Some(package) = self.fetch(locators, id) else {
                warn!(driver = %id, "no locator could provide driver");
                continue;
            };
            let location = driver_location(id);
            match self.installer.install(&location, package) {
                Ok(handles) => {
                    info!(driver = %id, %location, registered = handles.len(), "driver installed");
                    loaded.extend(handles);
                }
                Err(e) => warn!(driver = %id, error = %e, "driver install failed"),
            }
        }
        Ok(loaded)
    }

    fn unload(&self, driver: &DriverAttributes) -> Result<(), CatalogError> {
        debug!(driver = %driver.driver_id(), owner = %driver.owner(), "uninstalling driver");
        self.installer
            .uninstall(driver.owner())
            .map_err(|e| CatalogError::Unload {
                driver_id: driver.driver_id().clone(),
                reason: e.to_string(),
            })
    }
}

/// Builds a driver object from an installed package.
pub type DriverFactory =
    dyn Fn(&DriverPackage) -> Result<(Properties, Arc<dyn Driver>), CatalogError> + Send + Sync;

/// Installs packages as driver registrations on an [`InMemoryRegistry`].
pub struct RegistryInstaller {
    registry: InMemoryRegistry,
    factory: Box<DriverFactory>,
}

impl RegistryInstaller {
    pub fn new(registry: InMemoryRegistry, factory: Box<DriverFactory>) -> Self {
        Self { registry, factory }
    }
}

impl DriverInstaller for RegistryInstaller {
    fn install(&self, location: &str, package: DriverPackage) -> Result<Vec<DriverHandle>, CatalogError> {
        let (props, driver) = (self.factory)(&package).map_err(|e| CatalogError::Install {
            location: location.to_string(),
            reason: e.to_string(),
        })?;
        let props = match props.get_str(DRIVER_ID) {
            Some(_) => props,
            None => props.with(DRIVER_ID, package.driver_id.as_str()),
        };
        let owner = ConsumerId::new(location);
        Ok(vec![self.registry.register_driver(&owner, props, driver)])
    }

    fn uninstall(&self, owner: &ConsumerId) -> Result<(), CatalogError> {
        self.registry.uninstall_consumer(owner);
        Ok(())
    }
}
