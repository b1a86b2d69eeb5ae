//! Scenario files: devices, drivers and locator-provided drivers to register
//! on an in-memory registry, described in JSON.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use das_core::capability::{
    ConsumerId, Device, DeviceHandle, Driver, DriverId, InMemoryRegistry, Properties, ServiceRef, DEVICE_CATEGORY,
    DRIVER_ID, MATCH_NONE,
};
use das_core::catalog::{driver_location, DriverFactory, DriverLocator, DriverPackage};
use das_core::error::{CatalogError, DriverError};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Scenario {
    pub devices: Vec<DeviceSpec>,
    pub drivers: Vec<DriverSpec>,
    /// Drivers that are not registered up front but can be found and
    /// loaded through a locator.
    pub locator_drivers: Vec<DriverSpec>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSpec {
    pub owner: String,
    #[serde(default)]
    pub properties: Properties,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverSpec {
    pub driver_id: String,
    #[serde(default)]
    pub owner: Option<String>,
    /// Device categories this driver accepts; empty accepts every device.
    #[serde(default)]
    pub categories: Vec<String>,
    pub score: i32,
    /// Driver id to refer devices to instead of attaching.
    #[serde(default)]
    pub referral: Option<String>,
}

impl Scenario {
    pub fn from_file(path: &Path) -> Result<Scenario> {
        let text = fs::read_to_string(path).with_context(|| format!("failed to read scenario {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("failed to parse scenario {}", path.display()))
    }

    /// Registers the locator first, then drivers, then devices.
    pub fn install(&self, registry: &InMemoryRegistry) -> Vec<DeviceHandle> {
        let scenario_owner = ConsumerId::new("das.scenario");
        if !self.locator_drivers.is_empty() {
            let locator = ScenarioLocator {
                drivers: self.locator_drivers.clone(),
            };
            registry.register_locator(&scenario_owner, Properties::new(), Arc::new(locator));
        }

        for spec in &self.drivers {
            let owner = ConsumerId::new(spec.owner.clone().unwrap_or_else(|| format!("bundle.{}", spec.driver_id)));
            let props = Properties::new().with(DRIVER_ID, spec.driver_id.as_str());
            let driver = StaticDriver::new(spec.clone(), owner.clone(), registry.clone());
            registry.register_driver(&owner, props, Arc::new(driver));
        }

        self.devices
            .iter()
            .map(|spec| {
                let owner = ConsumerId::new(spec.owner.as_str());
                let device = LoggingDevice {
                    owner: spec.owner.clone(),
                };
                registry.register_device(&owner, spec.properties.clone(), Some(Arc::new(device)))
            })
            .collect()
    }
}

/// A driver with a fixed score for the categories it declares.
pub struct StaticDriver {
    spec: DriverSpec,
    owner: ConsumerId,
    registry: InMemoryRegistry,
}

impl StaticDriver {
    pub fn new(spec: DriverSpec, owner: ConsumerId, registry: InMemoryRegistry) -> Self {
        Self { spec, owner, registry }
    }
}

impl Driver for StaticDriver {
    fn match_device(&self, device: &ServiceRef) -> Result<i32, DriverError> {
        if self.spec.categories.is_empty() {
            return Ok(self.spec.score);
        }
        let categories = device.properties.get_list(DEVICE_CATEGORY);
        if self.spec.categories.iter().any(|c| categories.contains(c)) {
            Ok(self.spec.score)
        } else {
            Ok(MATCH_NONE)
        }
    }

    fn attach(&self, device: &ServiceRef) -> Result<Option<DriverId>, DriverError> {
        if let Some(next) = &self.spec.referral {
            return Ok(Some(DriverId::new(next.as_str())));
        }
        if !self.registry.acquire(&self.owner, device.id) {
            return Err(DriverError::Attach(format!("device {} is no longer registered", device.id)));
        }
        info!(driver = %self.spec.driver_id, device = %device.id, "attached");
        Ok(None)
    }
}

struct LoggingDevice {
    owner: String,
}

impl Device for LoggingDevice {
    fn no_driver_found(&self) {
        warn!(device = %self.owner, "no driver found");
    }
}

/// Offers the scenario's locator drivers, packaged as JSON.
pub struct ScenarioLocator {
    drivers: Vec<DriverSpec>,
}

impl DriverLocator for ScenarioLocator {
    fn find_drivers(&self, props: &Properties) -> Result<Vec<DriverId>, CatalogError> {
        let categories = props.get_list(DEVICE_CATEGORY);
        Ok(self
            .drivers
            .iter()
            .filter(|d| d.categories.is_empty() || d.categories.iter().any(|c| categories.contains(c)))
            .map(|d| DriverId::new(d.driver_id.as_str()))
            .collect())
    }

    fn load_driver(&self, id: &DriverId) -> Result<Option<DriverPackage>, CatalogError> {
        let Some(spec) = self.drivers.iter().find(|d| d.driver_id == id.as_str()) else {
            return Ok(None);
        };
        let payload = serde_json::to_vec(spec).map_err(|e| CatalogError::Locator(e.to_string()))?;
        Ok(Some(DriverPackage {
            driver_id: id.clone(),
            payload,
        }))
    }
}

/// Builds [`StaticDriver`]s out of packages produced by [`ScenarioLocator`].
pub fn driver_factory(registry: InMemoryRegistry) -> Box<DriverFactory> {
    Box::new(move |package: &DriverPackage| -> Result<(Properties, Arc<dyn Driver>), CatalogError> {
        let spec: DriverSpec = serde_json::from_slice(&package.payload).map_err(|e| CatalogError::Install {
            location: driver_location(&package.driver_id),
            reason: e.to_string(),
        })?;
        let owner = ConsumerId::new(driver_location(&package.driver_id));
        let props = Properties::new().with(DRIVER_ID, spec.driver_id.as_str());
        let driver: Arc<dyn Driver> = Arc::new(StaticDriver::new(spec, owner, registry.clone()));
        Ok((props, driver))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use das_core::capability::Registry;

    const SCENARIO: &str = r#"{
        "devices": [ { "owner": "hw.printer", "properties": { "DEVICE_CATEGORY": "printer" } } ],
        "drivers": [ { "driverId": "a", "categories": ["printer"], "score": 5 } ],
        "locatorDrivers": [ { "driverId": "x", "categories": ["printer"], "score": 3 } ]
    }"#;

    #[test]
    fn scenario_installs_locator_drivers_and_devices() {
        let scenario: Scenario = serde_json::from_str(SCENARIO).unwrap();
        let registry = InMemoryRegistry::new();
        let devices = scenario.install(&registry);

        assert_eq!(devices.len(), 1);
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn static_driver_scores_by_category() {
        let registry = InMemoryRegistry::new();
        let spec = DriverSpec {
            driver_id: "a".into(),
            owner: None,
            categories: vec!["printer".into()],
            score: 5,
            referral: None,
        };
        let driver = StaticDriver::new(spec, ConsumerId::new("bundle.a"), registry.clone());
        let printer = registry.register_device(
            &ConsumerId::new("hw"),
            Properties::new().with(DEVICE_CATEGORY, "printer"),
            None,
        );
        let camera = registry.register_device(
            &ConsumerId::new("hw"),
            Properties::new().with(DEVICE_CATEGORY, "camera"),
            None,
        );

        assert_eq!(driver.match_device(&printer.reference).unwrap(), 5);
        assert_eq!(driver.match_device(&camera.reference).unwrap(), MATCH_NONE);
        assert_eq!(driver.attach(&printer.reference).unwrap(), None);
        assert_eq!(registry.users_of(printer.id()), vec![ConsumerId::new("bundle.a")]);
    }

    #[test]
    fn locator_packages_round_trip_through_the_factory() {
        let scenario: Scenario = serde_json::from_str(SCENARIO).unwrap();
        let locator = ScenarioLocator {
            drivers: scenario.locator_drivers,
        };
        let ids = locator
            .find_drivers(&Properties::new().with(DEVICE_CATEGORY, "printer"))
            .unwrap();
        assert_eq!(ids, vec![DriverId::new("x")]);

        let package = locator.load_driver(&ids[0]).unwrap().unwrap();
        let (props, _driver) = driver_factory(InMemoryRegistry::new())(&package).unwrap();
        assert_eq!(props.get_str(DRIVER_ID), Some("x"));
    }
}
