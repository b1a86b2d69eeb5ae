//! # Driver Attributes
//!
//! Engine-side bookkeeping for one known driver: the registry handle, the
//! declared driver id and whether the catalog loaded it. Whether the driver is
//! in use is never cached; it is read from the registry on demand.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};

use tracing::{debug, error, info};

use crate::capability::{
    CapabilityKind, ConsumerId, DriverHandle, DriverId, Filter, Registry, ServiceId, ServiceRef,
};
use crate::catalog::{is_dynamic_location, DriverCatalog};
use crate::error::{CatalogError, DriverError};

/// Result of asking a driver to attach to a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachOutcome {
    Attached,
    /// The driver declined in favour of another driver.
    Referred(DriverId),
    Failed(DriverError),
}

pub struct DriverAttributes {
    handle: DriverHandle,
    driver_id: DriverId,
    dynamic: bool,
}

impl DriverAttributes {
    /// `loaded` marks a driver that came back from the catalog in this process.
    pub fn new(handle: DriverHandle, loaded: bool) -> Self {
        let driver_id = handle.driver_id();
        let dynamic = loaded || is_dynamic_location(&handle.reference.owner);
        Self {
            handle,
            driver_id,
            dynamic,
        }
    }

    pub fn handle(&self) -> &DriverHandle {
        &self.handle
    }

    pub fn driver_id(&self) -> &DriverId {
        &self.driver_id
    }

    pub fn owner(&self) -> &ConsumerId {
        &self.handle.reference.owner
    }

    pub fn service_id(&self) -> ServiceId {
        self.handle.id()
    }

    pub fn is_dynamic(&self) -> bool {
        self.dynamic
    }

    /// `true` while any registered device lists this driver's owner as a user.
    pub fn is_in_use(&self, registry: &dyn Registry) -> bool {
        let owner = self.owner();
        registry
            .query(CapabilityKind::Device, &Filter::Any)
            .iter()
            .any(|device| registry.users_of(device.id).iter().any(|user| user == owner))
    }

    /// Scores `device`. A panicking driver is reported as [`DriverError::Panicked`].
    pub fn match_device(&self, device: &ServiceRef) -> Result<i32, DriverError> {
        let score = panic::catch_unwind(AssertUnwindSafe(|| self.handle.driver.match_device(device)))
            .map_err(|payload| DriverError::Panicked(panic_message(payload.as_ref())))??;
        debug!(driver = %self.driver_id, device = %device.id, score, "match");
        Ok(score)
    }

    pub fn attach(&self, device: &ServiceRef) -> AttachOutcome {
        info!(driver = %self.driver_id, device = %device.id, "attaching");
        let result = panic::catch_unwind(AssertUnwindSafe(|| self.handle.driver.attach(device)))
            .unwrap_or_else(|payload| Err(DriverError::Panicked(panic_message(payload.as_ref()))));
        match result {
            Ok(None) => AttachOutcome::Attached,
            Ok(Some(next)) => {
                info!(driver = %self.driver_id, referral = %next, "driver referred device");
                AttachOutcome::Referred(next)
            }
            Err(e) => {
                error!(driver = %self.driver_id, device = %device.id, error = %e, "attach threw an exception");
                AttachOutcome::Failed(e)
            }
        }
    }

    /// Unloads this driver through `catalog` if it is dynamic and unused.
    ///
    /// Returns `Ok(true)` when the driver was unloaded.
    pub fn try_uninstall(&self, registry: &dyn Registry, catalog: &dyn DriverCatalog) -> Result<bool, CatalogError> {
        if !self.dynamic {
            return Ok(false);
        }
        if self.is_in_use(registry) {
            debug!(driver = %self.driver_id, "driver still in use");
            return Ok(false);
        }
        info!(driver = %self.driver_id, owner = %self.owner(), "uninstalling unused driver");
        catalog.unload(self)?;
        Ok(true)
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl fmt::Debug for DriverAttributes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverAttributes")
            .field("service", &self.handle.id())
            .field("driver_id", &self.driver_id)
            .field("dynamic", &self.dynamic)
            .finish()
    }
}
