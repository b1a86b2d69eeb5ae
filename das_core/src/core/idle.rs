//! # Idle Sweep
//!
//! Runs after a driver has disappeared. First every idle device is put back
//! through the attach algorithm, then every dynamically loaded driver that no
//! device uses any more is unloaded.

use std::collections::BTreeSet;

use tracing::{debug, info, warn};

use super::state::{EngineState, Task};
use crate::capability::ServiceId;
use crate::error::EngineError;

impl EngineState {
    /// Devices that no consumer other than the engine itself is using.
    pub fn idle_devices(&self) -> BTreeSet<ServiceId> {
        let engine = self.config.engine_consumer();
        let mut idle = BTreeSet::new();
        for (id, device) in &self.devices {
            debug!(device = %device.reference.owner, "checking if idle");
            let users = self.registry.users_of(*id);
            if let Some(driver) = users.iter().find(|u| self.is_driver_consumer(u)) {
                debug!(device = %id, driver = %driver, "used by driver");
                continue;
            }
            if users.iter().any(|u| *u != engine) {
                debug!(device = %id, "used by another consumer");
                continue;
            }
            idle.insert(*id);
        }
        idle
    }

    pub(crate) fn check_for_idle_devices(&mut self) -> Result<(), EngineError> {
        debug!("START - check for idle devices");
        let idle = self.idle_devices();
        for id in &idle {
            info!(device = %id, "device is idle, resubmitting");
            self.queue.submit(Task::Attach(*id))?;
        }
        self.queue.submit(Task::UninstallIdleDrivers)?;
        debug!(idle = idle.len(), "STOP - check for idle devices");
        Ok(())
    }

    /// Tries to uninstall every known driver; returns how many were unloaded.
    pub fn uninstall_idle_drivers(&mut self) -> usize {
        info!("cleaning driver cache");
        let mut unloaded = Vec::new();
        for (id, driver) in &self.drivers {
            match driver.try_uninstall(self.registry.as_ref(), self.catalog.as_ref()) {
                Ok(true) => unloaded.push(*id),
                Ok(false) => {}
                Err(e) => warn!(driver = %driver.driver_id(), error = %e, "failed to uninstall idle driver"),
            }
        }
        for id in &unloaded {
            self.drivers.remove(id);
        }
        unloaded.len()
    }
}
