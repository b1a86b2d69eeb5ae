//! # Driver Attach Algorithm
//!
//! One attachment session per device. Each attempt scores every known driver
//! that has not been excluded yet, attaches the winner and either stops or
//! goes around again:
//!
//! * success ends the session,
//! * a referral excludes the referring driver and retries with the referred id
//!   as the only id to load,
//! * an attach failure excludes the driver and retries with the same ids.
//!
//! Every attempt excludes one driver, so a session ends after at most
//! `drivers + 1` attempts. Drivers the catalog loaded during the session are
//! unloaded again at the end unless they became the attached driver.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::driver_attributes::{AttachOutcome, DriverAttributes};
use super::matcher::DriverMatcher;
use super::state::EngineState;
use crate::capability::{DeviceHandle, DriverId, ServiceId, ServiceRef};
use crate::catalog::DriverLocator;
use crate::error::EngineError;

/// How an attachment session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    Attached(DriverId),
    NoDriverFound,
    /// A driver already uses the device; nothing was done.
    AlreadyAttached,
    /// The device is no longer known to the engine.
    DeviceGone,
}

/// Drivers loaded in a session and the one that finally attached.
#[derive(Default)]
struct SessionLedger {
    loaded: Vec<ServiceId>,
    attached: Option<ServiceId>,
}

impl EngineState {
    /// Runs a full attachment session for `device_id`.
    pub fn attach_device(&mut self, device_id: ServiceId) -> Result<SessionOutcome, EngineError> {
        let Some(device) = self.devices.get(&device_id).cloned() else {
            debug!(device = %device_id, "device is gone, skipping attach");
            return Ok(SessionOutcome::DeviceGone);
        };
        if self.is_attached(device_id) {
            debug!(device = %device_id, "device already attached");
            return Ok(SessionOutcome::AlreadyAttached);
        }

        info!(device = %device.reference, "START - attach driver");
        let mut ledger = SessionLedger::default();
        let outcome = self.run_session(&device, &mut ledger);
        self.unload_session_drivers(&ledger);

        match &outcome {
            Ok(result) => info!(device = %device_id, outcome = ?result, "STOP - attach driver"),
            Err(e) => warn!(device = %device_id, error = %e, "attach session aborted"),
        }
        outcome
    }

    fn run_session(&mut self, device: &DeviceHandle, ledger: &mut SessionLedger) -> Result<SessionOutcome, EngineError> {
        // Properties are read once; changes during the session are not seen.
        let props = self
            .registry
            .properties(device.id())
            .unwrap_or_else(|| device.reference.properties.as_ref().clone());
        let reference = ServiceRef::new(device.id(), device.reference.kind, device.reference.owner.clone(), props);

        let locators = self.locator_list();
        let mut wanted = self.catalog.find_drivers(&locators, &reference.properties)?;
        let mut excluded: HashSet<ServiceId> = HashSet::new();
        let mut attempts = 0usize;

        loop {
            let limit = self.config.session_limit(self.drivers.len());
            attempts += 1;
            if attempts > limit {
                return Err(EngineError::SessionBoundExceeded {
                    device: device.id(),
                    limit,
                });
            }

            self.load_missing(&locators, &wanted, ledger)?;
            self.prune_unregistered_drivers()?;

            let mut matcher = DriverMatcher::new();
            for (id, driver) in &self.drivers {
                if !excluded.contains(id) {
                    matcher.offer(driver, &reference);
                }
            }

            let Some(best) = matcher.pick(&reference, self.selector.as_deref()) else {
                info!(device = %device.id(), "no driver found");
                if let Some(hook) = &device.device {
                    hook.no_driver_found();
                }
                return Ok(SessionOutcome::NoDriverFound);
            };

            debug!(device = %device.id(), driver = %best.driver.driver_id(), score = best.score, attempts, "selected");
            match best.driver.attach(&reference) {
                AttachOutcome::Attached => {
                    ledger.attached = Some(best.driver.service_id());
                    return Ok(SessionOutcome::Attached(best.driver.driver_id().clone()));
                }
                AttachOutcome::Referred(next) => {
                    excluded.insert(best.driver.service_id());
                    wanted = vec![next];
                }
                AttachOutcome::Failed(_) => {
                    excluded.insert(best.driver.service_id());
                }
            }
        }
    }

    /// Loads the `wanted` ids that no known driver already provides.
    fn load_missing(
        &mut self,
        locators: &[Arc<dyn DriverLocator>],
        wanted: &[DriverId],
        ledger: &mut SessionLedger,
    ) -> Result<(), EngineError> {
        let known: BTreeSet<&DriverId> = self.drivers.values().map(|d| d.driver_id()).collect();
        let missing: Vec<DriverId> = wanted.iter().filter(|id| !known.contains(id)).cloned().collect();
        if missing.is_empty() {
            return Ok(());
        }

        debug!(count = missing.len(), "loading drivers");
        for handle in self.catalog.load_drivers(locators, &missing)? {
            let attributes = DriverAttributes::new(handle, true);
            let id = attributes.service_id();
            if self.drivers.contains_key(&id) {
                continue;
            }
            debug!(driver = %attributes.driver_id(), "driver loaded");
            ledger.loaded.push(id);
            self.drivers.insert(id, Arc::new(attributes));
        }
        Ok(())
    }

    /// Unloads drivers this session loaded that did not end up attached.
    fn unload_session_drivers(&mut self, ledger: &SessionLedger) {
        for id in &ledger.loaded {
            if ledger.attached == Some(*id) {
                continue;
            }
            let Some(driver) = self.drivers.get(id).cloned() else {
                continue;
            };
            match self.catalog.unload(&driver) {
                Ok(()) => {
                    debug!(driver = %driver.driver_id(), "unloaded session driver");
                    self.drivers.remove(id);
                }
                Err(e) => warn!(driver = %driver.driver_id(), error = %e, "failed to unload driver"),
            }
        }
    }
}
