//! # Engine State
//!
//! Everything the engine knows about devices, drivers and locators. The state
//! is owned by the worker task and only ever touched from inside a [`Task`];
//! callers outside the worker can only enqueue work.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, info};

use super::driver_attributes::DriverAttributes;
use super::matcher::DriverSelector;
use super::startup::PlatformStatus;
use super::worker::{NamedTask, TaskQueue};
use crate::capability::{
    CapabilityKind, ConsumerId, DeviceHandle, DriverHandle, LocatorHandle, Registry, ServiceId, ServiceRef, DEVICE_CATEGORY,
};
use crate::catalog::{DriverCatalog, DriverLocator};
use crate::configs::EngineConfig;
use crate::error::EngineError;

/// Work items executed by the engine worker, one at a time.
pub enum Task {
    WaitForStart,
    LocatorAdded(LocatorHandle),
    LocatorRemoved(ServiceId),
    DriverAdded(DriverHandle),
    DriverRemoved(ServiceRef),
    DeviceAdded(DeviceHandle),
    DeviceModified(ServiceRef),
    DeviceRemoved(ServiceId),
    SetSelector(Option<Arc<dyn DriverSelector>>),
    Attach(ServiceId),
    CheckForIdleDevices,
    UninstallIdleDrivers,
    Snapshot(oneshot::Sender<EngineSnapshot>),
}

impl NamedTask for Task {
    fn name(&self) -> &'static str {
        match self {
            Task::WaitForStart => "WaitForStart",
            Task::LocatorAdded(_) => "LocatorAdded",
            Task::LocatorRemoved(_) => "LocatorRemoved",
            Task::DriverAdded(_) => "DriverAdded",
            Task::DriverRemoved(_) => "DriverRemoved",
            Task::DeviceAdded(_) => "DeviceAdded",
            Task::DeviceModified(_) => "DeviceModified",
            Task::DeviceRemoved(_) => "DeviceRemoved",
            Task::SetSelector(_) => "SetSelector",
            Task::Attach(_) => "DriverAttach",
            Task::CheckForIdleDevices => "CheckForIdleDevices",
            Task::UninstallIdleDrivers => "IdleDriverUninstall",
            Task::Snapshot(_) => "Snapshot",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceSummary {
    pub id: ServiceId,
    pub owner: String,
    pub categories: Vec<String>,
    pub users: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DriverSummary {
    pub id: ServiceId,
    pub driver_id: String,
    pub dynamic: bool,
    pub in_use: bool,
}

/// Point-in-time view of the engine, taken on the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineSnapshot {
    pub devices: Vec<DeviceSummary>,
    pub drivers: Vec<DriverSummary>,
    pub locators: usize,
    pub platform_running: bool,
}

impl EngineSnapshot {
    pub fn device(&self, id: ServiceId) -> Option<&DeviceSummary> {
        self.devices.iter().find(|d| d.id == id)
    }

    pub fn driver(&self, driver_id: &str) -> Option<&DriverSummary> {
        self.drivers.iter().find(|d| d.driver_id == driver_id)
    }
}

pub struct EngineState {
    pub(crate) config: EngineConfig,
    pub(crate) registry: Arc<dyn Registry>,
    pub(crate) catalog: Arc<dyn DriverCatalog>,
    pub(crate) selector: Option<Arc<dyn DriverSelector>>,
    pub(crate) devices: BTreeMap<ServiceId, DeviceHandle>,
    pub(crate) drivers: BTreeMap<ServiceId, Arc<DriverAttributes>>,
    pub(crate) locators: Vec<LocatorHandle>,
    pub(crate) queue: TaskQueue<Task>,
    platform: PlatformStatus,
}

impl EngineState {
    pub fn new(
        config: EngineConfig,
        registry: Arc<dyn Registry>,
        catalog: Arc<dyn DriverCatalog>,
        platform: PlatformStatus,
        queue: TaskQueue<Task>,
    ) -> Self {
        Self {
            config,
            registry,
            catalog,
            selector: None,
            devices: BTreeMap::new(),
            drivers: BTreeMap::new(),
            locators: Vec::new(),
            queue,
            platform,
        }
    }

    /// Runs one task to completion.
    pub async fn execute(&mut self, task: Task) -> Result<(), EngineError> {
        match task {
            Task::WaitForStart => self.wait_for_start().await,
            task => self.apply(task),
        }
    }

    /// Runs every task except the startup wait, which is the only one that
    /// awaits.
    pub(crate) fn apply(&mut self, task: Task) -> Result<(), EngineError> {
        match task {
            Task::WaitForStart => {
                debug!("startup wait cannot run synchronously, ignoring");
                Ok(())
            }
            Task::LocatorAdded(handle) => {
                if !self.locators.iter().any(|l| l.id() == handle.id()) {
                    self.locators.push(handle);
                }
                debug!(locators = self.locators.len(), "driver locator appeared");
                Ok(())
            }
            Task::LocatorRemoved(id) => {
                self.locators.retain(|l| l.id() != id);
                debug!(locators = self.locators.len(), "driver locator lost");
                Ok(())
            }
            Task::DriverAdded(handle) => {
                self.driver_added(handle);
                Ok(())
            }
            Task::DriverRemoved(reference) => self.driver_removed(&reference),
            Task::DeviceAdded(handle) => {
                let id = handle.id();
                debug!(device = %handle.reference, "device appeared");
                self.devices.insert(id, handle);
                self.attach_device(id).map(|_| ())
            }
            Task::DeviceModified(reference) => {
                debug!(device = %reference, "device modified");
                if let Some(known) = self.devices.get_mut(&reference.id) {
                    known.reference = reference;
                }
                Ok(())
            }
            Task::DeviceRemoved(id) => {
                if self.devices.remove(&id).is_some() {
                    debug!(device = %id, "device removed");
                }
                Ok(())
            }
            Task::SetSelector(selector) => {
                info!(installed = selector.is_some(), "driver selector changed");
                self.selector = selector;
                Ok(())
            }
            Task::Attach(id) => self.attach_device(id).map(|_| ()),
            Task::CheckForIdleDevices => self.check_for_idle_devices(),
            Task::UninstallIdleDrivers => {
                self.uninstall_idle_drivers();
                Ok(())
            }
            Task::Snapshot(reply) => {
                if reply.send(self.snapshot()).is_err() {
                    debug!("snapshot requester went away");
                }
                Ok(())
            }
        }
    }

    pub(crate) async fn wait_for_start(&mut self) -> Result<(), EngineError> {
        let token = self.queue.token().clone();
        self.platform.wait_started(&token).await?;
        info!(devices = self.devices.len(), "platform running, matching known devices");
        for id in self.devices.keys().copied().collect::<Vec<_>>() {
            self.queue.submit(Task::Attach(id))?;
        }
        Ok(())
    }

    fn driver_added(&mut self, handle: DriverHandle) {
        let id = handle.id();
        if let Some(known) = self.drivers.get(&id) {
            debug!(driver = %known.driver_id(), "driver already known");
            return;
        }
        if self.registry.properties(id).is_none() {
            debug!(service = %id, "driver already unregistered, ignoring");
            return;
        }
        let attributes = DriverAttributes::new(handle, false);
        debug!(driver = %attributes.driver_id(), dynamic = attributes.is_dynamic(), "driver appeared");
        self.drivers.insert(id, Arc::new(attributes));
    }

    fn driver_removed(&mut self, reference: &ServiceRef) -> Result<(), EngineError> {
        match self.drivers.remove(&reference.id) {
            Some(driver) => {
                debug!(driver = %driver.driver_id(), "driver lost");
                // Devices that were attached through it may now be idle.
                self.queue.schedule(Task::CheckForIdleDevices, self.config.idle_check_delay())
            }
            None => {
                debug!(service = %reference.id, "untracked driver lost");
                Ok(())
            }
        }
    }

    /// Forgets drivers the registry no longer holds, ahead of their queued
    /// removal, and schedules the idle sweep their removal would have.
    pub(crate) fn prune_unregistered_drivers(&mut self) -> Result<(), EngineError> {
        let gone: Vec<ServiceId> = self
            .drivers
            .keys()
            .copied()
            .filter(|id| self.registry.properties(*id).is_none())
            .collect();
        if gone.is_empty() {
            return Ok(());
        }
        for id in &gone {
            if let Some(driver) = self.drivers.remove(id) {
                debug!(driver = %driver.driver_id(), "driver already unregistered, dropping it");
            }
        }
        self.queue.schedule(Task::CheckForIdleDevices, self.config.idle_check_delay())
    }

    /// Locators in registration order.
    pub(crate) fn locator_list(&self) -> Vec<Arc<dyn DriverLocator>> {
        self.locators.iter().map(|l| Arc::clone(&l.locator)).collect()
    }

    /// `true` if `consumer` has registered at least one driver.
    pub(crate) fn is_driver_consumer(&self, consumer: &ConsumerId) -> bool {
        self.registry
            .registered_by(consumer)
            .iter()
            .any(|r| r.kind == CapabilityKind::Driver)
    }

    /// `true` if some driver consumer already uses `device`.
    pub(crate) fn is_attached(&self, device: ServiceId) -> bool {
        self.registry
            .users_of(device)
            .iter()
            .any(|user| self.is_driver_consumer(user))
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        let devices = self
            .devices
            .values()
            .map(|handle| {
                let props = self
                    .registry
                    .properties(handle.id())
                    .unwrap_or_else(|| handle.reference.properties.as_ref().clone());
                DeviceSummary {
                    id: handle.id(),
                    owner: handle.reference.owner.to_string(),
                    categories: props.get_list(DEVICE_CATEGORY),
                    users: self
                        .registry
                        .users_of(handle.id())
                        .into_iter()
                        .map(|u| u.to_string())
                        .collect(),
                }
            })
            .collect();

        let drivers = self
            .drivers
            .values()
            .map(|driver| DriverSummary {
                id: driver.service_id(),
                driver_id: driver.driver_id().to_string(),
                dynamic: driver.is_dynamic(),
                in_use: driver.is_in_use(self.registry.as_ref()),
            })
            .collect();

        EngineSnapshot {
            devices,
            drivers,
            locators: self.locators.len(),
            platform_running: self.platform.is_running(),
        }
    }
}
