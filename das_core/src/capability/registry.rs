//! # Capability Registry
//!
//! The engine only ever reads the registry through the narrow [`Registry`]
//! trait. [`InMemoryRegistry`] is a complete, thread-safe implementation used
//! by the bootstrap binary and the tests: it assigns service ids, keeps
//! reference-counted usage per consumer and publishes change events.
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;

use super::handle::{
    Capability, CapabilityKind, ConsumerId, Device, DeviceHandle, Driver, DriverHandle, LocatorHandle,
    ServiceId, ServiceRef,
};
use super::properties::{Filter, Properties};
use crate::catalog::DriverLocator;

/// Read-only view of the capability registry.
pub trait Registry: Send + Sync {
    /// Every registered capability of `kind` whose properties satisfy `filter`.
    fn query(&self, kind: CapabilityKind, filter: &Filter) -> Vec<ServiceRef>;

    fn properties(&self, id: ServiceId) -> Option<Properties>;

    /// Consumers currently holding a reference to `id`.
    fn users_of(&self, id: ServiceId) -> Vec<ConsumerId>;

    /// Capabilities registered by `consumer`.
    fn registered_by(&self, consumer: &ConsumerId) -> Vec<ServiceRef>;
}

/// A change published by [`InMemoryRegistry`].
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    Registered(Capability),
    Modified(Capability),
    Unregistered(Capability),
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    services: BTreeMap<ServiceId, Capability>,
    // service -> (consumer -> reference count)
    usage: HashMap<ServiceId, HashMap<ConsumerId, u32>>,
    listeners: Vec<mpsc::UnboundedSender<RegistryEvent>>,
}

impl Inner {
    fn publish(&mut self, event: RegistryEvent) {
        self.listeners.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

#[derive(Clone, Default)]
pub struct InMemoryRegistry {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Receives every subsequent registration change.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<RegistryEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().listeners.push(tx);
        rx
    }

    fn next_ref(inner: &mut Inner, kind: CapabilityKind, owner: &ConsumerId, props: Properties) -> ServiceRef {
        inner.next_id += 1;
        ServiceRef::new(ServiceId(inner.next_id), kind, owner.clone(), props)
    }

    fn insert(&self, capability: Capability) {
        let mut inner = self.lock();
        tracing::debug!(service = %capability.reference(), "registered");
        inner.services.insert(capability.reference().id, capability.clone());
        inner.publish(RegistryEvent::Registered(capability));
    }

    pub fn register_device(
        &self,
        owner: &ConsumerId,
        props: Properties,
        device: Option<Arc<dyn Device>>,
    ) -> DeviceHandle {
        let reference = Self::next_ref(&mut self.lock(), CapabilityKind::Device, owner, props);
        let handle = DeviceHandle::new(reference, device);
        self.insert(Capability::Device(handle.clone()));
        handle
    }

    pub fn register_driver(&self, owner: &ConsumerId, props: Properties, driver: Arc<dyn Driver>) -> DriverHandle {
        let reference = Self::next_ref(&mut self.lock(), CapabilityKind::Driver, owner, props);
        let handle = DriverHandle::new(reference, driver);
        self.insert(Capability::Driver(handle.clone()));
        handle
    }

    pub fn register_locator(
        &self,
        owner: &ConsumerId,
        props: Properties,
        locator: Arc<dyn DriverLocator>,
    ) -> LocatorHandle {
        let reference = Self::next_ref(&mut self.lock(), CapabilityKind::Locator, owner, props);
        let handle = LocatorHandle::new(reference, locator);
        self.insert(Capability::Locator(handle.clone()));
        handle
    }

    /// Replaces the property set of a registered capability.
    pub fn set_properties(&self, id: ServiceId, props: Properties) -> Option<Capability> {
        let mut inner = self.lock();
        let updated = {
            let entry = inner.services.get_mut(&id)?;
            let reference = entry.reference();
            let reference = ServiceRef::new(reference.id, reference.kind, reference.owner.clone(), props);
            *entry = match entry.clone() {
                Capability::Device(h) => Capability::Device(DeviceHandle::new(reference, h.device)),
                Capability::Driver(h) => Capability::Driver(DriverHandle::new(reference, h.driver)),
                Capability::Locator(h) => Capability::Locator(LocatorHandle::new(reference, h.locator)),
            };
            entry.clone()
        };
        inner.publish(RegistryEvent::Modified(updated.clone()));
        Some(updated)
    }

    pub fn unregister(&self, id: ServiceId) -> Option<Capability> {
        let mut inner = self.lock();
        let removed = inner.services.remove(&id)?;
        inner.usage.remove(&id);
        tracing::debug!(service = %removed.reference(), "unregistered");
        inner.publish(RegistryEvent::Unregistered(removed.clone()));
        Some(removed)
    }

    /// Unregisters everything `consumer` registered and drops everything it holds.
    pub fn uninstall_consumer(&self, consumer: &ConsumerId) -> Vec<Capability> {
        let owned: Vec<ServiceId> = {
            let mut inner = self.lock();
            for holders in inner.usage.values_mut() {
                holders.remove(consumer);
            }
            inner
                .services
                .values()
                .filter(|c| &c.reference().owner == consumer)
                .map(|c| c.reference().id)
                .collect()
        };
        owned.into_iter().filter_map(|id| self.unregister(id)).collect()
    }

    /// Records that `consumer` holds a reference to `id`. Returns `false` for unknown services.
    pub fn acquire(&self, consumer: &ConsumerId, id: ServiceId) -> bool {
        let mut inner = self.lock();
        if !inner.services.contains_key(&id) {
            return false;
        }
        let count = inner.usage.entry(id).or_default().entry(consumer.clone()).or_insert(0);
        *count += 1;
        true
    }

    /// Drops one reference of `consumer` to `id`.
    pub fn release(&self, consumer: &ConsumerId, id: ServiceId) {
        let mut inner = self.lock();
        if let Some(holders) = inner.usage.get_mut(&id) {
            if let Some(count) = holders.get_mut(consumer) {
                if *count > 0 {
                    *count -= 1;
                }
                if *count == 0 {
                    holders.remove(consumer);
                }
            }
        }
    }

    pub fn capability(&self, id: ServiceId) -> Option<Capability> {
        self.lock().services.get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().services.is_empty()
    }
}

impl Registry for InMemoryRegistry {
    fn query(&self, kind: CapabilityKind, filter: &Filter) -> Vec<ServiceRef> {
        self.lock()
            .services
            .values()
            .map(Capability::reference)
            .filter(|r| r.kind == kind && filter.matches(&r.properties))
            .cloned()
            .collect()
    }

    fn properties(&self, id: ServiceId) -> Option<Properties> {
        self.lock()
            .services
            .get(&id)
            .map(|c| c.reference().properties.as_ref().clone())
    }

    fn users_of(&self, id: ServiceId) -> Vec<ConsumerId> {
        let inner = self.lock();
        let mut users: Vec<ConsumerId> = inner
            .usage
            .get(&id)
            .map(|holders| holders.keys().cloned().collect())
            .unwrap_or_default();
        users.sort();
        users
    }

    fn registered_by(&self, consumer: &ConsumerId) -> Vec<ServiceRef> {
        self.lock()
            .services
            .values()
            .map(Capability::reference)
            .filter(|r| &r.owner == consumer)
            .cloned()
            .collect()
    }
}
