//! # Engine Handle
//!
//! [`Engine`] is the cloneable front of the device access engine. Registry
//! callbacks go through it and only enqueue work; a single worker task owns
//! the [`EngineState`] and runs the queued tasks one at a time.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use das_core::capability::InMemoryRegistry;
//! # use das_core::catalog::DriverCatalog;
//! # use das_core::configs::EngineConfig;
//! # use das_core::core::{Engine, PlatformStatus};
//! # async fn demo(catalog: Arc<dyn DriverCatalog>) -> Result<(), das_core::error::EngineError> {
//! let registry = InMemoryRegistry::new();
//! let engine = Engine::new(EngineConfig::default(), Arc::new(registry.clone()), catalog, PlatformStatus::running());
//! engine.follow(registry.subscribe());
//! engine.start()?;
//! let snapshot = engine.snapshot().await?;
//! println!("{} devices", snapshot.devices.len());
//! engine.destroy().await;
//! # Ok(()) }
//! ```

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::driver_attributes::panic_message;
use super::matcher::DriverSelector;
use super::startup::PlatformStatus;
use super::state::{EngineSnapshot, EngineState, Task};
use super::worker::{NamedTask, TaskQueue};
use crate::capability::{Capability, DeviceHandle, DriverHandle, LocatorHandle, Registry, RegistryEvent, ServiceId, ServiceRef};
use crate::catalog::DriverCatalog;
use crate::configs::EngineConfig;
use crate::error::EngineError;

struct Pending {
    state: EngineState,
    rx: mpsc::UnboundedReceiver<Task>,
}

struct Slots {
    pending: Option<Pending>,
    worker: Option<JoinHandle<()>>,
}

#[derive(Clone)]
pub struct Engine {
    queue: TaskQueue<Task>,
    slots: Arc<Mutex<Slots>>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        registry: Arc<dyn Registry>,
        catalog: Arc<dyn DriverCatalog>,
        platform: PlatformStatus,
    ) -> Self {
        let (queue, rx) = TaskQueue::new();
        let state = EngineState::new(config, registry, catalog, platform, queue.clone());
        let slots = Slots {
            pending: Some(Pending { state, rx }),
            worker: None,
        };
        Self {
            queue,
            slots: Arc::new(Mutex::new(slots)),
        }
    }

    fn slots(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Spawns the worker. Its first task waits for the platform to start.
    ///
    /// Callbacks made before `start` are queued and run once the gate opens.
    pub fn start(&self) -> Result<(), EngineError> {
        if self.queue.is_shutdown() {
            return Err(EngineError::Shutdown);
        }
        let mut slots = self.slots();
        let Some(Pending { state, rx }) = slots.pending.take() else {
            warn!("engine already started");
            return Ok(());
        };
        info!("starting device access engine");
        let token = self.queue.token().clone();
        slots.worker = Some(tokio::spawn(run_worker(state, rx, token)));
        Ok(())
    }

    pub fn stop(&self) {
        info!("device access engine stopping");
    }

    /// Stops the worker, drops pending delayed tasks and interrupts the
    /// startup wait. Waits for the task that is currently running.
    pub async fn destroy(&self) {
        self.queue.shutdown();
        let worker = self.slots().worker.take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                error!(error = %e, "engine worker ended abnormally");
            }
        }
        info!("device access engine destroyed");
    }

    pub fn is_destroyed(&self) -> bool {
        self.queue.is_shutdown()
    }

    pub fn locator_added(&self, locator: LocatorHandle) -> Result<(), EngineError> {
        self.queue.submit(Task::LocatorAdded(locator))
    }

    pub fn locator_removed(&self, id: ServiceId) -> Result<(), EngineError> {
        self.queue.submit(Task::LocatorRemoved(id))
    }

    pub fn driver_added(&self, driver: DriverHandle) -> Result<(), EngineError> {
        self.queue.submit(Task::DriverAdded(driver))
    }

    pub fn driver_removed(&self, driver: ServiceRef) -> Result<(), EngineError> {
        self.queue.submit(Task::DriverRemoved(driver))
    }

    /// Records the device and runs an attachment session for it.
    pub fn device_added(&self, device: DeviceHandle) -> Result<(), EngineError> {
        self.queue.submit(Task::DeviceAdded(device))
    }

    pub fn device_modified(&self, device: ServiceRef) -> Result<(), EngineError> {
        self.queue.submit(Task::DeviceModified(device))
    }

    pub fn device_removed(&self, id: ServiceId) -> Result<(), EngineError> {
        self.queue.submit(Task::DeviceRemoved(id))
    }

    /// Installs (or with `None`, removes) the external driver selector.
    pub fn set_selector(&self, selector: Option<Arc<dyn DriverSelector>>) -> Result<(), EngineError> {
        self.queue.submit(Task::SetSelector(selector))
    }

    /// Routes one registry change to the matching callback.
    pub fn on_registry_event(&self, event: RegistryEvent) -> Result<(), EngineError> {
        match event {
            RegistryEvent::Registered(capability) => match capability {
                Capability::Device(handle) => self.device_added(handle),
                Capability::Driver(handle) => self.driver_added(handle),
                Capability::Locator(handle) => self.locator_added(handle),
            },
            RegistryEvent::Modified(Capability::Device(handle)) => self.device_modified(handle.reference),
            RegistryEvent::Modified(other) => {
                debug!(service = %other.reference(), "capability modified");
                Ok(())
            }
            RegistryEvent::Unregistered(capability) => match capability {
                Capability::Device(handle) => self.device_removed(handle.id()),
                Capability::Driver(handle) => self.driver_removed(handle.reference),
                Capability::Locator(handle) => self.locator_removed(handle.id()),
            },
        }
    }

    /// Forwards registry events to the engine until either side goes away.
    pub fn follow(&self, mut events: mpsc::UnboundedReceiver<RegistryEvent>) -> JoinHandle<()> {
        let engine = self.clone();
        let token = self.queue.token().clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                if let Err(e) = engine.on_registry_event(event) {
                    debug!(error = %e, "registry event dropped");
                    break;
                }
            }
            debug!("registry follower finished");
        })
    }

    /// Takes a snapshot on the worker, after everything queued before it.
    ///
    /// Only completes once the engine has been started and the platform is up.
    pub async fn snapshot(&self) -> Result<EngineSnapshot, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.queue.submit(Task::Snapshot(tx))?;
        rx.await.map_err(|_| EngineError::WorkerGone)
    }
}

async fn run_worker(mut state: EngineState, mut rx: mpsc::UnboundedReceiver<Task>, token: CancellationToken) {
    run_task(&mut state, Task::WaitForStart).await;
    loop {
        let task = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            task = rx.recv() => match task {
                Some(task) => task,
                None => break,
            },
        };
        run_task(&mut state, task).await;
    }
    debug!("engine worker stopped");
}

/// Task boundary: errors and panics are logged and the worker carries on.
async fn run_task(state: &mut EngineState, task: Task) {
    let name = task.name();
    let result = match task {
        Task::WaitForStart => state.wait_for_start().await,
        task => match panic::catch_unwind(AssertUnwindSafe(|| state.apply(task))) {
            Ok(result) => result,
            Err(payload) => {
                error!(task = name, panic = %panic_message(payload.as_ref()), "task panicked");
                return;
            }
        },
    };
    match result {
        Ok(()) => {}
        Err(EngineError::Shutdown) => debug!(task = name, "task interrupted by shutdown"),
        Err(e) => error!(task = name, error = %e, "task failed"),
    }
}
