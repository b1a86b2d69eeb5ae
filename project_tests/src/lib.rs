//! # Engine Test Fixtures
//!
//! Scripted drivers, recording devices, locators and catalog wrappers shared
//! by the integration tests under `tests/`.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use das_core::capability::{
    ConsumerId, Device, DeviceHandle, Driver, DriverHandle, DriverId, InMemoryRegistry, LocatorHandle, Properties,
    Registry, ServiceId, ServiceRef, DEVICE_CATEGORY, DRIVER_ID, MATCH_NONE,
};
use das_core::catalog::{
    DriverCatalog, DriverInstaller, DriverLocator, DriverPackage, LocatorCatalog, RegistryInstaller, driver_location,
};
use das_core::core::{DriverAttributes, EngineState, Task, TaskQueue};
use das_core::error::{CatalogError, DriverError};
use das_core::{Engine, EngineConfig, EngineError, EngineSnapshot, PlatformStatus};
use tokio::sync::mpsc;

/// What a scripted driver does when asked to attach.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OnAttach {
    /// Takes the device by acquiring it in the registry.
    Acquire,
    Refer(String),
    Fail,
    Panic,
}

/// Behaviour of one scripted driver.
#[derive(Debug, Clone)]
pub struct Recipe {
    pub score: i32,
    pub categories: Vec<String>,
    pub on_attach: OnAttach,
    pub match_error: bool,
    pub match_panics: bool,
    /// Whether a [`BookLocator`] reports this driver from `find_drivers`.
    pub advertised: bool,
}

impl Recipe {
    pub fn scoring(score: i32) -> Self {
        Self {
            score,
            categories: Vec::new(),
            on_attach: OnAttach::Acquire,
            match_error: false,
            match_panics: false,
            advertised: true,
        }
    }

    pub fn for_category(mut self, category: &str) -> Self {
        self.categories.push(category.to_string());
        self
    }

    pub fn refers_to(mut self, driver_id: &str) -> Self {
        self.on_attach = OnAttach::Refer(driver_id.to_string());
        self
    }

    pub fn failing(mut self) -> Self {
        self.on_attach = OnAttach::Fail;
        self
    }

    pub fn broken_match(mut self) -> Self {
        self.match_error = true;
        self
    }

    pub fn panicking_match(mut self) -> Self {
        self.match_panics = true;
        self
    }

    pub fn panicking_attach(mut self) -> Self {
        self.on_attach = OnAttach::Panic;
        self
    }

    /// Loadable by id, but never reported by `find_drivers`.
    pub fn hidden(mut self) -> Self {
        self.advertised = false;
        self
    }

    fn accepts(&self, categories: &[String]) -> bool {
        self.categories.is_empty() || self.categories.iter().any(|c| categories.contains(c))
    }
}

pub struct ScriptedDriver {
    recipe: Recipe,
    owner: ConsumerId,
    registry: InMemoryRegistry,
    attaches: AtomicUsize,
}

impl ScriptedDriver {
    pub fn new(recipe: Recipe, owner: ConsumerId, registry: InMemoryRegistry) -> Self {
        Self {
            recipe,
            owner,
            registry,
            attaches: AtomicUsize::new(0),
        }
    }

    pub fn attach_calls(&self) -> usize {
        self.attaches.load(Ordering::SeqCst)
    }
}

impl Driver for ScriptedDriver {
    fn match_device(&self, device: &ServiceRef) -> Result<i32, DriverError> {
        if self.recipe.match_panics {
            panic!("scripted match panic");
        }
        if self.recipe.match_error {
            return Err(DriverError::Match("scripted match failure".into()));
        }
        if self.recipe.accepts(&device.properties.get_list(DEVICE_CATEGORY)) {
            Ok(self.recipe.score)
        } else {
            Ok(MATCH_NONE)
        }
    }

    fn attach(&self, device: &ServiceRef) -> Result<Option<DriverId>, DriverError> {
        self.attaches.fetch_add(1, Ordering::SeqCst);
        match &self.recipe.on_attach {
            OnAttach::Acquire => {
                self.registry.acquire(&self.owner, device.id);
                Ok(None)
            }
            OnAttach::Refer(next) => Ok(Some(DriverId::new(next.as_str()))),
            OnAttach::Fail => Err(DriverError::Attach("scripted attach failure".into())),
            OnAttach::Panic => panic!("scripted attach panic"),
        }
    }
}

/// A device that counts how often it was told no driver fits.
#[derive(Default)]
pub struct RecordingDevice {
    no_driver_found: AtomicUsize,
}

impl RecordingDevice {
    pub fn no_driver_found_calls(&self) -> usize {
        self.no_driver_found.load(Ordering::SeqCst)
    }
}

impl Device for RecordingDevice {
    fn no_driver_found(&self) {
        self.no_driver_found.fetch_add(1, Ordering::SeqCst);
    }
}

/// Recipes of drivers that can be located and loaded, keyed by driver id.
#[derive(Clone, Default)]
pub struct DriverBook {
    recipes: Arc<Mutex<BTreeMap<String, Recipe>>>,
}

impl DriverBook {
    pub fn offer(&self, driver_id: &str, recipe: Recipe) {
        self.recipes.lock().unwrap().insert(driver_id.to_string(), recipe);
    }

    pub fn recipe(&self, driver_id: &str) -> Option<Recipe> {
        self.recipes.lock().unwrap().get(driver_id).cloned()
    }
}

/// Locator backed by a [`DriverBook`].
pub struct BookLocator {
    book: DriverBook,
}

impl DriverLocator for BookLocator {
    fn find_drivers(&self, props: &Properties) -> Result<Vec<DriverId>, CatalogError> {
        let categories = props.get_list(DEVICE_CATEGORY);
        Ok(self
            .book
            .recipes
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, recipe)| recipe.advertised && recipe.accepts(&categories))
            .map(|(id, _)| DriverId::new(id.as_str()))
            .collect())
    }

    fn load_driver(&self, id: &DriverId) -> Result<Option<DriverPackage>, CatalogError> {
        Ok(self.book.recipe(id.as_str()).map(|_| DriverPackage {
            driver_id: id.clone(),
            payload: id.as_str().as_bytes().to_vec(),
        }))
    }
}

/// A locator whose discovery always fails.
pub struct FailingLocator;

impl DriverLocator for FailingLocator {
    fn find_drivers(&self, _props: &Properties) -> Result<Vec<DriverId>, CatalogError> {
        Err(CatalogError::Locator("catalog server unreachable".into()))
    }

    fn load_driver(&self, _id: &DriverId) -> Result<Option<DriverPackage>, CatalogError> {
        Err(CatalogError::Locator("catalog server unreachable".into()))
    }
}

/// Registry installer whose uninstall can be made to fail, for every owner
/// or for chosen ones.
pub struct FlakyInstaller {
    inner: RegistryInstaller,
    fail_uninstall: AtomicBool,
    locked_owners: Mutex<BTreeSet<String>>,
}

impl FlakyInstaller {
    pub fn set_fail_uninstall(&self, fail: bool) {
        self.fail_uninstall.store(fail, Ordering::SeqCst);
    }

    /// Makes uninstalling `owner` fail until further notice.
    pub fn lock_owner(&self, owner: &str) {
        self.locked_owners.lock().unwrap().insert(owner.to_string());
    }
}

impl DriverInstaller for FlakyInstaller {
    fn install(&self, location: &str, package: DriverPackage) -> Result<Vec<DriverHandle>, CatalogError> {
        self.inner.install(location, package)
    }

    fn uninstall(&self, owner: &ConsumerId) -> Result<(), CatalogError> {
        if self.fail_uninstall.load(Ordering::SeqCst) || self.locked_owners.lock().unwrap().contains(owner.as_str()) {
            return Err(CatalogError::Locator(format!("{} is locked", owner)));
        }
        self.inner.uninstall(owner)
    }
}

/// Delegates to a [`LocatorCatalog`] and records every call.
pub struct CountingCatalog {
    inner: LocatorCatalog,
    pub finds: AtomicUsize,
    pub loaded: Mutex<Vec<DriverId>>,
    pub unloaded: Mutex<Vec<DriverId>>,
    pub fail_find: AtomicBool,
}

impl CountingCatalog {
    pub fn loaded_ids(&self) -> Vec<String> {
        self.loaded.lock().unwrap().iter().map(|id| id.to_string()).collect()
    }

    pub fn unloaded_ids(&self) -> Vec<String> {
        self.unloaded.lock().unwrap().iter().map(|id| id.to_string()).collect()
    }
}

impl DriverCatalog for CountingCatalog {
    fn find_drivers(&self, locators: &[Arc<dyn DriverLocator>], props: &Properties) -> Result<Vec<DriverId>, CatalogError> {
        self.finds.fetch_add(1, Ordering::SeqCst);
        if self.fail_find.load(Ordering::SeqCst) {
            return Err(CatalogError::Locator("catalog offline".into()));
        }
        self.inner.find_drivers(locators, props)
    }

    fn load_drivers(&self, locators: &[Arc<dyn DriverLocator>], ids: &[DriverId]) -> Result<Vec<DriverHandle>, CatalogError> {
        let handles = self.inner.load_drivers(locators, ids)?;
        self.loaded
            .lock()
            .unwrap()
            .extend(handles.iter().map(|h| h.driver_id()));
        Ok(handles)
    }

    fn unload(&self, driver: &DriverAttributes) -> Result<(), CatalogError> {
        self.inner.unload(driver)?;
        self.unloaded.lock().unwrap().push(driver.driver_id().clone());
        Ok(())
    }
}

/// A registry, a driver book and a catalog wired together.
pub struct Harness {
    pub registry: InMemoryRegistry,
    pub book: DriverBook,
    pub installer: Arc<FlakyInstaller>,
    pub catalog: Arc<CountingCatalog>,
    drivers: Mutex<BTreeMap<String, Arc<ScriptedDriver>>>,
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

impl Harness {
    pub fn new() -> Self {
        let registry = InMemoryRegistry::new();
        let book = DriverBook::default();
        let factory_book = book.clone();
        let factory_registry = registry.clone();
        let inner = RegistryInstaller::new(
            registry.clone(),
            Box::new(move |package: &DriverPackage| -> Result<(Properties, Arc<dyn Driver>), CatalogError> {
                let recipe = factory_book
                    .recipe(package.driver_id.as_str())
                    .ok_or_else(|| CatalogError::Install {
                        location: driver_location(&package.driver_id),
                        reason: "unknown recipe".into(),
                    })?;
                let owner = ConsumerId::new(driver_location(&package.driver_id));
                let driver: Arc<dyn Driver> = Arc::new(ScriptedDriver::new(recipe, owner, factory_registry.clone()));
                Ok((Properties::new(), driver))
            }),
        );
        let installer = Arc::new(FlakyInstaller {
            inner,
            fail_uninstall: AtomicBool::new(false),
            locked_owners: Mutex::new(BTreeSet::new()),
        });
        let catalog = Arc::new(CountingCatalog {
            inner: LocatorCatalog::new(installer.clone()),
            finds: AtomicUsize::new(0),
            loaded: Mutex::new(Vec::new()),
            unloaded: Mutex::new(Vec::new()),
            fail_find: AtomicBool::new(false),
        });
        Self {
            registry,
            book,
            installer,
            catalog,
            drivers: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn engine(&self, config: EngineConfig, platform: PlatformStatus) -> Engine {
        Engine::new(config, Arc::new(self.registry.clone()), self.catalog.clone(), platform)
    }

    /// Engine state without a worker, plus the receiving end of its queue.
    pub fn state(&self, config: EngineConfig) -> (EngineState, mpsc::UnboundedReceiver<Task>) {
        let (queue, rx) = TaskQueue::new();
        let state = EngineState::new(
            config,
            Arc::new(self.registry.clone()),
            self.catalog.clone(),
            PlatformStatus::running(),
            queue,
        );
        (state, rx)
    }

    /// Registers a statically installed driver owned by `bundle.<driver_id>`.
    pub fn add_driver(&self, driver_id: &str, recipe: Recipe) -> DriverHandle {
        let owner = Self::driver_owner(driver_id);
        let driver = Arc::new(ScriptedDriver::new(recipe, owner.clone(), self.registry.clone()));
        self.drivers.lock().unwrap().insert(driver_id.to_string(), driver.clone());
        self.registry
            .register_driver(&owner, Properties::new().with(DRIVER_ID, driver_id), driver)
    }

    pub fn driver_owner(driver_id: &str) -> ConsumerId {
        ConsumerId::new(format!("bundle.{}", driver_id))
    }

    /// The scripted driver registered through [`Harness::add_driver`].
    pub fn driver(&self, driver_id: &str) -> Arc<ScriptedDriver> {
        self.drivers.lock().unwrap()[driver_id].clone()
    }

    pub fn add_device(&self, name: &str, category: &str) -> (DeviceHandle, Arc<RecordingDevice>) {
        let hook = Arc::new(RecordingDevice::default());
        let handle = self.registry.register_device(
            &ConsumerId::new(format!("hw.{}", name)),
            Properties::new().with(DEVICE_CATEGORY, category),
            Some(hook.clone()),
        );
        (handle, hook)
    }

    pub fn add_book_locator(&self) -> LocatorHandle {
        let locator = BookLocator { book: self.book.clone() };
        self.registry
            .register_locator(&ConsumerId::new("bundle.locator"), Properties::new(), Arc::new(locator))
    }

    pub fn add_failing_locator(&self) -> LocatorHandle {
        self.registry
            .register_locator(&ConsumerId::new("bundle.broken"), Properties::new(), Arc::new(FailingLocator))
    }

    /// Owners currently using `device`, as strings.
    pub fn users(&self, device: ServiceId) -> Vec<String> {
        self.registry.users_of(device).into_iter().map(|u| u.to_string()).collect()
    }
}

/// Polls snapshots until `done` holds or a second has passed.
pub async fn wait_until<F>(engine: &Engine, mut done: F) -> Result<EngineSnapshot, EngineError>
where
    F: FnMut(&EngineSnapshot) -> bool,
{
    let mut snapshot = engine.snapshot().await?;
    for _ in 0..100 {
        if done(&snapshot) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        snapshot = engine.snapshot().await?;
    }
    Ok(snapshot)
}
