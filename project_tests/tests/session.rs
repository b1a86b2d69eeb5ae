//! Attachment sessions and idle sweeps driven directly on an `EngineState`,
//! without a worker. Follow-up work the state queues is read back from the
//! receiving end of its task queue.

use das_core::capability::{ConsumerId, DriverId, ServiceId};
use das_core::core::{SessionOutcome, Task};
use das_core::{EngineConfig, EngineError};
use project_tests::{Harness, Recipe};
use tokio::sync::mpsc::UnboundedReceiver;

fn queued(rx: &mut UnboundedReceiver<Task>) -> Vec<Task> {
    let mut tasks = Vec::new();
    while let Ok(task) = rx.try_recv() {
        tasks.push(task);
    }
    tasks
}

#[tokio::test]
async fn device_seen_before_its_driver_attaches_on_the_next_session() {
    let h = Harness::new();
    let (mut state, _rx) = h.state(EngineConfig::default());
    let (d1, hook) = h.add_device("d1", "printer");

    state.execute(Task::DeviceAdded(d1.clone())).await.unwrap();
    assert_eq!(hook.no_driver_found_calls(), 1);

    let a = h.add_driver("a", Recipe::scoring(5).for_category("printer"));
    state.execute(Task::DriverAdded(a)).await.unwrap();
    assert_eq!(state.attach_device(d1.id()).unwrap(), SessionOutcome::Attached(DriverId::new("a")));
    assert_eq!(state.attach_device(d1.id()).unwrap(), SessionOutcome::AlreadyAttached);
    assert_eq!(h.driver("a").attach_calls(), 1);
}

#[tokio::test]
async fn unknown_or_removed_devices_are_skipped() {
    let h = Harness::new();
    let (mut state, _rx) = h.state(EngineConfig::default());
    let (d1, _hook) = h.add_device("d1", "printer");

    assert_eq!(state.attach_device(ServiceId(999)).unwrap(), SessionOutcome::DeviceGone);

    state.execute(Task::DeviceAdded(d1.clone())).await.unwrap();
    state.execute(Task::DeviceRemoved(d1.id())).await.unwrap();
    assert_eq!(state.attach_device(d1.id()).unwrap(), SessionOutcome::DeviceGone);
    assert!(state.snapshot().devices.is_empty());
}

#[tokio::test]
async fn referral_cycle_ends_without_a_driver() {
    let h = Harness::new();
    let (mut state, _rx) = h.state(EngineConfig::default());
    let a = h.add_driver("a", Recipe::scoring(5).refers_to("b"));
    let b = h.add_driver("b", Recipe::scoring(3).refers_to("a"));
    state.execute(Task::DriverAdded(a)).await.unwrap();
    state.execute(Task::DriverAdded(b)).await.unwrap();

    let (d1, hook) = h.add_device("d1", "printer");
    state.execute(Task::DeviceAdded(d1.clone())).await.unwrap();

    assert_eq!(h.driver("a").attach_calls(), 1);
    assert_eq!(h.driver("b").attach_calls(), 1);
    assert_eq!(hook.no_driver_found_calls(), 1);
    assert!(h.users(d1.id()).is_empty());
    assert!(h.catalog.loaded_ids().is_empty());
}

#[tokio::test]
async fn attempt_cap_aborts_the_session() {
    let h = Harness::new();
    let config = EngineConfig {
        max_session_attempts: Some(1),
        ..EngineConfig::default()
    };
    let (mut state, _rx) = h.state(config);
    let a = h.add_driver("a", Recipe::scoring(5).failing());
    let b = h.add_driver("b", Recipe::scoring(1));
    state.execute(Task::DriverAdded(a)).await.unwrap();
    state.execute(Task::DriverAdded(b)).await.unwrap();

    let (d1, hook) = h.add_device("d1", "printer");
    let result = state.execute(Task::DeviceAdded(d1.clone())).await;

    assert!(matches!(
        result,
        Err(EngineError::SessionBoundExceeded { device, limit: 1 }) if device == d1.id()
    ));
    assert_eq!(h.driver("b").attach_calls(), 0);
    assert_eq!(hook.no_driver_found_calls(), 0);
}

#[tokio::test]
async fn stale_driver_announcement_is_ignored() {
    let h = Harness::new();
    let (mut state, _rx) = h.state(EngineConfig::default());
    let a = h.add_driver("a", Recipe::scoring(5));
    h.registry.unregister(a.id());

    state.execute(Task::DriverAdded(a)).await.unwrap();
    assert!(state.snapshot().drivers.is_empty());
}

#[tokio::test]
async fn driver_unregistered_before_its_removal_runs_is_never_attached() {
    let h = Harness::new();
    let (mut state, _rx) = h.state(EngineConfig::default());
    let a = h.add_driver("a", Recipe::scoring(5).for_category("printer"));
    let b = h.add_driver("b", Recipe::scoring(1).for_category("printer"));
    state.execute(Task::DriverAdded(a.clone())).await.unwrap();
    state.execute(Task::DriverAdded(b)).await.unwrap();

    h.registry.uninstall_consumer(&Harness::driver_owner("a"));
    let (d1, _) = h.add_device("d1", "printer");
    state.execute(Task::DeviceAdded(d1.clone())).await.unwrap();
    state.execute(Task::DriverRemoved(a.reference.clone())).await.unwrap();

    assert_eq!(h.users(d1.id()), vec!["bundle.b"]);
    assert_eq!(h.driver("a").attach_calls(), 0);
    assert!(state.snapshot().driver("a").is_none());
    assert!(state.idle_devices().is_empty());
    assert_eq!(state.attach_device(d1.id()).unwrap(), SessionOutcome::AlreadyAttached);
    assert_eq!(h.users(d1.id()), vec!["bundle.b"]);
}

#[tokio::test]
async fn idle_check_requeues_idle_devices_then_cleans_drivers() {
    let h = Harness::new();
    let (mut state, mut rx) = h.state(EngineConfig::default());
    let a = h.add_driver("a", Recipe::scoring(5).for_category("printer"));
    state.execute(Task::DriverAdded(a)).await.unwrap();

    let (d1, _) = h.add_device("d1", "printer");
    let (d2, _) = h.add_device("d2", "scanner");
    let (d3, _) = h.add_device("d3", "scanner");
    let (d4, _) = h.add_device("d4", "scanner");
    for device in [&d1, &d2, &d3, &d4] {
        state.execute(Task::DeviceAdded(device.clone())).await.unwrap();
    }
    h.registry.acquire(&ConsumerId::new("bundle.viewer"), d3.id());
    h.registry.acquire(&ConsumerId::new("das.engine"), d4.id());

    let idle: Vec<ServiceId> = state.idle_devices().into_iter().collect();
    assert_eq!(idle, vec![d2.id(), d4.id()]);

    assert!(queued(&mut rx).is_empty());
    state.execute(Task::CheckForIdleDevices).await.unwrap();
    let tasks = queued(&mut rx);
    assert_eq!(tasks.len(), 3);
    assert!(matches!(tasks[0], Task::Attach(id) if id == d2.id()));
    assert!(matches!(tasks[1], Task::Attach(id) if id == d4.id()));
    assert!(matches!(tasks[2], Task::UninstallIdleDrivers));
}

#[tokio::test]
async fn idle_cleanup_unloads_only_unused_dynamic_drivers() {
    let h = Harness::new();
    h.book.offer("q", Recipe::scoring(2).for_category("printer"));
    let locator = h.add_book_locator();
    let (mut state, _rx) = h.state(EngineConfig::default());
    let s = h.add_driver("s", Recipe::scoring(1).for_category("camera"));
    state.execute(Task::LocatorAdded(locator)).await.unwrap();
    state.execute(Task::DriverAdded(s)).await.unwrap();

    let (d1, _) = h.add_device("d1", "printer");
    state.execute(Task::DeviceAdded(d1.clone())).await.unwrap();
    assert_eq!(h.users(d1.id()), vec!["_DD_q"]);

    state.execute(Task::UninstallIdleDrivers).await.unwrap();
    assert!(h.catalog.unloaded_ids().is_empty());

    h.registry.release(&ConsumerId::new("_DD_q"), d1.id());
    state.execute(Task::UninstallIdleDrivers).await.unwrap();

    assert_eq!(h.catalog.unloaded_ids(), vec!["q"]);
    let snapshot = state.snapshot();
    assert!(snapshot.driver("q").is_none());
    assert!(snapshot.driver("s").is_some());
}

#[tokio::test]
async fn one_failed_uninstall_does_not_stop_the_cleanup() {
    let h = Harness::new();
    h.book.offer("p", Recipe::scoring(0).for_category("printer"));
    h.book.offer("q", Recipe::scoring(0).for_category("printer"));
    let locator = h.add_book_locator();
    let (mut state, _rx) = h.state(EngineConfig::default());
    state.execute(Task::LocatorAdded(locator)).await.unwrap();

    // Both loaded drivers survive the session because unloading fails.
    h.installer.set_fail_uninstall(true);
    let (d1, hook) = h.add_device("d1", "printer");
    state.execute(Task::DeviceAdded(d1)).await.unwrap();
    assert_eq!(hook.no_driver_found_calls(), 1);
    assert_eq!(h.catalog.loaded_ids(), vec!["p", "q"]);
    assert_eq!(state.snapshot().drivers.len(), 2);

    h.installer.set_fail_uninstall(false);
    h.installer.lock_owner("_DD_p");
    assert_eq!(state.uninstall_idle_drivers(), 1);

    assert_eq!(h.catalog.unloaded_ids(), vec!["q"]);
    let snapshot = state.snapshot();
    assert!(snapshot.driver("p").is_some());
    assert!(snapshot.driver("q").is_none());
}

#[tokio::test]
async fn platform_start_replays_every_known_device() {
    let h = Harness::new();
    let (mut state, mut rx) = h.state(EngineConfig::default());
    let (d1, _) = h.add_device("d1", "printer");
    let (d2, _) = h.add_device("d2", "camera");
    state.execute(Task::DeviceAdded(d1.clone())).await.unwrap();
    state.execute(Task::DeviceAdded(d2.clone())).await.unwrap();

    state.execute(Task::WaitForStart).await.unwrap();

    let tasks = queued(&mut rx);
    assert_eq!(tasks.len(), 2);
    assert!(matches!(tasks[0], Task::Attach(id) if id == d1.id()));
    assert!(matches!(tasks[1], Task::Attach(id) if id == d2.id()));
}
