//! # Engine Scenarios
//!
//! End-to-end attachment behaviour through a running engine worker. Callbacks
//! are invoked directly so every test controls exactly what the engine sees;
//! a snapshot acts as a barrier since it runs after everything queued before.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use das_core::capability::{ConsumerId, Device, Properties, ServiceRef, DEVICE_CATEGORY};
use das_core::core::{DriverSelector, Match};
use das_core::{Engine, EngineConfig, PlatformStatus};
use project_tests::{Harness, Recipe};

fn running_engine(h: &Harness) -> Engine {
    let engine = h.engine(EngineConfig::default(), PlatformStatus::running());
    engine.start().unwrap();
    engine
}

struct PickDriver(&'static str);

impl DriverSelector for PickDriver {
    fn select(&self, _device: &ServiceRef, matches: &[Match]) -> Option<usize> {
        matches.iter().position(|m| m.driver.driver_id().as_str() == self.0)
    }
}

#[tokio::test]
async fn highest_score_wins_and_the_other_driver_stays_unused() {
    let h = Harness::new();
    let a = h.add_driver("a", Recipe::scoring(5).for_category("printer"));
    let b = h.add_driver("b", Recipe::scoring(1).for_category("printer"));
    let (d1, hook) = h.add_device("d1", "printer");

    let engine = running_engine(&h);
    engine.driver_added(a).unwrap();
    engine.driver_added(b.clone()).unwrap();
    engine.device_added(d1.clone()).unwrap();
    let snapshot = engine.snapshot().await.unwrap();

    assert_eq!(h.users(d1.id()), vec!["bundle.a"]);
    assert!(snapshot.driver("a").unwrap().in_use);
    assert!(!snapshot.driver("b").unwrap().in_use);
    assert!(h.registry.capability(b.id()).is_some());
    assert_eq!(h.driver("b").attach_calls(), 0);
    assert_eq!(hook.no_driver_found_calls(), 0);
    engine.destroy().await;
}

#[tokio::test(start_paused = true)]
async fn removing_the_attached_driver_reattaches_through_the_idle_sweep() {
    let h = Harness::new();
    let a = h.add_driver("a", Recipe::scoring(5).for_category("printer"));
    let b = h.add_driver("b", Recipe::scoring(1).for_category("printer"));
    let (d1, _hook) = h.add_device("d1", "printer");

    let engine = running_engine(&h);
    engine.driver_added(a.clone()).unwrap();
    engine.driver_added(b).unwrap();
    engine.device_added(d1.clone()).unwrap();
    engine.snapshot().await.unwrap();
    assert_eq!(h.users(d1.id()), vec!["bundle.a"]);

    h.registry.uninstall_consumer(&Harness::driver_owner("a"));
    engine.driver_removed(a.reference.clone()).unwrap();
    let snapshot = engine.snapshot().await.unwrap();
    assert!(snapshot.driver("a").is_none());
    assert!(h.users(d1.id()).is_empty());

    tokio::time::sleep(Duration::from_millis(1500)).await;
    engine.snapshot().await.unwrap();
    assert_eq!(h.users(d1.id()), vec!["bundle.b"]);
    engine.destroy().await;
}

#[tokio::test]
async fn referral_loads_the_referred_driver_and_attaches_it() {
    let h = Harness::new();
    h.book.offer("x", Recipe::scoring(3).for_category("printer").hidden());
    let locator = h.add_book_locator();
    let a = h.add_driver("a", Recipe::scoring(5).for_category("printer").refers_to("x"));
    let (d1, hook) = h.add_device("d1", "printer");

    let engine = running_engine(&h);
    engine.locator_added(locator).unwrap();
    engine.driver_added(a.clone()).unwrap();
    engine.device_added(d1.clone()).unwrap();
    let snapshot = engine.snapshot().await.unwrap();

    assert_eq!(h.users(d1.id()), vec!["_DD_x"]);
    let x = snapshot.driver("x").unwrap();
    assert!(x.dynamic);
    assert!(x.in_use);
    assert_eq!(h.driver("a").attach_calls(), 1);
    assert!(h.registry.capability(a.id()).is_some());
    assert_eq!(h.catalog.loaded_ids(), vec!["x"]);
    assert!(h.catalog.unloaded_ids().is_empty());
    assert_eq!(hook.no_driver_found_calls(), 0);
    engine.destroy().await;
}

#[tokio::test]
async fn dynamically_loaded_referrer_is_unloaded_after_the_session() {
    let h = Harness::new();
    h.book.offer("a", Recipe::scoring(5).for_category("printer").refers_to("x"));
    h.book.offer("x", Recipe::scoring(3).for_category("printer").hidden());
    let locator = h.add_book_locator();
    let (d1, _hook) = h.add_device("d1", "printer");

    let engine = running_engine(&h);
    engine.locator_added(locator).unwrap();
    engine.device_added(d1.clone()).unwrap();
    let snapshot = engine.snapshot().await.unwrap();

    assert_eq!(h.users(d1.id()), vec!["_DD_x"]);
    assert_eq!(h.catalog.loaded_ids(), vec!["a", "x"]);
    assert_eq!(h.catalog.unloaded_ids(), vec!["a"]);
    assert!(snapshot.driver("a").is_none());
    assert!(snapshot.driver("x").is_some());
    engine.destroy().await;
}

#[tokio::test]
async fn no_matching_driver_notifies_the_device_once() {
    let h = Harness::new();
    let c = h.add_driver("c", Recipe::scoring(9).for_category("camera"));
    let (d1, hook) = h.add_device("d1", "printer");

    let engine = running_engine(&h);
    engine.driver_added(c).unwrap();
    engine.device_added(d1.clone()).unwrap();
    engine.snapshot().await.unwrap();

    assert_eq!(hook.no_driver_found_calls(), 1);
    assert!(h.users(d1.id()).is_empty());
    assert_eq!(h.driver("c").attach_calls(), 0);
    engine.destroy().await;
}

#[tokio::test]
async fn selector_overrides_the_default_pick() {
    let h = Harness::new();
    let a = h.add_driver("a", Recipe::scoring(20).for_category("printer"));
    let b = h.add_driver("b", Recipe::scoring(20).for_category("printer"));
    let (d1, _hook) = h.add_device("d1", "printer");

    let engine = running_engine(&h);
    engine.set_selector(Some(Arc::new(PickDriver("b")))).unwrap();
    engine.driver_added(a).unwrap();
    engine.driver_added(b).unwrap();
    engine.device_added(d1.clone()).unwrap();
    engine.snapshot().await.unwrap();

    assert_eq!(h.users(d1.id()), vec!["bundle.b"]);
    engine.destroy().await;
}

#[tokio::test]
async fn failed_attach_falls_back_to_the_next_candidate() {
    let h = Harness::new();
    let a = h.add_driver("a", Recipe::scoring(5).for_category("printer").failing());
    let b = h.add_driver("b", Recipe::scoring(1).for_category("printer"));
    let broken = h.add_driver("broken", Recipe::scoring(50).broken_match());
    let (d1, _hook) = h.add_device("d1", "printer");

    let engine = running_engine(&h);
    engine.driver_added(a).unwrap();
    engine.driver_added(b).unwrap();
    engine.driver_added(broken).unwrap();
    engine.device_added(d1.clone()).unwrap();
    engine.snapshot().await.unwrap();

    assert_eq!(h.users(d1.id()), vec!["bundle.b"]);
    assert_eq!(h.driver("a").attach_calls(), 1);
    assert_eq!(h.driver("broken").attach_calls(), 0);
    engine.destroy().await;
}

#[tokio::test]
async fn panicking_drivers_are_skipped_and_the_worker_keeps_running() {
    let h = Harness::new();
    let bad_match = h.add_driver("bad_match", Recipe::scoring(50).panicking_match());
    let bad_attach = h.add_driver("bad_attach", Recipe::scoring(9).for_category("printer").panicking_attach());
    let b = h.add_driver("b", Recipe::scoring(1).for_category("printer"));
    let (d1, _) = h.add_device("d1", "printer");
    let (d2, _) = h.add_device("d2", "printer");

    let engine = running_engine(&h);
    engine.driver_added(bad_match).unwrap();
    engine.driver_added(bad_attach).unwrap();
    engine.driver_added(b).unwrap();
    engine.device_added(d1.clone()).unwrap();
    engine.snapshot().await.unwrap();

    assert_eq!(h.users(d1.id()), vec!["bundle.b"]);
    assert_eq!(h.driver("bad_attach").attach_calls(), 1);
    assert_eq!(h.driver("bad_match").attach_calls(), 0);

    engine.device_added(d2.clone()).unwrap();
    engine.snapshot().await.unwrap();
    assert_eq!(h.users(d2.id()), vec!["bundle.b"]);
    assert!(!engine.is_destroyed());
    engine.destroy().await;
}

struct ExplodingDevice;

impl Device for ExplodingDevice {
    fn no_driver_found(&self) {
        panic!("device hook exploded");
    }
}

#[tokio::test]
async fn panic_inside_a_task_is_contained_at_the_task_boundary() {
    let h = Harness::new();
    let bomb = h.registry.register_device(
        &ConsumerId::new("hw.bomb"),
        Properties::new().with(DEVICE_CATEGORY, "printer"),
        Some(Arc::new(ExplodingDevice)),
    );

    let engine = running_engine(&h);
    engine.device_added(bomb).unwrap();
    let snapshot = engine.snapshot().await.unwrap();
    assert_eq!(snapshot.devices.len(), 1);

    let a = h.add_driver("a", Recipe::scoring(5).for_category("printer"));
    let (d2, _) = h.add_device("d2", "printer");
    engine.driver_added(a).unwrap();
    engine.device_added(d2.clone()).unwrap();
    engine.snapshot().await.unwrap();
    assert_eq!(h.users(d2.id()), vec!["bundle.a"]);
    engine.destroy().await;
}

#[tokio::test]
async fn failing_locator_still_ends_in_no_driver_found() {
    let h = Harness::new();
    let locator = h.add_failing_locator();
    let (d1, hook) = h.add_device("d1", "printer");

    let engine = running_engine(&h);
    engine.locator_added(locator).unwrap();
    engine.device_added(d1).unwrap();
    let snapshot = engine.snapshot().await.unwrap();

    assert_eq!(hook.no_driver_found_calls(), 1);
    assert_eq!(snapshot.locators, 1);
    engine.destroy().await;
}

#[tokio::test]
async fn catalog_failure_abandons_the_task_but_not_the_worker() {
    let h = Harness::new();
    let a = h.add_driver("a", Recipe::scoring(5).for_category("printer"));
    let (d1, hook) = h.add_device("d1", "printer");
    let (d2, _) = h.add_device("d2", "printer");

    let engine = running_engine(&h);
    engine.driver_added(a).unwrap();
    h.catalog.fail_find.store(true, Ordering::SeqCst);
    engine.device_added(d1.clone()).unwrap();
    engine.snapshot().await.unwrap();

    assert!(h.users(d1.id()).is_empty());
    assert_eq!(hook.no_driver_found_calls(), 0);

    h.catalog.fail_find.store(false, Ordering::SeqCst);
    engine.device_added(d2.clone()).unwrap();
    let snapshot = engine.snapshot().await.unwrap();
    assert_eq!(h.users(d2.id()), vec!["bundle.a"]);
    assert_eq!(snapshot.devices.len(), 2);
    engine.destroy().await;
}

#[tokio::test(start_paused = true)]
async fn failed_unload_is_retried_by_the_idle_sweep() {
    let h = Harness::new();
    h.book.offer("y", Recipe::scoring(0).for_category("printer"));
    let locator = h.add_book_locator();
    let z = h.add_driver("z", Recipe::scoring(1).for_category("camera"));
    let (d1, hook) = h.add_device("d1", "printer");
    h.installer.set_fail_uninstall(true);

    let engine = running_engine(&h);
    engine.locator_added(locator).unwrap();
    engine.driver_added(z.clone()).unwrap();
    engine.device_added(d1).unwrap();
    let snapshot = engine.snapshot().await.unwrap();

    assert_eq!(hook.no_driver_found_calls(), 1);
    let y = snapshot.driver("y").unwrap();
    assert!(y.dynamic);
    assert!(!y.in_use);
    assert!(h.catalog.unloaded_ids().is_empty());

    h.installer.set_fail_uninstall(false);
    h.registry.uninstall_consumer(&Harness::driver_owner("z"));
    engine.driver_removed(z.reference.clone()).unwrap();
    tokio::time::sleep(Duration::from_millis(1500)).await;
    let snapshot = engine.snapshot().await.unwrap();

    // The sweep re-ran the session (y is known, so not loaded again), then unloaded y.
    assert_eq!(hook.no_driver_found_calls(), 2);
    assert_eq!(h.catalog.loaded_ids(), vec!["y"]);
    assert_eq!(h.catalog.unloaded_ids(), vec!["y"]);
    assert!(snapshot.driver("y").is_none());
    engine.destroy().await;
}

#[tokio::test]
async fn snapshot_serializes_to_json() {
    let h = Harness::new();
    let a = h.add_driver("a", Recipe::scoring(5).for_category("printer"));
    let (d1, _hook) = h.add_device("d1", "printer");

    let engine = running_engine(&h);
    engine.driver_added(a).unwrap();
    engine.device_added(d1).unwrap();
    let snapshot = engine.snapshot().await.unwrap();
    let json = serde_json::to_value(&snapshot).unwrap();

    assert_eq!(json["devices"][0]["categories"][0], "printer");
    assert_eq!(json["devices"][0]["users"][0], "bundle.a");
    assert_eq!(json["drivers"][0]["driver_id"], "a");
    assert_eq!(json["platform_running"], true);
    engine.destroy().await;
}
