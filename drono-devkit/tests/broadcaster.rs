use std::time::Duration;

use drono_devkit::fixtures::Prefs;
use drono_devkit::{Liveness, TestHarness};
use drono_kernel::events::KernelEvent;

fn fleet(h: &TestHarness, devices: &[(&str, u64)]) {
    for (id, current) in devices {
        h.probe.add_device(id, Liveness::Alive);
        h.probe.set_config(id, Prefs::running(*current, 100).to_xml());
    }
}

fn changed_ids(event: &KernelEvent) -> (Vec<String>, bool) {
    match event {
        KernelEvent::StatusUpdate {
            devices_status,
            is_partial,
            ..
        } => (devices_status.keys().cloned().collect(), *is_partial),
        other => panic!("expected status_update, got {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_cycle_emits_only_changed_devices() {
    let h = TestHarness::new();
    fleet(&h, &[("x", 1), ("y", 5), ("z", 9)]);
    let (_handle, recorder) = h.record("dashboard");
    h.start_bus();

    assert_eq!(h.kernel.broadcaster.run_cycle().await, 3);

    // Past the full TTL so every device is re-read.
    tokio::time::advance(Duration::from_secs(16)).await;
    h.probe.set_config("x", Prefs::running(2, 100).to_xml());
    assert_eq!(h.kernel.broadcaster.run_cycle().await, 1);

    let updates = h.wait_for(&recorder, "status_update", 2, Duration::from_secs(1)).await;
    assert_eq!(updates.len(), 2);
    assert_eq!(
        changed_ids(&updates[0]),
        (vec!["x".to_string(), "y".to_string(), "z".to_string()], true)
    );
    assert_eq!(changed_ids(&updates[1]), (vec!["x".to_string()], true));
}

#[tokio::test(start_paused = true)]
async fn test_unchanged_cycle_emits_nothing() {
    let h = TestHarness::new();
    fleet(&h, &[("x", 1)]);
    let (_handle, recorder) = h.record("dashboard");
    h.start_bus();

    h.kernel.broadcaster.run_cycle().await;
    tokio::time::advance(Duration::from_secs(16)).await;
    assert_eq!(h.kernel.broadcaster.run_cycle().await, 0);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(recorder.of_kind("status_update").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_manual_refresh_is_complete_and_forced() {
    let h = TestHarness::new();
    fleet(&h, &[("x", 1), ("y", 5)]);
    let (_handle, recorder) = h.record("dashboard");
    h.start_bus();

    h.kernel.broadcaster.run_cycle().await;
    assert_eq!(h.probe.calls("config"), 2);

    // Within both TTLs, yet every snapshot is read again.
    let statuses = h.kernel.broadcaster.request_full_refresh().await;
    assert_eq!(statuses.len(), 2);
    assert_eq!(h.probe.calls("config"), 4);

    let updates = h.wait_for(&recorder, "status_update", 2, Duration::from_secs(1)).await;
    assert_eq!(
        changed_ids(&updates[1]),
        (vec!["x".to_string(), "y".to_string()], false)
    );

    // The manual refresh became the comparison baseline.
    tokio::time::advance(Duration::from_secs(16)).await;
    assert_eq!(h.kernel.broadcaster.run_cycle().await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_directory_outage_uses_cached_ids() {
    let h = TestHarness::new();
    fleet(&h, &[("x", 1), ("y", 2)]);
    h.kernel.broadcaster.run_cycle().await;

    h.probe.set_directory_down(true);
    assert_eq!(h.kernel.broadcaster.device_ids().await, vec!["x", "y"]);
}

#[tokio::test(start_paused = true)]
async fn test_config_changes_are_clamped_and_announced() {
    let h = TestHarness::new();
    let (_handle, recorder) = h.record("dashboard");
    h.start_bus();

    let cfg = h.kernel.broadcaster.set_config(true, 1);
    assert!(cfg.automatic);
    assert_eq!(cfg.interval, 5);

    let cfg = h.kernel.broadcaster.set_extended_interval(120);
    assert!(!cfg.automatic);
    assert_eq!(cfg.interval, 7200);
    assert_eq!(h.kernel.broadcaster.config(), cfg);

    let announced = h
        .wait_for(&recorder, "status_update_config", 2, Duration::from_secs(1))
        .await;
    match &announced[1] {
        KernelEvent::StatusUpdateConfig {
            automatic, interval, ..
        } => {
            assert!(!automatic);
            assert_eq!(*interval, 7200);
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_background_loop_follows_config() {
    let h = TestHarness::new();
    fleet(&h, &[("x", 1)]);
    let (_handle, recorder) = h.record("dashboard");
    let _tasks = h.kernel.start();

    // Automatic off by default: nothing is pushed.
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(recorder.of_kind("status_update").is_empty());

    h.kernel.broadcaster.set_config(true, 5);
    let updates = h.wait_for(&recorder, "status_update", 1, Duration::from_secs(10)).await;
    assert_eq!(updates.len(), 1);

    // Progress moves; the next automatic cycle picks it up.
    h.probe.set_config("x", Prefs::running(2, 100).to_xml());
    let updates = h.wait_for(&recorder, "status_update", 2, Duration::from_secs(60)).await;
    assert_eq!(changed_ids(&updates[1]), (vec!["x".to_string()], true));
}
