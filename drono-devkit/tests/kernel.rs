use std::time::Duration;

use drono_devkit::fixtures::Prefs;
use drono_devkit::{Liveness, TestHarness};
use drono_kernel::commands::{CommandParams, DeviceAction};
use drono_kernel::error::CommandError;
use drono_kernel::events::KernelEvent;
use drono_kernel::http::handle_client_message;
use drono_kernel::models::RunState;

#[tokio::test]
async fn test_command_is_executed_and_announced() {
    let h = TestHarness::new();
    h.probe.add_device("a", Liveness::Alive);
    let (_handle, recorder) = h.record("dashboard");
    h.start_bus();

    let mut params = CommandParams::new();
    params.insert("iterations".into(), serde_json::json!(50));
    let outcome = h.kernel.execute_command("a", "start", &params).await.unwrap();

    assert!(outcome.success);
    let executed = h.probe.executed_commands();
    assert_eq!(executed.len(), 1);
    assert_eq!(executed[0].0, "a");
    assert_eq!(executed[0].1, DeviceAction::Start);
    assert_eq!(executed[0].2["iterations"], 50);

    // Success forces a full refresh of that device.
    assert_eq!(h.probe.calls("config"), 1);

    let results = h
        .wait_for(&recorder, "command_result", 1, Duration::from_secs(1))
        .await;
    match &results[0] {
        KernelEvent::CommandResult {
            device_id,
            command,
            result,
        } => {
            assert_eq!(device_id, "a");
            assert_eq!(command, "start");
            assert!(result.success);
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_failed_command_skips_refresh() {
    let h = TestHarness::new();
    h.probe.add_device("a", Liveness::Alive);
    h.probe.fail_command(DeviceAction::Stop, "all strategies failed");

    let outcome = h
        .kernel
        .execute_command("a", "stop", &CommandParams::new())
        .await
        .unwrap();

    assert!(!outcome.success);
    assert_eq!(outcome.message, "all strategies failed");
    assert_eq!(h.probe.calls("is_alive"), 0);
}

#[tokio::test]
async fn test_unknown_command_is_rejected_before_execution() {
    let h = TestHarness::new();
    let err = h
        .kernel
        .execute_command("a", "explode", &CommandParams::new())
        .await
        .unwrap_err();

    assert!(matches!(err, CommandError::UnknownAction(ref c) if c == "explode"));
    assert!(h.probe.executed_commands().is_empty());
}

#[tokio::test]
async fn test_reload_url_alias() {
    let h = TestHarness::new();
    h.probe.add_device("a", Liveness::Alive);
    h.kernel
        .execute_command("a", "reload_url", &CommandParams::new())
        .await
        .unwrap();
    assert_eq!(h.probe.executed_commands()[0].1, DeviceAction::Reload);
}

#[tokio::test]
async fn test_scan_lists_and_announces_devices() {
    let h = TestHarness::new();
    h.probe.add_device("a", Liveness::Alive).add_device("b", Liveness::Dead);
    let (_handle, recorder) = h.record("dashboard");
    h.start_bus();

    let devices = h.kernel.scan_devices().await;
    assert_eq!(devices.len(), 2);

    let lists = h.wait_for(&recorder, "device_list", 1, Duration::from_secs(1)).await;
    assert!(matches!(&lists[0], KernelEvent::DeviceList { count: 2, .. }));
}

#[tokio::test]
async fn test_directory_outage_lists_nothing() {
    let h = TestHarness::new();
    h.probe.add_device("a", Liveness::Alive);
    h.probe.set_directory_down(true);
    assert!(h.kernel.list_devices().await.is_empty());
}

#[tokio::test]
async fn test_client_messages() {
    let h = TestHarness::new();
    h.probe.add_device("a", Liveness::Alive);
    h.probe.set_config("a", Prefs::running(1, 4).to_xml());

    assert!(handle_client_message(&h.kernel, "{oops").await.is_none());

    match handle_client_message(&h.kernel, r#"{"type":"launch_rockets"}"#).await {
        Some(KernelEvent::Error { message }) => assert!(message.starts_with("unsupported message")),
        other => panic!("unexpected {:?}", other),
    }

    match handle_client_message(&h.kernel, r#"{"type":"scan_devices"}"#).await {
        Some(KernelEvent::DeviceList { count, .. }) => assert_eq!(count, 1),
        other => panic!("unexpected {:?}", other),
    }

    match handle_client_message(&h.kernel, r#"{"type":"get_device_status","device_id":"a"}"#).await {
        Some(KernelEvent::DeviceStatus { device_id, status, .. }) => {
            assert_eq!(device_id, "a");
            assert_eq!(status.status, RunState::Running);
            assert_eq!(status.percentage, 25.0);
        }
        other => panic!("unexpected {:?}", other),
    }

    match handle_client_message(&h.kernel, r#"{"type":"get_status"}"#).await {
        Some(KernelEvent::StatusUpdate {
            devices_status,
            is_partial,
            ..
        }) => {
            assert!(!is_partial);
            assert!(devices_status.contains_key("a"));
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_client_command_replies_through_bus_only() {
    let h = TestHarness::new();
    h.probe.add_device("a", Liveness::Alive);

    let ok = r#"{"type":"execute_command","device_id":"a","command":"pause"}"#;
    assert!(handle_client_message(&h.kernel, ok).await.is_none());
    assert_eq!(h.probe.executed_commands()[0].1, DeviceAction::Pause);

    let bad = r#"{"type":"execute_command","device_id":"a","command":"warp"}"#;
    assert!(matches!(
        handle_client_message(&h.kernel, bad).await,
        Some(KernelEvent::Error { .. })
    ));
}

#[tokio::test]
async fn test_health_reflects_kernel_state() {
    let h = TestHarness::new();
    h.probe.add_device("a", Liveness::Alive);
    let (_handle, _recorder) = h.record("dashboard");
    h.kernel.device_status("a", true).await;

    let health = h.kernel.health();
    assert_eq!(health.devices_tracked, 1);
    assert_eq!(health.active_channels, vec!["dashboard"]);
    assert_eq!(health.subscribers, 1);
    assert_eq!(health.mqtt_status, "disabled");
    assert!(!health.broadcast.automatic);
}
