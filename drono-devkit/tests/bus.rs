use std::sync::Arc;
use std::time::Duration;

use drono_devkit::{FailingSubscriber, TestHarness};
use drono_kernel::events::KernelEvent;

#[tokio::test]
async fn test_failing_subscriber_is_dropped_without_starving_others() {
    let h = TestHarness::new();
    let (_handle, recorder) = h.record("dashboard");
    let failing = Arc::new(FailingSubscriber::default());
    h.kernel.bus.subscribe("dashboard", failing.clone());
    assert_eq!(h.kernel.bus.channel_len("dashboard"), 2);

    let delivered = h.kernel.bus.publish("dashboard", &KernelEvent::error("first")).await;
    assert_eq!(delivered, 1);
    assert_eq!(h.kernel.bus.channel_len("dashboard"), 1);

    h.kernel.bus.publish("dashboard", &KernelEvent::error("second")).await;
    assert_eq!(failing.attempts(), 1);
    assert_eq!(recorder.len(), 2);
}

#[tokio::test]
async fn test_channels_are_isolated() {
    let h = TestHarness::new();
    let (_a, left) = h.record("left");
    let (_b, right) = h.record("right");

    h.kernel.bus.publish("left", &KernelEvent::error("only left")).await;
    assert_eq!(left.len(), 1);
    assert!(right.is_empty());

    assert_eq!(h.kernel.bus.publish("nobody", &KernelEvent::error("x")).await, 0);
}

#[tokio::test]
async fn test_queue_reaches_every_channel_in_order() {
    let h = TestHarness::new();
    let (_a, left) = h.record("left");
    let (_b, right) = h.record("right");
    h.start_bus();

    for i in 0..5 {
        h.kernel.bus.enqueue(KernelEvent::error(format!("e{}", i)));
    }
    h.wait_for(&right, "error", 5, Duration::from_secs(1)).await;

    let expected: Vec<KernelEvent> = (0..5).map(|i| KernelEvent::error(format!("e{}", i))).collect();
    assert_eq!(left.events(), expected);
    assert_eq!(right.events(), expected);
}

#[tokio::test]
async fn test_lagging_queue_subscriber_is_dropped() {
    let h = TestHarness::new();
    let (handle, mut rx) = h.kernel.bus.subscribe_queue("ws", "slow-client", 1);

    assert_eq!(h.kernel.bus.publish("ws", &KernelEvent::error("1")).await, 1);
    assert_eq!(h.kernel.bus.publish("ws", &KernelEvent::error("2")).await, 0);
    assert_eq!(h.kernel.bus.channel_len("ws"), 0);
    assert!(!h.kernel.bus.unsubscribe(&handle));

    assert_eq!(rx.recv().await, Some(KernelEvent::error("1")));
}

#[tokio::test]
async fn test_unsubscribe_removes_empty_channel() {
    let h = TestHarness::new();
    let (handle, _recorder) = h.record("dashboard");
    assert_eq!(h.kernel.bus.active_channels(), vec!["dashboard"]);

    assert!(h.kernel.bus.unsubscribe(&handle));
    assert!(h.kernel.bus.active_channels().is_empty());
    assert_eq!(h.kernel.bus.subscriber_count(), 0);
}
