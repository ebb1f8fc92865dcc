//! Shielded alert suppression and unshield renotification.

use watchpost_core::config::ActionConfig;
use watchpost_core::types::{ActionStatus, Signal};

use crate::helpers::fixtures::*;

/// A strategy-scoped shield marks the alert shielded at creation; with
/// `enable_push_shielded_alert = false` the queue push is suppressed.
/// Once the shield is lifted, the next manager tick emits exactly one
/// UNSHIELDED signal and the action goes through.
#[tokio::test]
async fn shielded_alert_suppressed_then_renotified_on_unshield() {
    let strategy = cpu_strategy(1, serde_json::json!({}));
    let (mut worker, mut events) = detect_stage(vec![strategy]).await;
    let (manager, mut signals, shields) =
        alert_stage(vec![strategy_shield(101, 0, i64::MAX)]);
    let executor = action_stage(ActionConfig {
        enable_push_shielded_alert: false,
        ..single_queue_config()
    });

    worker.process_point(point(60, 9.0)).await.unwrap();
    let event = events.try_recv().expect("trigger count 1 fires immediately");
    manager.handle_event(event, 70).await.unwrap();

    let signal = signals.try_recv().unwrap();
    assert_eq!(signal.signal, Signal::Abnormal);
    assert!(signal.alert.is_shielded);
    assert_eq!(signal.alert.shield_ids, vec![9]);

    let finished = executor.process_signal(&signal, 70).await;
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].status, ActionStatus::Skipped);
    assert!(finished[0].ex_data.contains("shielded"));

    // Shield expires; the manager notices on its next tick
    shields.clear();
    manager.tick(130).await.unwrap();
    let signal = signals.try_recv().expect("unshield renotify");
    assert_eq!(signal.signal, Signal::Unshielded);
    assert!(!signal.alert.is_shielded);

    let finished = executor.process_signal(&signal, 130).await;
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].status, ActionStatus::Success);

    // Renotification happens once, not on every tick
    manager.tick(160).await.unwrap();
    assert!(signals.try_recv().is_err());
}

/// Shielded alerts still push when the operator opts in.
#[tokio::test]
async fn shielded_alert_pushes_when_enabled() {
    let strategy = cpu_strategy(1, serde_json::json!({}));
    let (mut worker, mut events) = detect_stage(vec![strategy]).await;
    let (manager, mut signals, _) = alert_stage(vec![strategy_shield(101, 0, i64::MAX)]);
    let executor = action_stage(ActionConfig {
        enable_push_shielded_alert: true,
        ..single_queue_config()
    });

    worker.process_point(point(60, 9.0)).await.unwrap();
    manager
        .handle_event(events.try_recv().unwrap(), 70)
        .await
        .unwrap();
    let signal = signals.try_recv().unwrap();
    assert!(signal.alert.is_shielded);

    let finished = executor.process_signal(&signal, 70).await;
    assert_eq!(finished[0].status, ActionStatus::Success);
}
