//! Convergence behavior on repeated signals for the same root cause.

use std::sync::Arc;

use watchpost_action::converge::{ConvergeOptions, Converger};
use watchpost_action::executor::ActionExecutor;
use watchpost_core::types::{ActionStatus, LogOpType};

use crate::helpers::fakes::ScriptedFactory;
use crate::helpers::fixtures::*;

/// `collect` lets the first action through as the summary carrier and
/// folds every later one within the window into it.
#[tokio::test]
async fn collect_folds_repeat_notices_into_summary() {
    let options = serde_json::json!({
        "converge_config": {
            "is_enabled": true,
            "converge_func": "collect",
            "count": 1,
            "timedelta": 600
        }
    });
    let strategy = cpu_strategy(1, options);
    let (mut worker, mut events) = detect_stage(vec![strategy]).await;
    let (manager, mut signals, _) = alert_stage(vec![]);
    let executor = action_stage(single_queue_config());

    worker.process_point(point(60, 9.0)).await.unwrap();
    manager
        .handle_event(events.try_recv().unwrap(), 70)
        .await
        .unwrap();
    let signal = signals.try_recv().unwrap();

    let first = executor.process_signal(&signal, 100).await;
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].status, ActionStatus::Success);

    for i in 1..5 {
        let repeat = executor.process_signal(&signal, 100 + i).await;
        assert_eq!(repeat.len(), 1);
        assert_eq!(repeat[0].status, ActionStatus::Converged);
        assert!(
            repeat[0].ex_data.contains("so far"),
            "collected count should be reported: {}",
            repeat[0].ex_data
        );
    }
}

/// `defense` passes actions up to the threshold and drops the rest.
#[tokio::test]
async fn defense_drops_actions_past_threshold() {
    let options = serde_json::json!({
        "converge_config": {
            "is_enabled": true,
            "converge_func": "defense",
            "count": 2,
            "timedelta": 600
        }
    });
    let strategy = cpu_strategy(1, options);
    let (mut worker, mut events) = detect_stage(vec![strategy]).await;
    let (manager, mut signals, _) = alert_stage(vec![]);
    let executor = action_stage(single_queue_config());

    worker.process_point(point(60, 9.0)).await.unwrap();
    manager
        .handle_event(events.try_recv().unwrap(), 70)
        .await
        .unwrap();
    let signal = signals.try_recv().unwrap();

    for i in 0..2 {
        let out = executor.process_signal(&signal, 100 + i).await;
        assert_eq!(out[0].status, ActionStatus::Success, "within threshold");
    }
    let out = executor.process_signal(&signal, 103).await;
    assert_eq!(out[0].status, ActionStatus::Skipped);
    assert!(out[0].ex_data.contains("defense"));
}

/// Expired window entries no longer count toward convergence.
#[tokio::test]
async fn collect_window_expiry_lets_actions_through_again() {
    let options = serde_json::json!({
        "converge_config": {
            "is_enabled": true,
            "converge_func": "collect",
            "count": 1,
            "timedelta": 60
        }
    });
    let strategy = cpu_strategy(1, options);
    let (mut worker, mut events) = detect_stage(vec![strategy]).await;
    let (manager, mut signals, _) = alert_stage(vec![]);
    let executor = action_stage(single_queue_config());

    worker.process_point(point(60, 9.0)).await.unwrap();
    manager
        .handle_event(events.try_recv().unwrap(), 70)
        .await
        .unwrap();
    let signal = signals.try_recv().unwrap();

    let first = executor.process_signal(&signal, 100).await;
    assert_eq!(first[0].status, ActionStatus::Success);
    let folded = executor.process_signal(&signal, 130).await;
    assert_eq!(folded[0].status, ActionStatus::Converged);

    // Past the timedelta the window is empty again
    let fresh = executor.process_signal(&signal, 200).await;
    assert_eq!(fresh[0].status, ActionStatus::Success);
}

/// Past the QoS threshold no actions are produced at all, and the alert
/// document records the block exactly once.
#[tokio::test]
async fn qos_trip_drops_actions_and_marks_alert() {
    let strategy = cpu_strategy(1, serde_json::json!({}));
    let (mut worker, mut events) = detect_stage(vec![strategy]).await;
    let (manager, mut signals, _) = alert_stage(vec![]);
    let executor = ActionExecutor::new(
        single_queue_config(),
        Arc::new(Converger::new(ConvergeOptions {
            qos_threshold: 2,
            qos_window_secs: 60,
            noise_horizon_secs: 3600,
        })),
        Arc::new(ScriptedFactory),
    )
    .with_alert_feedback(manager.clone());

    worker.process_point(point(60, 9.0)).await.unwrap();
    manager
        .handle_event(events.try_recv().unwrap(), 70)
        .await
        .unwrap();
    let signal = signals.try_recv().unwrap();

    for i in 0..2 {
        let out = executor.process_signal(&signal, 100 + i).await;
        assert_eq!(out.len(), 1, "within qos threshold");
    }
    for i in 2..5 {
        let out = executor.process_signal(&signal, 100 + i).await;
        assert!(out.is_empty(), "blocked signals produce no actions");
    }

    let alert = manager.snapshot(&signal.alert.id).await.unwrap();
    assert!(alert.is_blocked);
    let qos_logs = alert
        .logs
        .iter()
        .filter(|l| l.op_type == LogOpType::Qos)
        .count();
    assert_eq!(qos_logs, 1);
}
