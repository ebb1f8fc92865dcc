//! Queue sink fan-out: per-biz DSN routing and partial delivery.

use std::collections::BTreeMap;

use watchpost_core::config::{ActionConfig, MessageQueueDsn};
use watchpost_core::types::ActionStatus;

use crate::helpers::fixtures::*;

fn per_biz_dsn() -> MessageQueueDsn {
    let mut map = BTreeMap::new();
    map.insert("2".to_owned(), "redis://localhost:6379/0/alerts".to_owned());
    map.insert("0".to_owned(), "kafka://fail-broker:9092/alerts".to_owned());
    MessageQueueDsn::PerBiz(map)
}

/// The alert's biz URI and the default ("0") URI are both pushed; one
/// failing broker still leaves the action SUCCESS with a (K/N) ratio.
#[tokio::test]
async fn per_biz_fanout_partial_success() {
    let strategy = cpu_strategy(1, serde_json::json!({}));
    let (mut worker, mut events) = detect_stage(vec![strategy]).await;
    let (manager, mut signals, _) = alert_stage(vec![]);
    let executor = action_stage(ActionConfig {
        enable_message_queue: true,
        message_queue_dsn: Some(per_biz_dsn()),
        ..ActionConfig::default()
    });

    worker.process_point(point(60, 9.0)).await.unwrap();
    manager
        .handle_event(events.try_recv().unwrap(), 70)
        .await
        .unwrap();
    let signal = signals.try_recv().unwrap();
    assert_eq!(signal.alert.bk_biz_id, 2);

    let finished = executor.process_signal(&signal, 100).await;
    assert_eq!(finished.len(), 1);
    let notice = &finished[0];
    assert_eq!(notice.status, ActionStatus::Success);
    assert!(notice.ex_data.contains("(1/2)"), "ex_data: {}", notice.ex_data);
    assert!(notice.ex_data.contains("broker unreachable"));
    assert_eq!(notice.execute_times, 0);
}

/// When every sink fails the action is FAILURE and execute_times grows.
#[tokio::test]
async fn total_sink_failure_marks_action_failed() {
    let strategy = cpu_strategy(1, serde_json::json!({}));
    let (mut worker, mut events) = detect_stage(vec![strategy]).await;
    let (manager, mut signals, _) = alert_stage(vec![]);
    let executor = action_stage(ActionConfig {
        enable_message_queue: true,
        message_queue_dsn: Some(MessageQueueDsn::Single(
            "kafka://fail-broker:9092/alerts".to_owned(),
        )),
        ..ActionConfig::default()
    });

    worker.process_point(point(60, 9.0)).await.unwrap();
    manager
        .handle_event(events.try_recv().unwrap(), 70)
        .await
        .unwrap();
    let signal = signals.try_recv().unwrap();

    let finished = executor.process_signal(&signal, 100).await;
    assert_eq!(finished[0].status, ActionStatus::Failure);
    assert!(finished[0].ex_data.starts_with("(0/1)"));
    assert_eq!(finished[0].execute_times, 1);
}

/// With the queue disabled the chain still completes; actions are
/// skipped rather than failed.
#[tokio::test]
async fn queue_disabled_skips_delivery() {
    let strategy = cpu_strategy(1, serde_json::json!({}));
    let (mut worker, mut events) = detect_stage(vec![strategy]).await;
    let (manager, mut signals, _) = alert_stage(vec![]);
    let executor = action_stage(ActionConfig::default());

    worker.process_point(point(60, 9.0)).await.unwrap();
    manager
        .handle_event(events.try_recv().unwrap(), 70)
        .await
        .unwrap();
    let signal = signals.try_recv().unwrap();

    let finished = executor.process_signal(&signal, 100).await;
    assert_eq!(finished[0].status, ActionStatus::Skipped);
    assert!(finished[0].ex_data.contains("queue disabled"));
}
