//! Threshold breach, recovery, and no-data flows through all three stages.

use watchpost_core::types::{ActionStatus, AlertStatus, AlertStatusDetail, Severity, Signal};

use crate::helpers::fixtures::*;

/// Anomaly -> trigger -> alert -> notice action, end to end.
///
/// Three points below the threshold within the check window satisfy the
/// trigger (count 3), producing one alert whose begin_time is the first
/// anomaly and one notice action rendered from the strategy template.
#[tokio::test]
async fn threshold_breach_fires_after_trigger_count() {
    let strategy = cpu_strategy(3, serde_json::json!({}));
    let (mut worker, mut events) = detect_stage(vec![strategy]).await;
    let (manager, mut signals, _) = alert_stage(vec![]);
    let executor = action_stage(single_queue_config());

    for ts in [60, 120] {
        worker.process_point(point(ts, 9.0)).await.unwrap();
        assert!(
            events.try_recv().is_err(),
            "no event before the trigger count is met"
        );
    }
    worker.process_point(point(180, 9.0)).await.unwrap();
    let event = events.try_recv().expect("third anomaly should fire");
    assert_eq!(event.severity, Severity::Critical);
    assert_eq!(event.anomaly_time, 60);
    assert_eq!(event.anomaly_ids.len(), 3);

    manager.handle_event(event, 200).await.unwrap();
    let signal = signals.try_recv().expect("alert should be created");
    assert_eq!(signal.signal, Signal::Abnormal);
    assert_eq!(signal.alert.alert_name, "cpu_idle");
    assert_eq!(signal.alert.begin_time, 60);
    assert_eq!(signal.alert.latest_time, 180);
    assert_eq!(signal.alert.status, AlertStatus::Abnormal);

    let finished = executor.process_signal(&signal, 200).await;
    assert_eq!(finished.len(), 1);
    let notice = &finished[0];
    assert_eq!(notice.plugin_type, "notice");
    assert_eq!(notice.status, ActionStatus::Success);
    assert_eq!(notice.execute_config["title"], "[1] cpu_idle");
    assert_eq!(notice.execute_config["message"], "ip=10.0.0.1");
}

/// A normal point puts the alert into RECOVERING; the transition to
/// RECOVERED happens only after the full recovery window has elapsed.
#[tokio::test]
async fn recovery_completes_after_full_window() {
    let strategy = cpu_strategy(3, serde_json::json!({}));
    let (mut worker, mut events) = detect_stage(vec![strategy]).await;
    let (manager, mut signals, _) = alert_stage(vec![]);

    for ts in [60, 120, 180] {
        worker.process_point(point(ts, 9.0)).await.unwrap();
    }
    let event = events.try_recv().expect("trigger should fire");
    manager.handle_event(event, 200).await.unwrap();
    let created = signals.try_recv().unwrap().alert;

    // Normal point at 240 starts the recovery clock (5 cycles x 60s)
    worker.process_point(point(240, 50.0)).await.unwrap();
    let normal = events.try_recv().expect("normal point becomes a recovery event");
    manager.handle_event(normal, 250).await.unwrap();

    let alert = manager.snapshot(&created.id).await.unwrap();
    assert_eq!(alert.status_detail, AlertStatusDetail::Recovering);
    assert_eq!(alert.next_status_time, Some(540));

    // Before the window elapses nothing changes
    manager.tick(500).await.unwrap();
    let alert = manager.snapshot(&created.id).await.unwrap();
    assert_eq!(alert.status, AlertStatus::Abnormal);

    manager.tick(545).await.unwrap();
    let signal = signals.try_recv().expect("recovered signal");
    assert_eq!(signal.signal, Signal::Recovered);
    assert_eq!(signal.alert.status, AlertStatus::Recovered);
    assert_eq!(signal.alert.end_time, Some(540));
    assert_eq!(signal.alert.duration, 480);
}

/// No-data points bypass the detection algorithms and fire at the
/// no-data level, surfacing as a NO_DATA signal on the alert.
#[tokio::test]
async fn no_data_point_raises_no_data_alert() {
    let strategy = cpu_strategy(3, serde_json::json!({}));
    let (mut worker, mut events) = detect_stage(vec![strategy]).await;
    let (manager, mut signals, _) = alert_stage(vec![]);

    worker.process_point(no_data_point(60)).await.unwrap();
    let event = events.try_recv().expect("no-data anomaly should fire at level 2");
    assert!(event.is_no_data);
    assert_eq!(event.severity, Severity::Warning);
    assert!(event.description.contains("no data"));

    manager.handle_event(event, 100).await.unwrap();
    let signal = signals.try_recv().unwrap();
    assert_eq!(signal.signal, Signal::NoData);
    // Internal marker dimensions never reach the alert document
    assert_eq!(signal.alert.dimensions.len(), 1);
    assert_eq!(signal.alert.dimensions[0].key, "ip");
}
