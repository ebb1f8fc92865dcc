//! 액션 디스패처 — 알림 신호를 액션 인스턴스로 구체화
//!
//! 신호마다 전략 스냅샷의 notice 바인딩과 핸들러 바인딩을 훑어, 해당
//! 신호를 구독하는 바인딩당 하나의 인스턴스를 만듭니다. 인스턴스의
//! `execute_config`에는 해석된 템플릿 사본이 들어갑니다.

use tracing::debug;
use uuid::Uuid;

use watchpost_alert::manager::AlertSignal;
use watchpost_core::fingerprint::dimensions_md5;
use watchpost_core::strategy::Strategy;
use watchpost_core::types::{ActionInstance, ActionStatus, Alert, DimensionMap, Signal};

use crate::template::{render, template_context};

/// 신호를 액션 인스턴스 목록으로 구체화합니다.
///
/// 알림의 `extra_info.strategy` 스냅샷을 사용하므로, 전략이 그 사이
/// 바뀌었어도 발화 당시의 바인딩이 적용됩니다.
pub fn dispatch(signal: &AlertSignal, now: i64) -> Vec<ActionInstance> {
    let Some(strategy) = strategy_snapshot(&signal.alert) else {
        debug!(alert_id = %signal.alert.id, "alert carries no strategy snapshot");
        return vec![];
    };
    let mut instances = Vec::new();

    if strategy.notice.signal.contains(&signal.signal) {
        instances.push(build_instance(
            signal,
            &strategy,
            strategy.notice.id,
            "notice",
            notice_template(&strategy, &signal.alert, signal.signal),
            now,
        ));
    }
    for relation in &strategy.actions {
        if relation.signal.contains(&signal.signal) {
            instances.push(build_instance(
                signal,
                &strategy,
                relation.id,
                "handler",
                serde_json::json!({"config_id": relation.config_id}),
                now,
            ));
        }
    }
    instances
}

fn strategy_snapshot(alert: &Alert) -> Option<Strategy> {
    let raw = alert.extra_info.strategy.clone()?;
    serde_json::from_value(raw).ok()
}

fn notice_template(strategy: &Strategy, alert: &Alert, signal: Signal) -> serde_json::Value {
    let vars = template_context(alert);
    let template = strategy
        .notice
        .config
        .template
        .iter()
        .find(|t| t.signal == signal.as_str())
        .or_else(|| strategy.notice.config.template.first());
    match template {
        Some(t) => serde_json::json!({
            "title": render(&t.title_tmpl, &vars),
            "message": render(&t.message_tmpl, &vars),
        }),
        None => serde_json::json!({
            "title": format!("[{}] {}", alert.severity.level(), alert.alert_name),
            "message": alert
                .logs
                .first()
                .map(|log| log.description.clone())
                .unwrap_or_default(),
        }),
    }
}

fn build_instance(
    signal: &AlertSignal,
    strategy: &Strategy,
    relation_id: u64,
    plugin_type: &str,
    execute_config: serde_json::Value,
    now: i64,
) -> ActionInstance {
    let dims: DimensionMap = signal
        .alert
        .dimensions
        .iter()
        .map(|d| (d.key.clone(), d.value.clone()))
        .collect();
    ActionInstance {
        id: Uuid::new_v4().to_string(),
        strategy_id: strategy.id,
        bk_biz_id: signal.alert.bk_biz_id,
        signal: signal.signal,
        alerts: vec![signal.alert.id.clone()],
        severity: signal.alert.severity,
        relation_id,
        execute_times: 0,
        status: ActionStatus::Running,
        ex_data: String::new(),
        plugin_type: plugin_type.to_owned(),
        dimensions_md5: dimensions_md5(&dims),
        execute_config,
        create_time: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use watchpost_core::types::{
        AlertDimension, AlertStatus, AlertStatusDetail, Severity,
    };

    fn alert_with_strategy(strategy: serde_json::Value) -> Alert {
        Alert {
            id: "20000001".to_owned(),
            dedupe_md5: "d".repeat(32),
            bk_biz_id: 2,
            strategy_id: 101,
            item_id: 1001,
            alert_name: "cpu_idle".to_owned(),
            severity: Severity::Critical,
            status: AlertStatus::Abnormal,
            status_detail: AlertStatusDetail::Abnormal,
            begin_time: 60,
            first_anomaly_time: 60,
            latest_time: 180,
            end_time: None,
            duration: 0,
            assignee: vec![],
            dimensions: vec![AlertDimension {
                key: "ip".to_owned(),
                value: serde_json::json!("10.0.0.1"),
                display_key: "ip".to_owned(),
                display_value: "10.0.0.1".to_owned(),
            }],
            tags: vec![],
            extra_info: watchpost_core::types::AlertExtraInfo {
                strategy: Some(strategy),
                ..Default::default()
            },
            anomaly_ids: vec![],
            is_shielded: false,
            shield_ids: vec![],
            shield_left_time: 0,
            is_ack: false,
            is_handled: false,
            is_blocked: false,
            next_status: None,
            next_status_time: None,
            logs: vec![],
        }
    }

    fn strategy_value() -> serde_json::Value {
        serde_json::json!({
            "id": 101,
            "bk_biz_id": 2,
            "name": "cpu_idle",
            "items": [],
            "detects": [],
            "notice": {
                "id": 55,
                "user_groups": [1],
                "signal": ["abnormal", "recovered"],
                "config": {
                    "template": [{
                        "signal": "abnormal",
                        "title_tmpl": "[{{alarm.level}}] {{alert.name}}",
                        "message_tmpl": "ip={{dimensions.ip}}"
                    }]
                }
            },
            "actions": [{
                "id": 77,
                "config_id": 900,
                "signal": ["abnormal"]
            }]
        })
    }

    #[test]
    fn abnormal_signal_materializes_notice_and_handler() {
        let signal = AlertSignal {
            signal: Signal::Abnormal,
            alert: alert_with_strategy(strategy_value()),
        };
        let instances = dispatch(&signal, 1000);

        assert_eq!(instances.len(), 2);
        let notice = &instances[0];
        assert_eq!(notice.plugin_type, "notice");
        assert_eq!(notice.relation_id, 55);
        assert_eq!(notice.execute_config["title"], "[1] cpu_idle");
        assert_eq!(notice.execute_config["message"], "ip=10.0.0.1");
        let handler = &instances[1];
        assert_eq!(handler.plugin_type, "handler");
        assert_eq!(handler.relation_id, 77);
    }

    #[test]
    fn unsubscribed_signal_produces_nothing_for_handler() {
        let signal = AlertSignal {
            signal: Signal::Recovered,
            alert: alert_with_strategy(strategy_value()),
        };
        let instances = dispatch(&signal, 1000);
        // notice만 recovered를 구독한다
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].plugin_type, "notice");
    }

    #[test]
    fn missing_snapshot_dispatches_nothing() {
        let mut alert = alert_with_strategy(strategy_value());
        alert.extra_info.strategy = None;
        let signal = AlertSignal {
            signal: Signal::Abnormal,
            alert,
        };
        assert!(dispatch(&signal, 1000).is_empty());
    }

    #[test]
    fn fallback_template_when_signal_has_none() {
        let mut strategy = strategy_value();
        strategy["notice"]["config"]["template"] = serde_json::json!([]);
        let signal = AlertSignal {
            signal: Signal::Abnormal,
            alert: alert_with_strategy(strategy),
        };
        let instances = dispatch(&signal, 1000);
        assert_eq!(instances[0].execute_config["title"], "[1] cpu_idle");
    }
}
