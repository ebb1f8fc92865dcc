//! 알림 빌더 — 트리거 이벤트를 알림 문서로
//!
//! 같은 `(전략, 항목 이름, 차원, 레벨)`의 이벤트는 하나의 열린 알림으로
//! 모입니다. 이벤트 시각이 뒤섞여 도착해도 `latest_time`은 뒤로 가지
//! 않습니다.

use std::sync::atomic::{AtomicU64, Ordering};

use watchpost_core::fingerprint::dedupe_md5;
use watchpost_core::types::{
    Alert, AlertDimension, AlertExtraInfo, AlertStatus, AlertStatusDetail, LogOpType,
    TriggeredEvent,
};

/// 알림 빌더 (프로세스 내 시퀀스 발급기 포함)
pub struct AlertBuilder {
    seq: AtomicU64,
}

impl Default for AlertBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl AlertBuilder {
    pub fn new() -> Self {
        Self { seq: AtomicU64::new(0) }
    }

    /// 이벤트의 중복 제거 키
    pub fn dedupe_key(event: &TriggeredEvent) -> String {
        let item_name = event
            .strategy
            .items
            .iter()
            .find(|i| i.id == event.item_id)
            .map(|i| i.name.as_str())
            .unwrap_or_default();
        dedupe_md5(
            event.strategy_id,
            item_name,
            &event.data.dimensions_md5(),
            event.severity.level(),
        )
    }

    /// `"{create_time}{seq:05}"` 형식의 알림 ID
    fn next_id(&self, create_time: i64) -> String {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) % 100_000;
        format!("{create_time}{seq:05}")
    }

    /// 새 알림을 만듭니다.
    pub fn new_alert(&self, event: &TriggeredEvent, now: i64) -> Alert {
        let dimensions = event
            .data
            .dimensions
            .iter()
            .filter(|(key, _)| !key.starts_with("__"))
            .map(|(key, value)| AlertDimension {
                key: key.clone(),
                value: value.clone(),
                display_key: key.clone(),
                display_value: display_value(value),
            })
            .collect();
        let mut alert = Alert {
            id: self.next_id(now),
            dedupe_md5: Self::dedupe_key(event),
            bk_biz_id: event.strategy.bk_biz_id,
            strategy_id: event.strategy_id,
            item_id: event.item_id,
            alert_name: event.strategy.name.clone(),
            severity: event.severity,
            status: AlertStatus::Abnormal,
            status_detail: AlertStatusDetail::Abnormal,
            begin_time: event.anomaly_time,
            first_anomaly_time: event.anomaly_time,
            latest_time: event.time,
            end_time: None,
            duration: 0,
            assignee: vec![],
            dimensions,
            tags: vec![],
            extra_info: AlertExtraInfo {
                strategy: serde_json::to_value(event.strategy.as_ref()).ok(),
                origin_alarm: serde_json::to_value(&event.data).ok(),
                ..AlertExtraInfo::default()
            },
            anomaly_ids: event.anomaly_ids.clone(),
            is_shielded: false,
            shield_ids: vec![],
            shield_left_time: 0,
            is_ack: false,
            is_handled: false,
            is_blocked: false,
            next_status: None,
            next_status_time: None,
            logs: vec![],
        };
        alert.duration = alert.duration_at(now);
        alert.add_log(LogOpType::Create, event.time, event.description.clone());
        alert
    }

    /// 열린 알림을 새 이벤트로 갱신합니다.
    ///
    /// 더 높은 레벨의 이벤트는 알림의 심각도를 끌어올립니다.
    pub fn update_alert(alert: &mut Alert, event: &TriggeredEvent) {
        if event.time > alert.latest_time {
            alert.latest_time = event.time;
        }
        if event.anomaly_time < alert.first_anomaly_time {
            alert.first_anomaly_time = event.anomaly_time;
            if alert.first_anomaly_time < alert.begin_time {
                alert.begin_time = alert.first_anomaly_time;
            }
        }
        for anomaly_id in &event.anomaly_ids {
            if !alert.anomaly_ids.contains(anomaly_id) {
                alert.anomaly_ids.push(anomaly_id.clone());
            }
        }
        if event.severity.is_higher_than(alert.severity) {
            alert.add_log(
                LogOpType::SeverityUp,
                event.time,
                format!(
                    "severity raised from {} to {}",
                    alert.severity.level(),
                    event.severity.level()
                ),
            );
            alert.severity = event.severity;
        }
    }
}

fn display_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
