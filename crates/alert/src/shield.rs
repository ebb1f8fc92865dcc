//! 차폐 판정 — 활성 차폐 규칙과 알림 매칭
//!
//! 활성 목록은 캐시가 게으르게 갱신합니다. 판정 실패는 "차폐 안 됨"으로
//! 처리됩니다. 범주별 매칭 조건은 차폐 문서의 `dimension_config`에
//! JSON으로 들어 있습니다.

use std::sync::Arc;

use regex::Regex;
use serde::Deserialize;
use tracing::debug;

use watchpost_cache::shield::{Shield, ShieldCache, ShieldCategory};
use watchpost_core::types::Alert;

/// 차폐 판정 결과
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShieldResult {
    pub is_shielded: bool,
    pub shield_ids: Vec<u64>,
    /// 매칭된 차폐 중 가장 이른 종료까지 남은 초
    pub shield_left_time: i64,
}

/// 차원 조건 한 항목
#[derive(Debug, Clone, Deserialize)]
pub struct DimensionCondition {
    pub key: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub value: Vec<serde_json::Value>,
}

fn default_method() -> String {
    "eq".to_owned()
}

#[derive(Debug, Default, Deserialize)]
struct ShieldMatchConfig {
    #[serde(default)]
    strategy_ids: Vec<u64>,
    #[serde(default)]
    dimension_conditions: Vec<DimensionCondition>,
    #[serde(default)]
    scope: Vec<DimensionCondition>,
    #[serde(default)]
    alert_ids: Vec<String>,
    #[serde(default)]
    event_ids: Vec<String>,
}

/// 차폐 판정기
pub struct ShieldEvaluator {
    cache: Arc<ShieldCache>,
}

impl ShieldEvaluator {
    pub fn new(cache: Arc<ShieldCache>) -> Self {
        Self { cache }
    }

    /// `now` 시점의 알림 차폐 상태를 평가합니다.
    pub async fn check(&self, alert: &Alert, now: i64) -> ShieldResult {
        let shields = self.cache.active_shields(alert.bk_biz_id, now).await;
        let matched: Vec<&Shield> = shields
            .iter()
            .filter(|shield| shield_matches(shield, alert))
            .collect();
        if matched.is_empty() {
            return ShieldResult::default();
        }
        let left = matched
            .iter()
            .map(|shield| shield.left_seconds(now))
            .min()
            .unwrap_or(0);
        debug!(alert_id = %alert.id, shields = matched.len(), "alert shielded");
        ShieldResult {
            is_shielded: true,
            shield_ids: matched.iter().map(|shield| shield.id).collect(),
            shield_left_time: left,
        }
    }
}

/// 한 차폐 규칙이 알림에 적용되는지 판정합니다.
pub fn shield_matches(shield: &Shield, alert: &Alert) -> bool {
    let config: ShieldMatchConfig =
        serde_json::from_value(shield.dimension_config.clone()).unwrap_or_default();
    match shield.category {
        ShieldCategory::Strategy => {
            config.strategy_ids.contains(&alert.strategy_id)
                && conditions_hold(&config.dimension_conditions, alert)
                && conditions_hold(&config.scope, alert)
        }
        // 범위 조건이 비어 있으면 비즈 전체 차폐
        ShieldCategory::Scope => conditions_hold(&config.scope, alert),
        ShieldCategory::Dimension => {
            !config.dimension_conditions.is_empty()
                && conditions_hold(&config.dimension_conditions, alert)
        }
        ShieldCategory::Alert => config.alert_ids.contains(&alert.id),
        ShieldCategory::Event => alert
            .anomaly_ids
            .iter()
            .any(|id| config.event_ids.contains(id)),
    }
}

fn conditions_hold(conditions: &[DimensionCondition], alert: &Alert) -> bool {
    conditions.iter().all(|cond| {
        let Some(actual) = lookup(alert, &cond.key) else {
            return false;
        };
        eval_condition(&actual, &cond.method, &cond.value)
    })
}

fn lookup(alert: &Alert, key: &str) -> Option<String> {
    if let Some(dim) = alert.dimensions.iter().find(|d| d.key == key) {
        return Some(as_string(&dim.value));
    }
    alert
        .tags
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.clone())
}

fn as_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn eval_condition(actual: &str, method: &str, expected: &[serde_json::Value]) -> bool {
    let expected: Vec<String> = expected.iter().map(as_string).collect();
    match method {
        "eq" => expected.iter().any(|e| e == actual),
        "neq" => !expected.iter().any(|e| e == actual),
        "gt" | "gte" | "lt" | "lte" => {
            let Ok(lhs) = actual.parse::<f64>() else {
                return false;
            };
            expected.iter().any(|e| {
                e.parse::<f64>().is_ok_and(|rhs| match method {
                    "gt" => lhs > rhs,
                    "gte" => lhs >= rhs,
                    "lt" => lhs < rhs,
                    _ => lhs <= rhs,
                })
            })
        }
        "include" => expected.iter().any(|e| actual.contains(e.as_str())),
        "exclude" => !expected.iter().any(|e| actual.contains(e.as_str())),
        "reg" => expected
            .iter()
            .any(|e| Regex::new(e).is_ok_and(|re| re.is_match(actual))),
        _ => false,
    }
}
