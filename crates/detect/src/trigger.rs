//! 트리거 — 윈도우 내 이상 개수 판정과 이벤트 발화
//!
//! 포인트마다 모든 설정 레벨의 판정을 결과 캐시에 기록한 뒤, 레벨을
//! 심각도 높은 순으로 평가합니다. 높은 레벨이 발화하면 낮은 레벨은
//! 건너뜁니다 (high severity wins). 발화한 이벤트는 발화 시점의 전략
//! 스냅샷 키와 윈도우 내 모든 anomaly_id를 담습니다.

use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use watchpost_core::strategy::{Item, Strategy};
use watchpost_core::types::{AnomalyPoint, EventStatus, Severity, TriggeredEvent};

use crate::error::DetectError;
use crate::result_cache::{CheckMarker, ResultWindowStore, WindowKey};

/// 트리거 평가기
pub struct TriggerEvaluator {
    store: Arc<dyn ResultWindowStore>,
}

impl TriggerEvaluator {
    pub fn new(store: Arc<dyn ResultWindowStore>) -> Self {
        Self { store }
    }

    /// 포인트 판정을 기록하고 발화 여부를 평가합니다.
    ///
    /// 반환은 최대 하나의 이벤트입니다 (가장 높은 발화 레벨).
    pub async fn record_and_check(
        &self,
        strategy: &Arc<Strategy>,
        item: &Item,
        anomaly: &AnomalyPoint,
    ) -> Result<Option<TriggeredEvent>, DetectError> {
        let point = &anomaly.point;
        let dims_md5 = point.dimensions_md5();
        let unit = item.window_unit_secs() as i64;

        // 모든 설정 레벨의 판정을 먼저 기록한다 (직렬화 지점).
        for level in strategy.levels_high_to_low() {
            let marker = if anomaly.by_level.contains_key(&level) {
                CheckMarker::Anomaly
            } else {
                CheckMarker::Normal
            };
            let key = WindowKey {
                strategy_id: strategy.id,
                item_id: item.id,
                dimensions_md5: dims_md5.clone(),
                level: level.level(),
            };
            self.store.add(&key, point.timestamp, marker).await?;
        }

        for level in strategy.levels_high_to_low() {
            let Some(block) = strategy.detect_for_level(level) else {
                continue;
            };
            // 현재 포인트가 이 레벨에서 정상이면 발화 후보가 아니다.
            // 윈도우에 남은 과거 이상만으로는 발화하지 않는다.
            if !anomaly.by_level.contains_key(&level) {
                continue;
            }
            let key = WindowKey {
                strategy_id: strategy.id,
                item_id: item.id,
                dimensions_md5: dims_md5.clone(),
                level: level.level(),
            };
            let window_secs = i64::from(block.trigger_config.check_window) * unit;
            let from = point.timestamp - (window_secs - 1);
            let records = self.store.range(&key, from, point.timestamp).await?;

            let anomalous: Vec<i64> = records
                .iter()
                .filter(|r| r.marker == CheckMarker::Anomaly)
                .map(|r| r.timestamp)
                .collect();
            let count = anomalous.len() as u32;
            let required = block.trigger_config.count;

            let fired = if count >= required {
                true
            } else if point.is_no_data() && !anomalous.is_empty() {
                // 희소 no-data 규칙: 윈도우 항목이 전부 이상이고 퍼진
                // 간격이 (count-1)·unit 이상이면 발화한다.
                let all_anomalous = anomalous.len() == records.len();
                let span = anomalous.last().unwrap() - anomalous.first().unwrap();
                all_anomalous && span >= i64::from(required.saturating_sub(1)) * unit
            } else {
                false
            };

            if !fired {
                continue;
            }

            let anomaly_ids: Vec<String> = anomalous
                .iter()
                .map(|ts| {
                    format!(
                        "{dims_md5}.{ts}.{}.{}.{}",
                        strategy.id,
                        item.id,
                        level.level()
                    )
                })
                .collect();
            let description = anomaly
                .by_level
                .get(&level)
                .map(|info| info.anomaly_message.clone())
                .unwrap_or_else(|| format!("{count} anomalies in window"));
            let first_anomaly = *anomalous.first().unwrap_or(&point.timestamp);

            debug!(
                strategy_id = strategy.id,
                item_id = item.id,
                level = level.level(),
                count,
                required,
                "trigger fired"
            );
            metrics::counter!("watchpost_trigger_fired_total").increment(1);

            return Ok(Some(TriggeredEvent {
                id: Uuid::new_v4().to_string(),
                strategy_id: strategy.id,
                item_id: item.id,
                severity: level,
                status: EventStatus::Abnormal,
                data: point.clone(),
                anomaly_ids,
                strategy_snapshot_key: strategy.snapshot_key(),
                strategy: Arc::clone(strategy),
                description,
                time: point.timestamp,
                anomaly_time: first_anomaly,
                is_no_data: point.is_no_data(),
            }));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result_cache::MemoryResultStore;
    use std::collections::BTreeMap;
    use watchpost_core::types::{AnomalyInfo, DataPoint, DimensionMap, NO_DATA_TAG_DIMENSION};

    fn strategy(count: u32, window: u32) -> Arc<Strategy> {
        Arc::new(
            Strategy::from_json(
                &serde_json::json!({
                    "id": 101,
                    "bk_biz_id": 2,
                    "name": "cpu_idle",
                    "items": [{
                        "id": 1001,
                        "name": "cpu_idle",
                        "query_configs": [{
                            "data_source_label": "bk_monitor",
                            "data_type_label": "time_series",
                            "result_table_id": "system.cpu",
                            "agg_interval": 60
                        }]
                    }],
                    "detects": [{
                        "level": 1,
                        "trigger_config": {"count": count, "check_window": window},
                        "recovery_config": {"check_window": 5}
                    }]
                })
                .to_string(),
            )
            .unwrap(),
        )
    }

    fn anomaly_at(ts: i64, flagged: bool, no_data: bool) -> AnomalyPoint {
        let mut dims = DimensionMap::new();
        dims.insert("ip".to_owned(), serde_json::json!("10.0.0.1"));
        if no_data {
            dims.insert(NO_DATA_TAG_DIMENSION.to_owned(), serde_json::json!(true));
        }
        let point = DataPoint {
            strategy_id: 101,
            item_id: 1001,
            dimensions: dims,
            timestamp: ts,
            value: 9.0,
            record_id: None,
        };
        let mut by_level = BTreeMap::new();
        if flagged {
            by_level.insert(
                Severity::Critical,
                AnomalyInfo {
                    anomaly_id: AnomalyPoint::format_anomaly_id(&point, Severity::Critical),
                    anomaly_message: "value 9 < threshold 10".to_owned(),
                },
            );
        }
        AnomalyPoint { point, by_level }
    }

    #[tokio::test]
    async fn fires_after_count_in_window() {
        let store = Arc::new(MemoryResultStore::new(3600));
        let evaluator = TriggerEvaluator::new(store);
        let strategy = strategy(3, 5);
        let item = &strategy.items[0];

        for ts in [60, 120] {
            let fired = evaluator
                .record_and_check(&strategy, item, &anomaly_at(ts, true, false))
                .await
                .unwrap();
            assert!(fired.is_none());
        }
        let event = evaluator
            .record_and_check(&strategy, item, &anomaly_at(180, true, false))
            .await
            .unwrap()
            .expect("third anomaly should fire");

        assert_eq!(event.severity, Severity::Critical);
        assert_eq!(event.anomaly_ids.len(), 3);
        assert_eq!(event.time, 180);
        assert_eq!(event.anomaly_time, 60);
        assert_eq!(event.strategy_snapshot_key, strategy.snapshot_key());
    }

    #[tokio::test]
    async fn normal_points_break_the_count() {
        let store = Arc::new(MemoryResultStore::new(3600));
        let evaluator = TriggerEvaluator::new(store);
        let strategy = strategy(3, 3);
        let item = &strategy.items[0];

        evaluator
            .record_and_check(&strategy, item, &anomaly_at(60, true, false))
            .await
            .unwrap();
        evaluator
            .record_and_check(&strategy, item, &anomaly_at(120, false, false))
            .await
            .unwrap();
        let fired = evaluator
            .record_and_check(&strategy, item, &anomaly_at(180, true, false))
            .await
            .unwrap();
        assert!(fired.is_none());
    }

    #[tokio::test]
    async fn window_excludes_old_anomalies() {
        let store = Arc::new(MemoryResultStore::new(7200));
        let evaluator = TriggerEvaluator::new(store);
        let strategy = strategy(3, 5);
        let item = &strategy.items[0];

        // 윈도우(300초) 밖으로 밀려날 이상
        evaluator
            .record_and_check(&strategy, item, &anomaly_at(60, true, false))
            .await
            .unwrap();
        evaluator
            .record_and_check(&strategy, item, &anomaly_at(600, true, false))
            .await
            .unwrap();
        let fired = evaluator
            .record_and_check(&strategy, item, &anomaly_at(660, true, false))
            .await
            .unwrap();
        assert!(fired.is_none());
    }

    #[tokio::test]
    async fn sparse_no_data_rule_fires() {
        let store = Arc::new(MemoryResultStore::new(3600));
        let evaluator = TriggerEvaluator::new(store);
        // continuous=3 상당: count=3, 윈도우는 넓게
        let strategy = strategy(3, 10);
        let item = &strategy.items[0];

        evaluator
            .record_and_check(&strategy, item, &anomaly_at(60, true, true))
            .await
            .unwrap();
        evaluator
            .record_and_check(&strategy, item, &anomaly_at(180, true, true))
            .await
            .unwrap();
        // 2개뿐이지만 전부 이상이고 간격 240 ≥ (3-1)·60
        let event = evaluator
            .record_and_check(&strategy, item, &anomaly_at(300, true, true))
            .await
            .unwrap();
        assert!(event.is_some_and(|e| e.is_no_data));
    }

    #[tokio::test]
    async fn sparse_rule_needs_all_anomalous() {
        let store = Arc::new(MemoryResultStore::new(3600));
        let evaluator = TriggerEvaluator::new(store);
        let strategy = strategy(3, 10);
        let item = &strategy.items[0];

        evaluator
            .record_and_check(&strategy, item, &anomaly_at(60, true, true))
            .await
            .unwrap();
        evaluator
            .record_and_check(&strategy, item, &anomaly_at(180, false, true))
            .await
            .unwrap();
        let fired = evaluator
            .record_and_check(&strategy, item, &anomaly_at(420, true, true))
            .await
            .unwrap();
        assert!(fired.is_none());
    }

    #[tokio::test]
    async fn higher_level_wins() {
        let store = Arc::new(MemoryResultStore::new(3600));
        let evaluator = TriggerEvaluator::new(store);
        let strategy = Arc::new(
            Strategy::from_json(
                &serde_json::json!({
                    "id": 101,
                    "bk_biz_id": 2,
                    "name": "cpu_idle",
                    "items": [{
                        "id": 1001,
                        "name": "cpu_idle",
                        "query_configs": [{
                            "data_source_label": "bk_monitor",
                            "data_type_label": "time_series",
                            "result_table_id": "system.cpu",
                            "agg_interval": 60
                        }]
                    }],
                    "detects": [
                        {"level": 1, "trigger_config": {"count": 1, "check_window": 5}},
                        {"level": 2, "trigger_config": {"count": 1, "check_window": 5}}
                    ]
                })
                .to_string(),
            )
            .unwrap(),
        );
        let item = &strategy.items[0];

        let mut anomaly = anomaly_at(60, true, false);
        anomaly.by_level.insert(
            Severity::Warning,
            AnomalyInfo {
                anomaly_id: AnomalyPoint::format_anomaly_id(&anomaly.point, Severity::Warning),
                anomaly_message: "warning too".to_owned(),
            },
        );
        let event = evaluator
            .record_and_check(&strategy, item, &anomaly)
            .await
            .unwrap()
            .unwrap();
        // 레벨 1만 발화, 레벨 2는 건너뜀
        assert_eq!(event.severity, Severity::Critical);
    }

    mod props {
        use super::*;
        use proptest::prelude::*;
        use proptest::test_runner::TestCaseError;

        proptest! {
            /// 현재 포인트가 이상일 때, 발화 여부는 윈도우 내 이상
            /// 개수로만 결정된다. 정상 포인트는 절대 발화하지 않는다.
            #[test]
            fn fires_iff_window_count_reached(
                markers in proptest::collection::vec(any::<bool>(), 1..30),
                count in 1u32..5,
                window in 1u32..8,
            ) {
                let rt = tokio::runtime::Builder::new_current_thread()
                    .build()
                    .unwrap();
                let outcome: Result<(), TestCaseError> = rt.block_on(async {
                    let store = Arc::new(MemoryResultStore::new(86_400));
                    let evaluator = TriggerEvaluator::new(store);
                    let strategy = strategy(count, window);
                    let item = &strategy.items[0];

                    for (i, flagged) in markers.iter().enumerate() {
                        let ts = 60 * (i as i64 + 1);
                        let fired = evaluator
                            .record_and_check(&strategy, item, &anomaly_at(ts, *flagged, false))
                            .await
                            .unwrap()
                            .is_some();

                        let from = ts - (i64::from(window) * 60 - 1);
                        let in_window = markers[..=i]
                            .iter()
                            .enumerate()
                            .filter(|(j, m)| {
                                let mts = 60 * (*j as i64 + 1);
                                **m && mts >= from
                            })
                            .count() as u32;
                        let expected = *flagged && in_window >= count;
                        prop_assert_eq!(fired, expected);
                    }
                    Ok(())
                });
                outcome?;
            }
        }
    }
}
