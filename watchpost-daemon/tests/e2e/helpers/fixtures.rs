//! Fixture builders: strategies, data points, and wired stage instances.
//!
//! The canonical test strategy is "cpu_idle" (id 101, item 1001, biz 2)
//! with a `value < 10` threshold at level 1 and a no-data fallback at
//! level 2, matching the shapes the platform API serves.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use watchpost_action::converge::{ConvergeOptions, Converger};
use watchpost_action::executor::ActionExecutor;
use watchpost_alert::enrich::Enricher;
use watchpost_alert::manager::{AlertManager, AlertSignal, ManagerOptions};
use watchpost_alert::shield::ShieldEvaluator;
use watchpost_cache::shield::{CycleConfig, Shield, ShieldCache, ShieldCategory};
use watchpost_cache::strategy::StrategyCache;
use watchpost_cache::topology::TopologyCache;
use watchpost_core::config::ActionConfig;
use watchpost_core::strategy::Strategy;
use watchpost_core::types::{DataPoint, DimensionMap, NO_DATA_TAG_DIMENSION, TriggeredEvent};
use watchpost_detect::detector::DetectWorker;
use watchpost_detect::result_cache::MemoryResultStore;
use watchpost_detect::trigger::TriggerEvaluator;

use super::fakes::{EmptyCmdb, ScriptedFactory, ScriptedShields, StaticStrategies};

/// Detect block list: level 1 threshold with the given trigger count, plus
/// a level 2 block (count 1) so no-data anomalies can fire.
pub fn detects_json(trigger_count: u32) -> serde_json::Value {
    serde_json::json!([
        {
            "level": 1,
            "trigger_config": {"count": trigger_count, "check_window": 5},
            "recovery_config": {"check_window": 5}
        },
        {
            "level": 2,
            "trigger_config": {"count": 1, "check_window": 5},
            "recovery_config": {"check_window": 5}
        }
    ])
}

/// Notice binding subscribed to every lifecycle signal the tests exercise.
pub fn notice_json(options: serde_json::Value) -> serde_json::Value {
    serde_json::json!({
        "id": 55,
        "user_groups": [1],
        "signal": ["abnormal", "recovered", "no_data", "unshielded", "closed"],
        "options": options,
        "config": {
            "template": [{
                "signal": "abnormal",
                "title_tmpl": "[{{alarm.level}}] {{alert.name}}",
                "message_tmpl": "ip={{dimensions.ip}}"
            }]
        }
    })
}

pub fn cpu_strategy(trigger_count: u32, notice_options: serde_json::Value) -> Strategy {
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
                }],
                "no_data_config": {"is_enabled": true, "continuous": 3, "level": 2},
                "algorithms": [{
                    "level": 1,
                    "type": "Threshold",
                    "config": [[{"method": "lt", "threshold": 10}]]
                }]
            }],
            "detects": detects_json(trigger_count),
            "notice": notice_json(notice_options)
        })
        .to_string(),
    )
    .expect("fixture strategy should parse")
}

pub fn point(ts: i64, value: f64) -> DataPoint {
    let mut dims = DimensionMap::new();
    dims.insert("ip".to_owned(), serde_json::json!("10.0.0.1"));
    DataPoint {
        strategy_id: 101,
        item_id: 1001,
        dimensions: dims,
        timestamp: ts,
        value,
        record_id: None,
    }
}

pub fn no_data_point(ts: i64) -> DataPoint {
    let mut p = point(ts, 0.0);
    p.dimensions
        .insert(NO_DATA_TAG_DIMENSION.to_owned(), serde_json::json!(true));
    p
}

/// Shield covering a whole strategy for `[begin_time, end_time)`.
pub fn strategy_shield(strategy_id: u64, begin_time: i64, end_time: i64) -> Shield {
    Shield {
        id: 9,
        bk_biz_id: 2,
        category: ShieldCategory::Strategy,
        scope_type: String::new(),
        dimension_config: serde_json::json!({"strategy_ids": [strategy_id]}),
        cycle_config: CycleConfig::default(),
        begin_time,
        end_time,
        is_enabled: true,
    }
}

/// Detect stage wired to a fresh strategy cache and result store.
pub async fn detect_stage(
    strategies: Vec<Strategy>,
) -> (DetectWorker, mpsc::Receiver<TriggeredEvent>) {
    let cache = Arc::new(StrategyCache::new(
        Arc::new(StaticStrategies(strategies)),
        Duration::from_secs(60),
    ));
    cache.refresh().await.expect("strategy cache refresh");
    let trigger = TriggerEvaluator::new(Arc::new(MemoryResultStore::new(3600)));
    let (tx, rx) = mpsc::channel(32);
    (DetectWorker::new(cache, trigger, tx), rx)
}

/// Alert stage with scripted shields; the shield cache TTL is zero so
/// every check sees the current scripted set.
pub fn alert_stage(
    shields: Vec<Shield>,
) -> (
    Arc<AlertManager>,
    mpsc::Receiver<AlertSignal>,
    Arc<ScriptedShields>,
) {
    let source = Arc::new(ScriptedShields::new(shields));
    let shield_cache = Arc::new(ShieldCache::new(source.clone(), Duration::from_millis(0)));
    let topology = Arc::new(TopologyCache::new(
        Arc::new(EmptyCmdb),
        Duration::from_secs(600),
    ));
    let (tx, rx) = mpsc::channel(32);
    let manager = Arc::new(AlertManager::new(
        Enricher::new(topology),
        ShieldEvaluator::new(shield_cache),
        tx,
        ManagerOptions::default(),
    ));
    (manager, rx, source)
}

/// Action stage with scripted sinks and default convergence options.
pub fn action_stage(config: ActionConfig) -> ActionExecutor {
    ActionExecutor::new(
        config,
        Arc::new(Converger::new(ConvergeOptions::default())),
        Arc::new(ScriptedFactory),
    )
}

/// Action config pushing to a single always-ok queue.
pub fn single_queue_config() -> ActionConfig {
    ActionConfig {
        enable_message_queue: true,
        message_queue_dsn: Some(watchpost_core::config::MessageQueueDsn::Single(
            "redis://localhost:6379/0/alerts".to_owned(),
        )),
        ..ActionConfig::default()
    }
}
