//! 탐지 워커 — 포인트 스트림 판정과 트리거 연결
//!
//! 접근 단계가 보낸 포인트를 전략별 컴파일된 알고리즘으로 판정하고,
//! 결과를 트리거 평가기에 넘깁니다. 알고리즘 컴파일 실패는 해당 전략을
//! 거부하며, 전략 갱신 시각이 바뀌면 다시 컴파일합니다.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use watchpost_cache::strategy::StrategyCache;
use watchpost_core::error::{PipelineError, StrategyError, WatchpostError};
use watchpost_core::pipeline::{HealthStatus, Pipeline, PipelineState};
use watchpost_core::strategy::{Item, Strategy};
use watchpost_core::types::{AnomalyInfo, AnomalyPoint, DataPoint, TriggeredEvent};

use crate::algorithm::{CompiledAlgorithm, IntelligentDetector};
use crate::error::DetectError;
use crate::trigger::TriggerEvaluator;

/// 한 항목의 레벨별 컴파일 결과
pub struct ItemDetector {
    by_level: Vec<LevelDetector>,
}

struct LevelDetector {
    connector: String,
    algorithms: Vec<CompiledAlgorithm>,
}

impl ItemDetector {
    /// 항목의 모든 레벨 알고리즘을 컴파일합니다. 한 레벨이라도 스키마
    /// 위반이면 전략 전체가 거부됩니다.
    pub fn compile(strategy: &Strategy, item: &Item) -> Result<Self, StrategyError> {
        let mut by_level = Vec::new();
        for level in strategy.levels_high_to_low() {
            let specs = item.algorithms_at_level(level);
            if specs.is_empty() {
                continue;
            }
            let connector = strategy
                .detect_for_level(level)
                .map(|block| block.connector.clone())
                .unwrap_or_else(|| "and".to_owned());
            let algorithms = specs
                .iter()
                .map(|spec| CompiledAlgorithm::compile(spec, strategy.id))
                .collect::<Result<Vec<_>, _>>()?;
            by_level.push(LevelDetector {
                connector,
                algorithms,
            });
        }
        Ok(Self { by_level })
    }

    /// 포인트를 모든 레벨로 판정합니다.
    ///
    /// `and` 연결자는 레벨 내 모든 알고리즘이 이상이어야 하고, `or`는
    /// 하나면 충분합니다.
    pub fn check(
        &self,
        point: &DataPoint,
        prev: Option<f64>,
        intelligent: Option<&dyn IntelligentDetector>,
    ) -> AnomalyPoint {
        let mut by_level = BTreeMap::new();
        for level_detector in &self.by_level {
            let messages: Vec<String> = level_detector
                .algorithms
                .iter()
                .filter_map(|a| a.evaluate(point, prev, intelligent))
                .collect();
            let flagged = if level_detector.connector == "or" {
                !messages.is_empty()
            } else {
                messages.len() == level_detector.algorithms.len()
            };
            if flagged {
                let level = level_detector.algorithms[0].level;
                by_level.insert(
                    level,
                    AnomalyInfo {
                        anomaly_id: AnomalyPoint::format_anomaly_id(point, level),
                        anomaly_message: messages.join("; "),
                    },
                );
            }
        }
        AnomalyPoint {
            point: point.clone(),
            by_level,
        }
    }
}

/// 컴파일 캐시 항목 — `None`은 컴파일 거부된 전략
type CachedDetector = (i64, Option<Arc<ItemDetector>>);

/// 탐지 워커
pub struct DetectWorker {
    strategies: Arc<StrategyCache>,
    trigger: TriggerEvaluator,
    output: mpsc::Sender<TriggeredEvent>,
    intelligent: Option<Arc<dyn IntelligentDetector>>,
    detectors: HashMap<(u64, u64), CachedDetector>,
    prev_values: HashMap<(u64, u64, String), f64>,
}

impl DetectWorker {
    pub fn new(
        strategies: Arc<StrategyCache>,
        trigger: TriggerEvaluator,
        output: mpsc::Sender<TriggeredEvent>,
    ) -> Self {
        Self {
            strategies,
            trigger,
            output,
            intelligent: None,
            detectors: HashMap::new(),
            prev_values: HashMap::new(),
        }
    }

    /// 지능형 탐지 판정기 훅을 등록합니다.
    pub fn with_intelligent(mut self, hook: Arc<dyn IntelligentDetector>) -> Self {
        self.intelligent = Some(hook);
        self
    }

    /// 포인트 하나를 판정하고 발화한 이벤트를 하류로 보냅니다.
    pub async fn process_point(&mut self, point: DataPoint) -> Result<(), DetectError> {
        let strategy = self
            .strategies
            .get(point.strategy_id)
            .await
            .map_err(|_| DetectError::UnknownStrategy {
                strategy_id: point.strategy_id,
            })?;
        let Some(item) = strategy.items.iter().find(|i| i.id == point.item_id) else {
            debug!(
                strategy_id = point.strategy_id,
                item_id = point.item_id,
                "point references unknown item, dropped"
            );
            return Ok(());
        };

        let anomaly = if point.is_no_data() {
            // no-data 포인트는 알고리즘을 거치지 않고 no_data 설정
            // 레벨로 바로 이상 표시된다.
            let level = item.no_data_config.level;
            let mut by_level = BTreeMap::new();
            by_level.insert(
                level,
                AnomalyInfo {
                    anomaly_id: AnomalyPoint::format_anomaly_id(&point, level),
                    anomaly_message: format!(
                        "no data reported for {} cycles",
                        item.no_data_config.continuous
                    ),
                },
            );
            AnomalyPoint {
                point: point.clone(),
                by_level,
            }
        } else {
            let Some(detector) = self.detector_for(&strategy, item) else {
                return Ok(());
            };
            let prev_key = (
                point.strategy_id,
                point.item_id,
                point.dimensions_md5(),
            );
            let prev = self.prev_values.get(&prev_key).copied();
            let anomaly = detector.check(&point, prev, self.intelligent.as_deref());
            self.prev_values.insert(prev_key, point.value);
            anomaly
        };

        if !anomaly.by_level.is_empty() {
            metrics::counter!("watchpost_detect_anomalies_total").increment(1);
        }

        if let Some(event) = self
            .trigger
            .record_and_check(&strategy, item, &anomaly)
            .await?
        {
            self.output
                .send(event)
                .await
                .map_err(|_| DetectError::ChannelClosed)?;
        } else if anomaly.by_level.is_empty() {
            // 모든 레벨에서 정상인 포인트는 회복 신호로 하류에 알린다.
            // 열린 알림이 없으면 경보 관리자가 그냥 버린다.
            let severity = strategy
                .levels_high_to_low()
                .last()
                .copied()
                .unwrap_or(watchpost_core::types::Severity::Info);
            let event = TriggeredEvent {
                id: uuid::Uuid::new_v4().to_string(),
                strategy_id: strategy.id,
                item_id: item.id,
                severity,
                status: watchpost_core::types::EventStatus::Recovered,
                data: point.clone(),
                anomaly_ids: vec![],
                strategy_snapshot_key: strategy.snapshot_key(),
                strategy: Arc::clone(&strategy),
                description: "point within normal range".to_owned(),
                time: point.timestamp,
                anomaly_time: point.timestamp,
                is_no_data: false,
            };
            self.output
                .send(event)
                .await
                .map_err(|_| DetectError::ChannelClosed)?;
        }
        Ok(())
    }

    /// 컴파일 캐시에서 탐지기를 꺼내거나 새로 컴파일합니다.
    fn detector_for(&mut self, strategy: &Arc<Strategy>, item: &Item) -> Option<Arc<ItemDetector>> {
        let key = (strategy.id, item.id);
        if let Some((update_time, cached)) = self.detectors.get(&key)
            && *update_time == strategy.update_time
        {
            return cached.clone();
        }
        let compiled = match ItemDetector::compile(strategy, item) {
            Ok(detector) => Some(Arc::new(detector)),
            Err(err) => {
                warn!(strategy_id = strategy.id, error = %err, "strategy rejected");
                None
            }
        };
        self.detectors
            .insert(key, (strategy.update_time, compiled.clone()));
        compiled
    }
}

/// 탐지 단계 파이프라인 래퍼
pub struct DetectPipeline {
    state: PipelineState,
    worker: Option<(DetectWorker, mpsc::Receiver<DataPoint>)>,
    handle: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl DetectPipeline {
    pub fn new(worker: DetectWorker, input: mpsc::Receiver<DataPoint>) -> Self {
        Self {
            state: PipelineState::Created,
            worker: Some((worker, input)),
            handle: None,
            cancel: CancellationToken::new(),
        }
    }
}

impl Pipeline for DetectPipeline {
    fn name(&self) -> &str {
        "detect"
    }

    fn state(&self) -> PipelineState {
        self.state
    }

    async fn start(&mut self) -> Result<(), WatchpostError> {
        if self.state == PipelineState::Running {
            return Err(PipelineError::AlreadyRunning.into());
        }
        let (mut worker, mut input) = self
            .worker
            .take()
            .ok_or_else(|| PipelineError::InitFailed("detect worker already consumed".to_owned()))?;
        let cancel = self.cancel.clone();
        self.handle = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    point = input.recv() => {
                        let Some(point) = point else { break };
                        match worker.process_point(point).await {
                            Ok(()) => {}
                            Err(DetectError::ChannelClosed) => break,
                            Err(err) => {
                                warn!(error = %err, "point dropped");
                            }
                        }
                    }
                }
            }
        }));
        self.state = PipelineState::Running;
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), WatchpostError> {
        if self.state != PipelineState::Running {
            return Err(PipelineError::NotRunning.into());
        }
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
        self.state = PipelineState::Stopped;
        Ok(())
    }

    async fn health_check(&self) -> HealthStatus {
        match self.state {
            PipelineState::Running => HealthStatus::Healthy,
            _ => HealthStatus::Unhealthy(format!("state: {}", self.state)),
        }
    }
}
