//! 접근 프로세서 — 전략별 윈도우 풀링, 정규화, 배치 방출
//!
//! 틱마다 각 전략 항목의 `[from, until]` 윈도우를 어댑터로 쿼리하고,
//! 정규화·필터링한 포인트를 bounded 채널로 하류(탐지)에 보냅니다.
//!
//! - 외부 쿼리는 상수 백오프로 제한 횟수 재시도합니다.
//! - 소스가 배치를 거부하면 윈도우를 절반으로 나눠 다시 쿼리합니다.
//! - 접근 큐가 고수위를 넘으면 비중요(치명 레벨 없는) 전략을 이번
//!   틱에서 건너뛰고 `backlog_skip`을 로그합니다.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use watchpost_cache::{StrategyCache, TopologyCache};
use watchpost_core::error::{PipelineError, WatchpostError};
use watchpost_core::pipeline::{HealthStatus, Pipeline, PipelineState};
use watchpost_core::strategy::{Item, Strategy};
use watchpost_core::types::{BatchCounts, DataPoint, Severity};

use crate::adapter::{DataSourceAdapter, QueryRequest, QueryRow, normalize};
use crate::error::AccessError;
use crate::filters::{FilterChain, TargetContext};

/// 조건 재확인이 필요한 ADVANCE 메서드
const ADVANCE_METHODS: &[&str] = &["include", "exclude", "reg"];

/// 프로세서 튜닝 값
#[derive(Debug, Clone)]
pub struct ProcessorOptions {
    pub batch_size: usize,
    pub pull_interval_secs: u64,
    pub max_lag_secs: i64,
    pub retry_limit: u32,
    pub retry_backoff: Duration,
    pub backlog_high_watermark: usize,
}

impl Default for ProcessorOptions {
    fn default() -> Self {
        Self {
            batch_size: 500,
            pull_interval_secs: 60,
            max_lag_secs: 600,
            retry_limit: 3,
            retry_backoff: Duration::from_millis(500),
            backlog_high_watermark: 10_000,
        }
    }
}

/// 접근 워커 — 실제 풀링/필터링 로직
///
/// 파이프라인 래퍼와 분리되어 있어 틱을 직접 호출해 결정적으로
/// 테스트할 수 있습니다.
pub struct AccessWorker {
    adapter: Arc<dyn DataSourceAdapter>,
    strategies: Arc<StrategyCache>,
    topology: Arc<TopologyCache>,
    output: mpsc::Sender<DataPoint>,
    options: ProcessorOptions,
    filters: HashMap<(u64, u64), FilterChain>,
    /// 항목별 마지막 처리 윈도우 끝 (워터마크)
    watermarks: HashMap<(u64, u64), i64>,
}

impl AccessWorker {
    pub fn new(
        adapter: Arc<dyn DataSourceAdapter>,
        strategies: Arc<StrategyCache>,
        topology: Arc<TopologyCache>,
        output: mpsc::Sender<DataPoint>,
        options: ProcessorOptions,
    ) -> Self {
        Self {
            adapter,
            strategies,
            topology,
            output,
            options,
            filters: HashMap::new(),
            watermarks: HashMap::new(),
        }
    }

    fn pending_in_queue(&self) -> usize {
        self.output.max_capacity() - self.output.capacity()
    }

    fn is_critical(strategy: &Strategy) -> bool {
        strategy.detect_for_level(Severity::Critical).is_some()
    }

    /// 한 틱을 처리합니다. `now`는 초 단위 현재 시각입니다.
    pub async fn process_tick(&mut self, now: i64) -> BatchCounts {
        let mut totals = BatchCounts::default();
        let backlogged = self.pending_in_queue() > self.options.backlog_high_watermark;

        for strategy in self.strategies.all().await {
            if backlogged && !Self::is_critical(&strategy) {
                info!(
                    strategy_id = strategy.id,
                    pending = self.pending_in_queue(),
                    "backlog_skip"
                );
                continue;
            }
            for item in strategy.items.clone() {
                let counts = self.process_item(&strategy, &item, now).await;
                totals.ok += counts.ok;
                totals.dropped += counts.dropped;
                totals.failed += counts.failed;
            }
        }
        totals
    }

    /// 항목 하나의 윈도우를 당겨 처리합니다.
    pub async fn process_item(
        &mut self,
        strategy: &Strategy,
        item: &Item,
        now: i64,
    ) -> BatchCounts {
        let key = (strategy.id, item.id);
        let interval = self.options.pull_interval_secs as i64;
        let until = now;
        let from = self
            .watermarks
            .get(&key)
            .map(|w| w + 1)
            .unwrap_or(until - interval + 1);

        let rows = match self.query_item(item, from, until).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!(
                    strategy_id = strategy.id,
                    item_id = item.id,
                    error = %e,
                    "item pull failed, will retry next tick"
                );
                metrics::counter!("watchpost_access_pull_failures_total").increment(1);
                return BatchCounts {
                    failed: 1,
                    ..BatchCounts::default()
                };
            }
        };

        let mut points = Vec::with_capacity(rows.len());
        let mut counts = BatchCounts::default();
        for row in rows {
            match normalize(strategy.id, item.id, row) {
                Ok(point) => points.push(point),
                Err(e) => {
                    debug!(strategy_id = strategy.id, error = %e, "dropping unnormalizable row");
                    counts.failed += 1;
                }
            }
        }

        let contexts = self.build_target_contexts(&points).await;
        let recheck = item.query_configs.iter().any(|qc| {
            qc.agg_condition
                .iter()
                .any(|c| ADVANCE_METHODS.contains(&c.method.as_str()))
        });
        let table = item
            .query_configs
            .first()
            .map(|qc| qc.result_table_id.clone())
            .unwrap_or_default();
        let conditions = item
            .query_configs
            .first()
            .map(|qc| qc.agg_condition.clone())
            .unwrap_or_default();

        let chain = self
            .filters
            .entry(key)
            .or_insert_with(|| FilterChain::new(self.options.max_lag_secs, 3 * interval));
        let (passed, filter_counts) = chain.apply(
            points,
            now,
            &item.target,
            &conditions,
            recheck,
            &table,
            |point| {
                let ip = point
                    .dimensions
                    .get("bk_target_ip")
                    .or_else(|| point.dimensions.get("ip"))?
                    .as_str()?
                    .to_owned();
                let cloud = point
                    .dimensions
                    .get("bk_target_cloud_id")
                    .or_else(|| point.dimensions.get("bk_cloud_id"))
                    .and_then(|v| v.as_i64())
                    .unwrap_or(0);
                contexts.get(&format!("{ip}|{cloud}")).cloned()
            },
        );
        counts.ok += filter_counts.ok;
        counts.dropped += filter_counts.dropped;
        counts.failed += filter_counts.failed;

        if self.send_batch(passed).await.is_ok() {
            self.watermarks.insert(key, until);
        } else {
            counts.failed += counts.ok;
            counts.ok = 0;
        }

        metrics::counter!("watchpost_access_points_total", "result" => "ok")
            .increment(counts.ok as u64);
        metrics::counter!("watchpost_access_points_total", "result" => "dropped")
            .increment(counts.dropped as u64);
        counts
    }

    /// 항목의 쿼리 설정들을 실행하고 expression으로 합성합니다.
    async fn query_item(
        &self,
        item: &Item,
        from_s: i64,
        until_s: i64,
    ) -> Result<Vec<QueryRow>, AccessError> {
        let mut per_alias: Vec<(String, Vec<QueryRow>)> = Vec::new();
        for (idx, qc) in item.query_configs.iter().enumerate() {
            let request = QueryRequest::from_config(qc, from_s, until_s).map_err(|e| {
                AccessError::Normalize {
                    reason: e.to_string(),
                }
            })?;
            let rows = self.query_with_split(&request).await?;
            let alias = qc
                .alias
                .clone()
                .unwrap_or_else(|| ((b'a' + idx as u8) as char).to_string());
            per_alias.push((alias, rows));
        }

        match per_alias.len() {
            0 => Ok(vec![]),
            1 => Ok(per_alias.remove(0).1),
            _ => Ok(combine_rows(&item.expression, per_alias)),
        }
    }

    /// 소스가 배치를 거부하면 범위를 절반으로 나눠 양쪽을 다시
    /// 쿼리합니다. 한 집계 주기까지 좁아져도 거부되면 포기합니다.
    async fn query_with_split(
        &self,
        request: &QueryRequest,
    ) -> Result<Vec<QueryRow>, AccessError> {
        let min_span_ms = (request.interval_s.max(1) * 1000) as i64;
        let mut pending = vec![request.clone()];
        let mut rows = Vec::new();
        while let Some(req) = pending.pop() {
            match self.query_with_retry(&req).await {
                Ok(mut batch) => rows.append(&mut batch),
                Err(AccessError::BatchRejected { reason }) => {
                    if req.end_ms - req.start_ms <= min_span_ms {
                        return Err(AccessError::BatchRejected { reason });
                    }
                    warn!(
                        start_ms = req.start_ms,
                        end_ms = req.end_ms,
                        reason = %reason,
                        "batch rejected, splitting range"
                    );
                    let (left, right) = req.split();
                    pending.push(right);
                    pending.push(left);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(rows)
    }

    async fn query_with_retry(
        &self,
        request: &QueryRequest,
    ) -> Result<Vec<QueryRow>, AccessError> {
        let mut last_reason = String::new();
        for attempt in 1..=self.options.retry_limit {
            match self.adapter.query(request).await {
                Ok(rows) => return Ok(rows),
                Err(AccessError::Forbidden { user }) => {
                    return Err(AccessError::Forbidden { user });
                }
                Err(AccessError::BatchRejected { reason }) => {
                    return Err(AccessError::BatchRejected { reason });
                }
                Err(e) => {
                    last_reason = e.to_string();
                    debug!(attempt, error = %e, "query attempt failed");
                    if attempt < self.options.retry_limit {
                        tokio::time::sleep(self.options.retry_backoff).await;
                    }
                }
            }
        }
        Err(AccessError::RetryExhausted {
            attempts: self.options.retry_limit,
            reason: last_reason,
        })
    }

    /// bounded 채널로 배치를 보냅니다. 채널이 가득 차면 여기서 대기해
    /// 상류에 역압이 걸립니다.
    async fn send_batch(&self, points: Vec<DataPoint>) -> Result<(), AccessError> {
        for chunk in points.chunks(self.options.batch_size) {
            for point in chunk {
                self.output
                    .send(point.clone())
                    .await
                    .map_err(|_| AccessError::ChannelClosed)?;
            }
        }
        Ok(())
    }

    async fn build_target_contexts(
        &self,
        points: &[DataPoint],
    ) -> HashMap<String, TargetContext> {
        let mut contexts = HashMap::new();
        for point in points {
            let Some(ip) = point
                .dimensions
                .get("bk_target_ip")
                .or_else(|| point.dimensions.get("ip"))
                .and_then(|v| v.as_str())
            else {
                continue;
            };
            let cloud = point
                .dimensions
                .get("bk_target_cloud_id")
                .or_else(|| point.dimensions.get("bk_cloud_id"))
                .and_then(|v| v.as_i64())
                .unwrap_or(0);
            let key = format!("{ip}|{cloud}");
            if contexts.contains_key(&key) {
                continue;
            }
            let ctx = match self.topology.host_by_ip_cloud(ip, cloud).await {
                Ok(Some(host)) => Some(TargetContext {
                    bk_target_ip: Some(host.ip.clone()),
                    bk_target_cloud_id: Some(host.bk_cloud_id),
                    topo_nodes: host
                        .topo_nodes
                        .iter()
                        .map(|n| (n.bk_obj_id.clone(), n.bk_inst_id))
                        .collect(),
                    service_instance_id: None,
                    dynamic_group_ids: vec![],
                }),
                Ok(None) => Some(TargetContext {
                    bk_target_ip: Some(ip.to_owned()),
                    bk_target_cloud_id: Some(cloud),
                    ..TargetContext::default()
                }),
                Err(e) => {
                    debug!(ip, error = %e, "topology lookup failed for target context");
                    None
                }
            };
            if let Some(ctx) = ctx {
                contexts.insert(key, ctx);
            }
        }
        contexts
    }
}

/// 여러 쿼리 결과를 `(차원, 타임스탬프)`로 조인하고 expression을
/// 좌결합 이항 연산으로 평가합니다. 별칭이 빠진 그룹은 버립니다.
fn combine_rows(expression: &str, per_alias: Vec<(String, Vec<QueryRow>)>) -> Vec<QueryRow> {
    use std::collections::BTreeMap;

    let mut groups: BTreeMap<(String, i64), (QueryRow, HashMap<String, f64>)> = BTreeMap::new();
    for (alias, rows) in per_alias {
        for row in rows {
            let key = (
                watchpost_core::fingerprint::dimensions_md5(&row.dimensions),
                row.timestamp_ms,
            );
            let entry = groups
                .entry(key)
                .or_insert_with(|| (row.clone(), HashMap::new()));
            entry.1.insert(alias.clone(), row.value);
        }
    }

    let tokens: Vec<&str> = expression.split_whitespace().collect();
    let mut combined = Vec::new();
    'group: for (_, (mut row, values)) in groups {
        let mut result = match tokens.first().and_then(|t| values.get(*t)) {
            Some(v) => *v,
            None => continue 'group,
        };
        let mut i = 1;
        while i + 1 < tokens.len() {
            let op = tokens[i];
            let Some(rhs) = tokens.get(i + 1).and_then(|t| values.get(*t)) else {
                continue 'group;
            };
            result = match op {
                "+" => result + rhs,
                "-" => result - rhs,
                "*" => result * rhs,
                "/" => {
                    if *rhs == 0.0 {
                        continue 'group;
                    }
                    result / rhs
                }
                _ => continue 'group,
            };
            i += 2;
        }
        row.value = result;
        combined.push(row);
    }
    combined
}

/// 접근 단계 파이프라인 래퍼
pub struct AccessPipeline {
    state: PipelineState,
    worker: Option<AccessWorker>,
    handle: Option<JoinHandle<()>>,
    cancel: CancellationToken,
    interval: Duration,
}

impl AccessPipeline {
    pub fn new(worker: AccessWorker) -> Self {
        let interval = Duration::from_secs(worker.options.pull_interval_secs);
        Self {
            state: PipelineState::Created,
            worker: Some(worker),
            handle: None,
            cancel: CancellationToken::new(),
            interval,
        }
    }
}

impl Pipeline for AccessPipeline {
    fn name(&self) -> &str {
        "access"
    }

    fn state(&self) -> PipelineState {
        self.state
    }

    async fn start(&mut self) -> Result<(), WatchpostError> {
        if self.state == PipelineState::Running {
            return Err(PipelineError::AlreadyRunning.into());
        }
        let mut worker = self
            .worker
            .take()
            .ok_or_else(|| PipelineError::InitFailed("access worker already consumed".to_owned()))?;
        let cancel = self.cancel.clone();
        let interval = self.interval;
        self.handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let now = chrono_now();
                        let counts = worker.process_tick(now).await;
                        debug!(ok = counts.ok, dropped = counts.dropped, failed = counts.failed, "access tick complete");
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

fn chrono_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
