//! 전략 캐시 — 읽기 전용 스냅샷과 파생 인덱스
//!
//! 설정 스토어에서 활성 전략을 읽어 와 파생 맵을 재구축합니다:
//! - `by_id` — 전략 ID 조회
//! - `by_fingerprint` — 항목 query_md5 → 전략 (접근 디스패치 키)
//! - 역인덱스 `(result_table, bk_biz_id, data_source_label)` → 전략 ID들
//!
//! 읽기는 `Arc<StrategySnapshot>` 스왑으로 락 없이 이루어지고, 갱신은
//! 백그라운드 리프레셔가 전체 스냅샷을 새로 만들어 교체합니다. 스냅샷에는
//! 단조 증가 버전이 붙어 독자가 staleness를 감지할 수 있습니다.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::{debug, warn};

use watchpost_core::BoxFuture;
use watchpost_core::strategy::{NoticeRelation, Strategy};

use crate::error::CacheError;

/// 전략을 내려주는 설정 스토어 어댑터
pub trait StrategySource: Send + Sync {
    /// 활성(enabled) 전략 전체를 가져옵니다.
    fn fetch_enabled(&self) -> BoxFuture<'_, Result<Vec<Strategy>, CacheError>>;
}

/// 패킷 라우팅 키: 어떤 전략이 이 데이터에 관심이 있는가
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RouteKey {
    pub result_table_id: String,
    pub bk_biz_id: i64,
    pub data_source_label: String,
}

/// 불변 전략 스냅샷
pub struct StrategySnapshot {
    pub version: u64,
    by_id: HashMap<u64, Arc<Strategy>>,
    by_fingerprint: HashMap<String, Vec<Arc<Strategy>>>,
    notice_by_strategy: HashMap<u64, NoticeRelation>,
    route_index: HashMap<RouteKey, Vec<u64>>,
}

impl StrategySnapshot {
    fn build(version: u64, strategies: Vec<Strategy>) -> Self {
        let mut by_id = HashMap::new();
        let mut by_fingerprint: HashMap<String, Vec<Arc<Strategy>>> = HashMap::new();
        let mut notice_by_strategy = HashMap::new();
        let mut route_index: HashMap<RouteKey, Vec<u64>> = HashMap::new();

        for mut strategy in strategies {
            if !strategy.is_enabled {
                continue;
            }
            strategy.apply_compat_defaults();
            let strategy = Arc::new(strategy);
            notice_by_strategy.insert(strategy.id, strategy.notice.clone());

            for item in &strategy.items {
                by_fingerprint
                    .entry(item.query_md5())
                    .or_default()
                    .push(Arc::clone(&strategy));
                for qc in &item.query_configs {
                    let key = RouteKey {
                        result_table_id: qc.result_table_id.clone(),
                        bk_biz_id: strategy.bk_biz_id,
                        data_source_label: qc.data_source_label.clone(),
                    };
                    let ids = route_index.entry(key).or_default();
                    if !ids.contains(&strategy.id) {
                        ids.push(strategy.id);
                    }
                }
            }
            by_id.insert(strategy.id, strategy);
        }

        Self {
            version,
            by_id,
            by_fingerprint,
            notice_by_strategy,
            route_index,
        }
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// 스냅샷의 모든 전략
    pub fn all(&self) -> Vec<Arc<Strategy>> {
        let mut strategies: Vec<Arc<Strategy>> = self.by_id.values().cloned().collect();
        strategies.sort_by_key(|s| s.id);
        strategies
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

/// 프로세스 전역 전략 캐시
pub struct StrategyCache {
    source: Arc<dyn StrategySource>,
    snapshot: RwLock<Arc<StrategySnapshot>>,
    version: AtomicU64,
    refresh_interval: Duration,
    last_refresh: RwLock<Option<Instant>>,
}

impl StrategyCache {
    /// 빈 캐시를 생성합니다. 첫 사용 전 [`refresh`](Self::refresh)가 필요합니다.
    pub fn new(source: Arc<dyn StrategySource>, refresh_interval: Duration) -> Self {
        Self {
            source,
            snapshot: RwLock::new(Arc::new(StrategySnapshot::build(0, vec![]))),
            version: AtomicU64::new(0),
            refresh_interval,
            last_refresh: RwLock::new(None),
        }
    }

    /// 현재 스냅샷 버전
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// 스토어에서 전략을 다시 읽어 스냅샷을 교체합니다.
    ///
    /// 실패하면 이전 스냅샷이 유지되고 에러가 반환됩니다.
    pub async fn refresh(&self) -> Result<(), CacheError> {
        let strategies = self.source.fetch_enabled().await.map_err(|e| {
            warn!(error = %e, "strategy cache refresh failed, keeping previous snapshot");
            CacheError::RefreshFailed {
                reason: e.to_string(),
            }
        })?;

        let version = self.version.fetch_add(1, Ordering::AcqRel) + 1;
        let next = Arc::new(StrategySnapshot::build(version, strategies));
        debug!(version, strategies = next.len(), "strategy snapshot rebuilt");

        *self.snapshot.write().await = next;
        *self.last_refresh.write().await = Some(Instant::now());
        Ok(())
    }

    /// 마지막 갱신 이후 주기가 지났으면 갱신합니다.
    pub async fn refresh_if_stale(&self) -> Result<(), CacheError> {
        let stale = match *self.last_refresh.read().await {
            Some(at) => at.elapsed() >= self.refresh_interval,
            None => true,
        };
        if stale { self.refresh().await } else { Ok(()) }
    }

    /// 명시적 무효화 — 다음 `refresh_if_stale` 호출이 즉시 갱신하게 합니다.
    pub async fn invalidate(&self) {
        *self.last_refresh.write().await = None;
    }

    /// 현재 스냅샷 핸들
    pub async fn snapshot(&self) -> Arc<StrategySnapshot> {
        Arc::clone(&*self.snapshot.read().await)
    }

    /// ID로 전략을 조회합니다. 미스는 `StrategyNotFound`이며 호출자는
    /// 해당 레코드를 드롭해야 합니다.
    pub async fn get(&self, strategy_id: u64) -> Result<Arc<Strategy>, CacheError> {
        self.snapshot()
            .await
            .by_id
            .get(&strategy_id)
            .cloned()
            .ok_or(CacheError::StrategyNotFound { strategy_id })
    }

    /// 항목 지문으로 전략을 조회합니다 (접근 디스패치).
    pub async fn by_fingerprint(&self, query_md5: &str) -> Vec<Arc<Strategy>> {
        self.snapshot()
            .await
            .by_fingerprint
            .get(query_md5)
            .cloned()
            .unwrap_or_default()
    }

    /// 새 데이터 패킷이 어떤 전략과 관련 있는지 역인덱스로 조회합니다.
    pub async fn route(&self, key: &RouteKey) -> Vec<u64> {
        self.snapshot()
            .await
            .route_index
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    /// 스냅샷의 모든 전략 (ID 순)
    pub async fn all(&self) -> Vec<Arc<Strategy>> {
        self.snapshot().await.all()
    }

    /// 전략의 notice 바인딩
    pub async fn notice_for(&self, strategy_id: u64) -> Result<NoticeRelation, CacheError> {
        self.snapshot()
            .await
            .notice_by_strategy
            .get(&strategy_id)
            .cloned()
            .ok_or(CacheError::StrategyNotFound { strategy_id })
    }
}
