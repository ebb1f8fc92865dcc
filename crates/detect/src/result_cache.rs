//! 결과 캐시 — `(전략, 항목, 차원, 레벨)`별 포인트 판정 윈도우
//!
//! 트리거 평가의 직렬화 지점입니다. 같은 키에 대한 추가는 타임스탬프
//! 정렬 맵에 들어가므로, 순서가 뒤섞여 도착한 포인트도 범위 조회에서는
//! 시각 순으로 보입니다.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use watchpost_core::BoxFuture;

use crate::error::DetectError;

/// 포인트 판정 마커
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckMarker {
    Anomaly,
    Normal,
}

/// 윈도우 키
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WindowKey {
    pub strategy_id: u64,
    pub item_id: u64,
    pub dimensions_md5: String,
    pub level: u8,
}

/// 범위 조회 결과 한 항목
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckRecord {
    pub timestamp: i64,
    pub marker: CheckMarker,
}

/// 판정 윈도우 스토어 계약
///
/// 프로세스 내 구현과 외부 키-값 스토어 구현이 같은 계약을 씁니다.
/// 같은 키에 같은 타임스탬프를 다시 추가하면 마지막 판정이 이깁니다.
pub trait ResultWindowStore: Send + Sync {
    fn add(
        &self,
        key: &WindowKey,
        timestamp: i64,
        marker: CheckMarker,
    ) -> BoxFuture<'_, Result<(), DetectError>>;

    /// `[from, to]` 범위의 레코드를 시각 오름차순으로 돌려줍니다.
    fn range(
        &self,
        key: &WindowKey,
        from: i64,
        to: i64,
    ) -> BoxFuture<'_, Result<Vec<CheckRecord>, DetectError>>;
}

/// 인메모리 윈도우 스토어
///
/// 추가 시 보존 지평선보다 오래된 항목을 잘라냅니다.
pub struct MemoryResultStore {
    horizon_secs: i64,
    windows: Mutex<HashMap<WindowKey, BTreeMap<i64, CheckMarker>>>,
}

impl MemoryResultStore {
    pub fn new(horizon_secs: i64) -> Self {
        Self {
            horizon_secs,
            windows: Mutex::new(HashMap::new()),
        }
    }
}

impl ResultWindowStore for MemoryResultStore {
    fn add(
        &self,
        key: &WindowKey,
        timestamp: i64,
        marker: CheckMarker,
    ) -> BoxFuture<'_, Result<(), DetectError>> {
        let key = key.clone();
        Box::pin(async move {
            let mut windows = self.windows.lock().map_err(|e| DetectError::ResultCache {
                reason: e.to_string(),
            })?;
            let window = windows.entry(key).or_default();
            window.insert(timestamp, marker);
            let cutoff = timestamp - self.horizon_secs;
            *window = window.split_off(&cutoff);
            Ok(())
        })
    }

    fn range(
        &self,
        key: &WindowKey,
        from: i64,
        to: i64,
    ) -> BoxFuture<'_, Result<Vec<CheckRecord>, DetectError>> {
        let key = key.clone();
        Box::pin(async move {
            let windows = self.windows.lock().map_err(|e| DetectError::ResultCache {
                reason: e.to_string(),
            })?;
            let records = windows
                .get(&key)
                .map(|window| {
                    window
                        .range(from..=to)
                        .map(|(ts, marker)| CheckRecord {
                            timestamp: *ts,
                            marker: *marker,
                        })
                        .collect()
                })
                .unwrap_or_default();
            Ok(records)
        })
    }
}
