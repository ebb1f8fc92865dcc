//! 데이터 소스 어댑터 — `(source_label, type_label)` 디스패치와 정규화
//!
//! 어댑터 API는 밀리초를 쓰고, 파이프라인 내부는 전부 초를 씁니다.
//! 변환은 이 모듈의 정규화 지점 한 곳에서만 일어납니다.

use serde::{Deserialize, Serialize};

use watchpost_core::BoxFuture;
use watchpost_core::error::StrategyError;
use watchpost_core::strategy::{AggCondition, QueryConfig};
use watchpost_core::types::{DataPoint, DimensionMap};

use crate::error::AccessError;

/// 지원하는 소스 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// 시계열 메트릭
    TimeSeries,
    /// 로그 집계 (문서 건수/집계값)
    LogAggregate,
    /// 플랫폼 이벤트
    Event,
    /// 서드파티 알림 피드
    ExternalAlert,
}

impl SourceKind {
    /// `(source_label, type_label)` 조합을 소스 종류로 해석합니다.
    ///
    /// 지원하지 않는 조합은 설정 에러이며, 전략 로드 시점에 거부됩니다.
    pub fn from_labels(source_label: &str, type_label: &str) -> Result<Self, StrategyError> {
        match type_label {
            "time_series" => Ok(Self::TimeSeries),
            "log" => Ok(Self::LogAggregate),
            "event" => Ok(Self::Event),
            "alert" => Ok(Self::ExternalAlert),
            _ => Err(StrategyError::UnsupportedSource {
                source_label: source_label.to_owned(),
                type_label: type_label.to_owned(),
            }),
        }
    }
}

/// 어댑터 쿼리 요청. 시간은 밀리초입니다.
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub kind: SourceKind,
    pub table: String,
    pub metric_field: String,
    pub agg_method: String,
    pub interval_s: u64,
    pub group_by: Vec<String>,
    pub conditions: Vec<AggCondition>,
    pub functions: Vec<serde_json::Value>,
    pub start_ms: i64,
    pub end_ms: i64,
}

impl QueryRequest {
    /// 쿼리 설정에서 요청을 구성합니다. 윈도우는 초 단위로 받아
    /// 여기서 밀리초로 변환합니다.
    pub fn from_config(qc: &QueryConfig, from_s: i64, until_s: i64) -> Result<Self, StrategyError> {
        let kind = SourceKind::from_labels(&qc.data_source_label, &qc.data_type_label)?;
        Ok(Self {
            kind,
            table: qc.result_table_id.clone(),
            metric_field: qc.metric_field.clone(),
            agg_method: qc.agg_method.clone(),
            interval_s: qc.agg_interval,
            group_by: qc.agg_dimension.clone(),
            conditions: qc.agg_condition.clone(),
            functions: qc.functions.clone(),
            start_ms: from_s * 1000,
            end_ms: until_s * 1000,
        })
    }

    /// 범위를 절반으로 나눕니다. 하류가 배치를 거부했을 때 씁니다.
    pub fn split(&self) -> (Self, Self) {
        let mid = self.start_ms + (self.end_ms - self.start_ms) / 2;
        let mut left = self.clone();
        let mut right = self.clone();
        left.end_ms = mid;
        right.start_ms = mid;
        (left, right)
    }
}

/// 어댑터가 돌려주는 원시 행. 시간은 밀리초입니다.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRow {
    pub dimensions: DimensionMap,
    pub value: f64,
    pub timestamp_ms: i64,
    /// 로그/이벤트 소스의 원본 문서 ID
    #[serde(default)]
    pub record_id: Option<String>,
}

/// 데이터 소스 어댑터 계약
///
/// 행은 윈도우 내에서 타임스탬프 순서가 보장되지 않지만 윈도우 밖의
/// 행을 돌려줘선 안 됩니다.
pub trait DataSourceAdapter: Send + Sync {
    fn query(&self, request: &QueryRequest) -> BoxFuture<'_, Result<Vec<QueryRow>, AccessError>>;
}

/// 원시 행을 DataPoint로 정규화합니다 (ms → s).
pub fn normalize(
    strategy_id: u64,
    item_id: u64,
    row: QueryRow,
) -> Result<DataPoint, AccessError> {
    if !row.value.is_finite() {
        return Err(AccessError::Normalize {
            reason: format!("non-finite value for strategy {strategy_id}"),
        });
    }
    Ok(DataPoint {
        strategy_id,
        item_id,
        dimensions: row.dimensions,
        timestamp: row.timestamp_ms / 1000,
        value: row.value,
        record_id: row.record_id,
    })
}
