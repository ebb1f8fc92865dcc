//! 전략(모니터링 규칙) 모델
//!
//! 설정 플레인이 내려주는 JSON 전략 문서를 파싱합니다. 하위 호환을 위해
//! 알 수 없는 필드는 무시하고, `detects`가 비어 있으면 레벨 2의 기본
//! 블록(트리거 1/1, 복구 5)으로 채웁니다. 알고리즘 설정 페이로드는
//! 이 단계에서는 원시 JSON으로 보존되고, 탐지 크레이트가 로드 시점에
//! 변형별 스키마로 검증/컴파일합니다.

use serde::{Deserialize, Serialize};

use crate::error::StrategyError;
use crate::fingerprint::object_md5;
use crate::types::{Severity, Signal};

/// 기본 윈도우 단위 (초)
pub const DEFAULT_WINDOW_UNIT_SECS: u64 = 60;

/// 전략 문서
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Strategy {
    pub id: u64,
    pub bk_biz_id: i64,
    pub name: String,
    #[serde(default)]
    pub scenario: String,
    #[serde(default)]
    pub items: Vec<Item>,
    #[serde(default)]
    pub detects: Vec<DetectBlock>,
    #[serde(default)]
    pub notice: NoticeRelation,
    #[serde(default)]
    pub actions: Vec<ActionRelation>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default = "default_true")]
    pub is_enabled: bool,
    /// 설정 플레인의 마지막 갱신 시각 (초). 스냅샷 키 버전으로 쓰입니다.
    #[serde(default)]
    pub update_time: i64,
}

fn default_true() -> bool {
    true
}

impl Strategy {
    /// JSON 문서를 파싱하고 호환 기본값을 적용합니다.
    pub fn from_json(raw: &str) -> Result<Self, StrategyError> {
        let mut strategy: Strategy =
            serde_json::from_str(raw).map_err(|e| StrategyError::ParseFailed {
                reason: e.to_string(),
            })?;
        strategy.apply_compat_defaults();
        Ok(strategy)
    }

    /// 누락된 detects를 기본 블록으로 채웁니다.
    pub fn apply_compat_defaults(&mut self) {
        if self.detects.is_empty() {
            self.detects.push(DetectBlock::default());
        }
    }

    /// 발화 시점 스냅샷 저장 키
    pub fn snapshot_key(&self) -> String {
        format!("snapshot.{}.{}", self.id, self.update_time)
    }

    /// 주어진 레벨의 detect 블록
    pub fn detect_for_level(&self, level: Severity) -> Option<&DetectBlock> {
        self.detects.iter().find(|d| d.level == level)
    }

    /// 전략에 설정된 레벨을 심각도 순(높은 것 먼저)으로 반환합니다.
    pub fn levels_high_to_low(&self) -> Vec<Severity> {
        let mut levels: Vec<Severity> = self.detects.iter().map(|d| d.level).collect();
        levels.sort();
        levels.dedup();
        levels
    }
}

/// 전략 내 단일 모니터링 항목
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Item {
    pub id: u64,
    pub name: String,
    /// 서브 쿼리 조합식 (예: "a + b")
    #[serde(default = "default_expression")]
    pub expression: String,
    #[serde(default)]
    pub query_configs: Vec<QueryConfig>,
    #[serde(default)]
    pub no_data_config: NoDataConfig,
    /// 대상 범위 — 원자 조건의 DNF (바깥 Vec은 OR, 안쪽 Vec은 AND)
    #[serde(default)]
    pub target: Vec<Vec<TargetAtom>>,
    #[serde(default)]
    pub algorithms: Vec<AlgorithmSpec>,
}

fn default_expression() -> String {
    "a".to_owned()
}

impl Item {
    /// 쿼리 설정 지문. 동일한 내용이면 `agg_dimension` 나열 순서와
    /// 무관하게 동일한 값이 나옵니다. 접근 디스패치 키로 쓰입니다.
    pub fn query_md5(&self) -> String {
        let mut canonical = self.query_configs.clone();
        for qc in &mut canonical {
            qc.agg_dimension.sort();
        }
        object_md5(&(&self.expression, &canonical))
    }

    /// 트리거/복구 윈도우의 단위 (초). 첫 쿼리 설정의 집계 주기,
    /// 없으면 60초입니다.
    pub fn window_unit_secs(&self) -> u64 {
        self.query_configs
            .first()
            .map(|qc| qc.agg_interval)
            .filter(|interval| *interval > 0)
            .unwrap_or(DEFAULT_WINDOW_UNIT_SECS)
    }

    /// 주어진 레벨에서 평가할 알고리즘들
    pub fn algorithms_at_level(&self, level: Severity) -> Vec<&AlgorithmSpec> {
        self.algorithms.iter().filter(|a| a.level == level).collect()
    }
}

/// 단일 데이터 소스 쿼리 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryConfig {
    pub data_source_label: String,
    pub data_type_label: String,
    /// 결과 테이블 또는 인덱스
    #[serde(default)]
    pub result_table_id: String,
    #[serde(default)]
    pub metric_field: String,
    #[serde(default)]
    pub agg_method: String,
    /// 집계 주기 (초)
    #[serde(default = "default_agg_interval")]
    pub agg_interval: u64,
    #[serde(default)]
    pub agg_dimension: Vec<String>,
    #[serde(default)]
    pub agg_condition: Vec<AggCondition>,
    #[serde(default)]
    pub functions: Vec<serde_json::Value>,
    /// expression에서 참조하는 별칭
    #[serde(default)]
    pub alias: Option<String>,
}

fn default_agg_interval() -> u64 {
    DEFAULT_WINDOW_UNIT_SECS
}

/// 집계 필터 조건 한 항목
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggCondition {
    pub key: String,
    pub method: String,
    #[serde(default)]
    pub value: Vec<serde_json::Value>,
    /// 앞 항목과의 연결자 ("and"/"or"). 첫 항목에서는 무시됩니다.
    #[serde(default)]
    pub condition: Option<String>,
}

/// 레벨별 탐지 블록
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectBlock {
    pub level: Severity,
    #[serde(default)]
    pub trigger_config: TriggerConfig,
    #[serde(default)]
    pub recovery_config: RecoveryConfig,
    /// 같은 레벨 알고리즘 간 연결자 ("and"/"or")
    #[serde(default = "default_connector")]
    pub connector: String,
    #[serde(default)]
    pub uptime: Option<Uptime>,
}

fn default_connector() -> String {
    "and".to_owned()
}

impl Default for DetectBlock {
    fn default() -> Self {
        Self {
            level: Severity::Warning,
            trigger_config: TriggerConfig::default(),
            recovery_config: RecoveryConfig::default(),
            connector: default_connector(),
            uptime: None,
        }
    }
}

/// 트리거 조건: 윈도우 내 이상 개수
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerConfig {
    pub count: u32,
    pub check_window: u32,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            count: 1,
            check_window: 1,
        }
    }
}

/// 복구 조건: 이상 없이 지나야 하는 윈도우 수
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    pub check_window: u32,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self { check_window: 5 }
    }
}

/// 탐지 유효 시간대 (선택)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Uptime {
    /// "HH:MM--HH:MM" 구간들
    #[serde(default)]
    pub time_ranges: Vec<TimeRange>,
    #[serde(default)]
    pub calendars: Vec<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: String,
    pub end: String,
}

/// no-data 탐지 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoDataConfig {
    #[serde(default)]
    pub is_enabled: bool,
    /// 연속 누락 주기 수
    #[serde(default = "default_continuous")]
    pub continuous: u32,
    #[serde(default)]
    pub agg_dimension: Vec<String>,
    #[serde(default = "default_no_data_level")]
    pub level: Severity,
}

fn default_continuous() -> u32 {
    5
}

fn default_no_data_level() -> Severity {
    Severity::Warning
}

impl Default for NoDataConfig {
    fn default() -> Self {
        Self {
            is_enabled: false,
            continuous: default_continuous(),
            agg_dimension: vec![],
            level: default_no_data_level(),
        }
    }
}

/// 대상 범위 원자 조건 `{field, method, value}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetAtom {
    pub field: String,
    pub method: String,
    #[serde(default)]
    pub value: Vec<serde_json::Value>,
}

/// 알고리즘 명세 (원시 페이로드)
///
/// `config`는 여기서 검증하지 않습니다. 탐지 크레이트가 로드 시점에
/// `algorithm_type`별 스키마로 컴파일하며, 실패하면 전략 전체를 거부합니다.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlgorithmSpec {
    #[serde(default = "default_no_data_level")]
    pub level: Severity,
    #[serde(rename = "type")]
    pub algorithm_type: String,
    #[serde(default)]
    pub config: serde_json::Value,
}

/// 알림(notice) 바인딩
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NoticeRelation {
    #[serde(default)]
    pub id: u64,
    #[serde(default)]
    pub user_groups: Vec<u64>,
    #[serde(default)]
    pub signal: Vec<Signal>,
    #[serde(default)]
    pub config: NoticeConfig,
    #[serde(default)]
    pub options: RelationOptions,
}

/// notice 설정 본문
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoticeConfig {
    /// "standard" 또는 "increasing"
    #[serde(default = "default_notify_mode")]
    pub interval_notify_mode: String,
    /// 재알림 주기 (초)
    #[serde(default = "default_notify_interval")]
    pub notify_interval: i64,
    #[serde(default)]
    pub template: Vec<NoticeTemplate>,
}

fn default_notify_mode() -> String {
    "standard".to_owned()
}

fn default_notify_interval() -> i64 {
    7200
}

impl Default for NoticeConfig {
    fn default() -> Self {
        Self {
            interval_notify_mode: default_notify_mode(),
            notify_interval: default_notify_interval(),
            template: vec![],
        }
    }
}

/// 신호별 알림 템플릿
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NoticeTemplate {
    #[serde(default)]
    pub signal: String,
    #[serde(default)]
    pub title_tmpl: String,
    #[serde(default)]
    pub message_tmpl: String,
}

/// 처리(핸들러) 액션 바인딩
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActionRelation {
    #[serde(default)]
    pub id: u64,
    #[serde(default)]
    pub config_id: u64,
    #[serde(default)]
    pub user_groups: Vec<u64>,
    #[serde(default)]
    pub signal: Vec<Signal>,
    #[serde(default)]
    pub options: RelationOptions,
}

/// 바인딩 공통 옵션
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelationOptions {
    #[serde(default)]
    pub converge_config: Option<ConvergeConfig>,
    #[serde(default)]
    pub noise_reduce_config: Option<NoiseReduceConfig>,
}

/// 수렴 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvergeConfig {
    #[serde(default = "default_true")]
    pub is_enabled: bool,
    /// "collect" 또는 "defense"
    #[serde(default = "default_converge_func")]
    pub converge_func: String,
    #[serde(default = "default_converge_count")]
    pub count: u32,
    /// 수렴 윈도우 (초)
    #[serde(default = "default_converge_timedelta")]
    pub timedelta: i64,
    #[serde(default)]
    pub condition: Vec<ConvergeCondition>,
    /// false이면 sub_converge_config가 있어도 비즈 수렴을 건너뜁니다.
    #[serde(default)]
    pub need_biz_converge: bool,
    #[serde(default)]
    pub sub_converge_config: Option<serde_json::Value>,
}

fn default_converge_func() -> String {
    "collect".to_owned()
}

fn default_converge_count() -> u32 {
    1
}

fn default_converge_timedelta() -> i64 {
    60
}

impl Default for ConvergeConfig {
    fn default() -> Self {
        Self {
            is_enabled: true,
            converge_func: default_converge_func(),
            count: default_converge_count(),
            timedelta: default_converge_timedelta(),
            condition: vec![],
            need_biz_converge: false,
            sub_converge_config: None,
        }
    }
}

/// 수렴 매칭 조건. `value = ["self"]`는 "현재 액션의 해당 차원 값과
/// 동일"을 뜻합니다.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvergeCondition {
    pub dimension: String,
    #[serde(default)]
    pub value: Vec<serde_json::Value>,
}

/// 노이즈 감소 게이트 설정
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NoiseReduceConfig {
    #[serde(default)]
    pub is_enabled: bool,
    /// 알림 전 필요한 서로 다른 차원 튜플 수
    #[serde(default)]
    pub count: u32,
    #[serde(default)]
    pub dimensions: Vec<String>,
}
