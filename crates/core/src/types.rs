//! 도메인 타입 — 파이프라인 전역에서 사용되는 공통 타입
//!
//! 데이터 포인트, 이상 포인트, 트리거 이벤트, 알림 문서 등
//! 모든 단계가 공유하는 데이터 구조를 정의합니다.
//! 타임스탬프는 전부 초 단위 unix time(i64)입니다.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::strategy::Strategy;

/// 데이터 포인트의 group-by 차원 맵
///
/// BTreeMap이므로 직렬화 순서가 키 순으로 고정되어 md5 지문이 안정적입니다.
pub type DimensionMap = BTreeMap<String, serde_json::Value>;

/// no-data 포인트를 표시하는 예약 차원 키
pub const NO_DATA_TAG_DIMENSION: &str = "__NO_DATA_DIMENSION__";

/// 심각도 레벨 (1=치명, 2=경고, 3=알림)
///
/// 숫자가 **작을수록** 심각합니다. 문서에는 숫자로 직렬화됩니다.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Severity {
    /// 치명 — 즉시 대응 필요
    Critical,
    /// 경고
    Warning,
    /// 알림(정보성)
    Info,
}

impl Severity {
    /// 레벨 번호(1/2/3)를 반환합니다.
    pub fn level(self) -> u8 {
        match self {
            Self::Critical => 1,
            Self::Warning => 2,
            Self::Info => 3,
        }
    }

    /// self가 other보다 더 심각한지 여부
    pub fn is_higher_than(self, other: Severity) -> bool {
        self.level() < other.level()
    }
}

impl TryFrom<u8> for Severity {
    type Error = String;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        match level {
            1 => Ok(Self::Critical),
            2 => Ok(Self::Warning),
            3 => Ok(Self::Info),
            other => Err(format!("invalid severity level: {other}")),
        }
    }
}

impl From<Severity> for u8 {
    fn from(severity: Severity) -> u8 {
        severity.level()
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Critical => write!(f, "critical"),
            Self::Warning => write!(f, "warning"),
            Self::Info => write!(f, "info"),
        }
    }
}

/// 액션을 일으키는 생명주기 신호
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Signal {
    Abnormal,
    Recovered,
    Closed,
    Ack,
    Execute,
    ExecuteSuccess,
    ExecuteFailed,
    Unshielded,
    NoData,
    Collect,
}

impl Signal {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Abnormal => "abnormal",
            Self::Recovered => "recovered",
            Self::Closed => "closed",
            Self::Ack => "ack",
            Self::Execute => "execute",
            Self::ExecuteSuccess => "execute_success",
            Self::ExecuteFailed => "execute_failed",
            Self::Unshielded => "unshielded",
            Self::NoData => "no_data",
            Self::Collect => "collect",
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// 알림 상태 (외부 노출)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlertStatus {
    Abnormal,
    Recovered,
    Closed,
}

/// 알림 상세 상태 (RECOVERING은 내부 상태로, status는 ABNORMAL 유지)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlertStatusDetail {
    Abnormal,
    Recovering,
    Recovered,
    Closed,
}

/// 트리거 이벤트의 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventStatus {
    Abnormal,
    Recovered,
    Closed,
}

/// 필터/배치 처리 결과 카운트
///
/// 실패한 포인트는 배치의 나머지를 막지 않습니다.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchCounts {
    pub ok: usize,
    pub dropped: usize,
    pub failed: usize,
}

impl BatchCounts {
    pub fn total(&self) -> usize {
        self.ok + self.dropped + self.failed
    }
}

/// 정규화된 데이터 포인트
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    pub strategy_id: u64,
    pub item_id: u64,
    /// group-by 차원 (정렬된 맵)
    pub dimensions: DimensionMap,
    /// 초 단위 unix time
    pub timestamp: i64,
    pub value: f64,
    /// 원본 레코드 ID (로그/이벤트 소스의 `_id`)
    pub record_id: Option<String>,
}

impl DataPoint {
    /// 차원 맵의 md5 지문
    pub fn dimensions_md5(&self) -> String {
        crate::fingerprint::dimensions_md5(&self.dimensions)
    }

    /// no-data 마커 포인트인지 여부
    pub fn is_no_data(&self) -> bool {
        self.dimensions.contains_key(NO_DATA_TAG_DIMENSION)
    }
}

/// 레벨별 이상 정보
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyInfo {
    /// `"{dims_md5}.{ts}.{strategy_id}.{item_id}.{level}"`
    pub anomaly_id: String,
    /// 탐지 메시지 (예: "value 9 < threshold 10")
    pub anomaly_message: String,
}

/// 탐지를 통과한 이상 포인트
///
/// 플래그된 레벨만 `by_level`에 존재합니다.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyPoint {
    pub point: DataPoint,
    pub by_level: BTreeMap<Severity, AnomalyInfo>,
}

impl AnomalyPoint {
    /// 이상 ID 포맷: `{dims_md5}.{ts}.{strategy_id}.{item_id}.{level}`
    pub fn format_anomaly_id(point: &DataPoint, severity: Severity) -> String {
        format!(
            "{}.{}.{}.{}.{}",
            point.dimensions_md5(),
            point.timestamp,
            point.strategy_id,
            point.item_id,
            severity.level(),
        )
    }
}

/// 트리거를 통과해 발화한 이벤트
///
/// 발화 시점의 전략 스냅샷을 들고 다니므로 이후 단계는
/// 규칙이 변경되어도 발화 당시의 규칙을 봅니다.
#[derive(Debug, Clone)]
pub struct TriggeredEvent {
    pub id: String,
    pub strategy_id: u64,
    pub item_id: u64,
    pub severity: Severity,
    pub status: EventStatus,
    pub data: DataPoint,
    /// 윈도우 내 모든 anomaly_id
    pub anomaly_ids: Vec<String>,
    /// 스냅샷 저장 키 (`"snapshot.{strategy_id}.{version}"`)
    pub strategy_snapshot_key: String,
    /// 발화 당시의 전략 스냅샷
    pub strategy: Arc<Strategy>,
    pub description: String,
    /// 이벤트 시각 (포인트 타임스탬프)
    pub time: i64,
    /// 첫 이상 시각
    pub anomaly_time: i64,
    pub is_no_data: bool,
}

/// 알림 생명주기 로그의 작업 유형
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogOpType {
    Create,
    Converge,
    SeverityUp,
    AbortRecover,
    DelayRecover,
    Recover,
    SystemRecover,
    Close,
    SystemClose,
    Ack,
    Qos,
    Unshielded,
}

/// 알림 생명주기 로그 엔트리
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertLog {
    pub op_type: LogOpType,
    pub time: i64,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
}

/// 사용자에게 보여줄 번역이 포함된 알림 차원
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertDimension {
    pub key: String,
    pub value: serde_json::Value,
    pub display_key: String,
    pub display_value: String,
}

/// 주기 처리 기록 — relation_id별 마지막 알림 발송 상태
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CycleHandleRecord {
    pub last_time: i64,
    pub execute_times: u32,
    /// 마지막 주기 발송이 차폐/무발송 주기였는지
    pub is_shielded: bool,
    pub latest_anomaly_time: i64,
}

/// 알림 부가 정보 (전략 스냅샷, 원본 알람, 주기 처리 기록)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlertExtraInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_alarm: Option<serde_json::Value>,
    #[serde(default)]
    pub cycle_handle_record: BTreeMap<String, CycleHandleRecord>,
    #[serde(default)]
    pub agg_dimensions: Vec<String>,
}

/// 알림 문서
///
/// Alert Manager가 단독 소유하며, 다른 단계는 id 또는 불변 스냅샷으로만 봅니다.
///
/// 불변식:
/// - `begin_time ≤ first_anomaly_time ≤ latest_time`
/// - `end_time`은 status가 ABNORMAL(RECOVERING 포함)인 동안 None
/// - `duration = (end_time ?? now) − begin_time`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub dedupe_md5: String,
    pub bk_biz_id: i64,
    pub strategy_id: u64,
    pub item_id: u64,
    pub alert_name: String,
    pub severity: Severity,
    pub status: AlertStatus,
    pub status_detail: AlertStatusDetail,
    pub begin_time: i64,
    pub first_anomaly_time: i64,
    pub latest_time: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<i64>,
    pub duration: i64,
    #[serde(default)]
    pub assignee: Vec<String>,
    #[serde(default)]
    pub dimensions: Vec<AlertDimension>,
    #[serde(default)]
    pub tags: Vec<(String, String)>,
    #[serde(default)]
    pub extra_info: AlertExtraInfo,
    #[serde(default)]
    pub anomaly_ids: Vec<String>,
    pub is_shielded: bool,
    #[serde(default)]
    pub shield_ids: Vec<u64>,
    #[serde(default)]
    pub shield_left_time: i64,
    pub is_ack: bool,
    pub is_handled: bool,
    /// 액션 QoS가 발동해 후속 액션이 버려지는 중인지
    #[serde(default)]
    pub is_blocked: bool,
    /// 예약된 다음 상태 전이
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_status: Option<AlertStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_status_time: Option<i64>,
    #[serde(default)]
    pub logs: Vec<AlertLog>,
}

impl Alert {
    /// 현재 지속 시간 (초)
    pub fn duration_at(&self, now: i64) -> i64 {
        (self.end_time.unwrap_or(now) - self.begin_time).max(0)
    }

    /// 아직 종결되지 않은 알림인지 (ABNORMAL 또는 RECOVERING)
    pub fn is_open(&self) -> bool {
        self.status == AlertStatus::Abnormal
    }

    /// 생명주기 로그를 추가합니다.
    pub fn add_log(&mut self, op_type: LogOpType, time: i64, description: impl Into<String>) {
        self.logs.push(AlertLog {
            op_type,
            time,
            description: description.into(),
            event_id: None,
        });
    }

    /// 다음 상태 전이를 예약합니다.
    pub fn set_next_status(&mut self, status: AlertStatus, now: i64, after_secs: i64) {
        self.next_status = Some(status);
        self.next_status_time = Some(now + after_secs);
    }

    /// 예약된 상태 전이를 해제합니다.
    pub fn clear_next_status(&mut self) {
        self.next_status = None;
        self.next_status_time = None;
    }

    /// 종결 상태를 기록합니다 (end_time, duration 포함).
    pub fn set_end_status(
        &mut self,
        status: AlertStatus,
        detail: AlertStatusDetail,
        op_type: LogOpType,
        end_time: i64,
        description: impl Into<String>,
    ) {
        self.status = status;
        self.status_detail = detail;
        self.end_time = Some(end_time);
        self.duration = self.duration_at(end_time);
        self.clear_next_status();
        self.add_log(op_type, end_time, description);
    }
}

impl fmt::Display for Alert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Alert[{}] strategy={} severity={} status={:?} shielded={}",
            self.id, self.strategy_id, self.severity, self.status, self.is_shielded,
        )
    }
}

/// 액션 인스턴스 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ActionStatus {
    Running,
    Success,
    Failure,
    Skipped,
    Converged,
}

/// 전략의 notice/handler 바인딩에서 구체화된 액션 인스턴스
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionInstance {
    pub id: String,
    pub strategy_id: u64,
    pub bk_biz_id: i64,
    pub signal: Signal,
    /// 관련 알림 ID들
    pub alerts: Vec<String>,
    pub severity: Severity,
    pub relation_id: u64,
    pub execute_times: u32,
    pub status: ActionStatus,
    /// 자유 형식 결과 메시지
    pub ex_data: String,
    pub plugin_type: String,
    /// 수렴 키에 쓰이는 차원 지문
    pub dimensions_md5: String,
    /// 해석된 알림 템플릿 사본
    pub execute_config: serde_json::Value,
    pub create_time: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_point() -> DataPoint {
        let mut dims = DimensionMap::new();
        dims.insert("ip".to_owned(), serde_json::json!("10.0.0.1"));
        dims.insert("bk_cloud_id".to_owned(), serde_json::json!(0));
        DataPoint {
            strategy_id: 1,
            item_id: 2,
            dimensions: dims,
            timestamp: 1700000000,
            value: 9.0,
            record_id: None,
        }
    }

    #[test]
    fn severity_level_numbers() {
        assert_eq!(Severity::Critical.level(), 1);
        assert_eq!(Severity::Warning.level(), 2);
        assert_eq!(Severity::Info.level(), 3);
    }

    #[test]
    fn severity_higher_means_smaller_level() {
        assert!(Severity::Critical.is_higher_than(Severity::Warning));
        assert!(Severity::Warning.is_higher_than(Severity::Info));
        assert!(!Severity::Info.is_higher_than(Severity::Critical));
    }

    #[test]
    fn severity_serializes_as_number() {
        let json = serde_json::to_string(&Severity::Warning).unwrap();
        assert_eq!(json, "2");
        let back: Severity = serde_json::from_str("1").unwrap();
        assert_eq!(back, Severity::Critical);
    }

    #[test]
    fn severity_rejects_invalid_level() {
        let result: Result<Severity, _> = serde_json::from_str("4");
        assert!(result.is_err());
    }

    #[test]
    fn signal_as_str() {
        assert_eq!(Signal::Unshielded.as_str(), "unshielded");
        assert_eq!(Signal::ExecuteFailed.as_str(), "execute_failed");
    }

    #[test]
    fn alert_status_serializes_uppercase() {
        assert_eq!(
            serde_json::to_string(&AlertStatus::Abnormal).unwrap(),
            "\"ABNORMAL\""
        );
        assert_eq!(
            serde_json::to_string(&AlertStatusDetail::Recovering).unwrap(),
            "\"RECOVERING\""
        );
    }

    #[test]
    fn anomaly_id_format() {
        let point = sample_point();
        let id = AnomalyPoint::format_anomaly_id(&point, Severity::Critical);
        let parts: Vec<&str> = id.split('.').collect();
        assert_eq!(parts.len(), 5);
        assert_eq!(parts[1], "1700000000");
        assert_eq!(parts[2], "1");
        assert_eq!(parts[3], "2");
        assert_eq!(parts[4], "1");
        assert_eq!(parts[0].len(), 32); // md5 hex
    }

    #[test]
    fn no_data_point_detection() {
        let mut point = sample_point();
        assert!(!point.is_no_data());
        point
            .dimensions
            .insert(NO_DATA_TAG_DIMENSION.to_owned(), serde_json::json!(true));
        assert!(point.is_no_data());
    }

    fn sample_alert() -> Alert {
        Alert {
            id: "170000000000001".to_owned(),
            dedupe_md5: "abc".to_owned(),
            bk_biz_id: 2,
            strategy_id: 1,
            item_id: 2,
            alert_name: "cpu_idle".to_owned(),
            severity: Severity::Critical,
            status: AlertStatus::Abnormal,
            status_detail: AlertStatusDetail::Abnormal,
            begin_time: 60,
            first_anomaly_time: 60,
            latest_time: 180,
            end_time: None,
            duration: 0,
            assignee: vec![],
            dimensions: vec![],
            tags: vec![],
            extra_info: AlertExtraInfo::default(),
            anomaly_ids: vec![],
            is_shielded: false,
            shield_ids: vec![],
            shield_left_time: 0,
            is_ack: false,
            is_handled: false,
            is_blocked: false,
            next_status: None,
            next_status_time: None,
            logs: vec![],
        }
    }

    #[test]
    fn alert_duration_open_uses_now() {
        let alert = sample_alert();
        assert_eq!(alert.duration_at(540), 480);
    }

    #[test]
    fn alert_duration_ended_uses_end_time() {
        let mut alert = sample_alert();
        alert.end_time = Some(540);
        assert_eq!(alert.duration_at(9999), 480);
    }

    #[test]
    fn alert_duration_never_negative() {
        let alert = sample_alert();
        assert_eq!(alert.duration_at(0), 0);
    }

    #[test]
    fn set_end_status_closes_alert() {
        let mut alert = sample_alert();
        alert.set_next_status(AlertStatus::Closed, 180, 3600);
        alert.set_end_status(
            AlertStatus::Recovered,
            AlertStatusDetail::Recovered,
            LogOpType::SystemRecover,
            540,
            "no anomaly within recovery window",
        );
        assert_eq!(alert.status, AlertStatus::Recovered);
        assert_eq!(alert.end_time, Some(540));
        assert_eq!(alert.duration, 480);
        assert!(alert.next_status.is_none());
        assert_eq!(alert.logs.last().unwrap().op_type, LogOpType::SystemRecover);
    }

    #[test]
    fn alert_document_roundtrip() {
        let alert = sample_alert();
        let json = serde_json::to_string(&alert).unwrap();
        let back: Alert = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, alert.id);
        assert_eq!(back.severity, Severity::Critical);
        assert_eq!(back.status, AlertStatus::Abnormal);
    }

    #[test]
    fn alert_document_ignores_unknown_fields() {
        let mut value = serde_json::to_value(sample_alert()).unwrap();
        value["some_future_field"] = serde_json::json!({"x": 1});
        let back: Alert = serde_json::from_value(value).unwrap();
        assert_eq!(back.strategy_id, 1);
    }

    #[test]
    fn batch_counts_total() {
        let counts = BatchCounts {
            ok: 5,
            dropped: 2,
            failed: 1,
        };
        assert_eq!(counts.total(), 8);
    }
}
