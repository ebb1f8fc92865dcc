//! 에러 타입 — 도메인별 에러 정의
//!
//! 에러는 타입 이름이 아니라 **효과**로 분류됩니다. [`ErrorKind`]가 그 분류이며,
//! 파이프라인 각 단계는 이 분류에 따라 드롭/재시도/경고를 결정합니다.

use std::fmt;

/// Watchpost 최상위 에러 타입
#[derive(Debug, thiserror::Error)]
pub enum WatchpostError {
    /// 설정 관련 에러
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// 전략 파싱/검증 에러
    #[error("strategy error: {0}")]
    Strategy(#[from] StrategyError),

    /// 파이프라인 처리 에러
    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    /// I/O 에러
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl WatchpostError {
    /// 에러의 효과 분류를 반환합니다.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) | Self::Strategy(_) => ErrorKind::Config,
            Self::Pipeline(e) => e.kind(),
            Self::Io(_) => ErrorKind::Transient,
        }
    }
}

/// 에러 효과 분류
///
/// 각 단계의 처리 방침:
/// - `Config`: 로그 후 해당 레코드 드롭
/// - `Transient`: 제한 횟수 재시도 후 실패 반환, 다음 틱에서 재시도
/// - `Permission`: 이번 시도 실패, fallback 사용자로 재시도 가능하면 재시도
/// - `Enrichment`: 경고만, biz 귀속이 불가능할 때만 드롭
/// - `ShieldEval`: 차폐되지 않은 것으로 간주하고 로그
/// - `Sink`: 싱크별 실패 누적, 하나라도 성공하면 전체 SUCCESS
/// - `Serialization`: 매니저 틱 재시도, 불일치 상태는 기록하지 않음
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Config,
    Transient,
    Permission,
    Enrichment,
    ShieldEval,
    Sink,
    Serialization,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Config => "config",
            Self::Transient => "transient",
            Self::Permission => "permission",
            Self::Enrichment => "enrichment",
            Self::ShieldEval => "shield_eval",
            Self::Sink => "sink",
            Self::Serialization => "serialization",
        };
        write!(f, "{s}")
    }
}

/// 설정 관련 에러
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// 설정 파일을 찾을 수 없음
    #[error("config file not found: {path}")]
    FileNotFound { path: String },

    /// 설정 파싱 실패
    #[error("failed to parse config: {reason}")]
    ParseFailed { reason: String },

    /// 유효하지 않은 설정 값
    #[error("invalid config value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}

/// 전략 문서 에러
#[derive(Debug, thiserror::Error)]
pub enum StrategyError {
    /// 전략 JSON 파싱 실패
    #[error("failed to parse strategy document: {reason}")]
    ParseFailed { reason: String },

    /// 알고리즘 설정이 변형별 스키마를 통과하지 못함
    #[error("invalid algorithm config in strategy {strategy_id}: {reason}")]
    InvalidAlgorithm { strategy_id: u64, reason: String },

    /// 지원하지 않는 데이터 소스 조합
    #[error("unsupported data source: ({source_label}, {type_label})")]
    UnsupportedSource {
        source_label: String,
        type_label: String,
    },
}

/// 파이프라인 처리 에러
///
/// 각 단계 크레이트의 도메인 에러는 이 타입으로 변환되어 상위로 전파됩니다.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// 외부 호출 타임아웃 (재시도 한도 초과 포함)
    #[error("external call timed out: {0}")]
    Timeout(String),

    /// 어댑터가 접근을 거부함
    #[error("permission denied: {0}")]
    Forbidden(String),

    /// 채널 전송 실패
    #[error("channel send failed: {0}")]
    ChannelSend(String),

    /// 직렬화 지점 경합 (알림 락, result cache)
    #[error("serialization conflict: {0}")]
    Serialization(String),

    /// 파이프라인 초기화 실패
    #[error("pipeline init failed: {0}")]
    InitFailed(String),

    /// 이미 실행 중
    #[error("pipeline already running")]
    AlreadyRunning,

    /// 실행 중이 아님
    #[error("pipeline not running")]
    NotRunning,
}

impl PipelineError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Timeout(_) | Self::ChannelSend(_) => ErrorKind::Transient,
            Self::Forbidden(_) => ErrorKind::Permission,
            Self::Serialization(_) => ErrorKind::Serialization,
            Self::InitFailed(_) | Self::AlreadyRunning | Self::NotRunning => ErrorKind::Config,
        }
    }
}
