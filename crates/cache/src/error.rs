//! 캐시 크레이트 에러 타입

use watchpost_core::error::{ErrorKind, PipelineError, WatchpostError};

/// 캐시 조회/갱신 에러
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// 전략 캐시에 없는 ID — 호출자는 해당 레코드를 드롭해야 합니다
    #[error("strategy not found: {strategy_id}")]
    StrategyNotFound { strategy_id: u64 },

    /// 설정 스토어/CMDB 호출 실패
    #[error("cache source unavailable: {reason}")]
    SourceUnavailable { reason: String },

    /// 단일 IP가 여러 클라우드 영역의 호스트로 해석됨
    #[error("multiple cloud regions for IP: {ip}")]
    AmbiguousIp { ip: String },

    /// 백그라운드 갱신 실패 (이전 스냅샷 유지)
    #[error("cache refresh failed: {reason}")]
    RefreshFailed { reason: String },
}

impl CacheError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::StrategyNotFound { .. } => ErrorKind::Config,
            Self::SourceUnavailable { .. } | Self::RefreshFailed { .. } => ErrorKind::Transient,
            Self::AmbiguousIp { .. } => ErrorKind::Enrichment,
        }
    }
}

impl From<CacheError> for WatchpostError {
    fn from(err: CacheError) -> Self {
        match err.kind() {
            ErrorKind::Transient => {
                WatchpostError::Pipeline(PipelineError::Timeout(err.to_string()))
            }
            _ => WatchpostError::Pipeline(PipelineError::InitFailed(err.to_string())),
        }
    }
}
