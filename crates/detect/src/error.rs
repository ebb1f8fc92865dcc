//! 탐지 크레이트 에러 타입

use watchpost_core::error::{ErrorKind, PipelineError, WatchpostError};

/// 탐지/트리거 에러
#[derive(Debug, thiserror::Error)]
pub enum DetectError {
    /// 결과 캐시 접근 실패 (직렬화 지점 경합 포함)
    #[error("result cache error: {reason}")]
    ResultCache { reason: String },

    /// 하류 채널이 닫힘
    #[error("downstream channel closed")]
    ChannelClosed,

    /// 포인트가 속한 전략을 찾지 못함 — 드롭 대상
    #[error("unknown strategy for point: {strategy_id}")]
    UnknownStrategy { strategy_id: u64 },
}

impl DetectError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ResultCache { .. } => ErrorKind::Serialization,
            Self::ChannelClosed => ErrorKind::Transient,
            Self::UnknownStrategy { .. } => ErrorKind::Config,
        }
    }
}

impl From<DetectError> for WatchpostError {
    fn from(err: DetectError) -> Self {
        match err {
            DetectError::ResultCache { reason } => {
                WatchpostError::Pipeline(PipelineError::Serialization(reason))
            }
            DetectError::ChannelClosed => {
                WatchpostError::Pipeline(PipelineError::ChannelSend(err.to_string()))
            }
            DetectError::UnknownStrategy { .. } => {
                WatchpostError::Pipeline(PipelineError::InitFailed(err.to_string()))
            }
        }
    }
}
