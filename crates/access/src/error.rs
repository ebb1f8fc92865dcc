//! 접근 크레이트 에러 타입

use watchpost_core::error::{ErrorKind, PipelineError, WatchpostError};

/// 데이터 접근 에러
#[derive(Debug, thiserror::Error)]
pub enum AccessError {
    /// 데이터 소스 쿼리 실패 (타임아웃, 5xx, 연결 끊김)
    #[error("data source query failed: {reason}")]
    QueryFailed { reason: String },

    /// 어댑터가 접근을 거부함
    #[error("data source forbidden for user '{user}'")]
    Forbidden { user: String },

    /// 소스가 배치가 너무 크다며 거부함. 범위를 좁혀 다시 쿼리한다.
    #[error("batch rejected: {reason}")]
    BatchRejected { reason: String },

    /// 원본 레코드를 DataPoint로 정규화하지 못함
    #[error("failed to normalize record: {reason}")]
    Normalize { reason: String },

    /// 하류 채널이 닫힘 (셧다운 중)
    #[error("downstream channel closed")]
    ChannelClosed,

    /// 재시도 한도 초과
    #[error("retry limit exceeded after {attempts} attempts: {reason}")]
    RetryExhausted { attempts: u32, reason: String },
}

impl AccessError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::QueryFailed { .. }
            | Self::BatchRejected { .. }
            | Self::ChannelClosed
            | Self::RetryExhausted { .. } => ErrorKind::Transient,
            Self::Forbidden { .. } => ErrorKind::Permission,
            Self::Normalize { .. } => ErrorKind::Config,
        }
    }
}

impl From<AccessError> for WatchpostError {
    fn from(err: AccessError) -> Self {
        match err {
            AccessError::Forbidden { .. } => {
                WatchpostError::Pipeline(PipelineError::Forbidden(err.to_string()))
            }
            AccessError::ChannelClosed => {
                WatchpostError::Pipeline(PipelineError::ChannelSend(err.to_string()))
            }
            _ => WatchpostError::Pipeline(PipelineError::Timeout(err.to_string())),
        }
    }
}
