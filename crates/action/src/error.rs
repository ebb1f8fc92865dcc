//! 액션 크레이트 에러 타입

use watchpost_core::error::{ErrorKind, PipelineError, WatchpostError};

/// 액션 실행/싱크 에러
#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    /// 싱크 전송 실패 (개별 싱크 단위로 누적)
    #[error("sink '{name}' failed: {reason}")]
    Sink { name: String, reason: String },

    /// 지원하지 않는 싱크 URI 스킴
    #[error("unsupported sink scheme: {scheme}")]
    UnsupportedScheme { scheme: String },

    /// 싱크 URI 파싱 실패
    #[error("invalid sink uri: {reason}")]
    InvalidUri { reason: String },

    /// 하류 채널이 닫힘
    #[error("downstream channel closed")]
    ChannelClosed,
}

impl ActionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Sink { .. } => ErrorKind::Sink,
            Self::UnsupportedScheme { .. } | Self::InvalidUri { .. } => ErrorKind::Config,
            Self::ChannelClosed => ErrorKind::Transient,
        }
    }
}

impl From<ActionError> for WatchpostError {
    fn from(err: ActionError) -> Self {
        WatchpostError::Pipeline(PipelineError::ChannelSend(err.to_string()))
    }
}
