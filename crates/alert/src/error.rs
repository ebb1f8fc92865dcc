//! 경보 크레이트 에러 타입

use watchpost_core::error::{ErrorKind, PipelineError, WatchpostError};

/// 알림 빌드/관리 에러
#[derive(Debug, thiserror::Error)]
pub enum AlertError {
    /// 비즈 ID를 어디서도 찾을 수 없는 알림 — 드롭 대상
    #[error("alert has no attributable business id (strategy {strategy_id})")]
    Unattributable { strategy_id: u64 },

    /// 보강 실패 (호스트/서비스 조회 등)
    #[error("enrichment failed: {reason}")]
    Enrichment { reason: String },

    /// 하류 채널이 닫힘
    #[error("downstream channel closed")]
    ChannelClosed,
}

impl AlertError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Unattributable { .. } | Self::Enrichment { .. } => ErrorKind::Enrichment,
            Self::ChannelClosed => ErrorKind::Transient,
        }
    }
}

impl From<AlertError> for WatchpostError {
    fn from(err: AlertError) -> Self {
        WatchpostError::Pipeline(PipelineError::ChannelSend(err.to_string()))
    }
}
