//! 파이프라인 trait — 단계 생명주기와 dyn 호환 어댑터
//!
//! 각 파이프라인 단계(접근, 탐지, 알림, 액션)는 [`Pipeline`]을 구현합니다.
//! RPITIT 기반이라 `dyn Pipeline`은 불가하므로, 오케스트레이터가 박싱해서
//! 관리할 수 있도록 [`DynPipeline`]이 [`BoxFuture`]로 감쌉니다.
//!
//! # 생명주기
//! ```text
//! Created → start() → Running → stop() → Stopped
//! ```

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

use crate::error::WatchpostError;

/// 박싱된 Future 타입 별칭
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// 파이프라인 건강 상태
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    /// 정상 동작 중
    Healthy,
    /// 동작하지만 주의 필요 (지연, 부분 실패 등)
    Degraded(String),
    /// 동작 불가
    Unhealthy(String),
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded(reason) => write!(f, "degraded: {reason}"),
            Self::Unhealthy(reason) => write!(f, "unhealthy: {reason}"),
        }
    }
}

/// 파이프라인 생명주기 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelineState {
    Created,
    Running,
    Stopped,
    Failed,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// 파이프라인 단계 trait
///
/// `start`는 내부 워커 태스크를 띄운 뒤 즉시 반환해야 하며,
/// `stop`은 진행 중인 배치를 드레인한 뒤 반환합니다 (graceful shutdown).
pub trait Pipeline: Send + Sync {
    /// 단계 이름 (로그/헬스 집계에 사용)
    fn name(&self) -> &str;

    /// 현재 생명주기 상태
    fn state(&self) -> PipelineState;

    /// 단계를 시작합니다. `Created` 또는 `Stopped` 상태에서만 유효합니다.
    fn start(&mut self) -> impl Future<Output = Result<(), WatchpostError>> + Send;

    /// 단계를 정지합니다. `Running` 상태에서만 유효합니다.
    fn stop(&mut self) -> impl Future<Output = Result<(), WatchpostError>> + Send;

    /// 건강 상태를 확인합니다.
    fn health_check(&self) -> impl Future<Output = HealthStatus> + Send;
}

/// dyn 호환 파이프라인 trait
///
/// 오케스트레이터는 `Vec<Box<dyn DynPipeline>>`으로 단계를 순서대로
/// 관리합니다. [`Pipeline`] 구현체는 자동으로 이 trait도 구현합니다.
pub trait DynPipeline: Send + Sync {
    fn name(&self) -> &str;
    fn state(&self) -> PipelineState;
    fn start(&mut self) -> BoxFuture<'_, Result<(), WatchpostError>>;
    fn stop(&mut self) -> BoxFuture<'_, Result<(), WatchpostError>>;
    fn health_check(&self) -> BoxFuture<'_, HealthStatus>;
}

impl<T: Pipeline> DynPipeline for T {
    fn name(&self) -> &str {
        Pipeline::name(self)
    }

    fn state(&self) -> PipelineState {
        Pipeline::state(self)
    }

    fn start(&mut self) -> BoxFuture<'_, Result<(), WatchpostError>> {
        Box::pin(Pipeline::start(self))
    }

    fn stop(&mut self) -> BoxFuture<'_, Result<(), WatchpostError>> {
        Box::pin(Pipeline::stop(self))
    }

    fn health_check(&self) -> BoxFuture<'_, HealthStatus> {
        Box::pin(Pipeline::health_check(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;

    struct MockStage {
        name: String,
        state: PipelineState,
    }

    impl Pipeline for MockStage {
        fn name(&self) -> &str {
            &self.name
        }

        fn state(&self) -> PipelineState {
            self.state
        }

        async fn start(&mut self) -> Result<(), WatchpostError> {
            if self.state == PipelineState::Running {
                return Err(PipelineError::AlreadyRunning.into());
            }
            self.state = PipelineState::Running;
            Ok(())
        }

        async fn stop(&mut self) -> Result<(), WatchpostError> {
            if self.state != PipelineState::Running {
                return Err(PipelineError::NotRunning.into());
            }
            self.state = PipelineState::Stopped;
            Ok(())
        }

        async fn health_check(&self) -> HealthStatus {
            match self.state {
                PipelineState::Running => HealthStatus::Healthy,
                _ => HealthStatus::Unhealthy("not running".to_owned()),
            }
        }
    }

    #[tokio::test]
    async fn lifecycle_start_stop() {
        let mut stage = MockStage {
            name: "access".to_owned(),
            state: PipelineState::Created,
        };
        Pipeline::start(&mut stage).await.unwrap();
        assert_eq!(Pipeline::state(&stage), PipelineState::Running);
        Pipeline::stop(&mut stage).await.unwrap();
        assert_eq!(Pipeline::state(&stage), PipelineState::Stopped);
    }

    #[tokio::test]
    async fn double_start_is_error() {
        let mut stage = MockStage {
            name: "detect".to_owned(),
            state: PipelineState::Created,
        };
        Pipeline::start(&mut stage).await.unwrap();
        assert!(Pipeline::start(&mut stage).await.is_err());
    }

    #[tokio::test]
    async fn dyn_pipeline_can_be_boxed() {
        let mut boxed: Box<dyn DynPipeline> = Box::new(MockStage {
            name: "alert".to_owned(),
            state: PipelineState::Created,
        });
        assert_eq!(boxed.name(), "alert");
        boxed.start().await.unwrap();
        assert!(boxed.health_check().await.is_healthy());
        boxed.stop().await.unwrap();
    }

    #[test]
    fn health_status_display() {
        assert_eq!(HealthStatus::Healthy.to_string(), "healthy");
        assert_eq!(
            HealthStatus::Degraded("slow".to_owned()).to_string(),
            "degraded: slow"
        );
    }
}
