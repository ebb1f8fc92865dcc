//! Watchpost 공통 코어
//!
//! 알림 처리 파이프라인의 모든 크레이트가 공유하는 타입을 제공합니다:
//!
//! - [`types`] — 데이터 포인트, 이상 포인트, 트리거 이벤트, 알림 문서
//! - [`strategy`] — 전략(모니터링 규칙) JSON 모델과 지문
//! - [`fingerprint`] — md5 기반 결정적 지문 유틸리티
//! - [`config`] — `watchpost.toml` 파싱 + 환경변수 오버라이드
//! - [`error`] — 에러 타입과 효과 분류
//! - [`pipeline`] — 단계 생명주기 trait
//!
//! 이 크레이트는 I/O를 하지 않습니다 (설정 파일 로딩 제외). 외부 시스템
//! 어댑터 trait은 각 단계 크레이트에 있습니다.

pub mod config;
pub mod error;
pub mod fingerprint;
pub mod pipeline;
pub mod strategy;
pub mod types;

pub use config::{MessageQueueDsn, WatchpostConfig};
pub use error::{ConfigError, ErrorKind, PipelineError, StrategyError, WatchpostError};
pub use pipeline::{BoxFuture, DynPipeline, HealthStatus, Pipeline, PipelineState};
pub use strategy::{DetectBlock, Item, QueryConfig, Strategy, TriggerConfig};
pub use types::{
    Alert, AlertStatus, AlertStatusDetail, AnomalyPoint, DataPoint, DimensionMap, Severity,
    Signal, TriggeredEvent,
};
