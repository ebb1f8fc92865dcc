//! Watchpost 데이터 접근 단계
//!
//! 전략 항목의 쿼리 설정을 데이터 소스 어댑터 호출로 바꾸고, 원시 행을
//! [`DataPoint`](watchpost_core::types::DataPoint)로 정규화한 뒤 필터
//! 체인(expire → dedupe → 대상 범위 → 조건 재확인 → 내장 제외)을 거쳐
//! 탐지 단계로 내보냅니다.

pub mod adapter;
pub mod error;
pub mod filters;
pub mod processor;

pub use adapter::{DataSourceAdapter, QueryRequest, QueryRow, SourceKind, normalize};
pub use error::AccessError;
pub use filters::{FilterChain, TargetContext, eval_conditions, matches_target};
pub use processor::{AccessPipeline, AccessWorker, ProcessorOptions};
