//! Watchpost 캐시 계층
//!
//! 파이프라인 전 단계가 참조하는 읽기 중심 캐시 세 가지:
//!
//! - [`strategy`] — 전략 스냅샷 + 파생 인덱스 (≤60초 주기 갱신)
//! - [`topology`] — CMDB 호스트/서비스/동적 그룹 TTL 캐시
//! - [`shield`] — 차폐 규칙 모델과 비즈별 활성 목록
//!
//! 외부 시스템 접근은 전부 trait([`StrategySource`], [`CmdbAdapter`],
//! [`ShieldSource`]) 뒤에 있어 데몬이 실제 어댑터를 주입합니다.

pub mod error;
pub mod shield;
pub mod strategy;
pub mod topology;

pub use error::CacheError;
pub use shield::{CycleConfig, CycleType, Shield, ShieldCache, ShieldCategory, ShieldSource};
pub use strategy::{RouteKey, StrategyCache, StrategySnapshot, StrategySource};
pub use topology::{CmdbAdapter, Host, HostKey, ServiceInstance, TopoNode, TopologyCache};
