//! Watchpost 경보 크레이트
//!
//! 트리거 이벤트를 알림 문서로 중복 제거해 모으고, 대상/비즈 정보를
//! 보강하고, 차폐 규칙을 판정한 뒤, 생명주기 상태 기계를 굴립니다.
//! 상태 전이마다 액션 단계로 신호를 내보냅니다.

pub mod builder;
pub mod enrich;
pub mod error;
pub mod manager;
pub mod shield;

pub use builder::AlertBuilder;
pub use enrich::{Enricher, TargetType};
pub use error::AlertError;
pub use manager::{AlertManager, AlertPipeline, AlertSignal, ManagerOptions};
pub use shield::{ShieldEvaluator, ShieldResult, shield_matches};
