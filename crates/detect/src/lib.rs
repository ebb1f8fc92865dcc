//! Watchpost 탐지 크레이트
//!
//! 접근 단계가 정규화한 포인트를 전략 알고리즘으로 판정하고, 레벨별
//! 판정을 결과 캐시에 기록해 트리거 조건(윈도우 내 이상 개수)을
//! 평가합니다. 발화한 이벤트는 경보 단계로 전달됩니다.

pub mod algorithm;
pub mod detector;
pub mod error;
pub mod result_cache;
pub mod trigger;

pub use algorithm::{AlgorithmConfig, CompiledAlgorithm, IntelligentDetector};
pub use detector::{DetectPipeline, DetectWorker, ItemDetector};
pub use error::DetectError;
pub use result_cache::{CheckMarker, CheckRecord, MemoryResultStore, ResultWindowStore, WindowKey};
pub use trigger::TriggerEvaluator;
