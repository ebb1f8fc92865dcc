//! Watchpost 액션 크레이트
//!
//! 알림 생명주기 신호를 액션 인스턴스로 구체화하고, 수렴/QoS 게이트를
//! 거쳐 큐·웹훅·통지 싱크로 내보냅니다.

pub mod converge;
pub mod dispatch;
pub mod error;
pub mod executor;
pub mod sink;
pub mod template;

pub use converge::{ConvergeOptions, ConvergeOutcome, Converger, QosOutcome};
pub use dispatch::dispatch;
pub use error::ActionError;
pub use executor::{ActionExecutor, ActionPipeline, SinkFactory, UriSinkFactory};
pub use sink::{Sink, SinkOptions, sink_from_uri};
