//! 싱크 어댑터 — URI 스킴으로 선택되는 단방향 출구
//!
//! 모든 싱크는 `send(바이트) → ok | error` 하나만 노출합니다.

use watchpost_core::BoxFuture;

use crate::error::ActionError;

pub mod kafka;
pub mod notice;
pub mod redis;
pub mod webhook;

pub use kafka::KafkaSink;
pub use notice::{NoticeChannel, NoticeSink};
pub use redis::RedisSink;
pub use webhook::{WebhookConfig, WebhookSink};

/// 발송 싱크 계약
pub trait Sink: Send + Sync {
    fn name(&self) -> &str;
    fn send(&self, payload: &[u8]) -> BoxFuture<'_, Result<(), ActionError>>;
}

/// 싱크 생성 옵션
#[derive(Debug, Clone)]
pub struct SinkOptions {
    /// 레디스 리스트 최대 길이 (LTRIM). `None`이면 무제한.
    pub redis_max_length: Option<isize>,
}

impl Default for SinkOptions {
    fn default() -> Self {
        Self {
            redis_max_length: Some(10_000),
        }
    }
}

/// URI 스킴으로 싱크를 만듭니다.
///
/// - `redis://[:pw@]host:port/db/key` — 리스트 LPUSH
/// - `kafka://[user:pw@]host:port/topic` — 건당 produce 후 종료
/// - `http(s)://…` — 웹훅 POST
pub fn sink_from_uri(uri: &str, options: &SinkOptions) -> Result<Box<dyn Sink>, ActionError> {
    let scheme = uri
        .split_once("://")
        .map(|(scheme, _)| scheme)
        .ok_or_else(|| ActionError::InvalidUri {
            reason: format!("missing scheme: {uri}"),
        })?;
    match scheme {
        "redis" | "rediss" => Ok(Box::new(RedisSink::from_uri(uri, options.redis_max_length)?)),
        "kafka" => Ok(Box::new(KafkaSink::from_uri(uri)?)),
        "http" | "https" => Ok(Box::new(WebhookSink::new(WebhookConfig::post(uri)))),
        other => Err(ActionError::UnsupportedScheme {
            scheme: other.to_owned(),
        }),
    }
}
