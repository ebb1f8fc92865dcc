//! 레디스 리스트 싱크 — LPUSH + 선택적 LTRIM

use redis::AsyncCommands;

use watchpost_core::BoxFuture;

use crate::error::ActionError;
use crate::sink::Sink;

pub struct RedisSink {
    client: redis::Client,
    key: String,
    max_length: Option<isize>,
}

impl RedisSink {
    /// `redis://[:pw@]host:port/db/key` 형식. 마지막 경로 조각이 리스트 키입니다.
    pub fn from_uri(uri: &str, max_length: Option<isize>) -> Result<Self, ActionError> {
        let (_, rest) = uri.split_once("://").ok_or_else(|| ActionError::InvalidUri {
            reason: format!("missing scheme: {uri}"),
        })?;
        if !rest.contains('/') {
            return Err(ActionError::InvalidUri {
                reason: format!("redis uri needs a list key: {uri}"),
            });
        }
        let (base, key) = uri.rsplit_once('/').ok_or_else(|| ActionError::InvalidUri {
            reason: format!("redis uri needs a list key: {uri}"),
        })?;
        if key.is_empty() {
            return Err(ActionError::InvalidUri {
                reason: format!("empty list key: {uri}"),
            });
        }
        let client = redis::Client::open(base).map_err(|e| ActionError::InvalidUri {
            reason: e.to_string(),
        })?;
        Ok(Self {
            client,
            key: key.to_owned(),
            max_length,
        })
    }
}

impl Sink for RedisSink {
    fn name(&self) -> &str {
        "redis"
    }

    fn send(&self, payload: &[u8]) -> BoxFuture<'_, Result<(), ActionError>> {
        let payload = payload.to_vec();
        Box::pin(async move {
            let sink_err = |e: redis::RedisError| ActionError::Sink {
                name: "redis".to_owned(),
                reason: e.to_string(),
            };
            let mut conn = self
                .client
                .get_multiplexed_async_connection()
                .await
                .map_err(sink_err)?;
            let _: () = conn.lpush(&self.key, payload).await.map_err(sink_err)?;
            if let Some(max) = self.max_length {
                let _: () = conn.ltrim(&self.key, 0, max - 1).await.map_err(sink_err)?;
            }
            Ok(())
        })
    }
}
