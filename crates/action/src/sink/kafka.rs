//! 카프카 싱크 — 건당 레코드 하나, 3초 플러시, 전송 후 종료
//!
//! `kafka` 크레이트는 블로킹이므로 전송은 블로킹 태스크로 내립니다.

use std::time::Duration;

use kafka::producer::{Producer, Record, RequiredAcks};

use watchpost_core::BoxFuture;

use crate::error::ActionError;
use crate::sink::Sink;

pub struct KafkaSink {
    hosts: Vec<String>,
    topic: String,
}

impl KafkaSink {
    /// `kafka://[user:pw@]host:port/topic` 형식
    pub fn from_uri(uri: &str) -> Result<Self, ActionError> {
        let (_, rest) = uri.split_once("://").ok_or_else(|| ActionError::InvalidUri {
            reason: format!("missing scheme: {uri}"),
        })?;
        // 인증 조각은 브로커 주소에서 떼어낸다
        let rest = rest.rsplit_once('@').map(|(_, host)| host).unwrap_or(rest);
        let (host, topic) = rest.split_once('/').ok_or_else(|| ActionError::InvalidUri {
            reason: format!("kafka uri needs a topic: {uri}"),
        })?;
        if host.is_empty() || topic.is_empty() {
            return Err(ActionError::InvalidUri {
                reason: format!("kafka uri needs host and topic: {uri}"),
            });
        }
        Ok(Self {
            hosts: vec![host.to_owned()],
            topic: topic.to_owned(),
        })
    }
}

impl Sink for KafkaSink {
    fn name(&self) -> &str {
        "kafka"
    }

    fn send(&self, payload: &[u8]) -> BoxFuture<'_, Result<(), ActionError>> {
        let hosts = self.hosts.clone();
        let topic = self.topic.clone();
        let payload = payload.to_vec();
        Box::pin(async move {
            let sink_err = |reason: String| ActionError::Sink {
                name: "kafka".to_owned(),
                reason,
            };
            tokio::task::spawn_blocking(move || {
                let mut producer = Producer::from_hosts(hosts)
                    .with_ack_timeout(Duration::from_secs(3))
                    .with_required_acks(RequiredAcks::One)
                    .create()
                    .map_err(|e| sink_err(e.to_string()))?;
                producer
                    .send(&Record::from_value(&topic, payload))
                    .map_err(|e| sink_err(e.to_string()))
                // 전송마다 프로듀서를 닫는다 (drop)
            })
            .await
            .map_err(|e| ActionError::Sink {
                name: "kafka".to_owned(),
                reason: e.to_string(),
            })?
        })
    }
}
