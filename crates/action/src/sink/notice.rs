//! 통지 채널 싱크 — 메일/SMS/음성/IM은 플랫폼 RPC로 위임

use std::sync::Arc;

use watchpost_core::BoxFuture;

use crate::error::ActionError;
use crate::sink::Sink;

/// 플랫폼 통지 RPC 계약
pub trait NoticeChannel: Send + Sync {
    fn send_notice(
        &self,
        way: &str,
        receivers: &[String],
        title: &str,
        content: &str,
    ) -> BoxFuture<'_, Result<(), ActionError>>;
}

/// 통지 채널을 싱크 계약에 맞춘 래퍼
pub struct NoticeSink {
    channel: Arc<dyn NoticeChannel>,
    way: String,
    receivers: Vec<String>,
    title: String,
}

impl NoticeSink {
    pub fn new(
        channel: Arc<dyn NoticeChannel>,
        way: impl Into<String>,
        receivers: Vec<String>,
        title: impl Into<String>,
    ) -> Self {
        Self {
            channel,
            way: way.into(),
            receivers,
            title: title.into(),
        }
    }
}

impl Sink for NoticeSink {
    fn name(&self) -> &str {
        "notice"
    }

    fn send(&self, payload: &[u8]) -> BoxFuture<'_, Result<(), ActionError>> {
        let content = String::from_utf8_lossy(payload).into_owned();
        Box::pin(async move {
            self.channel
                .send_notice(&self.way, &self.receivers, &self.title, &content)
                .await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recording(Mutex<Vec<(String, Vec<String>, String)>>);

    impl NoticeChannel for Recording {
        fn send_notice(
            &self,
            way: &str,
            receivers: &[String],
            _title: &str,
            content: &str,
        ) -> BoxFuture<'_, Result<(), ActionError>> {
            self.0.lock().unwrap().push((
                way.to_owned(),
                receivers.to_vec(),
                content.to_owned(),
            ));
            Box::pin(async { Ok(()) })
        }
    }

    #[tokio::test]
    async fn forwards_to_channel() {
        let channel = Arc::new(Recording(Mutex::new(vec![])));
        let sink = NoticeSink::new(
            channel.clone(),
            "mail",
            vec!["admin".to_owned()],
            "cpu_idle",
        );
        sink.send(b"alert body").await.unwrap();

        let sent = channel.0.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "mail");
        assert_eq!(sent[0].2, "alert body");
    }
}
