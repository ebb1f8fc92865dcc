//! HTTP 웹훅 싱크 — 메서드/헤더/쿼리/본문/인증 조합

use std::collections::BTreeMap;

use serde::Deserialize;

use watchpost_core::BoxFuture;

use crate::error::ActionError;
use crate::sink::Sink;

/// 웹훅 본문 구성
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WebhookBody {
    /// 액션 페이로드를 그대로 본문으로
    #[default]
    Payload,
    Raw {
        content: String,
    },
    Kv {
        fields: BTreeMap<String, String>,
    },
}

/// 웹훅 인증
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WebhookAuth {
    Basic { username: String, password: String },
    Token { token: String },
}

/// 웹훅 설정
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookConfig {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub query_params: BTreeMap<String, String>,
    #[serde(default)]
    pub body: WebhookBody,
    #[serde(default)]
    pub auth: Option<WebhookAuth>,
}

fn default_method() -> String {
    "POST".to_owned()
}

impl WebhookConfig {
    /// 기본 POST 설정
    pub fn post(url: &str) -> Self {
        Self {
            url: url.to_owned(),
            method: default_method(),
            headers: BTreeMap::new(),
            query_params: BTreeMap::new(),
            body: WebhookBody::Payload,
            auth: None,
        }
    }
}

pub struct WebhookSink {
    client: reqwest::Client,
    config: WebhookConfig,
}

impl WebhookSink {
    pub fn new(config: WebhookConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }
}

impl Sink for WebhookSink {
    fn name(&self) -> &str {
        "webhook"
    }

    fn send(&self, payload: &[u8]) -> BoxFuture<'_, Result<(), ActionError>> {
        let payload = payload.to_vec();
        Box::pin(async move {
            let sink_err = |reason: String| ActionError::Sink {
                name: "webhook".to_owned(),
                reason,
            };
            let method = reqwest::Method::from_bytes(self.config.method.as_bytes())
                .map_err(|e| sink_err(e.to_string()))?;
            let mut request = self
                .client
                .request(method, &self.config.url)
                .query(&self.config.query_params);
            for (name, value) in &self.config.headers {
                request = request.header(name, value);
            }
            request = match &self.config.auth {
                Some(WebhookAuth::Basic { username, password }) => {
                    request.basic_auth(username, Some(password))
                }
                Some(WebhookAuth::Token { token }) => request.bearer_auth(token),
                None => request,
            };
            request = match &self.config.body {
                WebhookBody::Payload => request.body(payload),
                WebhookBody::Raw { content } => request.body(content.clone()),
                WebhookBody::Kv { fields } => request.form(fields),
            };
            let response = request.send().await.map_err(|e| sink_err(e.to_string()))?;
            response
                .error_for_status()
                .map_err(|e| sink_err(e.to_string()))?;
            Ok(())
        })
    }
}
