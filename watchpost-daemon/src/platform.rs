//! Platform API adapters.
//!
//! The pipeline crates only know trait seams (`StrategySource`,
//! `ShieldSource`, `CmdbAdapter`, `DataSourceAdapter`, `NoticeChannel`);
//! this module binds them to the monitoring platform's HTTP API. Every
//! call carries a bounded timeout; retries are handled by the callers
//! (access worker, caches) per their own policies.

use std::time::Duration;

use serde::Deserialize;

use watchpost_access::adapter::{DataSourceAdapter, QueryRequest, QueryRow};
use watchpost_access::error::AccessError;
use watchpost_action::error::ActionError;
use watchpost_action::sink::NoticeChannel;
use watchpost_cache::error::CacheError;
use watchpost_cache::shield::{Shield, ShieldSource};
use watchpost_cache::strategy::StrategySource;
use watchpost_cache::topology::{CmdbAdapter, Host, HostKey, ServiceInstance, TopoNode};
use watchpost_core::BoxFuture;
use watchpost_core::strategy::Strategy;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP client for the platform config/CMDB/query/notice APIs.
pub struct PlatformClient {
    base_url: String,
    client: reqwest::Client,
}

/// Platform API envelope: `{"result": true, "data": ...}`.
#[derive(Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    result: bool,
    #[serde(default)]
    message: String,
    data: Option<T>,
}

impl PlatformClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            client,
        }
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, String> {
        let url = format!("{}{path}", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        unwrap_envelope(response).await
    }

    async fn post<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<T, String> {
        let url = format!("{}{path}", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        unwrap_envelope(response).await
    }
}

async fn unwrap_envelope<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, String> {
    let response = response.error_for_status().map_err(|e| e.to_string())?;
    let envelope: Envelope<T> = response.json().await.map_err(|e| e.to_string())?;
    if !envelope.result {
        return Err(if envelope.message.is_empty() {
            "platform api returned result=false".to_owned()
        } else {
            envelope.message
        });
    }
    envelope
        .data
        .ok_or_else(|| "platform api returned no data".to_owned())
}

impl StrategySource for PlatformClient {
    fn fetch_enabled(&self) -> BoxFuture<'_, Result<Vec<Strategy>, CacheError>> {
        Box::pin(async move {
            self.get("/api/v1/strategies?enabled=true")
                .await
                .map_err(|reason| CacheError::SourceUnavailable { reason })
        })
    }
}

impl ShieldSource for PlatformClient {
    fn list_active(
        &self,
        bk_biz_id: i64,
        now: i64,
    ) -> BoxFuture<'_, Result<Vec<Shield>, CacheError>> {
        Box::pin(async move {
            self.get(&format!("/api/v1/shields?bk_biz_id={bk_biz_id}&now={now}"))
                .await
                .map_err(|reason| CacheError::SourceUnavailable { reason })
        })
    }
}

impl CmdbAdapter for PlatformClient {
    fn lookup_hosts(&self, keys: &[HostKey]) -> BoxFuture<'_, Result<Vec<Host>, CacheError>> {
        let body = serde_json::json!({
            "keys": keys.iter().map(host_key_json).collect::<Vec<_>>(),
        });
        Box::pin(async move {
            self.post("/api/v1/cmdb/hosts", &body)
                .await
                .map_err(|reason| CacheError::SourceUnavailable { reason })
        })
    }

    fn lookup_service_instances(
        &self,
        ids: &[u64],
    ) -> BoxFuture<'_, Result<Vec<ServiceInstance>, CacheError>> {
        let body = serde_json::json!({ "ids": ids });
        Box::pin(async move {
            self.post("/api/v1/cmdb/service_instances", &body)
                .await
                .map_err(|reason| CacheError::SourceUnavailable { reason })
        })
    }

    fn lookup_topo_nodes(
        &self,
        bk_obj_id: &str,
        inst_ids: &[u64],
    ) -> BoxFuture<'_, Result<Vec<TopoNode>, CacheError>> {
        let body = serde_json::json!({ "bk_obj_id": bk_obj_id, "inst_ids": inst_ids });
        Box::pin(async move {
            self.post("/api/v1/cmdb/topo_nodes", &body)
                .await
                .map_err(|reason| CacheError::SourceUnavailable { reason })
        })
    }

    fn dynamic_group_members(&self, id: &str) -> BoxFuture<'_, Result<Vec<HostKey>, CacheError>> {
        let path = format!("/api/v1/cmdb/dynamic_groups/{id}/members");
        Box::pin(async move {
            let hosts: Vec<Host> = self
                .get(&path)
                .await
                .map_err(|reason| CacheError::SourceUnavailable { reason })?;
            Ok(hosts
                .into_iter()
                .map(|h| HostKey::IpCloud(h.ip, h.bk_cloud_id))
                .collect())
        })
    }
}

impl DataSourceAdapter for PlatformClient {
    fn query(&self, request: &QueryRequest) -> BoxFuture<'_, Result<Vec<QueryRow>, AccessError>> {
        let body = serde_json::json!({
            "kind": request.kind,
            "table": request.table,
            "metric_field": request.metric_field,
            "agg_method": request.agg_method,
            "interval": request.interval_s,
            "group_by": request.group_by,
            "conditions": request.conditions,
            "functions": request.functions,
            "start_time": request.start_ms,
            "end_time": request.end_ms,
        });
        Box::pin(async move {
            self.post("/api/v1/query", &body)
                .await
                .map_err(|reason| AccessError::QueryFailed { reason })
        })
    }
}

impl NoticeChannel for PlatformClient {
    fn send_notice(
        &self,
        way: &str,
        receivers: &[String],
        title: &str,
        content: &str,
    ) -> BoxFuture<'_, Result<(), ActionError>> {
        let body = serde_json::json!({
            "way": way,
            "receivers": receivers,
            "title": title,
            "content": content,
        });
        Box::pin(async move {
            let _: serde_json::Value =
                self.post("/api/v1/notice/send", &body)
                    .await
                    .map_err(|reason| ActionError::Sink {
                        name: "notice".to_owned(),
                        reason,
                    })?;
            Ok(())
        })
    }
}

fn host_key_json(key: &HostKey) -> serde_json::Value {
    match key {
        HostKey::IpCloud(ip, cloud) => {
            serde_json::json!({"ip": ip, "bk_cloud_id": cloud})
        }
        HostKey::HostId(id) => serde_json::json!({"bk_host_id": id}),
    }
}
