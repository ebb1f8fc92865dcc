//! 보강 — 알림에 대상 정보와 비즈 귀속을 채웁니다.
//!
//! 대상 유형은 차원에서 유추합니다. IP가 있으면 호스트, 서비스 인스턴스
//! ID가 있으면 서비스, 토폴로지 노드 필드가 있으면 토폴로지, 나머지는
//! 커스텀입니다. 비즈 불일치는 경고만 남기고, 비즈를 어디서도 찾지
//! 못한 알림만 드롭합니다.

use std::sync::Arc;

use tracing::warn;

use watchpost_cache::topology::TopologyCache;
use watchpost_core::types::Alert;

use crate::error::AlertError;

/// 알림의 대상 유형
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetType {
    Host,
    Service,
    Topo,
    Custom,
}

impl TargetType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::Service => "service",
            Self::Topo => "topo",
            Self::Custom => "custom",
        }
    }
}

/// 알림 보강기
pub struct Enricher {
    topology: Arc<TopologyCache>,
}

impl Enricher {
    pub fn new(topology: Arc<TopologyCache>) -> Self {
        Self { topology }
    }

    /// 차원에서 대상 유형을 유추합니다.
    pub fn target_type(alert: &Alert) -> TargetType {
        let has = |key: &str| alert.dimensions.iter().any(|d| d.key == key);
        if has("bk_target_ip") || has("ip") {
            TargetType::Host
        } else if has("service_instance_id") || has("bk_service_instance_id") {
            TargetType::Service
        } else if has("bk_obj_id") {
            TargetType::Topo
        } else {
            TargetType::Custom
        }
    }

    /// 알림을 보강합니다. 비즈를 귀속할 수 없으면 에러를 돌려줍니다.
    pub async fn enrich(&self, alert: &mut Alert) -> Result<(), AlertError> {
        let target_type = Self::target_type(alert);
        alert
            .tags
            .push(("target_type".to_owned(), target_type.as_str().to_owned()));

        match target_type {
            TargetType::Host => self.enrich_host(alert).await,
            TargetType::Service => self.enrich_service(alert).await,
            TargetType::Topo | TargetType::Custom => {}
        }

        if alert.bk_biz_id <= 0 {
            return Err(AlertError::Unattributable {
                strategy_id: alert.strategy_id,
            });
        }
        Ok(())
    }

    async fn enrich_host(&self, alert: &mut Alert) {
        let Some(ip) = dimension_string(alert, &["bk_target_ip", "ip"]) else {
            return;
        };
        let cloud_id = dimension_string(alert, &["bk_target_cloud_id", "bk_cloud_id"])
            .and_then(|raw| raw.parse::<i64>().ok());

        let host = match cloud_id {
            Some(cloud_id) => self.topology.host_by_ip_cloud(&ip, cloud_id).await,
            None => {
                let biz = (alert.bk_biz_id > 0).then_some(alert.bk_biz_id);
                self.topology.resolve_ip(&ip, biz).await
            }
        };
        match host {
            Ok(Some(host)) => {
                if alert.bk_biz_id > 0 && host.bk_biz_id != alert.bk_biz_id {
                    warn!(
                        alert_id = %alert.id,
                        alert_biz = alert.bk_biz_id,
                        host_biz = host.bk_biz_id,
                        "host business id does not match alert"
                    );
                }
                if alert.bk_biz_id <= 0 {
                    alert.bk_biz_id = host.bk_biz_id;
                }
                alert
                    .tags
                    .push(("bk_host_id".to_owned(), host.bk_host_id.to_string()));
                alert
                    .tags
                    .push(("bk_cloud_id".to_owned(), host.bk_cloud_id.to_string()));
                if let Some(ipv6) = &host.ipv6 {
                    alert.tags.push(("ipv6".to_owned(), ipv6.clone()));
                }
            }
            Ok(None) => {
                warn!(alert_id = %alert.id, ip = %ip, "host not found in topology");
            }
            Err(e) => {
                warn!(alert_id = %alert.id, ip = %ip, error = %e, "host lookup failed");
            }
        }
    }

    async fn enrich_service(&self, alert: &mut Alert) {
        let Some(id) = dimension_string(alert, &["service_instance_id", "bk_service_instance_id"])
            .and_then(|raw| raw.parse::<u64>().ok())
        else {
            return;
        };
        match self.topology.service_instances(&[id]).await {
            Ok(instances) => {
                if let Some(instance) = instances.first() {
                    if alert.bk_biz_id <= 0 {
                        alert.bk_biz_id = instance.bk_biz_id;
                    }
                    alert
                        .tags
                        .push(("service_instance_name".to_owned(), instance.name.clone()));
                    alert
                        .tags
                        .push(("bk_host_id".to_owned(), instance.bk_host_id.to_string()));
                }
            }
            Err(e) => {
                warn!(alert_id = %alert.id, service_instance_id = id, error = %e, "service instance lookup failed");
            }
        }
    }
}

fn dimension_string(alert: &Alert, keys: &[&str]) -> Option<String> {
    for key in keys {
        if let Some(dim) = alert.dimensions.iter().find(|d| &d.key == key) {
            return Some(match &dim.value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            });
        }
    }
    None
}
