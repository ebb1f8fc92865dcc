//! 토폴로지 캐시 — 호스트/서비스 인스턴스/토폴로지 노드 조회
//!
//! CMDB 어댑터 위에 TTL 캐시를 얹습니다. 조회 키:
//! - 호스트: `(ip, bk_cloud_id)` 또는 `bk_host_id`
//! - 서비스 인스턴스: ID
//! - 토폴로지 노드: `(bk_obj_id, bk_inst_id)`
//! - 동적 그룹: ID → 멤버 호스트 키
//!
//! 하나의 IP가 여러 클라우드 영역의 호스트로 해석되는 경우는 여기서
//! [`CacheError::AmbiguousIp`]로 드러나고, 비즈 필터가 없는 이벤트는
//! 강화 단계에서 드롭됩니다.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use watchpost_core::BoxFuture;

use crate::error::CacheError;

/// CMDB 호스트 레코드
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Host {
    pub bk_host_id: u64,
    pub ip: String,
    #[serde(default)]
    pub ipv6: Option<String>,
    pub bk_cloud_id: i64,
    pub bk_biz_id: i64,
    #[serde(default)]
    pub topo_nodes: Vec<TopoNode>,
}

/// 서비스 인스턴스 레코드
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub id: u64,
    pub name: String,
    pub bk_host_id: u64,
    pub bk_biz_id: i64,
}

/// 토폴로지 노드 `(오브젝트, 인스턴스)` 쌍
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TopoNode {
    pub bk_obj_id: String,
    pub bk_inst_id: u64,
}

/// 호스트 조회 키
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HostKey {
    IpCloud(String, i64),
    HostId(u64),
}

/// CMDB 어댑터 — 배치 조회 계약
pub trait CmdbAdapter: Send + Sync {
    fn lookup_hosts(&self, keys: &[HostKey]) -> BoxFuture<'_, Result<Vec<Host>, CacheError>>;
    fn lookup_service_instances(
        &self,
        ids: &[u64],
    ) -> BoxFuture<'_, Result<Vec<ServiceInstance>, CacheError>>;
    fn lookup_topo_nodes(
        &self,
        bk_obj_id: &str,
        inst_ids: &[u64],
    ) -> BoxFuture<'_, Result<Vec<TopoNode>, CacheError>>;
    fn dynamic_group_members(&self, id: &str) -> BoxFuture<'_, Result<Vec<HostKey>, CacheError>>;
}

struct Cached<T> {
    value: T,
    inserted_at: Instant,
}

impl<T: Clone> Cached<T> {
    fn fresh(value: T) -> Self {
        Self {
            value,
            inserted_at: Instant::now(),
        }
    }

    fn get(&self, ttl: Duration) -> Option<T> {
        (self.inserted_at.elapsed() < ttl).then(|| self.value.clone())
    }
}

/// 프로세스 전역 토폴로지 캐시
pub struct TopologyCache {
    adapter: Arc<dyn CmdbAdapter>,
    ttl: Duration,
    by_ip_cloud: DashMap<(String, i64), Cached<Host>>,
    by_host_id: DashMap<u64, Cached<Host>>,
    // IP만으로 조회했을 때의 후보 목록 (클라우드 영역 충돌 판정용)
    by_ip: DashMap<String, Cached<Vec<Host>>>,
    service_instances: DashMap<u64, Cached<ServiceInstance>>,
    dynamic_groups: DashMap<String, Cached<Vec<HostKey>>>,
}

impl TopologyCache {
    pub fn new(adapter: Arc<dyn CmdbAdapter>, ttl: Duration) -> Self {
        Self {
            adapter,
            ttl,
            by_ip_cloud: DashMap::new(),
            by_host_id: DashMap::new(),
            by_ip: DashMap::new(),
            service_instances: DashMap::new(),
            dynamic_groups: DashMap::new(),
        }
    }

    fn store_host(&self, host: &Host) {
        self.by_ip_cloud.insert(
            (host.ip.clone(), host.bk_cloud_id),
            Cached::fresh(host.clone()),
        );
        self.by_host_id
            .insert(host.bk_host_id, Cached::fresh(host.clone()));
    }

    /// `(ip, cloud_id)`로 호스트를 조회합니다.
    pub async fn host_by_ip_cloud(
        &self,
        ip: &str,
        bk_cloud_id: i64,
    ) -> Result<Option<Host>, CacheError> {
        let key = (ip.to_owned(), bk_cloud_id);
        if let Some(entry) = self.by_ip_cloud.get(&key)
            && let Some(host) = entry.get(self.ttl)
        {
            return Ok(Some(host));
        }

        let fetched = self
            .adapter
            .lookup_hosts(&[HostKey::IpCloud(ip.to_owned(), bk_cloud_id)])
            .await?;
        for host in &fetched {
            self.store_host(host);
        }
        Ok(fetched.into_iter().next())
    }

    /// host_id로 호스트를 조회합니다.
    pub async fn host_by_id(&self, bk_host_id: u64) -> Result<Option<Host>, CacheError> {
        if let Some(entry) = self.by_host_id.get(&bk_host_id)
            && let Some(host) = entry.get(self.ttl)
        {
            return Ok(Some(host));
        }
        let fetched = self
            .adapter
            .lookup_hosts(&[HostKey::HostId(bk_host_id)])
            .await?;
        for host in &fetched {
            self.store_host(host);
        }
        Ok(fetched.into_iter().next())
    }

    /// 클라우드 영역 정보 없이 IP만으로 호스트를 해석합니다.
    ///
    /// 둘 이상의 클라우드 영역에 걸치면 [`CacheError::AmbiguousIp`]입니다.
    /// 비즈 ID 필터가 있으면 먼저 그 비즈로 좁힙니다.
    pub async fn resolve_ip(
        &self,
        ip: &str,
        bk_biz_id: Option<i64>,
    ) -> Result<Option<Host>, CacheError> {
        let candidates = match self
            .by_ip
            .get(ip)
            .and_then(|entry| entry.get(self.ttl))
        {
            Some(hosts) => hosts,
            None => {
                // 클라우드 0을 우선 조회하고, 어댑터가 IP 전체 후보를 돌려줄
                // 수 있으므로 결과를 그대로 캐시한다.
                let fetched = self
                    .adapter
                    .lookup_hosts(&[HostKey::IpCloud(ip.to_owned(), -1)])
                    .await?;
                for host in &fetched {
                    self.store_host(host);
                }
                self.by_ip
                    .insert(ip.to_owned(), Cached::fresh(fetched.clone()));
                fetched
            }
        };

        let filtered: Vec<&Host> = match bk_biz_id {
            Some(biz) => candidates.iter().filter(|h| h.bk_biz_id == biz).collect(),
            None => candidates.iter().collect(),
        };

        let mut clouds: Vec<i64> = filtered.iter().map(|h| h.bk_cloud_id).collect();
        clouds.sort_unstable();
        clouds.dedup();
        if clouds.len() > 1 {
            debug!(ip, clouds = clouds.len(), "ip resolves across cloud regions");
            return Err(CacheError::AmbiguousIp { ip: ip.to_owned() });
        }
        Ok(filtered.into_iter().next().cloned())
    }

    /// 서비스 인스턴스 배치 조회 (캐시 미스만 어댑터로 나갑니다)
    pub async fn service_instances(
        &self,
        ids: &[u64],
    ) -> Result<Vec<ServiceInstance>, CacheError> {
        let mut found = Vec::with_capacity(ids.len());
        let mut missing = Vec::new();
        for id in ids {
            match self
                .service_instances
                .get(id)
                .and_then(|entry| entry.get(self.ttl))
            {
                Some(instance) => found.push(instance),
                None => missing.push(*id),
            }
        }
        if !missing.is_empty() {
            let fetched = self.adapter.lookup_service_instances(&missing).await?;
            for instance in fetched {
                self.service_instances
                    .insert(instance.id, Cached::fresh(instance.clone()));
                found.push(instance);
            }
        }
        Ok(found)
    }

    /// 동적 그룹 멤버십 조회
    pub async fn dynamic_group_members(&self, id: &str) -> Result<Vec<HostKey>, CacheError> {
        if let Some(entry) = self.dynamic_groups.get(id)
            && let Some(members) = entry.get(self.ttl)
        {
            return Ok(members);
        }
        let members = self.adapter.dynamic_group_members(id).await?;
        self.dynamic_groups
            .insert(id.to_owned(), Cached::fresh(members.clone()));
        Ok(members)
    }
}
