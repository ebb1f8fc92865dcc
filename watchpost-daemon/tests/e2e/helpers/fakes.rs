//! Scripted stand-ins for the platform adapters and queue sinks.

use std::sync::Mutex;

use watchpost_action::error::ActionError;
use watchpost_action::executor::SinkFactory;
use watchpost_action::sink::Sink;
use watchpost_cache::CacheError;
use watchpost_cache::shield::{Shield, ShieldSource};
use watchpost_cache::strategy::StrategySource;
use watchpost_cache::topology::{CmdbAdapter, Host, HostKey, ServiceInstance, TopoNode};
use watchpost_core::BoxFuture;
use watchpost_core::strategy::Strategy;

/// Strategy source returning a fixed set.
pub struct StaticStrategies(pub Vec<Strategy>);

impl StrategySource for StaticStrategies {
    fn fetch_enabled(&self) -> BoxFuture<'_, Result<Vec<Strategy>, CacheError>> {
        let strategies = self.0.clone();
        Box::pin(async move { Ok(strategies) })
    }
}

/// CMDB fake with no hosts; enrichment falls back to the strategy biz.
pub struct EmptyCmdb;

impl CmdbAdapter for EmptyCmdb {
    fn lookup_hosts(&self, _keys: &[HostKey]) -> BoxFuture<'_, Result<Vec<Host>, CacheError>> {
        Box::pin(async { Ok(vec![]) })
    }

    fn lookup_service_instances(
        &self,
        _ids: &[u64],
    ) -> BoxFuture<'_, Result<Vec<ServiceInstance>, CacheError>> {
        Box::pin(async { Ok(vec![]) })
    }

    fn lookup_topo_nodes(
        &self,
        _obj_id: &str,
        _inst_ids: &[u64],
    ) -> BoxFuture<'_, Result<Vec<TopoNode>, CacheError>> {
        Box::pin(async { Ok(vec![]) })
    }

    fn dynamic_group_members(
        &self,
        _group_id: &str,
    ) -> BoxFuture<'_, Result<Vec<HostKey>, CacheError>> {
        Box::pin(async { Ok(vec![]) })
    }
}

/// Shield source whose active set can be swapped mid-test.
pub struct ScriptedShields(pub Mutex<Vec<Shield>>);

impl ScriptedShields {
    pub fn new(shields: Vec<Shield>) -> Self {
        Self(Mutex::new(shields))
    }

    pub fn clear(&self) {
        self.0.lock().unwrap().clear();
    }
}

impl ShieldSource for ScriptedShields {
    fn list_active(
        &self,
        _bk_biz_id: i64,
        _now: i64,
    ) -> BoxFuture<'_, Result<Vec<Shield>, CacheError>> {
        let shields = self.0.lock().unwrap().clone();
        Box::pin(async move { Ok(shields) })
    }
}

/// Sink that succeeds or fails according to its URI.
pub struct ScriptedSink {
    name: String,
    ok: bool,
}

impl Sink for ScriptedSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn send(&self, _payload: &[u8]) -> BoxFuture<'_, Result<(), ActionError>> {
        let ok = self.ok;
        let name = self.name.clone();
        Box::pin(async move {
            if ok {
                Ok(())
            } else {
                Err(ActionError::Sink {
                    name,
                    reason: "broker unreachable".to_owned(),
                })
            }
        })
    }
}

/// Factory producing [`ScriptedSink`]s; URIs containing "fail" fail to send.
pub struct ScriptedFactory;

impl SinkFactory for ScriptedFactory {
    fn create(&self, uri: &str) -> Result<Box<dyn Sink>, ActionError> {
        Ok(Box::new(ScriptedSink {
            name: uri.split("://").next().unwrap_or("sink").to_owned(),
            ok: !uri.contains("fail"),
        }))
    }
}
