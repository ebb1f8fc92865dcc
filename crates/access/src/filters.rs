//! 필터 체인 — expire → dedupe → 대상 범위 → 집계 조건 → 내장 제외
//!
//! 포인트는 개별적으로 처리되어 하나의 실패/드롭이 배치의 나머지를
//! 막지 않습니다. 결과는 `{ok, dropped, failed}` 카운트로 집계됩니다.

use std::collections::{HashSet, VecDeque};

use regex::Regex;
use tracing::debug;

use watchpost_core::strategy::{AggCondition, TargetAtom};
use watchpost_core::types::{BatchCounts, DataPoint, DimensionMap};

/// 시스템 디스크 메트릭에서 제외하는 파일시스템 유형
const EXCLUDED_FS_TYPES: &[&str] = &["iso9660", "tmpfs", "udf"];
/// 시스템 네트워크 메트릭에서 제외하는 인터페이스 접두어
const EXCLUDED_NET_PREFIXES: &[&str] = &["lo", "veth", "docker"];

fn value_as_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn value_as_f64(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// 단일 조건을 차원 맵에 대해 평가합니다.
fn eval_one(condition: &AggCondition, dimensions: &DimensionMap) -> bool {
    let Some(actual) = dimensions.get(&condition.key) else {
        return false;
    };
    let actual_str = value_as_string(actual);
    match condition.method.as_str() {
        "eq" => condition
            .value
            .iter()
            .any(|v| value_as_string(v) == actual_str),
        "neq" => !condition
            .value
            .iter()
            .any(|v| value_as_string(v) == actual_str),
        "gt" | "gte" | "lt" | "lte" => {
            let Some(actual_num) = value_as_f64(actual) else {
                return false;
            };
            condition.value.iter().filter_map(value_as_f64).any(|v| {
                match condition.method.as_str() {
                    "gt" => actual_num > v,
                    "gte" => actual_num >= v,
                    "lt" => actual_num < v,
                    _ => actual_num <= v,
                }
            })
        }
        "include" => condition
            .value
            .iter()
            .any(|v| actual_str.contains(&value_as_string(v))),
        "exclude" => !condition
            .value
            .iter()
            .any(|v| actual_str.contains(&value_as_string(v))),
        "reg" => condition.value.iter().any(|v| {
            Regex::new(&value_as_string(v))
                .map(|re| re.is_match(&actual_str))
                .unwrap_or(false)
        }),
        _ => false,
    }
}

/// 조건 목록을 and/or 연결자로 평가합니다.
///
/// 연결자는 각 항목의 `condition` 필드("and"/"or", 기본 "and")이며
/// or가 절 경계를 만듭니다: `a AND b OR c` == `(a AND b) OR c`.
pub fn eval_conditions(conditions: &[AggCondition], dimensions: &DimensionMap) -> bool {
    if conditions.is_empty() {
        return true;
    }
    let mut any_clause = false;
    let mut clause = true;
    for (i, cond) in conditions.iter().enumerate() {
        let is_or = i > 0 && cond.condition.as_deref() == Some("or");
        if is_or {
            any_clause |= clause;
            clause = true;
        }
        clause &= eval_one(cond, dimensions);
    }
    any_clause | clause
}

/// 대상 범위 매칭에 쓰이는 토폴로지 컨텍스트
///
/// 강화 이전 단계이므로 호출자(프로세서)가 토폴로지 캐시에서 미리
/// 해석해 넘깁니다.
#[derive(Debug, Clone, Default)]
pub struct TargetContext {
    pub bk_target_ip: Option<String>,
    pub bk_target_cloud_id: Option<i64>,
    /// `(bk_obj_id, bk_inst_id)` 쌍 — 호스트가 속한 모든 노드
    pub topo_nodes: Vec<(String, u64)>,
    pub service_instance_id: Option<u64>,
    pub dynamic_group_ids: Vec<String>,
}

fn atom_matches(atom: &TargetAtom, ctx: &TargetContext) -> bool {
    match atom.field.as_str() {
        // IP 원자는 {bk_target_ip, bk_target_cloud_id}로 전개된 값을 갖는다
        "ip" | "bk_target_ip" | "host_target_ip" => atom.value.iter().any(|v| {
            let ip = v.get("bk_target_ip").map(value_as_string);
            let cloud = v.get("bk_target_cloud_id").and_then(|c| c.as_i64());
            match (ip, &ctx.bk_target_ip) {
                (Some(atom_ip), Some(ctx_ip)) if atom_ip == *ctx_ip => {
                    cloud.is_none() || cloud == ctx.bk_target_cloud_id
                }
                _ => false,
            }
        }),
        // 템플릿/노드 원자는 {bk_obj_id, bk_inst_id}만 본다
        "host_topo_node" | "topo_node" | "set_template" | "service_template" => {
            atom.value.iter().any(|v| {
                let obj = v.get("bk_obj_id").map(value_as_string);
                let inst = v.get("bk_inst_id").and_then(|i| i.as_u64());
                match (obj, inst) {
                    (Some(obj), Some(inst)) => ctx
                        .topo_nodes
                        .iter()
                        .any(|(o, i)| *o == obj && *i == inst),
                    _ => false,
                }
            })
        }
        "service_instance_id" => atom.value.iter().any(|v| {
            v.as_u64()
                .map(|id| ctx.service_instance_id == Some(id))
                .unwrap_or(false)
        }),
        "dynamic_group" => atom.value.iter().any(|v| {
            let id = value_as_string(v);
            ctx.dynamic_group_ids.contains(&id)
        }),
        _ => false,
    }
}

/// 항목의 대상 DNF를 평가합니다. 빈 대상은 "전체"를 뜻합니다.
pub fn matches_target(dnf: &[Vec<TargetAtom>], ctx: &TargetContext) -> bool {
    if dnf.is_empty() || dnf.iter().all(|clause| clause.is_empty()) {
        return true;
    }
    dnf.iter().any(|clause| {
        !clause.is_empty()
            && clause.iter().all(|atom| {
                // method는 현재 eq만 내려온다
                atom.method == "eq" && atom_matches(atom, ctx)
            })
    })
}

/// 최근 윈도우에서 본 레코드를 기억하는 dedupe 창
pub struct DedupeWindow {
    horizon_secs: i64,
    seen: HashSet<String>,
    order: VecDeque<(i64, String)>,
}

impl DedupeWindow {
    pub fn new(horizon_secs: i64) -> Self {
        Self {
            horizon_secs,
            seen: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    fn key(point: &DataPoint) -> String {
        match &point.record_id {
            Some(id) => id.clone(),
            None => format!("{}.{}", point.dimensions_md5(), point.timestamp),
        }
    }

    /// 처음 보는 포인트면 true를 반환하고 기억합니다.
    pub fn check_and_insert(&mut self, point: &DataPoint, now: i64) -> bool {
        while let Some((ts, _)) = self.order.front() {
            if now - ts > self.horizon_secs {
                let (_, key) = self.order.pop_front().unwrap();
                self.seen.remove(&key);
            } else {
                break;
            }
        }
        let key = Self::key(point);
        if self.seen.contains(&key) {
            return false;
        }
        self.seen.insert(key.clone());
        self.order.push_back((now, key));
        true
    }
}

/// 항목 하나에 대한 필터 체인
pub struct FilterChain {
    max_lag_secs: i64,
    dedupe: DedupeWindow,
}

impl FilterChain {
    pub fn new(max_lag_secs: i64, dedupe_horizon_secs: i64) -> Self {
        Self {
            max_lag_secs,
            dedupe: DedupeWindow::new(dedupe_horizon_secs),
        }
    }

    /// 배치를 필터링합니다. 통과한 포인트와 카운트를 돌려줍니다.
    ///
    /// `resolve_ctx`는 포인트의 토폴로지 컨텍스트를 돌려주며, `None`은
    /// 대상 해석 불가(대상 필터가 있으면 드롭)를 뜻합니다.
    pub fn apply<F>(
        &mut self,
        points: Vec<DataPoint>,
        now: i64,
        target: &[Vec<TargetAtom>],
        conditions: &[AggCondition],
        recheck_conditions: bool,
        table: &str,
        resolve_ctx: F,
    ) -> (Vec<DataPoint>, BatchCounts)
    where
        F: Fn(&DataPoint) -> Option<TargetContext>,
    {
        let mut counts = BatchCounts::default();
        let mut passed = Vec::with_capacity(points.len());
        let has_target = !target.is_empty() && target.iter().any(|c| !c.is_empty());

        for point in points {
            // (a) expire
            if now - point.timestamp > self.max_lag_secs {
                counts.dropped += 1;
                continue;
            }
            // (b) dedupe
            if !self.dedupe.check_and_insert(&point, now) {
                counts.dropped += 1;
                continue;
            }
            // (c) 대상 범위
            if has_target {
                match resolve_ctx(&point) {
                    Some(ctx) if matches_target(target, &ctx) => {}
                    Some(_) => {
                        counts.dropped += 1;
                        continue;
                    }
                    None => {
                        debug!(
                            strategy_id = point.strategy_id,
                            "target context unresolvable, dropping point"
                        );
                        counts.dropped += 1;
                        continue;
                    }
                }
            }
            // (d) 집계 조건 재확인 (실시간/ADVANCE 조건일 때만)
            if recheck_conditions && !eval_conditions(conditions, &point.dimensions) {
                counts.dropped += 1;
                continue;
            }
            // (e) 내장 제외
            if builtin_excluded(table, &point.dimensions) {
                counts.dropped += 1;
                continue;
            }
            counts.ok += 1;
            passed.push(point);
        }
        (passed, counts)
    }
}

/// 시스템 디스크/네트워크 테이블의 내장 제외 규칙
fn builtin_excluded(table: &str, dimensions: &DimensionMap) -> bool {
    if table.starts_with("system.disk") || table.starts_with("system.io") {
        if let Some(fs) = dimensions.get("fs_type").or_else(|| dimensions.get("device_type")) {
            let fs = value_as_string(fs);
            if EXCLUDED_FS_TYPES.contains(&fs.as_str()) {
                return true;
            }
        }
    }
    if table.starts_with("system.net")
        && let Some(device) = dimensions.get("device_name")
    {
        let device = value_as_string(device);
        if EXCLUDED_NET_PREFIXES.iter().any(|p| device.starts_with(p)) {
            return true;
        }
    }
    false
}
