//! 수렴 — 같은 원인의 액션 폭주를 묶거나 막습니다.
//!
//! 1차 수렴 키는 `(전략, 신호, 심각도, 바인딩)`이며, 수렴 조건에
//! `value=["self"]` 항목이 있으면 차원 지문이 키에 추가됩니다.
//! `collect`는 윈도우의 첫 액션을 요약 운반자로 내보내고 이후 액션을
//! 접어 넣습니다. `defense`는 임계값까지 통과시키고 이후를 버립니다.
//! 같은 인스턴스 ID의 재처리는 집계를 바꾸지 않습니다.

use std::collections::HashMap;

use dashmap::DashMap;
use tracing::{debug, info};

use watchpost_core::strategy::{ConvergeConfig, NoiseReduceConfig};
use watchpost_core::types::{ActionInstance, Signal};

/// 1차 수렴 판정 결과
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConvergeOutcome {
    /// 실행한다 (collect의 첫 액션 포함)
    Pass,
    /// 기존 요약으로 접힘, 실행하지 않는다
    Converged { collected: usize },
    /// defense 임계값 초과로 버려짐
    Defended,
}

/// QoS 판정 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QosOutcome {
    Allowed,
    /// `first`는 이 알림/신호에서 처음 차단된 액션인지
    Blocked { first: bool },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PrimaryKey {
    strategy_id: u64,
    signal: Signal,
    severity: u8,
    relation_id: u64,
    dims_fp: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SubKey {
    bk_biz_id: i64,
    receiver: String,
    way: String,
    severity: u8,
    signal: Signal,
}

#[derive(Debug, Default)]
struct Window {
    /// (인스턴스 ID, 도착 시각)
    entries: Vec<(String, i64)>,
}

/// 수렴 옵션 (QoS 포함)
#[derive(Debug, Clone)]
pub struct ConvergeOptions {
    pub qos_threshold: u32,
    pub qos_window_secs: i64,
    /// 노이즈 게이트의 차원 집계 보존 시간 (초)
    pub noise_horizon_secs: i64,
}

impl Default for ConvergeOptions {
    fn default() -> Self {
        Self {
            qos_threshold: 50,
            qos_window_secs: 60,
            noise_horizon_secs: 3600,
        }
    }
}

/// 수렴기
pub struct Converger {
    options: ConvergeOptions,
    windows: DashMap<PrimaryKey, Window>,
    sub_windows: DashMap<SubKey, i64>,
    noise: DashMap<u64, HashMap<String, i64>>,
    qos: DashMap<(String, Signal), Vec<i64>>,
}

impl Converger {
    pub fn new(options: ConvergeOptions) -> Self {
        Self {
            options,
            windows: DashMap::new(),
            sub_windows: DashMap::new(),
            noise: DashMap::new(),
            qos: DashMap::new(),
        }
    }

    /// 1차 수렴을 판정합니다.
    pub fn check_primary(
        &self,
        instance: &ActionInstance,
        config: Option<&ConvergeConfig>,
        now: i64,
    ) -> ConvergeOutcome {
        let Some(config) = config.filter(|c| c.is_enabled) else {
            return ConvergeOutcome::Pass;
        };
        let self_keyed = config
            .condition
            .iter()
            .any(|c| c.value.iter().any(|v| v == "self"));
        let key = PrimaryKey {
            strategy_id: instance.strategy_id,
            signal: instance.signal,
            severity: instance.severity.level(),
            relation_id: instance.relation_id,
            dims_fp: self_keyed.then(|| instance.dimensions_md5.clone()),
        };

        let mut window = self.windows.entry(key).or_default();
        window.entries.retain(|(_, ts)| now - ts < config.timedelta);
        if window.entries.iter().any(|(id, _)| id == &instance.id) {
            // 같은 이벤트 재처리: 집계 불변
            return ConvergeOutcome::Converged {
                collected: window.entries.len(),
            };
        }
        window.entries.push((instance.id.clone(), now));
        let count = window.entries.len();

        match config.converge_func.as_str() {
            "defense" => {
                if count as u32 > config.count {
                    debug!(instance_id = %instance.id, count, "action defended");
                    ConvergeOutcome::Defended
                } else {
                    ConvergeOutcome::Pass
                }
            }
            _ => {
                if count == 1 {
                    ConvergeOutcome::Pass
                } else {
                    info!(
                        strategy_id = instance.strategy_id,
                        signal = %instance.signal,
                        collected = count,
                        "actions collected"
                    );
                    ConvergeOutcome::Converged { collected: count }
                }
            }
        }
    }

    /// 비즈 수렴: 같은 수신자/방식으로 가는 알림을 윈도우 내 한 번으로
    /// 합칩니다. `true`면 이번 발송은 접습니다.
    pub fn check_sub(
        &self,
        instance: &ActionInstance,
        receiver: &str,
        way: &str,
        timedelta: i64,
        now: i64,
    ) -> bool {
        let key = SubKey {
            bk_biz_id: instance.bk_biz_id,
            receiver: receiver.to_owned(),
            way: way.to_owned(),
            severity: instance.severity.level(),
            signal: instance.signal,
        };
        if let Some(last) = self.sub_windows.get(&key)
            && now - *last < timedelta
        {
            return true;
        }
        self.sub_windows.insert(key, now);
        false
    }

    /// 노이즈 게이트: 전략의 서로 다른 이상 차원 튜플이 `count`개에
    /// 이르기 전에는 알림을 막습니다. `true`면 아직 게이트에 막힌 상태.
    pub fn noise_gated(
        &self,
        instance: &ActionInstance,
        config: Option<&NoiseReduceConfig>,
        now: i64,
    ) -> bool {
        let Some(config) = config.filter(|c| c.is_enabled) else {
            return false;
        };
        let mut seen = self.noise.entry(instance.strategy_id).or_default();
        seen.retain(|_, ts| now - *ts < self.options.noise_horizon_secs);
        seen.insert(instance.dimensions_md5.clone(), now);
        let distinct = seen.len() as u32;
        if distinct < config.count {
            debug!(
                strategy_id = instance.strategy_id,
                distinct,
                required = config.count,
                "noise gate holding notification"
            );
            true
        } else {
            false
        }
    }

    /// 알림별 신호 QoS 카운터를 굴립니다.
    pub fn check_qos(&self, alert_id: &str, signal: Signal, now: i64) -> QosOutcome {
        let mut counter = self
            .qos
            .entry((alert_id.to_owned(), signal))
            .or_default();
        counter.retain(|ts| now - ts < self.options.qos_window_secs);
        counter.push(now);
        let count = counter.len() as u32;
        if count > self.options.qos_threshold {
            QosOutcome::Blocked {
                first: count == self.options.qos_threshold + 1,
            }
        } else {
            QosOutcome::Allowed
        }
    }
}
