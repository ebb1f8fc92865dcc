//! 차폐(shield) 모델과 활성 목록 캐시
//!
//! 차폐 규칙 자체의 활성 판정(전체 기간 + 주기 매칭)은 여기서 하고,
//! 알림이 차폐에 **매칭**되는지(범주/범위/차원)는 알림 크레이트의
//! 평가기가 담당합니다.
//!
//! 주기 차폐는 daily/weekly/monthly이며 하루 안의 시간 구간이 자정을
//! 넘을 수 있습니다. 자정을 넘는 구간에서 새벽 시각은 "전날의 주기"에
//! 속한 것으로 판정합니다.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Datelike, NaiveTime, TimeZone, Timelike, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::warn;

use watchpost_core::BoxFuture;

use crate::error::CacheError;

/// 차폐 범주
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShieldCategory {
    Scope,
    Strategy,
    Dimension,
    Event,
    Alert,
}

/// 주기 유형
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleType {
    #[default]
    Once,
    Daily,
    Weekly,
    Monthly,
}

/// 주기 설정. `begin_time`/`end_time`은 "HH:MM" 시각 문자열입니다.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CycleConfig {
    #[serde(rename = "type", default)]
    pub cycle_type: CycleType,
    #[serde(default)]
    pub begin_time: String,
    #[serde(default)]
    pub end_time: String,
    /// weekly: 요일 목록 (1=월 .. 7=일)
    #[serde(default)]
    pub week_list: Vec<u32>,
    /// monthly: 일자 목록 (1..=31)
    #[serde(default)]
    pub day_list: Vec<u32>,
}

/// 차폐 규칙
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Shield {
    pub id: u64,
    pub bk_biz_id: i64,
    pub category: ShieldCategory,
    #[serde(default)]
    pub scope_type: String,
    /// 범주별 매칭 조건 (전략 ID 목록, 범위 원자, 차원 조건 등)
    #[serde(default)]
    pub dimension_config: serde_json::Value,
    #[serde(default)]
    pub cycle_config: CycleConfig,
    pub begin_time: i64,
    pub end_time: i64,
    #[serde(default = "default_true")]
    pub is_enabled: bool,
}

fn default_true() -> bool {
    true
}

fn parse_tod(raw: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(raw, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M"))
        .ok()
}

impl Shield {
    /// 이 차폐가 `now`(초) 시점에 활성인지 판정합니다.
    pub fn is_active_at(&self, now: i64) -> bool {
        if !self.is_enabled || now < self.begin_time || now > self.end_time {
            return false;
        }
        self.cycle_matches(now)
    }

    fn cycle_matches(&self, now: i64) -> bool {
        if self.cycle_config.cycle_type == CycleType::Once {
            return true;
        }
        let Some(now_dt) = Utc.timestamp_opt(now, 0).single() else {
            return false;
        };
        let (Some(begin), Some(end)) = (
            parse_tod(&self.cycle_config.begin_time),
            parse_tod(&self.cycle_config.end_time),
        ) else {
            warn!(shield_id = self.id, "invalid cycle time range, treating as inactive");
            return false;
        };

        let tod = now_dt.time();
        let spans_midnight = begin > end;
        let in_window = if spans_midnight {
            tod >= begin || tod <= end
        } else {
            tod >= begin && tod <= end
        };
        if !in_window {
            return false;
        }

        // 자정을 넘는 구간에서 새벽 시각은 전날 주기에 속한다.
        let cycle_day = if spans_midnight && tod <= end {
            now_dt - chrono::Duration::days(1)
        } else {
            now_dt
        };
        match self.cycle_config.cycle_type {
            CycleType::Once => true,
            CycleType::Daily => true,
            CycleType::Weekly => self
                .cycle_config
                .week_list
                .contains(&cycle_day.weekday().number_from_monday()),
            CycleType::Monthly => self.cycle_config.day_list.contains(&cycle_day.day()),
        }
    }

    /// 활성 상태가 끝날 때까지 남은 초. 비활성이면 0입니다.
    pub fn left_seconds(&self, now: i64) -> i64 {
        if !self.is_active_at(now) {
            return 0;
        }
        let overall_left = self.end_time - now;
        if self.cycle_config.cycle_type == CycleType::Once {
            return overall_left.max(0);
        }
        let (Some(now_dt), Some(begin), Some(end)) = (
            Utc.timestamp_opt(now, 0).single(),
            parse_tod(&self.cycle_config.begin_time),
            parse_tod(&self.cycle_config.end_time),
        ) else {
            return overall_left.max(0);
        };
        let tod = now_dt.time();
        let spans_midnight = begin > end;
        let secs_of_day = i64::from(tod.num_seconds_from_midnight());
        let end_secs = i64::from(end.num_seconds_from_midnight());
        let cycle_left = if spans_midnight && tod >= begin {
            // 오늘 밤 구간: 내일의 end까지
            86_400 - secs_of_day + end_secs
        } else {
            end_secs - secs_of_day
        };
        cycle_left.clamp(0, overall_left.max(0))
    }

    /// 사용자에게 보여줄 지속 시간: "N 小时/단위", 1시간 미만은 "<1 小时/단위".
    ///
    /// 단위는 once=次, daily=天, weekly=周, monthly=月입니다.
    pub fn display_duration(&self) -> String {
        let (span_secs, unit) = match self.cycle_config.cycle_type {
            CycleType::Once => (self.end_time - self.begin_time, "次"),
            cycle => {
                let unit = match cycle {
                    CycleType::Daily => "天",
                    CycleType::Weekly => "周",
                    CycleType::Monthly => "月",
                    CycleType::Once => unreachable!(),
                };
                let span = match (
                    parse_tod(&self.cycle_config.begin_time),
                    parse_tod(&self.cycle_config.end_time),
                ) {
                    (Some(begin), Some(end)) => {
                        let b = i64::from(begin.num_seconds_from_midnight());
                        let e = i64::from(end.num_seconds_from_midnight());
                        if e >= b { e - b } else { 86_400 - b + e }
                    }
                    _ => 0,
                };
                (span, unit)
            }
        };
        let hours = span_secs / 3600;
        if hours < 1 {
            format!("<1 小时/{unit}")
        } else {
            format!("{hours} 小时/{unit}")
        }
    }
}

/// 차폐 스토어 어댑터
pub trait ShieldSource: Send + Sync {
    /// 비즈의 활성 후보 차폐 목록 (전체 기간 기준)
    fn list_active(
        &self,
        bk_biz_id: i64,
        now: i64,
    ) -> BoxFuture<'_, Result<Vec<Shield>, CacheError>>;
}

struct CachedList {
    shields: Vec<Shield>,
    fetched_at: Instant,
}

/// 비즈별 활성 차폐 목록 캐시 (게으른 갱신)
pub struct ShieldCache {
    source: Arc<dyn ShieldSource>,
    refresh_interval: Duration,
    by_biz: DashMap<i64, CachedList>,
}

impl ShieldCache {
    pub fn new(source: Arc<dyn ShieldSource>, refresh_interval: Duration) -> Self {
        Self {
            source,
            refresh_interval,
            by_biz: DashMap::new(),
        }
    }

    /// `now` 시점에 활성인 차폐 목록.
    ///
    /// 스토어 조회 실패는 "차폐 없음"으로 처리하고 로그만 남깁니다.
    pub async fn active_shields(&self, bk_biz_id: i64, now: i64) -> Vec<Shield> {
        let stale = self
            .by_biz
            .get(&bk_biz_id)
            .is_none_or(|entry| entry.fetched_at.elapsed() >= self.refresh_interval);
        if stale {
            match self.source.list_active(bk_biz_id, now).await {
                Ok(shields) => {
                    self.by_biz.insert(
                        bk_biz_id,
                        CachedList {
                            shields,
                            fetched_at: Instant::now(),
                        },
                    );
                }
                Err(e) => {
                    warn!(bk_biz_id, error = %e, "shield list fetch failed, treating as unshielded");
                }
            }
        }
        self.by_biz
            .get(&bk_biz_id)
            .map(|entry| {
                entry
                    .shields
                    .iter()
                    .filter(|s| s.is_active_at(now))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// 명시적 무효화
    pub fn invalidate(&self, bk_biz_id: i64) {
        self.by_biz.remove(&bk_biz_id);
    }
}
