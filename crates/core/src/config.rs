//! 설정 관리 — watchpost.toml 파싱 및 런타임 설정
//!
//! [`WatchpostConfig`]는 모든 파이프라인 단계의 설정을 담는 최상위
//! 구조체입니다.
//!
//! # 설정 로딩 우선순위
//! 1. CLI 인자 (최고 우선)
//! 2. 환경변수 (`WATCHPOST_{SECTION}_{FIELD}` 형식 + 레거시 플랫폼 변수)
//! 3. 설정 파일 (`watchpost.toml`)
//! 4. 기본값 (`Default` 구현)
//!
//! 레거시 플랫폼 변수(`MAX_TASK_PROCESS_NUM`, `ENABLE_MESSAGE_QUEUE` 등)는
//! 접두어 없이 그대로 읽습니다. 기존 배포 환경과의 호환을 위한 것입니다.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{ConfigError, WatchpostError};

/// Watchpost 통합 설정
///
/// `watchpost.toml` 파일의 최상위 구조를 나타냅니다.
/// 각 크레이트는 자기 섹션만 읽어 사용합니다.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WatchpostConfig {
    /// 일반 설정
    #[serde(default)]
    pub general: GeneralConfig,
    /// 데이터 접근 설정
    #[serde(default)]
    pub access: AccessConfig,
    /// 알림 매니저 설정
    #[serde(default)]
    pub alert: AlertConfig,
    /// 액션/수렴/싱크 설정
    #[serde(default)]
    pub action: ActionConfig,
    /// 캐시 설정
    #[serde(default)]
    pub cache: CacheConfig,
    /// 주기 작업 스케줄러 설정
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// 메트릭 노출 설정
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl WatchpostConfig {
    /// TOML 파일에서 설정을 로드하고 환경변수 오버라이드를 적용합니다.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, WatchpostError> {
        let mut config = Self::from_file(path).await?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// TOML 파일에서 설정을 로드합니다 (환경변수 오버라이드 없음).
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self, WatchpostError> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                WatchpostError::Config(ConfigError::FileNotFound {
                    path: path.display().to_string(),
                })
            } else {
                WatchpostError::Io(e)
            }
        })?;
        let config = Self::parse(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// TOML 문자열에서 설정을 파싱합니다.
    pub fn parse(toml_str: &str) -> Result<Self, WatchpostError> {
        toml::from_str(toml_str).map_err(|e| {
            WatchpostError::Config(ConfigError::ParseFailed {
                reason: e.to_string(),
            })
        })
    }

    /// 환경변수로 설정값을 오버라이드합니다.
    pub fn apply_env_overrides(&mut self) {
        // General
        override_string(&mut self.general.log_level, "WATCHPOST_GENERAL_LOG_LEVEL");
        override_string(&mut self.general.log_format, "WATCHPOST_GENERAL_LOG_FORMAT");
        override_usize(&mut self.general.max_task_process_num, "MAX_TASK_PROCESS_NUM");
        override_csv(&mut self.general.disable_event_dataid, "DISABLE_EVENT_DATAID");

        // Access
        override_usize(&mut self.access.batch_size, "WATCHPOST_ACCESS_BATCH_SIZE");
        override_u64(
            &mut self.access.pull_interval_secs,
            "WATCHPOST_ACCESS_PULL_INTERVAL_SECS",
        );
        override_u64(&mut self.access.max_lag_secs, "WATCHPOST_ACCESS_MAX_LAG_SECS");
        override_u32(&mut self.access.retry_limit, "WATCHPOST_ACCESS_RETRY_LIMIT");
        override_usize(
            &mut self.access.backlog_high_watermark,
            "WATCHPOST_ACCESS_BACKLOG_HIGH_WATERMARK",
        );

        // Alert
        override_u64(
            &mut self.alert.poll_interval_secs,
            "WATCHPOST_ALERT_POLL_INTERVAL_SECS",
        );
        override_u64(
            &mut self.alert.auto_close_after_secs,
            "WATCHPOST_ALERT_AUTO_CLOSE_AFTER_SECS",
        );

        // Action
        override_bool(&mut self.action.enable_message_queue, "ENABLE_MESSAGE_QUEUE");
        override_bool(
            &mut self.action.enable_push_shielded_alert,
            "ENABLE_PUSH_SHIELDED_ALERT",
        );
        override_bool(
            &mut self.action.compatible_alarm_format,
            "COMPATIBLE_ALARM_FORMAT",
        );
        override_u32(&mut self.action.qos_threshold, "WATCHPOST_ACTION_QOS_THRESHOLD");
        override_u64(
            &mut self.action.qos_window_secs,
            "WATCHPOST_ACTION_QOS_WINDOW_SECS",
        );
        if let Ok(raw) = std::env::var("MESSAGE_QUEUE_DSN") {
            match MessageQueueDsn::parse(&raw) {
                Ok(dsn) => self.action.message_queue_dsn = Some(dsn),
                Err(reason) => warn!(
                    value = raw.as_str(),
                    reason = reason.as_str(),
                    "failed to parse MESSAGE_QUEUE_DSN from env var, ignoring"
                ),
            }
        }

        // Cache
        override_u64(
            &mut self.cache.strategy_refresh_secs,
            "WATCHPOST_CACHE_STRATEGY_REFRESH_SECS",
        );
        override_u64(
            &mut self.cache.topology_ttl_secs,
            "WATCHPOST_CACHE_TOPOLOGY_TTL_SECS",
        );
        override_u64(
            &mut self.cache.shield_refresh_secs,
            "WATCHPOST_CACHE_SHIELD_REFRESH_SECS",
        );

        // Scheduler
        override_u64(
            &mut self.scheduler.lock_ttl_secs,
            "WATCHPOST_SCHEDULER_LOCK_TTL_SECS",
        );

        // Metrics
        override_bool(&mut self.metrics.enabled, "WATCHPOST_METRICS_ENABLED");
        override_string(&mut self.metrics.listen_addr, "WATCHPOST_METRICS_LISTEN_ADDR");
    }

    /// 설정값의 유효성을 검증합니다.
    pub fn validate(&self) -> Result<(), WatchpostError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.general.log_level.as_str()) {
            return Err(ConfigError::InvalidValue {
                field: "general.log_level".to_owned(),
                reason: format!("must be one of: {}", valid_levels.join(", ")),
            }
            .into());
        }

        let valid_formats = ["json", "pretty"];
        if !valid_formats.contains(&self.general.log_format.as_str()) {
            return Err(ConfigError::InvalidValue {
                field: "general.log_format".to_owned(),
                reason: format!("must be one of: {}", valid_formats.join(", ")),
            }
            .into());
        }

        if self.general.max_task_process_num == 0 {
            return Err(ConfigError::InvalidValue {
                field: "general.max_task_process_num".to_owned(),
                reason: "must be > 0".to_owned(),
            }
            .into());
        }

        if self.access.batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "access.batch_size".to_owned(),
                reason: "must be > 0".to_owned(),
            }
            .into());
        }

        // 전략 캐시 갱신 주기는 60초를 넘을 수 없다
        if self.cache.strategy_refresh_secs == 0 || self.cache.strategy_refresh_secs > 60 {
            return Err(ConfigError::InvalidValue {
                field: "cache.strategy_refresh_secs".to_owned(),
                reason: "must be in 1..=60".to_owned(),
            }
            .into());
        }

        if self.action.enable_message_queue && self.action.message_queue_dsn.is_none() {
            return Err(ConfigError::InvalidValue {
                field: "action.message_queue_dsn".to_owned(),
                reason: "required when enable_message_queue is true".to_owned(),
            }
            .into());
        }

        if self.scheduler.lock_ttl_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "scheduler.lock_ttl_secs".to_owned(),
                reason: "must be > 0".to_owned(),
            }
            .into());
        }

        Ok(())
    }
}

/// 일반 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// 로그 레벨 (trace, debug, info, warn, error)
    pub log_level: String,
    /// 로그 형식 (json, pretty)
    pub log_format: String,
    /// 주기 작업 팬아웃 동시 실행 한도
    pub max_task_process_num: usize,
    /// 건너뛸 이벤트 데이터 소스 ID 목록
    pub disable_event_dataid: Vec<String>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_owned(),
            log_format: "json".to_owned(),
            max_task_process_num: 8,
            disable_event_dataid: vec![],
        }
    }
}

/// 데이터 접근 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessConfig {
    /// 한 번에 내보내는 포인트 배치 크기
    pub batch_size: usize,
    /// 풀링 주기 (초)
    pub pull_interval_secs: u64,
    /// 수용 가능한 최대 지연 (초) — expire 필터 기준
    pub max_lag_secs: u64,
    /// 외부 호출 재시도 한도
    pub retry_limit: u32,
    /// 접근 큐 고수위 — 초과 시 비중요 전략을 다음 틱으로 건너뜁니다
    pub backlog_high_watermark: usize,
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            pull_interval_secs: 60,
            max_lag_secs: 600,
            retry_limit: 3,
            backlog_high_watermark: 10_000,
        }
    }
}

/// 알림 매니저 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    /// 매니저 틱 주기 (초)
    pub poll_interval_secs: u64,
    /// RECOVERED 이후 자동 CLOSE까지의 시간 (초)
    pub auto_close_after_secs: u64,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 30,
            auto_close_after_secs: 3600,
        }
    }
}

/// 액션/수렴/싱크 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ActionConfig {
    /// 메시지 큐 싱크 활성화 여부
    pub enable_message_queue: bool,
    /// 큐 싱크 DSN (단일 URI 또는 비즈별 URI 맵)
    pub message_queue_dsn: Option<MessageQueueDsn>,
    /// false이면 차폐된 알림은 큐 싱크로 내보내지 않습니다
    pub enable_push_shielded_alert: bool,
    /// 레거시 콜백 페이로드 형식 사용 여부
    pub compatible_alarm_format: bool,
    /// 알림당 신호별 QoS 임계값
    pub qos_threshold: u32,
    /// QoS 롤링 카운터 윈도우 (초)
    pub qos_window_secs: u64,
}

impl Default for ActionConfig {
    fn default() -> Self {
        Self {
            enable_message_queue: false,
            message_queue_dsn: None,
            enable_push_shielded_alert: true,
            compatible_alarm_format: false,
            qos_threshold: 50,
            qos_window_secs: 60,
        }
    }
}

/// 큐 싱크 DSN — 단일 URI이거나 `{bk_biz_id → URI}` 맵
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageQueueDsn {
    Single(String),
    PerBiz(BTreeMap<String, String>),
}

impl MessageQueueDsn {
    /// 환경변수 값에서 파싱합니다. `{`로 시작하면 JSON 맵으로,
    /// 아니면 단일 URI로 취급합니다.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let trimmed = raw.trim();
        if trimmed.starts_with('{') {
            let map: BTreeMap<String, String> =
                serde_json::from_str(trimmed).map_err(|e| e.to_string())?;
            Ok(Self::PerBiz(map))
        } else if trimmed.is_empty() {
            Err("empty dsn".to_owned())
        } else {
            Ok(Self::Single(trimmed.to_owned()))
        }
    }

    /// 비즈 ID에 해당하는 URI. 맵 형식에서는 해당 키가 없으면
    /// `"0"`(기본) 키로 폴백합니다.
    pub fn uri_for_biz(&self, bk_biz_id: i64) -> Option<&str> {
        match self {
            Self::Single(uri) => Some(uri.as_str()),
            Self::PerBiz(map) => map
                .get(&bk_biz_id.to_string())
                .or_else(|| map.get("0"))
                .map(String::as_str),
        }
    }
}

/// 캐시 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// 전략 캐시 갱신 주기 (초, 최대 60)
    pub strategy_refresh_secs: u64,
    /// 토폴로지 캐시 TTL (초)
    pub topology_ttl_secs: u64,
    /// 차폐 목록 갱신 주기 (초)
    pub shield_refresh_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            strategy_refresh_secs: 60,
            topology_ttl_secs: 600,
            shield_refresh_secs: 60,
        }
    }
}

/// 주기 작업 스케줄러 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// 작업 락 TTL (초) — 예상 작업 시간 이상이어야 합니다
    pub lock_ttl_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { lock_ttl_secs: 300 }
    }
}

/// 메트릭 노출 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub listen_addr: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_addr: "127.0.0.1:9256".to_owned(),
        }
    }
}

// --- 환경변수 오버라이드 헬퍼 ---

fn override_string(target: &mut String, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        *target = val;
    }
}

fn override_bool(target: &mut bool, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        match val.parse::<bool>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(
                env_key,
                value = val.as_str(),
                "failed to parse bool from env var, ignoring"
            ),
        }
    }
}

fn override_usize(target: &mut usize, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        match val.parse::<usize>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(
                env_key,
                value = val.as_str(),
                "failed to parse usize from env var, ignoring"
            ),
        }
    }
}

fn override_u32(target: &mut u32, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        match val.parse::<u32>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(
                env_key,
                value = val.as_str(),
                "failed to parse u32 from env var, ignoring"
            ),
        }
    }
}

fn override_u64(target: &mut u64, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        match val.parse::<u64>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(
                env_key,
                value = val.as_str(),
                "failed to parse u64 from env var, ignoring"
            ),
        }
    }
}

fn override_csv(target: &mut Vec<String>, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        *target = val
            .split(',')
            .map(|s| s.trim().to_owned())
            .filter(|s| !s.is_empty())
            .collect();
    }
}
