//! 알림 관리자 — 생명주기 상태 기계의 단독 소유자
//!
//! 알림 문서는 여기서만 변경됩니다. 다른 단계는 신호에 실린 불변
//! 스냅샷으로만 봅니다. 알림별 뮤텍스가 한 틱 동안의 전이를 직렬화하며,
//! 같은 이벤트를 두 번 적용해도 상태가 두 번 전진하지 않습니다.
//!
//! 상태 전이:
//! - 정상 포인트가 오면 ABNORMAL → RECOVERING, 회복 윈도우 전체가
//!   지나면 RECOVERED (end_time 확정).
//! - RECOVERING 중 이상이 다시 오면 ABNORMAL로 복귀.
//! - 수동 종료는 어느 상태에서든 CLOSED.
//! - 최근 이상 없이 자동 종료 시간이 지나면 SYSTEM_CLOSE.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use watchpost_core::error::{PipelineError, WatchpostError};
use watchpost_core::pipeline::{HealthStatus, Pipeline, PipelineState};
use watchpost_core::types::{
    Alert, AlertStatus, AlertStatusDetail, CycleHandleRecord, EventStatus, LogOpType, Signal,
    TriggeredEvent,
};

use crate::builder::AlertBuilder;
use crate::enrich::Enricher;
use crate::error::AlertError;
use crate::shield::ShieldEvaluator;

/// 액션 단계로 넘기는 신호 (알림 불변 스냅샷 포함)
#[derive(Debug, Clone)]
pub struct AlertSignal {
    pub signal: Signal,
    pub alert: Alert,
}

/// 관리자 옵션
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// 최근 이상 없이 이 시간이 지나면 시스템 종료 (초)
    pub auto_close_after_secs: i64,
    pub poll_interval_secs: u64,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            auto_close_after_secs: 3600,
            poll_interval_secs: 30,
        }
    }
}

type OpenIndexKey = (u64, u64, String);

/// 알림 관리자
pub struct AlertManager {
    builder: AlertBuilder,
    enricher: Enricher,
    shields: ShieldEvaluator,
    output: mpsc::Sender<AlertSignal>,
    options: ManagerOptions,
    alerts: DashMap<String, Arc<Mutex<Alert>>>,
    by_id: DashMap<String, String>,
    open_index: DashMap<OpenIndexKey, Vec<String>>,
}

impl AlertManager {
    pub fn new(
        enricher: Enricher,
        shields: ShieldEvaluator,
        output: mpsc::Sender<AlertSignal>,
        options: ManagerOptions,
    ) -> Self {
        Self {
            builder: AlertBuilder::new(),
            enricher,
            shields,
            output,
            options,
            alerts: DashMap::new(),
            by_id: DashMap::new(),
            open_index: DashMap::new(),
        }
    }

    /// 알림 스냅샷 조회 (테스트/조회용)
    pub async fn snapshot(&self, alert_id: &str) -> Option<Alert> {
        let dedupe = self.by_id.get(alert_id)?.clone();
        let entry = self.alerts.get(&dedupe)?.clone();
        let alert = entry.lock().await;
        Some(alert.clone())
    }

    /// 트리거 이벤트 하나를 처리합니다.
    pub async fn handle_event(&self, event: TriggeredEvent, now: i64) -> Result<(), AlertError> {
        match event.status {
            EventStatus::Abnormal => self.handle_abnormal(event, now).await,
            EventStatus::Recovered => self.handle_normal_point(&event).await,
            EventStatus::Closed => Ok(()),
        }
    }

    async fn handle_abnormal(&self, event: TriggeredEvent, now: i64) -> Result<(), AlertError> {
        let dedupe = AlertBuilder::dedupe_key(&event);
        if let Some(entry) = self.alerts.get(&dedupe).map(|e| e.clone()) {
            let mut alert = entry.lock().await;
            if alert.is_open() {
                if alert.status_detail == AlertStatusDetail::Recovering {
                    alert.status_detail = AlertStatusDetail::Abnormal;
                    alert.clear_next_status();
                    alert.add_log(
                        LogOpType::AbortRecover,
                        event.time,
                        "anomaly arrived within recovery window",
                    );
                }
                AlertBuilder::update_alert(&mut alert, &event);
                alert.duration = alert.duration_at(now);
                return Ok(());
            }
            // 종결된 알림: 같은 키로 새 알림을 만들도록 흘려보낸다
            drop(alert);
            self.drop_closed(&dedupe);
        }

        let mut alert = self.builder.new_alert(&event, now);
        if let Err(err) = self.enricher.enrich(&mut alert).await {
            warn!(strategy_id = event.strategy_id, error = %err, "alert dropped");
            return Ok(());
        }
        let shield = self.shields.check(&alert, now).await;
        alert.is_shielded = shield.is_shielded;
        alert.shield_ids = shield.shield_ids;
        alert.shield_left_time = shield.shield_left_time;

        let signal = if event.is_no_data {
            Signal::NoData
        } else {
            Signal::Abnormal
        };
        self.record_cycle(&mut alert, &event, now);

        let key = (alert.strategy_id, alert.item_id, event.data.dimensions_md5());
        self.by_id.insert(alert.id.clone(), dedupe.clone());
        self.open_index
            .entry(key)
            .or_default()
            .push(dedupe.clone());
        let snapshot = alert.clone();
        self.alerts.insert(dedupe, Arc::new(Mutex::new(alert)));

        metrics::counter!("watchpost_alerts_created_total").increment(1);
        info!(alert_id = %snapshot.id, strategy_id = snapshot.strategy_id, severity = snapshot.severity.level(), "alert created");
        self.emit(signal, snapshot).await
    }

    /// 정상 포인트 신호: 같은 차원의 열린 알림을 회복 경로에 올립니다.
    async fn handle_normal_point(&self, event: &TriggeredEvent) -> Result<(), AlertError> {
        let key = (
            event.strategy_id,
            event.item_id,
            event.data.dimensions_md5(),
        );
        let dedupes = self
            .open_index
            .get(&key)
            .map(|entry| entry.clone())
            .unwrap_or_default();
        for dedupe in dedupes {
            let Some(entry) = self.alerts.get(&dedupe).map(|e| e.clone()) else {
                continue;
            };
            let mut alert = entry.lock().await;
            if !alert.is_open() || alert.status_detail == AlertStatusDetail::Recovering {
                continue;
            }
            let window = recovery_window_secs(event, alert.severity);
            alert.status_detail = AlertStatusDetail::Recovering;
            alert.set_next_status(AlertStatus::Recovered, event.time, window);
            alert.add_log(
                LogOpType::DelayRecover,
                event.time,
                format!("no anomaly, recovery due in {window}s"),
            );
            debug!(alert_id = %alert.id, window, "alert recovering");
        }
        Ok(())
    }

    /// 주기 점검: 예약된 전이, 자동 종료, 차폐 상태 변화를 처리합니다.
    pub async fn tick(&self, now: i64) -> Result<(), AlertError> {
        let entries: Vec<Arc<Mutex<Alert>>> =
            self.alerts.iter().map(|e| e.value().clone()).collect();
        for entry in entries {
            let mut alert = entry.lock().await;
            if !alert.is_open() {
                continue;
            }

            // 예약된 회복
            if let (Some(AlertStatus::Recovered), Some(due)) =
                (alert.next_status, alert.next_status_time)
                && due <= now
            {
                alert.set_end_status(
                    AlertStatus::Recovered,
                    AlertStatusDetail::Recovered,
                    LogOpType::Recover,
                    due,
                    "recovery window fully elapsed",
                );
                self.close_index_for(&alert);
                let snapshot = alert.clone();
                drop(alert);
                info!(alert_id = %snapshot.id, "alert recovered");
                self.emit(Signal::Recovered, snapshot).await?;
                continue;
            }

            // 자동 종료
            if now - alert.latest_time >= self.options.auto_close_after_secs {
                alert.set_end_status(
                    AlertStatus::Closed,
                    AlertStatusDetail::Closed,
                    LogOpType::SystemClose,
                    now,
                    "no new anomaly, closed by system",
                );
                self.close_index_for(&alert);
                let snapshot = alert.clone();
                drop(alert);
                info!(alert_id = %snapshot.id, "alert closed by system");
                self.emit(Signal::Closed, snapshot).await?;
                continue;
            }

            self.refresh_shield_state(&mut alert, now).await?;
        }
        Ok(())
    }

    /// 차폐 상태를 다시 평가하고 해제 재통지를 처리합니다.
    async fn refresh_shield_state(
        &self,
        alert: &mut Alert,
        now: i64,
    ) -> Result<(), AlertError> {
        let result = self.shields.check(alert, now).await;
        let was_shielded = alert.is_shielded;
        alert.is_shielded = result.is_shielded;
        alert.shield_ids = result.shield_ids;
        alert.shield_left_time = result.shield_left_time;

        if was_shielded
            && !alert.is_shielded
            && alert.status == AlertStatus::Abnormal
            && alert.status_detail != AlertStatusDetail::Recovering
        {
            // 직전 주기 발송이 차폐 주기였을 때만 해제 통지를 보낸다.
            // 아니라면 정규 재알림 주기로 충분하다.
            let last_cycle_shielded = alert
                .extra_info
                .cycle_handle_record
                .values()
                .next_back()
                .is_some_and(|record| record.is_shielded);
            if last_cycle_shielded {
                alert.add_log(LogOpType::Unshielded, now, "shield lifted, renotifying");
                let relation_id = alert
                    .extra_info
                    .cycle_handle_record
                    .keys()
                    .next_back()
                    .cloned()
                    .unwrap_or_default();
                if let Some(record) = alert.extra_info.cycle_handle_record.get_mut(&relation_id) {
                    record.execute_times += 1;
                    record.is_shielded = false;
                    record.last_time = now;
                }
                let snapshot = alert.clone();
                info!(alert_id = %snapshot.id, "unshielded renotify");
                self.emit(Signal::Unshielded, snapshot).await?;
            }
        }
        Ok(())
    }

    /// 수동 종료
    pub async fn close(&self, alert_id: &str, reason: &str, now: i64) -> Result<(), AlertError> {
        let Some(dedupe) = self.by_id.get(alert_id).map(|e| e.clone()) else {
            return Ok(());
        };
        let Some(entry) = self.alerts.get(&dedupe).map(|e| e.clone()) else {
            return Ok(());
        };
        let mut alert = entry.lock().await;
        if !alert.is_open() {
            return Ok(());
        }
        alert.set_end_status(
            AlertStatus::Closed,
            AlertStatusDetail::Closed,
            LogOpType::Close,
            now,
            reason,
        );
        self.close_index_for(&alert);
        let snapshot = alert.clone();
        drop(alert);
        self.emit(Signal::Closed, snapshot).await
    }

    /// QoS 차단 기록: 차단 플래그와 QOS 로그를 알림당 한 번만 남깁니다.
    pub async fn mark_blocked(&self, alert_id: &str, now: i64) {
        let Some(dedupe) = self.by_id.get(alert_id).map(|e| e.clone()) else {
            return;
        };
        let Some(entry) = self.alerts.get(&dedupe).map(|e| e.clone()) else {
            return;
        };
        let mut alert = entry.lock().await;
        if alert.is_blocked {
            return;
        }
        alert.is_blocked = true;
        alert.add_log(
            LogOpType::Qos,
            now,
            "action qos threshold exceeded, notifications dropped",
        );
        warn!(alert_id = %alert.id, "alert blocked by action qos");
    }

    /// 확인(ack) 처리
    pub async fn ack(&self, alert_id: &str, user: &str, now: i64) -> Result<(), AlertError> {
        let Some(dedupe) = self.by_id.get(alert_id).map(|e| e.clone()) else {
            return Ok(());
        };
        let Some(entry) = self.alerts.get(&dedupe).map(|e| e.clone()) else {
            return Ok(());
        };
        let mut alert = entry.lock().await;
        if alert.is_ack {
            return Ok(());
        }
        alert.is_ack = true;
        alert.add_log(LogOpType::Ack, now, format!("acknowledged by {user}"));
        let snapshot = alert.clone();
        drop(alert);
        self.emit(Signal::Ack, snapshot).await
    }

    fn record_cycle(&self, alert: &mut Alert, event: &TriggeredEvent, now: i64) {
        let relation_id = event.strategy.notice.id.to_string();
        let record = alert
            .extra_info
            .cycle_handle_record
            .entry(relation_id)
            .or_insert_with(CycleHandleRecord::default);
        record.last_time = now;
        record.execute_times += 1;
        record.is_shielded = alert.is_shielded;
        record.latest_anomaly_time = event.time;
    }

    fn close_index_for(&self, alert: &Alert) {
        for mut entry in self.open_index.iter_mut() {
            entry.value_mut().retain(|d| d != &alert.dedupe_md5);
        }
    }

    fn drop_closed(&self, dedupe: &str) {
        self.alerts.remove(dedupe);
    }

    async fn emit(&self, signal: Signal, alert: Alert) -> Result<(), AlertError> {
        self.output
            .send(AlertSignal { signal, alert })
            .await
            .map_err(|_| AlertError::ChannelClosed)
    }
}

fn recovery_window_secs(event: &TriggeredEvent, severity: watchpost_core::types::Severity) -> i64 {
    let unit = event
        .strategy
        .items
        .iter()
        .find(|i| i.id == event.item_id)
        .map(|i| i.window_unit_secs())
        .unwrap_or(60) as i64;
    let window = event
        .strategy
        .detect_for_level(severity)
        .map(|block| block.recovery_config.check_window)
        .unwrap_or(5);
    i64::from(window) * unit
}

/// 경보 단계 파이프라인 래퍼
pub struct AlertPipeline {
    state: PipelineState,
    manager: Option<(Arc<AlertManager>, mpsc::Receiver<TriggeredEvent>)>,
    handle: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl AlertPipeline {
    pub fn new(manager: Arc<AlertManager>, input: mpsc::Receiver<TriggeredEvent>) -> Self {
        Self {
            state: PipelineState::Created,
            manager: Some((manager, input)),
            handle: None,
            cancel: CancellationToken::new(),
        }
    }
}

impl Pipeline for AlertPipeline {
    fn name(&self) -> &str {
        "alert"
    }

    fn state(&self) -> PipelineState {
        self.state
    }

    async fn start(&mut self) -> Result<(), WatchpostError> {
        if self.state == PipelineState::Running {
            return Err(PipelineError::AlreadyRunning.into());
        }
        let (manager, mut input) = self
            .manager
            .take()
            .ok_or_else(|| PipelineError::InitFailed("alert manager already consumed".to_owned()))?;
        let cancel = self.cancel.clone();
        let interval = std::time::Duration::from_secs(manager.options.poll_interval_secs);
        self.handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = input.recv() => {
                        let Some(event) = event else { break };
                        let now = unix_now();
                        match manager.handle_event(event, now).await {
                            Ok(()) => {}
                            Err(AlertError::ChannelClosed) => break,
                            Err(err) => warn!(error = %err, "event dropped"),
                        }
                    }
                    _ = ticker.tick() => {
                        if let Err(err) = manager.tick(unix_now()).await {
                            if matches!(err, AlertError::ChannelClosed) {
                                break;
                            }
                            warn!(error = %err, "manager tick failed");
                        }
                    }
                }
            }
        }));
        self.state = PipelineState::Running;
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), WatchpostError> {
        if self.state != PipelineState::Running {
            return Err(PipelineError::NotRunning.into());
        }
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
        self.state = PipelineState::Stopped;
        Ok(())
    }

    async fn health_check(&self) -> HealthStatus {
        match self.state {
            PipelineState::Running => HealthStatus::Healthy,
            _ => HealthStatus::Unhealthy(format!("state: {}", self.state)),
        }
    }
}

fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
