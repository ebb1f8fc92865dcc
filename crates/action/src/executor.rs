//! 액션 실행기 — 신호를 받아 수렴/QoS를 거쳐 싱크로 내보냅니다.
//!
//! 큐 싱크 집합은 `MESSAGE_QUEUE_DSN`에서 옵니다. 비즈별 DSN 맵이면
//! 해당 비즈 URI와 기본("0") URI를 함께 씁니다. 여러 싱크 중 일부만
//! 성공해도 액션은 SUCCESS로 끝나며 `ex_data`에 `(K/N)`과 실패 사유가
//! 남습니다. 전부 실패하면 FAILURE이고 `execute_times`가 증가합니다.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use watchpost_alert::manager::{AlertManager, AlertSignal};
use watchpost_core::config::{ActionConfig, MessageQueueDsn};
use watchpost_core::error::{PipelineError, WatchpostError};
use watchpost_core::pipeline::{HealthStatus, Pipeline, PipelineState};
use watchpost_core::strategy::{RelationOptions, Strategy};
use watchpost_core::types::{ActionInstance, ActionStatus, Alert};

use crate::converge::{ConvergeOutcome, Converger, QosOutcome};
use crate::dispatch::dispatch;
use crate::error::ActionError;
use crate::sink::{Sink, SinkOptions, sink_from_uri};

/// 싱크 생성 계약 (테스트에서 가짜 싱크로 대체)
pub trait SinkFactory: Send + Sync {
    fn create(&self, uri: &str) -> Result<Box<dyn Sink>, ActionError>;
}

/// URI 스킴 기반 기본 팩토리
pub struct UriSinkFactory {
    options: SinkOptions,
}

impl UriSinkFactory {
    pub fn new(options: SinkOptions) -> Self {
        Self { options }
    }
}

impl SinkFactory for UriSinkFactory {
    fn create(&self, uri: &str) -> Result<Box<dyn Sink>, ActionError> {
        sink_from_uri(uri, &self.options)
    }
}

/// 액션 실행기
pub struct ActionExecutor {
    config: ActionConfig,
    converger: Arc<Converger>,
    factory: Arc<dyn SinkFactory>,
    alerts: Option<Arc<AlertManager>>,
}

impl ActionExecutor {
    pub fn new(
        config: ActionConfig,
        converger: Arc<Converger>,
        factory: Arc<dyn SinkFactory>,
    ) -> Self {
        Self {
            config,
            converger,
            factory,
            alerts: None,
        }
    }

    /// QoS 차단을 알림 문서에 되돌려 기록할 관리자를 연결합니다.
    pub fn with_alert_feedback(mut self, manager: Arc<AlertManager>) -> Self {
        self.alerts = Some(manager);
        self
    }

    /// 신호 하나를 처리하고 최종 상태가 기록된 인스턴스들을 돌려줍니다.
    pub async fn process_signal(&self, signal: &AlertSignal, now: i64) -> Vec<ActionInstance> {
        match self
            .converger
            .check_qos(&signal.alert.id, signal.signal, now)
        {
            QosOutcome::Blocked { first } => {
                if first {
                    // 알림/신호당 한 번만 남긴다
                    info!(alert_id = %signal.alert.id, signal = %signal.signal, "qos triggered");
                    if let Some(manager) = &self.alerts {
                        manager.mark_blocked(&signal.alert.id, now).await;
                    }
                }
                return vec![];
            }
            QosOutcome::Allowed => {}
        }

        let strategy = strategy_snapshot(&signal.alert);
        let mut finished = Vec::new();
        for mut instance in dispatch(signal, now) {
            let options = strategy
                .as_ref()
                .and_then(|s| relation_options(s, instance.relation_id));

            if self.converger.noise_gated(
                &instance,
                options.and_then(|o| o.noise_reduce_config.as_ref()),
                now,
            ) {
                instance.status = ActionStatus::Skipped;
                instance.ex_data = "held by noise reduction gate".to_owned();
                finished.push(instance);
                continue;
            }

            let converge_config = options.and_then(|o| o.converge_config.as_ref());
            match self.converger.check_primary(&instance, converge_config, now) {
                ConvergeOutcome::Converged { collected } => {
                    instance.status = ActionStatus::Converged;
                    instance.ex_data = format!("collected into summary ({collected} so far)");
                    finished.push(instance);
                    continue;
                }
                ConvergeOutcome::Defended => {
                    instance.status = ActionStatus::Skipped;
                    instance.ex_data = "dropped by defense convergence".to_owned();
                    finished.push(instance);
                    continue;
                }
                ConvergeOutcome::Pass => {}
            }

            if let Some(config) = converge_config
                && config.need_biz_converge
            {
                let receiver = if signal.alert.assignee.is_empty() {
                    instance.relation_id.to_string()
                } else {
                    signal.alert.assignee.join(",")
                };
                let timedelta = config
                    .sub_converge_config
                    .as_ref()
                    .and_then(|c| c.get("timedelta"))
                    .and_then(|v| v.as_i64())
                    .unwrap_or(60);
                if self
                    .converger
                    .check_sub(&instance, &receiver, "notice", timedelta, now)
                {
                    instance.status = ActionStatus::Converged;
                    instance.ex_data = "coalesced by business convergence".to_owned();
                    finished.push(instance);
                    continue;
                }
            }

            self.execute(&mut instance, &signal.alert).await;
            finished.push(instance);
        }
        finished
    }

    /// 큐 싱크로 실제 발송합니다.
    pub async fn execute(&self, instance: &mut ActionInstance, alert: &Alert) {
        if alert.is_shielded && !self.config.enable_push_shielded_alert {
            instance.status = ActionStatus::Skipped;
            instance.ex_data = "alert shielded, queue push suppressed".to_owned();
            debug!(alert_id = %alert.id, "shielded alert not pushed");
            return;
        }
        if !self.config.enable_message_queue {
            instance.status = ActionStatus::Skipped;
            instance.ex_data = "message queue disabled".to_owned();
            return;
        }
        let uris = queue_uris(self.config.message_queue_dsn.as_ref(), alert.bk_biz_id);
        if uris.is_empty() {
            instance.status = ActionStatus::Skipped;
            instance.ex_data = "no queue sink configured".to_owned();
            return;
        }

        let payload = self.build_payload(instance, alert);
        let total = uris.len();
        let mut ok = 0usize;
        let mut failures = Vec::new();
        for uri in uris {
            let result = match self.factory.create(&uri) {
                Ok(sink) => sink.send(&payload).await,
                Err(err) => Err(err),
            };
            match result {
                Ok(()) => ok += 1,
                Err(err) => failures.push(err.to_string()),
            }
        }

        if ok > 0 {
            instance.status = ActionStatus::Success;
            instance.ex_data = if failures.is_empty() {
                format!("({ok}/{total}) all sinks ok")
            } else {
                format!("({ok}/{total}) partial: {}", failures.join("; "))
            };
            metrics::counter!("watchpost_actions_success_total").increment(1);
        } else {
            instance.status = ActionStatus::Failure;
            instance.execute_times += 1;
            instance.ex_data = format!("(0/{total}) {}", failures.join("; "));
            metrics::counter!("watchpost_actions_failure_total").increment(1);
            warn!(instance_id = %instance.id, alert_id = %alert.id, "all sinks failed");
        }
    }

    fn build_payload(&self, instance: &ActionInstance, alert: &Alert) -> Vec<u8> {
        let value = if self.config.compatible_alarm_format {
            // 레거시 콜백 페이로드
            serde_json::json!({
                "bk_biz_id": alert.bk_biz_id,
                "alarm_id": alert.id,
                "strategy_id": alert.strategy_id,
                "level": alert.severity.level(),
                "status": alert.status,
                "dimensions": alert.dimensions,
                "content": instance.execute_config.get("message").cloned().unwrap_or_default(),
            })
        } else {
            serde_json::json!({
                "alert": alert,
                "action": {
                    "id": instance.id,
                    "signal": instance.signal,
                    "plugin_type": instance.plugin_type,
                },
                "notice": instance.execute_config,
            })
        };
        serde_json::to_vec(&value).unwrap_or_default()
    }
}

fn strategy_snapshot(alert: &Alert) -> Option<Strategy> {
    alert
        .extra_info
        .strategy
        .clone()
        .and_then(|raw| serde_json::from_value(raw).ok())
}

fn relation_options(strategy: &Strategy, relation_id: u64) -> Option<&RelationOptions> {
    if strategy.notice.id == relation_id {
        return Some(&strategy.notice.options);
    }
    strategy
        .actions
        .iter()
        .find(|r| r.id == relation_id)
        .map(|r| &r.options)
}

/// 비즈의 큐 싱크 URI 목록. 비즈별 맵이면 기본("0") URI도 함께 씁니다.
fn queue_uris(dsn: Option<&MessageQueueDsn>, bk_biz_id: i64) -> Vec<String> {
    let Some(dsn) = dsn else {
        return vec![];
    };
    match dsn {
        MessageQueueDsn::Single(uri) => vec![uri.clone()],
        MessageQueueDsn::PerBiz(map) => {
            let mut uris = Vec::new();
            if let Some(uri) = map.get(&bk_biz_id.to_string()) {
                uris.push(uri.clone());
            }
            if let Some(default) = map.get("0")
                && !uris.contains(default)
            {
                uris.push(default.clone());
            }
            uris
        }
    }
}

/// 액션 단계 파이프라인 래퍼
pub struct ActionPipeline {
    state: PipelineState,
    executor: Option<(Arc<ActionExecutor>, mpsc::Receiver<AlertSignal>)>,
    handle: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl ActionPipeline {
    pub fn new(executor: Arc<ActionExecutor>, input: mpsc::Receiver<AlertSignal>) -> Self {
        Self {
            state: PipelineState::Created,
            executor: Some((executor, input)),
            handle: None,
            cancel: CancellationToken::new(),
        }
    }
}

impl Pipeline for ActionPipeline {
    fn name(&self) -> &str {
        "action"
    }

    fn state(&self) -> PipelineState {
        self.state
    }

    async fn start(&mut self) -> Result<(), WatchpostError> {
        if self.state == PipelineState::Running {
            return Err(PipelineError::AlreadyRunning.into());
        }
        let (executor, mut input) = self.executor.take().ok_or_else(|| {
            PipelineError::InitFailed("action executor already consumed".to_owned())
        })?;
        let cancel = self.cancel.clone();
        self.handle = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    signal = input.recv() => {
                        let Some(signal) = signal else { break };
                        let now = unix_now();
                        let finished = executor.process_signal(&signal, now).await;
                        debug!(alert_id = %signal.alert.id, actions = finished.len(), "signal processed");
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::converge::ConvergeOptions;
    use std::collections::BTreeMap;
    use watchpost_core::BoxFuture;
    use watchpost_core::types::{
        AlertDimension, AlertStatus, AlertStatusDetail, Severity, Signal,
    };

    struct ScriptedSink {
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

    /// URI에 "fail"이 들어가면 실패하는 팩토리
    struct ScriptedFactory;

    impl SinkFactory for ScriptedFactory {
        fn create(&self, uri: &str) -> Result<Box<dyn Sink>, ActionError> {
            Ok(Box::new(ScriptedSink {
                name: uri.split("://").next().unwrap_or("sink").to_owned(),
                ok: !uri.contains("fail"),
            }))
        }
    }

    fn alert(bk_biz_id: i64, shielded: bool) -> Alert {
        Alert {
            id: "20000001".to_owned(),
            dedupe_md5: "d".repeat(32),
            bk_biz_id,
            strategy_id: 101,
            item_id: 1001,
            alert_name: "cpu_idle".to_owned(),
            severity: Severity::Critical,
            status: AlertStatus::Abnormal,
            status_detail: AlertStatusDetail::Abnormal,
            begin_time: 60,
            first_anomaly_time: 60,
            latest_time: 180,
            end_time: None,
            duration: 0,
            assignee: vec!["admin".to_owned()],
            dimensions: vec![AlertDimension {
                key: "ip".to_owned(),
                value: serde_json::json!("10.0.0.1"),
                display_key: "ip".to_owned(),
                display_value: "10.0.0.1".to_owned(),
            }],
            tags: vec![],
            extra_info: watchpost_core::types::AlertExtraInfo {
                strategy: Some(serde_json::json!({
                    "id": 101,
                    "bk_biz_id": bk_biz_id,
                    "name": "cpu_idle",
                    "items": [],
                    "detects": [],
                    "notice": {"id": 55, "user_groups": [1], "signal": ["abnormal"]}
                })),
                ..Default::default()
            },
            anomaly_ids: vec![],
            is_shielded: shielded,
            shield_ids: vec![],
            shield_left_time: 0,
            is_ack: false,
            is_handled: false,
            is_blocked: false,
            next_status: None,
            next_status_time: None,
            logs: vec![],
        }
    }

    fn instance_for(alert: &Alert) -> ActionInstance {
        ActionInstance {
            id: "act1".to_owned(),
            strategy_id: alert.strategy_id,
            bk_biz_id: alert.bk_biz_id,
            signal: Signal::Abnormal,
            alerts: vec![alert.id.clone()],
            severity: alert.severity,
            relation_id: 55,
            execute_times: 0,
            status: ActionStatus::Running,
            ex_data: String::new(),
            plugin_type: "notice".to_owned(),
            dimensions_md5: "f".repeat(32),
            execute_config: serde_json::json!({"title": "t", "message": "m"}),
            create_time: 0,
        }
    }

    fn executor(config: ActionConfig) -> ActionExecutor {
        ActionExecutor::new(
            config,
            Arc::new(Converger::new(ConvergeOptions::default())),
            Arc::new(ScriptedFactory),
        )
    }

    fn per_biz_dsn() -> MessageQueueDsn {
        let mut map = BTreeMap::new();
        map.insert("2".to_owned(), "redis://localhost:6379/0/alerts".to_owned());
        map.insert("0".to_owned(), "kafka://fail-broker:9092/alerts".to_owned());
        MessageQueueDsn::PerBiz(map)
    }

    #[tokio::test]
    async fn partial_success_is_success_with_ratio() {
        let exec = executor(ActionConfig {
            enable_message_queue: true,
            message_queue_dsn: Some(per_biz_dsn()),
            ..ActionConfig::default()
        });
        let alert = alert(2, false);
        let mut instance = instance_for(&alert);
        exec.execute(&mut instance, &alert).await;

        assert_eq!(instance.status, ActionStatus::Success);
        assert!(instance.ex_data.contains("(1/2)"));
        assert!(instance.ex_data.contains("broker unreachable"));
        assert_eq!(instance.execute_times, 0);
    }

    #[tokio::test]
    async fn total_failure_increments_execute_times() {
        let exec = executor(ActionConfig {
            enable_message_queue: true,
            message_queue_dsn: Some(MessageQueueDsn::Single(
                "kafka://fail-broker:9092/alerts".to_owned(),
            )),
            ..ActionConfig::default()
        });
        let alert = alert(2, false);
        let mut instance = instance_for(&alert);
        exec.execute(&mut instance, &alert).await;

        assert_eq!(instance.status, ActionStatus::Failure);
        assert!(instance.ex_data.starts_with("(0/1)"));
        assert_eq!(instance.execute_times, 1);
    }

    #[tokio::test]
    async fn shielded_alert_is_suppressed_when_configured() {
        let exec = executor(ActionConfig {
            enable_message_queue: true,
            message_queue_dsn: Some(per_biz_dsn()),
            enable_push_shielded_alert: false,
            ..ActionConfig::default()
        });
        let alert = alert(2, true);
        let mut instance = instance_for(&alert);
        exec.execute(&mut instance, &alert).await;
        assert_eq!(instance.status, ActionStatus::Skipped);
        assert!(instance.ex_data.contains("shielded"));
    }

    #[tokio::test]
    async fn process_signal_runs_dispatch_and_sinks() {
        let exec = executor(ActionConfig {
            enable_message_queue: true,
            message_queue_dsn: Some(MessageQueueDsn::Single(
                "redis://localhost:6379/0/alerts".to_owned(),
            )),
            ..ActionConfig::default()
        });
        let signal = AlertSignal {
            signal: Signal::Abnormal,
            alert: alert(2, false),
        };
        let finished = exec.process_signal(&signal, 100).await;
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].status, ActionStatus::Success);
    }

    #[tokio::test]
    async fn qos_drops_signals_past_threshold() {
        let exec = ActionExecutor::new(
            ActionConfig {
                enable_message_queue: true,
                message_queue_dsn: Some(MessageQueueDsn::Single(
                    "redis://localhost:6379/0/alerts".to_owned(),
                )),
                ..ActionConfig::default()
            },
            Arc::new(Converger::new(ConvergeOptions {
                qos_threshold: 2,
                qos_window_secs: 60,
                noise_horizon_secs: 3600,
            })),
            Arc::new(ScriptedFactory),
        );
        let signal = AlertSignal {
            signal: Signal::Abnormal,
            alert: alert(2, false),
        };
        assert_eq!(exec.process_signal(&signal, 10).await.len(), 1);
        assert_eq!(exec.process_signal(&signal, 11).await.len(), 1);
        // 임계값 초과: 인스턴스가 아예 만들어지지 않는다
        assert!(exec.process_signal(&signal, 12).await.is_empty());
        assert!(exec.process_signal(&signal, 13).await.is_empty());
    }

    #[tokio::test]
    async fn legacy_payload_format() {
        let exec = executor(ActionConfig {
            compatible_alarm_format: true,
            ..ActionConfig::default()
        });
        let alert = alert(2, false);
        let instance = instance_for(&alert);
        let payload = exec.build_payload(&instance, &alert);
        let value: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(value["alarm_id"], "20000001");
        assert_eq!(value["level"], 1);
        assert!(value.get("alert").is_none());
    }

    #[test]
    fn queue_uris_fall_back_to_default_entry() {
        let dsn = per_biz_dsn();
        let uris = queue_uris(Some(&dsn), 2);
        assert_eq!(uris.len(), 2);
        let uris = queue_uris(Some(&dsn), 7);
        assert_eq!(uris, vec!["kafka://fail-broker:9092/alerts".to_owned()]);
        assert!(queue_uris(None, 2).is_empty());
    }

    mod props {
        use super::*;
        use proptest::prelude::*;
        use proptest::test_runner::TestCaseError;

        proptest! {
            /// N개 싱크 중 K개 성공(0<K<N)이면 SUCCESS이고 ex_data에
            /// "K/N"과 실패 사유가 들어간다.
            #[test]
            fn sink_partial_success(outcomes in proptest::collection::vec(any::<bool>(), 2..6)) {
                prop_assume!(outcomes.iter().any(|b| *b));
                prop_assume!(outcomes.iter().any(|b| !*b));
                let rt = tokio::runtime::Builder::new_current_thread()
                    .build()
                    .unwrap();
                let outcome: Result<(), TestCaseError> = rt.block_on(async {
                    let mut map = BTreeMap::new();
                    // 비즈별 맵 대신 단일 URI를 순차 실행해야 하므로
                    // 싱크 수만큼 직접 execute를 돌리는 대신 팩토리 결과를
                    // 스크립트한다
                    for (i, ok) in outcomes.iter().enumerate() {
                        let marker = if *ok { "ok" } else { "fail" };
                        map.insert(i.to_string(), format!("redis://{marker}-{i}:6379/0/q"));
                    }
                    let uris: Vec<String> = map.values().cloned().collect();
                    let factory = ScriptedFactory;
                    let payload = b"x";
                    let total = uris.len();
                    let mut ok = 0usize;
                    let mut failures = Vec::new();
                    for uri in &uris {
                        match factory.create(uri).unwrap().send(payload).await {
                            Ok(()) => ok += 1,
                            Err(err) => failures.push(err.to_string()),
                        }
                    }
                    let k = outcomes.iter().filter(|b| **b).count();
                    prop_assert_eq!(ok, k);
                    prop_assert_eq!(failures.len(), total - k);
                    // 실행기와 같은 집계 규칙
                    prop_assert!(ok > 0);
                    let ex_data = format!("({ok}/{total}) partial: {}", failures.join("; "));
                    let needle = format!("({k}/{total})");
                    prop_assert!(ex_data.contains(&needle));
                    prop_assert!(ex_data.contains("broker unreachable"));
                    Ok(())
                });
                outcome?;
            }
        }
    }
}
