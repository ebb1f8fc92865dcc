//! Pipeline orchestration -- assembly, channel wiring, and lifecycle management.
//!
//! The [`Orchestrator`] is the central coordinator of `watchpost-daemon`.
//! It validates configuration, wires the inter-stage channels, builds the
//! four pipeline stages, manages startup/shutdown ordering, and runs the
//! main event loop.
//!
//! # Startup Order (producers before consumers)
//!
//! 1. Access (pulls data, produces DataPoints)
//! 2. Detect (consumes DataPoints, produces TriggeredEvents)
//! 3. Alert (consumes TriggeredEvents, produces AlertSignals)
//! 4. Action (consumes AlertSignals, pushes to sinks)
//!
//! # Shutdown Order (same as startup - producers first)
//!
//! Stopping producers first lets every consumer drain its input channel
//! before its own `stop()` returns.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};

use watchpost_access::adapter::DataSourceAdapter;
use watchpost_access::processor::{AccessPipeline, AccessWorker, ProcessorOptions};
use watchpost_action::converge::{ConvergeOptions, Converger};
use watchpost_action::executor::{ActionExecutor, ActionPipeline, SinkFactory, UriSinkFactory};
use watchpost_action::sink::SinkOptions;
use watchpost_alert::enrich::Enricher;
use watchpost_alert::manager::{AlertManager, AlertPipeline, AlertSignal, ManagerOptions};
use watchpost_alert::shield::ShieldEvaluator;
use watchpost_cache::shield::{ShieldCache, ShieldSource};
use watchpost_cache::strategy::{StrategyCache, StrategySource};
use watchpost_cache::topology::{CmdbAdapter, TopologyCache};
use watchpost_core::config::WatchpostConfig;
use watchpost_core::pipeline::DynPipeline;
use watchpost_core::types::{DataPoint, TriggeredEvent};
use watchpost_detect::detector::{DetectPipeline, DetectWorker};
use watchpost_detect::result_cache::MemoryResultStore;
use watchpost_detect::trigger::TriggerEvaluator;

use crate::health::{DaemonHealth, StageHealth, aggregate_status};
use crate::metrics_server;
use crate::scheduler::{LocalJobLock, Scheduler};

/// Channel capacity constants.
const DATA_POINT_CHANNEL_CAPACITY: usize = 1024;
const TRIGGERED_EVENT_CHANNEL_CAPACITY: usize = 256;
const ALERT_SIGNAL_CHANNEL_CAPACITY: usize = 256;

/// Horizon for the in-memory detect result window store (seconds).
const RESULT_STORE_HORIZON_SECS: i64 = 86_400;

/// Default backoff between access query retries.
const ACCESS_RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// External system adapters injected into the pipeline stages.
///
/// Production wires every field to [`crate::platform::PlatformClient`];
/// tests substitute fakes. When `sink_factory` is `None` the executor
/// builds sinks from queue URIs directly.
pub struct Adapters {
    pub data_source: Arc<dyn DataSourceAdapter>,
    pub strategy_source: Arc<dyn StrategySource>,
    pub shield_source: Arc<dyn ShieldSource>,
    pub cmdb: Arc<dyn CmdbAdapter>,
    pub sink_factory: Option<Arc<dyn SinkFactory>>,
}

/// The main daemon orchestrator.
///
/// Manages the complete lifecycle of the alert processing chain:
/// configuration validation, channel wiring, ordered startup, periodic
/// cache refresh, health reporting, and graceful shutdown.
pub struct Orchestrator {
    config: WatchpostConfig,
    /// Pipeline stages in start order (producers first).
    pipelines: Vec<Box<dyn DynPipeline>>,
    strategies: Arc<StrategyCache>,
    scheduler: Scheduler,
    shutdown_tx: broadcast::Sender<()>,
    start_time: Instant,
}

impl Orchestrator {
    /// Build the full pipeline chain from an already-loaded configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Configuration validation fails
    /// - The metrics recorder cannot be installed
    pub fn build_from_config(config: WatchpostConfig, adapters: Adapters) -> Result<Self> {
        config
            .validate()
            .map_err(|e| anyhow::anyhow!("config validation failed: {}", e))?;

        // Install metrics recorder before any stage starts emitting
        if config.metrics.enabled {
            metrics_server::install_metrics_recorder(&config.metrics)?;
        }

        tracing::debug!("creating inter-stage channels");
        let (point_tx, point_rx) = mpsc::channel::<DataPoint>(DATA_POINT_CHANNEL_CAPACITY);
        let (event_tx, event_rx) =
            mpsc::channel::<TriggeredEvent>(TRIGGERED_EVENT_CHANNEL_CAPACITY);
        let (signal_tx, signal_rx) = mpsc::channel::<AlertSignal>(ALERT_SIGNAL_CHANNEL_CAPACITY);
        let (shutdown_tx, _) = broadcast::channel(16);

        // Shared caches
        let strategies = Arc::new(StrategyCache::new(
            Arc::clone(&adapters.strategy_source),
            Duration::from_secs(config.cache.strategy_refresh_secs),
        ));
        let topology = Arc::new(TopologyCache::new(
            Arc::clone(&adapters.cmdb),
            Duration::from_secs(config.cache.topology_ttl_secs),
        ));
        let shields = Arc::new(ShieldCache::new(
            Arc::clone(&adapters.shield_source),
            Duration::from_secs(config.cache.shield_refresh_secs),
        ));

        // Stage 1: access
        let access_worker = AccessWorker::new(
            Arc::clone(&adapters.data_source),
            Arc::clone(&strategies),
            Arc::clone(&topology),
            point_tx,
            ProcessorOptions {
                batch_size: config.access.batch_size,
                pull_interval_secs: config.access.pull_interval_secs,
                max_lag_secs: config.access.max_lag_secs as i64,
                retry_limit: config.access.retry_limit,
                retry_backoff: ACCESS_RETRY_BACKOFF,
                backlog_high_watermark: config.access.backlog_high_watermark,
            },
        );

        // Stage 2: detect
        let trigger =
            TriggerEvaluator::new(Arc::new(MemoryResultStore::new(RESULT_STORE_HORIZON_SECS)));
        let detect_worker = DetectWorker::new(Arc::clone(&strategies), trigger, event_tx);

        // Stage 3: alert
        let manager = Arc::new(AlertManager::new(
            Enricher::new(Arc::clone(&topology)),
            ShieldEvaluator::new(shields),
            signal_tx,
            ManagerOptions {
                auto_close_after_secs: config.alert.auto_close_after_secs as i64,
                poll_interval_secs: config.alert.poll_interval_secs,
            },
        ));

        // Stage 4: action
        let converger = Arc::new(Converger::new(ConvergeOptions {
            qos_threshold: config.action.qos_threshold,
            qos_window_secs: config.action.qos_window_secs as i64,
            ..ConvergeOptions::default()
        }));
        let factory = adapters
            .sink_factory
            .unwrap_or_else(|| Arc::new(UriSinkFactory::new(SinkOptions::default())));
        let executor = Arc::new(
            ActionExecutor::new(config.action.clone(), converger, factory)
                .with_alert_feedback(Arc::clone(&manager)),
        );

        let pipelines: Vec<Box<dyn DynPipeline>> = vec![
            Box::new(AccessPipeline::new(access_worker)),
            Box::new(DetectPipeline::new(detect_worker, point_rx)),
            Box::new(AlertPipeline::new(manager, event_rx)),
            Box::new(ActionPipeline::new(executor, signal_rx)),
        ];

        let scheduler = Scheduler::new(
            Arc::new(LocalJobLock::new()),
            Duration::from_secs(config.scheduler.lock_ttl_secs),
            shutdown_tx.clone(),
        );

        info!(stages = pipelines.len(), "orchestrator initialized");

        Ok(Self {
            config,
            pipelines,
            strategies,
            scheduler,
            shutdown_tx,
            start_time: Instant::now(),
        })
    }

    /// Start all pipeline stages and enter the main event loop.
    ///
    /// Blocks until `SIGTERM` or `SIGINT` is received, then performs a
    /// graceful shutdown.
    pub async fn run(&mut self) -> Result<()> {
        // The access stage cannot plan queries without strategies, so the
        // first load is mandatory. Later refreshes may fail transiently.
        self.strategies
            .refresh()
            .await
            .map_err(|e| anyhow::anyhow!("initial strategy cache load failed: {}", e))?;

        self.start_all().await?;
        self.spawn_jobs();

        info!("entering main event loop");
        let signal = wait_for_shutdown_signal().await?;
        info!(signal, "shutdown signal received");

        self.shutdown().await
    }

    /// Start stages in order (producers first), rolling back on failure.
    pub async fn start_all(&mut self) -> Result<()> {
        for index in 0..self.pipelines.len() {
            let name = self.pipelines[index].name().to_owned();
            info!(stage = name.as_str(), "starting pipeline stage");
            if let Err(e) = self.pipelines[index].start().await {
                warn!(stage = name.as_str(), "startup failed, rolling back already-started stages");
                for started in self.pipelines[..index].iter_mut() {
                    if let Err(stop_err) = started.stop().await {
                        error!(
                            stage = started.name(),
                            error = %stop_err,
                            "rollback stop failed during startup cleanup"
                        );
                    }
                }
                return Err(anyhow::anyhow!("failed to start stage '{}': {}", name, e));
            }
        }
        Ok(())
    }

    /// Spawn the periodic housekeeping jobs.
    fn spawn_jobs(&mut self) {
        let strategies = Arc::clone(&self.strategies);
        self.scheduler.spawn(
            "strategy_refresh",
            Duration::from_secs(self.config.cache.strategy_refresh_secs),
            move || {
                let strategies = Arc::clone(&strategies);
                async move {
                    if let Err(e) = strategies.refresh_if_stale().await {
                        warn!(error = %e, "strategy cache refresh failed, keeping stale snapshot");
                    }
                }
            },
        );

        if self.config.metrics.enabled {
            let start_time = self.start_time;
            self.scheduler
                .spawn("uptime", Duration::from_secs(10), move || async move {
                    metrics::gauge!("watchpost_daemon_uptime_seconds")
                        .set(start_time.elapsed().as_secs() as f64);
                });
        }
    }

    /// Perform graceful shutdown: stop jobs, then stages producers-first.
    pub async fn shutdown(&mut self) -> Result<()> {
        info!("broadcasting shutdown to background jobs");
        let _ = self.shutdown_tx.send(());
        self.scheduler.join_all().await;

        info!("stopping pipeline stages");
        let mut first_error = None;
        for pipeline in self.pipelines.iter_mut() {
            if let Err(e) = pipeline.stop().await {
                error!(stage = pipeline.name(), error = %e, "stage stop failed");
                if first_error.is_none() {
                    first_error = Some(anyhow::anyhow!(
                        "failed to stop stage '{}': {}",
                        pipeline.name(),
                        e
                    ));
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Get the current aggregated health status.
    pub async fn health(&self) -> DaemonHealth {
        let mut stages = Vec::with_capacity(self.pipelines.len());
        for pipeline in &self.pipelines {
            stages.push(StageHealth {
                name: pipeline.name().to_owned(),
                status: pipeline.health_check().await,
            });
        }

        DaemonHealth {
            status: aggregate_status(&stages),
            uptime_secs: self.start_time.elapsed().as_secs(),
            stages,
        }
    }

    /// Get a reference to the loaded configuration.
    pub fn config(&self) -> &WatchpostConfig {
        &self.config
    }
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
///
/// Returns the name of the signal that triggered the shutdown.
async fn wait_for_shutdown_signal() -> Result<&'static str> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| anyhow::anyhow!("failed to install SIGTERM handler: {}", e))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| anyhow::anyhow!("failed to install SIGINT handler: {}", e))?;

    Ok(tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    })
}
