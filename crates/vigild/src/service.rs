//! VigilService - the one object a front end talks to.
//!
//! Composes the collector, dispatcher, task engine, disk predictor and
//! context classifier around a single [`MetricSource`]. Nothing here is a
//! global: every component is owned by the service.

use std::sync::Arc;
use tokio::sync::{broadcast, mpsc::UnboundedSender};
use tracing::{info, warn};
use vigil_common::config::Config;
use vigil_common::{
    resolve_policy, snapshot_channel, AdapterError, AnalysisReport, CancelFlag, Collector,
    ContextClassifier, DiskSnapshot, DiskTrendPredictor, Dispatcher, DispatcherHandle, HostInfo,
    MetricSource, OptimizationAction, ProgressEvent, ResourcePolicy, Result, RunResult,
    TaskEngine, TelemetryUpdate, TrendPrediction, UsageContext, VigilError,
};

/// Collector and dispatcher while telemetry is running
struct Telemetry {
    collector: Collector,
    dispatcher: DispatcherHandle,
}

pub struct VigilService {
    config: Config,
    source: Arc<dyn MetricSource>,
    engine: Arc<TaskEngine>,
    predictor: DiskTrendPredictor,
    classifier: ContextClassifier,
    host: Option<HostInfo>,
    telemetry: Option<Telemetry>,
}

impl VigilService {
    /// Build every component from `config`. Fails with `StateCorrupted` when
    /// the persisted disk history cannot be read.
    pub fn new(config: Config, source: Arc<dyn MetricSource>) -> Result<Self> {
        let engine = TaskEngine::new(Arc::clone(&source), &config.optimizer);
        let predictor = DiskTrendPredictor::open(Arc::clone(&source), &config.disk)?
            .with_cleanable_roots(engine.policy().volatile_roots().to_vec());
        let classifier = ContextClassifier::from_config(&config.context);

        let host = match source.host_info() {
            Ok(host) => {
                info!(
                    "Host: {} CPUs, {} MB RAM",
                    host.cpu_count,
                    host.total_memory_bytes / 1024 / 1024
                );
                Some(host)
            }
            Err(e) => {
                warn!("Host info unavailable: {}", e);
                None
            }
        };

        Ok(Self {
            config,
            source,
            engine: Arc::new(engine),
            predictor,
            classifier,
            host,
            telemetry: None,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn host_info(&self) -> Option<&HostInfo> {
        self.host.as_ref()
    }

    // ------------------------------------------------------------------------
    // Telemetry
    // ------------------------------------------------------------------------

    /// Start sampling and dispatching. No-op when already running.
    pub fn start(&mut self) {
        if self.telemetry.is_some() {
            return;
        }
        let t = &self.config.telemetry;
        let (sender, receiver) = snapshot_channel(t.channel_capacity);
        let dispatcher = Dispatcher::new(receiver, t.history_len, t.drain_batch);
        let collector = Collector::start(Arc::clone(&self.source), sender, t.sample_interval());
        let dispatcher = dispatcher.spawn(t.dispatch_cadence());
        info!("Telemetry started");
        self.telemetry = Some(Telemetry {
            collector,
            dispatcher,
        });
    }

    pub fn is_running(&self) -> bool {
        self.telemetry.is_some()
    }

    /// Consolidated updates, `None` until [`Self::start`] has been called
    pub fn subscribe(&self) -> Option<broadcast::Receiver<TelemetryUpdate>> {
        self.telemetry.as_ref().map(|t| t.dispatcher.subscribe())
    }

    /// Stop the collector (bounded by the configured grace period), then the
    /// dispatcher. The dispatcher is stopped even when the collector times out.
    pub async fn stop(&mut self) -> Result<()> {
        let Some(mut telemetry) = self.telemetry.take() else {
            return Ok(());
        };
        let collector_result = telemetry
            .collector
            .stop(self.config.telemetry.stop_grace())
            .await;
        telemetry.dispatcher.stop().await;
        info!("Telemetry stopped");
        collector_result
    }

    // ------------------------------------------------------------------------
    // Optimization
    // ------------------------------------------------------------------------

    pub fn task_names(&self) -> Vec<String> {
        self.engine.task_names()
    }

    /// Read-only analysis on the blocking pool. Empty `tasks` means all.
    pub async fn analyze(&self, tasks: &[&str]) -> Result<AnalysisReport> {
        let engine = Arc::clone(&self.engine);
        let names: Vec<String> = tasks.iter().map(|s| s.to_string()).collect();
        tokio::task::spawn_blocking(move || {
            let names: Vec<&str> = names.iter().map(String::as_str).collect();
            engine.analyze(&names)
        })
        .await
        .map_err(|e| VigilError::Worker(e.to_string()))?
    }

    pub async fn apply(
        &self,
        approved: Vec<OptimizationAction>,
        progress: Option<UnboundedSender<ProgressEvent>>,
        cancel: &CancelFlag,
    ) -> RunResult {
        self.engine.apply(approved, progress, cancel).await
    }

    /// Analyze everything and apply exactly the actions judged safe
    pub async fn boost(
        &self,
        progress: Option<UnboundedSender<ProgressEvent>>,
        cancel: &CancelFlag,
    ) -> Result<RunResult> {
        let report = self.analyze(&[]).await?;
        let safe = report.safe_actions();
        info!(
            "Boost: applying {} of {} candidates",
            safe.len(),
            report.actions.len()
        );
        Ok(self.apply(safe, progress, cancel).await)
    }

    // ------------------------------------------------------------------------
    // Disk forecast
    // ------------------------------------------------------------------------

    pub fn record_disk_snapshot(&mut self) -> Result<DiskSnapshot> {
        self.predictor.record_snapshot()
    }

    pub fn predict(&self) -> TrendPrediction {
        self.predictor.predict()
    }

    pub fn disk_history(&self) -> Vec<(chrono::DateTime<chrono::Utc>, u64)> {
        self.predictor.history_trend()
    }

    pub fn reset_disk_history(&mut self) -> Result<()> {
        self.predictor.reset()
    }

    // ------------------------------------------------------------------------
    // Usage context
    // ------------------------------------------------------------------------

    /// Classify what is running right now
    pub fn classify(&self) -> std::result::Result<UsageContext, AdapterError> {
        let names = self.source.process_names()?;
        Ok(self.classifier.classify(&names))
    }

    pub fn resolve_policy(&self, context: UsageContext) -> ResourcePolicy {
        resolve_policy(context)
    }
}
