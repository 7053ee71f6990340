//! Vigil Common - the system-maintenance core.
//!
//! Telemetry collection and throttled dispatch, the two-phase optimization
//! engine, the disk trend predictor and the usage-context classifier. All
//! platform access goes through [`MetricSource`].

pub mod collector;
pub mod config;
pub mod context;
pub mod disk_predictor;
pub mod dispatcher;
pub mod error;
pub mod history;
pub mod optimizer;
pub mod source;
pub mod state_manager;
pub mod types;

pub use collector::{snapshot_channel, Collector, CollectorStats};
pub use config::Config;
pub use context::{resolve_policy, ContextClassifier, ResourcePolicy, UsageContext};
pub use disk_predictor::{DiskSnapshot, DiskTrendPredictor, Severity, TrendPrediction};
pub use dispatcher::{Dispatcher, DispatcherHandle, TelemetryUpdate};
pub use error::{AdapterError, Result, VigilError};
pub use history::{HistoryBuffer, Metric};
pub use optimizer::{
    ActionTarget, AnalysisReport, CancelFlag, OptimizationAction, ProgressEvent, RunResult,
    SafetyPolicy, TaskEngine, TaskResult,
};
pub use source::MetricSource;
pub use types::*;
