//! Disk Trend Predictor - "disk will be full in N days".
//!
//! Snapshots of free/total space plus the sizes of a few watched directories
//! are appended to a persisted series. The growth rate is the least-squares
//! slope of space consumed over time across the whole retained series, which
//! damps the noise a two-point estimate would pick up.

use crate::config::DiskConfig;
use crate::error::{Result, VigilError};
use crate::optimizer::policy::normalize;
use crate::source::MetricSource;
use crate::state_manager;
use crate::types::PathUsage;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Most growing directories kept per snapshot
pub const TOP_GROWING_LIMIT: usize = 5;

const BYTES_PER_GB: f64 = 1_000_000_000.0;

/// One point of the persisted series
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskSnapshot {
    pub timestamp: DateTime<Utc>,
    pub free_bytes: u64,
    pub total_bytes: u64,
    /// At most [`TOP_GROWING_LIMIT`] entries, largest growth first
    pub top_growing_paths: Vec<PathUsage>,
    /// Every watched directory, kept for the next snapshot's deltas
    #[serde(default)]
    pub watched: Vec<PathUsage>,
}

impl DiskSnapshot {
    pub fn used_bytes(&self) -> u64 {
        self.total_bytes.saturating_sub(self.free_bytes)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Ok,
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn from_days_remaining(days: f64) -> Self {
        if days < 7.0 {
            Severity::Critical
        } else if days < 30.0 {
            Severity::Warning
        } else if days < 90.0 {
            Severity::Info
        } else {
            Severity::Ok
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Ok => "OK",
            Severity::Info => "INFO",
            Severity::Warning => "WARNING",
            Severity::Critical => "CRITICAL",
        };
        write!(f, "{}", s)
    }
}

/// Derived on demand from the series, never persisted
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrendPrediction {
    /// `f64::INFINITY` when space is not being consumed
    pub days_remaining: f64,
    pub growth_rate_bytes_per_day: f64,
    pub severity: Severity,
    /// Fewer than two snapshots; the numbers above are not estimates
    pub insufficient_history: bool,
    pub current_free_bytes: u64,
    pub samples_used: usize,
    pub top_growing_paths: Vec<PathUsage>,
    pub recommendations: Vec<String>,
}

pub struct DiskTrendPredictor {
    source: Arc<dyn MetricSource>,
    mount: PathBuf,
    watched_paths: Vec<PathBuf>,
    /// `None` when the window is wider than chrono can represent
    retention: Option<ChronoDuration>,
    state_file: PathBuf,
    /// Roots whose contents the optimizer may clean; used for advice only
    cleanable_roots: Vec<PathBuf>,
    series: Vec<DiskSnapshot>,
}

impl DiskTrendPredictor {
    /// Predictor with an empty series. Nothing is read from disk.
    pub fn new(source: Arc<dyn MetricSource>, config: &DiskConfig) -> Self {
        Self {
            source,
            mount: config.mount.clone(),
            watched_paths: config.watched_paths.clone(),
            retention: i64::try_from(config.retention_days)
                .ok()
                .and_then(ChronoDuration::try_days),
            state_file: config.state_file.clone(),
            cleanable_roots: Vec::new(),
            series: Vec::new(),
        }
    }

    /// Predictor with the persisted series loaded. A state file that exists
    /// but does not parse is `StateCorrupted`; see [`Self::reset`].
    pub fn open(source: Arc<dyn MetricSource>, config: &DiskConfig) -> Result<Self> {
        let mut predictor = Self::new(source, config);
        predictor.load()?;
        Ok(predictor)
    }

    pub fn with_cleanable_roots(mut self, roots: Vec<PathBuf>) -> Self {
        self.cleanable_roots = roots.iter().map(|r| normalize(r)).collect();
        self
    }

    fn load(&mut self) -> Result<()> {
        let mut series: Vec<DiskSnapshot> =
            state_manager::load_json(&self.state_file)?.unwrap_or_default();
        // Tolerate hand-edited files: restore timestamp order
        series.sort_by_key(|s| s.timestamp);
        info!(
            "Loaded {} disk snapshots from {}",
            series.len(),
            self.state_file.display()
        );
        prune(&mut series, self.retention);
        self.series = series;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    pub fn snapshots(&self) -> &[DiskSnapshot] {
        &self.series
    }

    /// Capture the current disk state and append it to the series
    pub fn record_snapshot(&mut self) -> Result<DiskSnapshot> {
        let usage = self
            .source
            .disk_usage(&self.mount)
            .map_err(|source| VigilError::Adapter {
                operation: "disk usage",
                source,
            })?;

        let previous = self.series.last().map(|s| s.watched.as_slice()).unwrap_or(&[]);
        let has_previous = !self.series.is_empty();

        let mut watched = Vec::new();
        for path in &self.watched_paths {
            match self.source.directory_size(path) {
                Ok(size_bytes) => {
                    let delta_bytes = previous
                        .iter()
                        .find(|p| p.path == *path)
                        .map(|p| size_bytes as i64 - p.size_bytes as i64);
                    watched.push(PathUsage {
                        path: path.clone(),
                        size_bytes,
                        delta_bytes,
                    });
                }
                Err(e) => debug!("Not sizing {}: {}", path.display(), e),
            }
        }

        let mut snapshot = DiskSnapshot {
            timestamp: Utc::now(),
            free_bytes: usage.free_bytes,
            total_bytes: usage.total_bytes,
            top_growing_paths: rank_growing(&watched, has_previous),
            watched,
        };
        self.clamp_timestamp(&mut snapshot);
        self.record(snapshot.clone())?;
        Ok(snapshot)
    }

    fn clamp_timestamp(&self, snapshot: &mut DiskSnapshot) {
        if let Some(last) = self.series.last() {
            if snapshot.timestamp < last.timestamp {
                warn!(
                    "Clock went backwards ({} < {}), clamping snapshot time",
                    snapshot.timestamp, last.timestamp
                );
                snapshot.timestamp = last.timestamp;
            }
        }
    }

    /// Append an already-captured snapshot, prune and persist.
    ///
    /// A timestamp earlier than the newest one is clamped up to it so the
    /// series stays ordered even if the wall clock steps backwards. The
    /// in-memory series only changes once the new one is on disk.
    pub fn record(&mut self, mut snapshot: DiskSnapshot) -> Result<()> {
        self.clamp_timestamp(&mut snapshot);
        debug!(
            "Disk snapshot: {} free of {} bytes",
            snapshot.free_bytes, snapshot.total_bytes
        );
        let mut series = self.series.clone();
        series.push(snapshot);
        prune(&mut series, self.retention);
        state_manager::save_json(&self.state_file, &series)?;
        self.series = series;
        Ok(())
    }

    /// Forget the whole series, on disk and in memory
    pub fn reset(&mut self) -> Result<()> {
        self.series.clear();
        state_manager::safe_delete(&self.state_file)?;
        info!("Disk history reset ({})", self.state_file.display());
        Ok(())
    }

    /// `(timestamp, used_bytes)` pairs, oldest first, for graphing
    pub fn history_trend(&self) -> Vec<(DateTime<Utc>, u64)> {
        self.series.iter().map(|s| (s.timestamp, s.used_bytes())).collect()
    }

    pub fn predict(&self) -> TrendPrediction {
        let current_free_bytes = self.series.last().map(|s| s.free_bytes).unwrap_or(0);
        let top_growing_paths = self
            .series
            .last()
            .map(|s| s.top_growing_paths.clone())
            .unwrap_or_default();

        if self.series.len() < 2 {
            return TrendPrediction {
                days_remaining: f64::INFINITY,
                growth_rate_bytes_per_day: 0.0,
                severity: Severity::Ok,
                insufficient_history: true,
                current_free_bytes,
                samples_used: self.series.len(),
                top_growing_paths,
                recommendations: vec![
                    "Not enough history yet. At least two snapshots are needed for a forecast."
                        .to_string(),
                ],
            };
        }

        let rate = consumption_rate(&self.series);
        let days_remaining = if rate > 0.0 {
            current_free_bytes as f64 / rate
        } else {
            f64::INFINITY
        };
        let severity = Severity::from_days_remaining(days_remaining);
        let recommendations = self.recommendations(severity, days_remaining, &top_growing_paths);

        TrendPrediction {
            days_remaining,
            growth_rate_bytes_per_day: rate,
            severity,
            insufficient_history: false,
            current_free_bytes,
            samples_used: self.series.len(),
            top_growing_paths,
            recommendations,
        }
    }

    fn is_cleanable(&self, path: &Path) -> bool {
        let path = normalize(path);
        self.cleanable_roots.iter().any(|root| path.starts_with(root))
    }

    fn recommendations(&self, severity: Severity, days: f64, growing: &[PathUsage]) -> Vec<String> {
        let mut out = Vec::new();
        match severity {
            Severity::Critical => out.push(format!(
                "URGENT: disk will be full in {} days. Clean up large files immediately.",
                days as u64
            )),
            Severity::Warning => out.push(format!("Disk will be full in {} days.", days as u64)),
            Severity::Info => out.push(format!(
                "Disk space is adequate for {} days. Monitor usage regularly.",
                days as u64
            )),
            Severity::Ok => {
                out.push("Disk space is healthy. No immediate action needed.".to_string());
                return out;
            }
        }

        if let Some(largest) = growing.first() {
            let growth = largest.delta_bytes.unwrap_or(largest.size_bytes as i64);
            let note = if self.is_cleanable(&largest.path) {
                "safe to clean with the optimizer"
            } else {
                "review manually"
            };
            out.push(format!(
                "Review {} (+{:.2} GB, {})",
                largest.path.display(),
                growth as f64 / BYTES_PER_GB,
                note
            ));
        }
        out
    }
}

/// Drop snapshots older than the retention window, measured from the newest
/// snapshot. An unbounded window keeps everything.
fn prune(series: &mut Vec<DiskSnapshot>, retention: Option<ChronoDuration>) {
    let Some(newest) = series.last().map(|s| s.timestamp) else {
        return;
    };
    let Some(cutoff) = retention.and_then(|r| newest.checked_sub_signed(r)) else {
        return;
    };
    let before = series.len();
    series.retain(|s| s.timestamp >= cutoff);
    let pruned = before - series.len();
    if pruned > 0 {
        debug!("Pruned {} disk snapshots older than {}", pruned, cutoff);
    }
}

/// Growth first (positive deltas only); absolute size when there is nothing
/// to compare against
fn rank_growing(watched: &[PathUsage], has_previous: bool) -> Vec<PathUsage> {
    let mut ranked: Vec<PathUsage> = if has_previous {
        watched
            .iter()
            .filter(|p| p.delta_bytes.is_some_and(|d| d > 0))
            .cloned()
            .collect()
    } else {
        watched.to_vec()
    };

    if has_previous {
        ranked.sort_by(|a, b| b.delta_bytes.cmp(&a.delta_bytes));
    } else {
        ranked.sort_by(|a, b| b.size_bytes.cmp(&a.size_bytes));
    }
    ranked.truncate(TOP_GROWING_LIMIT);
    ranked
}

/// Least-squares slope of space consumed (bytes) against elapsed days
fn consumption_rate(series: &[DiskSnapshot]) -> f64 {
    let Some(first) = series.first() else {
        return 0.0;
    };

    let points: Vec<(f64, f64)> = series
        .iter()
        .map(|s| {
            let days = (s.timestamp - first.timestamp).num_milliseconds() as f64 / 86_400_000.0;
            let consumed = first.free_bytes as f64 - s.free_bytes as f64;
            (days, consumed)
        })
        .collect();

    let n = points.len() as f64;
    let mean_x = points.iter().map(|(x, _)| x).sum::<f64>() / n;
    let mean_y = points.iter().map(|(_, y)| y).sum::<f64>() / n;

    let mut numerator = 0.0;
    let mut denominator = 0.0;
    for (x, y) in &points {
        numerator += (x - mean_x) * (y - mean_y);
        denominator += (x - mean_x).powi(2);
    }

    // All snapshots at the same instant: no trend to speak of
    if denominator == 0.0 {
        return 0.0;
    }
    numerator / denominator
}
