//! Vigil configuration.
//!
//! Loaded once from TOML at startup and read-only afterwards; changes only
//! apply on the next start. Every field has a default, so an empty file (or
//! no file at all) is a valid configuration.
//!
//! Values outside their valid range are rejected and the core refuses to
//! start.

use crate::error::{Result, VigilError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// System config file
pub const CONFIG_PATH: &str = "/etc/vigil/config.toml";

const STATE_FILE: &str = "disk_history.json";

// ============================================================================
// Telemetry
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Time between samples (milliseconds, valid: 1000-10000)
    #[serde(default = "default_sample_interval")]
    pub sample_interval_ms: u64,

    /// Dispatcher cadence (milliseconds, valid: 50-60000)
    #[serde(default = "default_dispatch_cadence")]
    pub dispatch_cadence_ms: u64,

    /// Samples kept per metric for graphs
    #[serde(default = "default_history_len")]
    pub history_len: usize,

    /// Snapshots queued between collector and dispatcher
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Max snapshots folded per dispatcher tick
    #[serde(default = "default_drain_batch")]
    pub drain_batch: usize,

    /// How long stop() waits for the collector loop
    #[serde(default = "default_stop_grace")]
    pub stop_grace_secs: u64,
}

fn default_sample_interval() -> u64 {
    2000
}

fn default_dispatch_cadence() -> u64 {
    500
}

fn default_history_len() -> usize {
    60
}

fn default_channel_capacity() -> usize {
    100
}

fn default_drain_batch() -> usize {
    32
}

fn default_stop_grace() -> u64 {
    5
}

impl TelemetryConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    pub fn dispatch_cadence(&self) -> Duration {
        Duration::from_millis(self.dispatch_cadence_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: default_sample_interval(),
            dispatch_cadence_ms: default_dispatch_cadence(),
            history_len: default_history_len(),
            channel_capacity: default_channel_capacity(),
            drain_batch: default_drain_batch(),
            stop_grace_secs: default_stop_grace(),
        }
    }
}

// ============================================================================
// Optimizer
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    /// Worker pool size for apply
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Files must be strictly older than this to be deletable
    #[serde(default = "default_min_age_days")]
    pub min_age_days: u64,

    /// Emit a progress event at most every N items
    #[serde(default = "default_progress_every")]
    pub progress_every: usize,

    /// Propose memory trimming above this usage
    #[serde(default = "default_memory_threshold")]
    pub memory_threshold_percent: f64,

    /// Extra volatile roots on top of what the platform reports
    #[serde(default = "default_volatile_roots")]
    pub volatile_roots: Vec<PathBuf>,

    /// Never scanned, never allowed as (or under) a volatile root
    #[serde(default = "default_protected_roots")]
    pub protected_roots: Vec<PathBuf>,
}

fn default_workers() -> usize {
    4
}

const SECS_PER_DAY: u64 = 24 * 3600;

/// Ten years
pub const MAX_MIN_AGE_DAYS: u64 = 3650;

/// A century
pub const MAX_RETENTION_DAYS: u64 = 36_500;

fn default_min_age_days() -> u64 {
    7
}

fn default_progress_every() -> usize {
    100
}

fn default_memory_threshold() -> f64 {
    70.0
}

fn default_volatile_roots() -> Vec<PathBuf> {
    let mut roots = vec![std::env::temp_dir()];
    if let Some(cache) = dirs::cache_dir() {
        roots.push(cache);
    }
    roots
}

fn default_protected_roots() -> Vec<PathBuf> {
    [
        dirs::home_dir(),
        dirs::document_dir(),
        dirs::data_dir(),
        dirs::config_dir(),
        dirs::desktop_dir(),
        dirs::picture_dir(),
    ]
    .into_iter()
    .flatten()
    .collect()
}

impl OptimizerConfig {
    pub fn min_age(&self) -> Duration {
        Duration::from_secs(self.min_age_days.saturating_mul(SECS_PER_DAY))
    }
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            min_age_days: default_min_age_days(),
            progress_every: default_progress_every(),
            memory_threshold_percent: default_memory_threshold(),
            volatile_roots: default_volatile_roots(),
            protected_roots: default_protected_roots(),
        }
    }
}

// ============================================================================
// Disk trend
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskConfig {
    /// Mount point to forecast
    #[serde(default = "default_mount")]
    pub mount: PathBuf,

    /// Days of snapshots kept
    #[serde(default = "default_retention_days")]
    pub retention_days: u64,

    /// Directories whose growth is tracked between snapshots
    #[serde(default = "default_watched_paths")]
    pub watched_paths: Vec<PathBuf>,

    /// Where the snapshot series is persisted
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
}

fn default_mount() -> PathBuf {
    PathBuf::from("/")
}

fn default_retention_days() -> u64 {
    90
}

fn default_watched_paths() -> Vec<PathBuf> {
    let mut paths: Vec<PathBuf> = [dirs::download_dir(), dirs::video_dir(), dirs::cache_dir()]
        .into_iter()
        .flatten()
        .collect();
    paths.push(std::env::temp_dir());
    paths
}

fn default_state_file() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("vigil")
        .join(STATE_FILE)
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self {
            mount: default_mount(),
            retention_days: default_retention_days(),
            watched_paths: default_watched_paths(),
            state_file: default_state_file(),
        }
    }
}

// ============================================================================
// Context membership
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    #[serde(default = "default_games")]
    pub games: Vec<String>,

    #[serde(default = "default_creative")]
    pub creative: Vec<String>,

    #[serde(default = "default_work")]
    pub work: Vec<String>,
}

fn to_strings(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

fn default_games() -> Vec<String> {
    to_strings(&[
        "csgo", "valorant", "league of legends", "fortnite", "minecraft", "dota2",
        "overwatch", "apex", "gta5", "rdr2", "cyberpunk2077", "witcher3",
        "steam", "epicgameslauncher", "origin", "uplay", "lutris", "wine", "proton",
    ])
}

fn default_creative() -> Vec<String> {
    to_strings(&[
        "photoshop", "illustrator", "premiere", "aftereffects", "davinci resolve",
        "resolve", "blender", "3dsmax", "maya", "unity", "unrealengine", "obs64", "obs",
        "gimp", "kdenlive", "inkscape", "krita",
    ])
}

fn default_work() -> Vec<String> {
    to_strings(&[
        "excel", "word", "powerpoint", "outlook", "teams", "slack", "zoom", "chrome",
        "firefox", "code", "pycharm", "intellij", "visual studio", "libreoffice",
        "thunderbird",
    ])
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            games: default_games(),
            creative: default_creative(),
            work: default_work(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// ============================================================================
// Root
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub telemetry: TelemetryConfig,

    #[serde(default)]
    pub optimizer: OptimizerConfig,

    #[serde(default)]
    pub disk: DiskConfig,

    #[serde(default)]
    pub context: ContextConfig,

    #[serde(default)]
    pub log: LogConfig,
}

impl Config {
    /// Parse and validate a TOML document
    pub fn from_toml_str(content: &str, origin: &Path) -> Result<Self> {
        let config: Config = toml::from_str(content).map_err(|source| VigilError::ConfigParse {
            path: origin.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load config from a specific path. The file must exist.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|source| VigilError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&content, path)?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Missing file means defaults; a file that exists but is invalid is an error
    pub fn load_or_default(path: &Path) -> Result<Self> {
        match Self::load_from_path(path) {
            Err(VigilError::ConfigRead { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                warn!("Config {} not found, using defaults", path.display());
                let config = Config::default();
                config.validate()?;
                Ok(config)
            }
            other => other,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let t = &self.telemetry;
        check_range("telemetry.sample_interval_ms", t.sample_interval_ms, 1000, 10_000)?;
        check_range("telemetry.dispatch_cadence_ms", t.dispatch_cadence_ms, 50, 60_000)?;
        check_positive("telemetry.history_len", t.history_len)?;
        check_positive("telemetry.channel_capacity", t.channel_capacity)?;
        check_positive("telemetry.drain_batch", t.drain_batch)?;

        let o = &self.optimizer;
        check_range("optimizer.workers", o.workers as u64, 1, 64)?;
        check_positive("optimizer.progress_every", o.progress_every)?;
        check_range("optimizer.min_age_days", o.min_age_days, 1, MAX_MIN_AGE_DAYS)?;
        if !(0.0..=100.0).contains(&o.memory_threshold_percent) {
            return Err(invalid("optimizer.memory_threshold_percent must be within 0-100"));
        }
        for root in &o.volatile_roots {
            if !root.is_absolute() {
                return Err(invalid(format!(
                    "volatile root {} must be an absolute path",
                    root.display()
                )));
            }
            if let Some(protected) = o.protected_roots.iter().find(|p| p.starts_with(root)) {
                return Err(invalid(format!(
                    "volatile root {} would expose protected root {}",
                    root.display(),
                    protected.display()
                )));
            }
        }

        check_range("disk.retention_days", self.disk.retention_days, 1, MAX_RETENTION_DAYS)?;

        self.check_context_sets()
    }

    fn check_context_sets(&self) -> Result<()> {
        let mut seen: HashMap<String, &'static str> = HashMap::new();
        let sets: [(&'static str, &Vec<String>); 3] = [
            ("games", &self.context.games),
            ("creative", &self.context.creative),
            ("work", &self.context.work),
        ];
        for (set_name, names) in sets {
            for name in names {
                let key = crate::context::normalize_process_name(name);
                if key.is_empty() {
                    return Err(invalid(format!("context.{} contains an empty name", set_name)));
                }
                if let Some(other) = seen.insert(key, set_name) {
                    if other != set_name {
                        return Err(invalid(format!(
                            "process '{}' listed in both context.{} and context.{}",
                            name, other, set_name
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

fn invalid(msg: impl Into<String>) -> VigilError {
    VigilError::ConfigurationInvalid(msg.into())
}

fn check_range(field: &str, value: u64, min: u64, max: u64) -> Result<()> {
    if value < min || value > max {
        return Err(invalid(format!(
            "{} = {} is outside {}-{}",
            field, value, min, max
        )));
    }
    Ok(())
}

fn check_positive(field: &str, value: usize) -> Result<()> {
    if value == 0 {
        return Err(invalid(format!("{} must be at least 1", field)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn origin() -> PathBuf {
        PathBuf::from("test.toml")
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = Config::from_toml_str("", &origin()).unwrap();
        assert_eq!(config.telemetry.history_len, 60);
        assert_eq!(config.telemetry.dispatch_cadence_ms, 500);
        assert_eq!(config.optimizer.workers, 4);
        assert_eq!(config.optimizer.min_age_days, 7);
        assert_eq!(config.optimizer.progress_every, 100);
        assert_eq!(config.disk.retention_days, 90);
    }

    #[test]
    fn test_partial_section_keeps_other_defaults() {
        let config = Config::from_toml_str(
            "[telemetry]\nsample_interval_ms = 5000\n\n[optimizer]\nworkers = 2\n",
            &origin(),
        )
        .unwrap();
        assert_eq!(config.telemetry.sample_interval_ms, 5000);
        assert_eq!(config.telemetry.channel_capacity, 100);
        assert_eq!(config.optimizer.workers, 2);
    }

    #[test]
    fn test_out_of_range_interval_is_rejected() {
        let err = Config::from_toml_str("[telemetry]\nsample_interval_ms = 200\n", &origin())
            .unwrap_err();
        assert!(matches!(err, VigilError::ConfigurationInvalid(_)));
    }

    #[test]
    fn test_zero_workers_is_rejected() {
        let err = Config::from_toml_str("[optimizer]\nworkers = 0\n", &origin()).unwrap_err();
        assert!(matches!(err, VigilError::ConfigurationInvalid(_)));
    }

    #[test]
    fn test_volatile_root_above_protected_root_is_rejected() {
        let doc = r#"
[optimizer]
volatile_roots = ["/home/alex"]
protected_roots = ["/home/alex/Documents"]
"#;
        let err = Config::from_toml_str(doc, &origin()).unwrap_err();
        assert!(err.to_string().contains("protected root"));
    }

    #[test]
    fn test_relative_volatile_root_is_rejected() {
        let doc = "[optimizer]\nvolatile_roots = [\"tmp\"]\nprotected_roots = []\n";
        assert!(Config::from_toml_str(doc, &origin()).is_err());
    }

    #[test]
    fn test_name_in_two_context_sets_is_rejected() {
        let doc = "[context]\ngames = [\"steam\"]\ncreative = [\"Steam\"]\nwork = []\n";
        let err = Config::from_toml_str(doc, &origin()).unwrap_err();
        assert!(err.to_string().contains("steam") || err.to_string().contains("Steam"));
    }

    #[test]
    fn test_malformed_toml_is_parse_error() {
        let err = Config::from_toml_str("[telemetry\n", &origin()).unwrap_err();
        assert!(matches!(err, VigilError::ConfigParse { .. }));
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let temp = TempDir::new().unwrap();
        let config = Config::load_or_default(&temp.path().join("absent.toml")).unwrap();
        assert_eq!(config.telemetry.history_len, 60);
    }

    #[test]
    fn test_day_counts_are_bounded() {
        for doc in [
            "[optimizer]\nmin_age_days = 0\n",
            "[optimizer]\nmin_age_days = 3651\n",
            "[optimizer]\nmin_age_days = 1000000000000000000\n",
            "[disk]\nretention_days = 36501\n",
            "[disk]\nretention_days = 100000000\n",
        ] {
            let err = Config::from_toml_str(doc, &origin()).unwrap_err();
            assert!(matches!(err, VigilError::ConfigurationInvalid(_)), "{}", doc);
        }

        let config = Config::from_toml_str(
            "[optimizer]\nmin_age_days = 3650\n\n[disk]\nretention_days = 36500\n",
            &origin(),
        )
        .unwrap();
        assert_eq!(config.optimizer.min_age(), Duration::from_secs(3650 * 86_400));
    }

    #[test]
    fn test_min_age_saturates() {
        let optimizer = OptimizerConfig {
            min_age_days: u64::MAX,
            ..OptimizerConfig::default()
        };
        assert_eq!(optimizer.min_age(), Duration::from_secs(u64::MAX));
    }

    #[test]
    fn test_load_or_default_invalid_file_is_error() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        fs::write(&path, "[disk]\nretention_days = 0\n").unwrap();
        assert!(Config::load_or_default(&path).is_err());
    }
}
