//! Task Engine - transparent two-phase optimization.
//!
//! 1. `analyze` is a read-only scan that lists every candidate action, each
//!    with its safety verdict, so the user sees exactly what would happen.
//! 2. `apply` executes only the subset the caller approved, on a worker pool,
//!    with per-item isolation, progress events and cooperative cancellation.
//!
//! Individual cleanups are named [`OptimizationTask`]s kept in a registry, so
//! new tasks can be added without touching the dispatch logic.

pub mod engine;
pub mod policy;
pub mod tasks;

pub use engine::{CancelFlag, ProgressEvent, TaskEngine};
pub use policy::SafetyPolicy;
pub use tasks::{MemoryTask, OptimizationTask, TempFilesTask};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

// ============================================================================
// Actions
// ============================================================================

/// What an action operates on
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionTarget {
    /// A single filesystem entry
    Path(PathBuf),
    /// A non-filesystem resource (e.g. "working-set")
    Named(String),
}

impl fmt::Display for ActionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionTarget::Path(p) => write!(f, "{}", p.display()),
            ActionTarget::Named(n) => write!(f, "{}", n),
        }
    }
}

/// One candidate produced by the analyze phase
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptimizationAction {
    /// Name of the task that produced (and will apply) this action
    pub task: String,
    /// Human-facing grouping, e.g. "Temporary Files"
    pub category: String,
    pub target: ActionTarget,
    pub size_bytes: u64,
    pub age_seconds: u64,
    pub reason: String,
    pub safe: bool,
}

/// A sub-scan that failed during analysis. Not fatal to the analysis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedCategory {
    pub task: String,
    pub location: String,
    pub cause: String,
}

/// Per-category summary for the transparency view
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategorySummary {
    pub count: usize,
    pub safe_count: usize,
    pub total_bytes: u64,
}

/// Output of the analyze phase
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub actions: Vec<OptimizationAction>,
    pub skipped: Vec<SkippedCategory>,
}

impl AnalysisReport {
    pub fn safe_actions(&self) -> Vec<OptimizationAction> {
        self.actions.iter().filter(|a| a.safe).cloned().collect()
    }

    /// Number of filesystem entries listed
    pub fn total_files(&self) -> usize {
        self.actions
            .iter()
            .filter(|a| matches!(a.target, ActionTarget::Path(_)))
            .count()
    }

    pub fn total_bytes(&self) -> u64 {
        self.actions.iter().map(|a| a.size_bytes).sum()
    }

    pub fn by_category(&self) -> BTreeMap<String, CategorySummary> {
        let mut groups: BTreeMap<String, CategorySummary> = BTreeMap::new();
        for action in &self.actions {
            let entry = groups.entry(action.category.clone()).or_default();
            entry.count += 1;
            entry.total_bytes += action.size_bytes;
            if action.safe {
                entry.safe_count += 1;
            }
        }
        groups
    }
}

// ============================================================================
// Results
// ============================================================================

/// A failed item, attributed to the item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemError {
    pub item: String,
    pub cause: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_name: String,
    pub items_processed: usize,
    pub bytes_freed: u64,
    /// In the order the items were approved
    pub errors: Vec<ItemError>,
    pub duration: Duration,
}

/// Aggregate of every task in one apply run. Immutable once returned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub tasks: Vec<TaskResult>,
    /// Sum of the task results' `bytes_freed`
    pub bytes_freed: u64,
    pub items_processed: usize,
    /// True when the run was cancelled before every item was attempted
    pub partial: bool,
    pub duration: Duration,
}

impl RunResult {
    pub(crate) fn from_tasks(
        run_id: Uuid,
        started_at: DateTime<Utc>,
        tasks: Vec<TaskResult>,
        partial: bool,
        duration: Duration,
    ) -> Self {
        let bytes_freed = tasks.iter().map(|t| t.bytes_freed).sum();
        let items_processed = tasks.iter().map(|t| t.items_processed).sum();
        Self {
            run_id,
            started_at,
            tasks,
            bytes_freed,
            items_processed,
            partial,
            duration,
        }
    }

    pub fn error_count(&self) -> usize {
        self.tasks.iter().map(|t| t.errors.len()).sum()
    }

    pub fn errors(&self) -> impl Iterator<Item = &ItemError> {
        self.tasks.iter().flat_map(|t| t.errors.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn action(category: &str, size: u64, safe: bool) -> OptimizationAction {
        OptimizationAction {
            task: "temp_files".into(),
            category: category.into(),
            target: ActionTarget::Path(PathBuf::from(format!("/tmp/{}-{}", category, size))),
            size_bytes: size,
            age_seconds: 0,
            reason: String::new(),
            safe,
        }
    }

    #[test]
    fn test_report_grouping_and_totals() {
        let report = AnalysisReport {
            actions: vec![
                action("Temporary Files", 100, true),
                action("Temporary Files", 50, false),
                action("Cache", 25, true),
            ],
            skipped: vec![],
        };
        assert_eq!(report.total_files(), 3);
        assert_eq!(report.total_bytes(), 175);
        assert_eq!(report.safe_actions().len(), 2);

        let groups = report.by_category();
        assert_eq!(groups["Temporary Files"].count, 2);
        assert_eq!(groups["Temporary Files"].safe_count, 1);
        assert_eq!(groups["Cache"].total_bytes, 25);
    }

    #[test]
    fn test_run_result_sums_tasks() {
        let task = |name: &str, bytes| TaskResult {
            task_name: name.into(),
            items_processed: 2,
            bytes_freed: bytes,
            errors: vec![],
            duration: Duration::ZERO,
        };
        let run = RunResult::from_tasks(
            Uuid::new_v4(),
            Utc::now(),
            vec![task("a", 10), task("b", 32)],
            false,
            Duration::ZERO,
        );
        assert_eq!(run.bytes_freed, 42);
        assert_eq!(run.items_processed, 4);
    }
}
