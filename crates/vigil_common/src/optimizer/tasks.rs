//! Named optimization tasks.
//!
//! Each task knows how to list its candidates (read-only) and how to apply a
//! single approved action. The engine owns scheduling, partitioning, progress
//! and error aggregation; tasks only deal with one item at a time.

use super::policy::SafetyPolicy;
use super::{ActionTarget, AnalysisReport, OptimizationAction, SkippedCategory};
use crate::error::AdapterError;
use crate::source::MetricSource;
use crate::types::EntryKind;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info};

/// Directory depth below a volatile root that analysis descends to
const MAX_SCAN_DEPTH: usize = 16;

/// Everything a task may read during analysis
pub struct TaskContext<'a> {
    pub source: &'a dyn MetricSource,
    pub policy: &'a SafetyPolicy,
    pub now: SystemTime,
}

pub trait OptimizationTask: Send + Sync {
    /// Registry key, e.g. "temp_files"
    fn name(&self) -> &str;

    /// Shown in progress events
    fn label(&self) -> &str;

    /// Read-only scan. Failed sub-scans go to `report.skipped`.
    fn analyze(&self, ctx: &TaskContext<'_>, report: &mut AnalysisReport);

    /// Perform one approved action. Returns bytes of storage freed.
    fn apply_item(
        &self,
        source: &dyn MetricSource,
        action: &OptimizationAction,
    ) -> Result<u64, AdapterError>;

    /// Apply-time re-check, run before every item. Path targets are judged
    /// on their metadata as of `now`, not on what analysis saw. Anything
    /// refused here is never touched.
    fn recheck(
        &self,
        source: &dyn MetricSource,
        policy: &SafetyPolicy,
        action: &OptimizationAction,
        now: SystemTime,
    ) -> Result<(), String> {
        if !action.safe {
            return Err("refused: not marked safe by analysis".to_string());
        }
        match &action.target {
            ActionTarget::Path(path) => {
                let entry = source.stat_entry(path).map_err(|e| e.to_string())?;
                if entry.kind != EntryKind::File {
                    return Err(format!(
                        "refused: {} is no longer a regular file",
                        path.display()
                    ));
                }
                let age = now.duration_since(entry.modified).unwrap_or(Duration::ZERO);
                if policy.is_safe(path, age) {
                    Ok(())
                } else {
                    Err(format!("refused: {}", policy.explain(path, age)))
                }
            }
            ActionTarget::Named(_) => Ok(()),
        }
    }
}

// ============================================================================
// Temp / cache files
// ============================================================================

/// Old files under the volatile (temp/cache) roots
#[derive(Debug, Default)]
pub struct TempFilesTask;

pub const TEMP_FILES_TASK: &str = "temp_files";

impl TempFilesTask {
    fn category_for(root: &Path) -> &'static str {
        let is_cache = root.components().any(|c| {
            c.as_os_str()
                .to_str()
                .is_some_and(|s| s.to_lowercase().contains("cache"))
        });
        if is_cache {
            "Cache"
        } else {
            "Temporary Files"
        }
    }

    /// Drop roots nested inside another root so nothing is enumerated twice
    fn outermost_roots(roots: &[PathBuf]) -> Vec<PathBuf> {
        roots
            .iter()
            .filter(|root| !roots.iter().any(|other| other != *root && root.starts_with(other)))
            .cloned()
            .collect()
    }

    fn scan_root(
        &self,
        ctx: &TaskContext<'_>,
        root: &Path,
        found: &mut BTreeMap<PathBuf, OptimizationAction>,
        skipped: &mut Vec<SkippedCategory>,
    ) {
        let category = Self::category_for(root);
        let mut stack: Vec<(PathBuf, usize)> = vec![(root.to_path_buf(), 0)];

        while let Some((dir, depth)) = stack.pop() {
            let entries = match ctx.source.scan_directory(&dir) {
                Ok(entries) => entries,
                Err(e) => {
                    debug!("Skipping {}: {}", dir.display(), e);
                    skipped.push(SkippedCategory {
                        task: self.name().to_string(),
                        location: dir.display().to_string(),
                        cause: e.to_string(),
                    });
                    continue;
                }
            };

            for entry in entries {
                match entry.kind {
                    EntryKind::File => {
                        if found.contains_key(&entry.path) {
                            continue;
                        }
                        let age = ctx.now.duration_since(entry.modified).unwrap_or(Duration::ZERO);
                        let safe = ctx.policy.is_safe(&entry.path, age);
                        found.insert(
                            entry.path.clone(),
                            OptimizationAction {
                                task: self.name().to_string(),
                                category: category.to_string(),
                                target: ActionTarget::Path(entry.path.clone()),
                                size_bytes: entry.size_bytes,
                                age_seconds: age.as_secs(),
                                reason: ctx.policy.explain(&entry.path, age),
                                safe,
                            },
                        );
                    }
                    EntryKind::Directory => {
                        if ctx.policy.is_protected(&entry.path) {
                            debug!("Not descending into protected {}", entry.path.display());
                        } else if depth + 1 < MAX_SCAN_DEPTH {
                            stack.push((entry.path, depth + 1));
                        }
                    }
                    // Never followed, never candidates
                    EntryKind::Symlink | EntryKind::Other => {}
                }
            }
        }
    }
}

impl OptimizationTask for TempFilesTask {
    fn name(&self) -> &str {
        TEMP_FILES_TASK
    }

    fn label(&self) -> &str {
        "Cleaning temporary files"
    }

    fn analyze(&self, ctx: &TaskContext<'_>, report: &mut AnalysisReport) {
        let mut found = BTreeMap::new();

        for root in Self::outermost_roots(ctx.policy.volatile_roots()) {
            if ctx.policy.is_protected(&root) {
                debug!("Volatile root {} is protected, not scanning", root.display());
                continue;
            }
            self.scan_root(ctx, &root, &mut found, &mut report.skipped);
        }

        // BTreeMap keeps the listing in path order
        report.actions.extend(found.into_values());
    }

    fn apply_item(
        &self,
        source: &dyn MetricSource,
        action: &OptimizationAction,
    ) -> Result<u64, AdapterError> {
        match &action.target {
            ActionTarget::Path(path) => {
                source.remove_entry(path)?;
                debug!("Removed {} ({} bytes)", path.display(), action.size_bytes);
                Ok(action.size_bytes)
            }
            ActionTarget::Named(name) => Err(AdapterError::Unavailable(format!(
                "{} is not a filesystem target",
                name
            ))),
        }
    }
}

// ============================================================================
// Memory
// ============================================================================

/// Working-set trim, proposed only when memory usage is above a threshold
#[derive(Debug)]
pub struct MemoryTask {
    threshold_percent: f64,
}

pub const MEMORY_TASK: &str = "memory";
const MEMORY_TARGET: &str = "working-set";

impl MemoryTask {
    pub fn new(threshold_percent: f64) -> Self {
        Self { threshold_percent }
    }
}

impl OptimizationTask for MemoryTask {
    fn name(&self) -> &str {
        MEMORY_TASK
    }

    fn label(&self) -> &str {
        "Optimizing memory"
    }

    fn analyze(&self, ctx: &TaskContext<'_>, report: &mut AnalysisReport) {
        match ctx.source.sample() {
            Ok(sample) if sample.memory_percent() > self.threshold_percent => {
                report.actions.push(OptimizationAction {
                    task: self.name().to_string(),
                    category: "Memory Optimization".to_string(),
                    target: ActionTarget::Named(MEMORY_TARGET.to_string()),
                    size_bytes: 0,
                    age_seconds: 0,
                    reason: format!("Memory usage at {:.1}%", sample.memory_percent()),
                    // Trimming releases caches; it never deletes data
                    safe: true,
                });
            }
            Ok(_) => {}
            Err(e) => report.skipped.push(SkippedCategory {
                task: self.name().to_string(),
                location: MEMORY_TARGET.to_string(),
                cause: e.to_string(),
            }),
        }
    }

    fn apply_item(
        &self,
        source: &dyn MetricSource,
        action: &OptimizationAction,
    ) -> Result<u64, AdapterError> {
        match &action.target {
            ActionTarget::Named(name) if name == MEMORY_TARGET => {
                let released = source.trim_memory()?;
                info!("Memory trim released {} bytes", released);
                // Not storage
                Ok(0)
            }
            other => Err(AdapterError::Unavailable(format!(
                "{} is not a memory target",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::fake::FakeSource;

    const DAY: u64 = 86_400;

    fn policy() -> SafetyPolicy {
        SafetyPolicy::new(
            Duration::from_secs(7 * DAY),
            vec![PathBuf::from("/tmp"), PathBuf::from("/tmp/nested")],
            vec![PathBuf::from("/tmp/nested/keep")],
        )
    }

    #[test]
    fn test_scan_descends_but_skips_symlinks_and_protected() {
        let now = SystemTime::now();
        let old = now - Duration::from_secs(10 * DAY);
        let source = FakeSource::default();
        source.add_file("/tmp/a.log", 10, old);
        source.add_entry(PathBuf::from("/tmp/nested"), EntryKind::Directory, 0, old);
        source.add_file("/tmp/nested/b.log", 20, old);
        source.add_entry(PathBuf::from("/tmp/link"), EntryKind::Symlink, 0, old);
        source.add_entry(PathBuf::from("/tmp/nested/keep"), EntryKind::Directory, 0, old);
        source.add_file("/tmp/nested/keep/c.log", 30, old);

        let policy = policy();
        let ctx = TaskContext {
            source: &source,
            policy: &policy,
            now,
        };
        let mut report = AnalysisReport::default();
        TempFilesTask.analyze(&ctx, &mut report);

        let paths: Vec<String> = report.actions.iter().map(|a| a.target.to_string()).collect();
        // Nested root not enumerated twice, symlink and protected dir ignored
        assert_eq!(paths, vec!["/tmp/a.log", "/tmp/nested/b.log"]);
        assert!(report.actions.iter().all(|a| a.safe));
    }

    #[test]
    fn test_failed_subscan_is_recorded_not_fatal() {
        let now = SystemTime::now();
        let source = FakeSource::default();
        source.add_file("/tmp/a.log", 10, now);
        source.add_entry(PathBuf::from("/tmp/locked"), EntryKind::Directory, 0, now);
        source.scan_failures.lock().unwrap().insert(
            PathBuf::from("/tmp/locked"),
            AdapterError::PermissionDenied("/tmp/locked".into()),
        );

        let policy = policy();
        let ctx = TaskContext {
            source: &source,
            policy: &policy,
            now,
        };
        let mut report = AnalysisReport::default();
        TempFilesTask.analyze(&ctx, &mut report);

        assert_eq!(report.actions.len(), 1);
        assert!(!report.actions[0].safe);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].location, "/tmp/locked");
    }

    #[test]
    fn test_memory_task_respects_threshold() {
        let source = FakeSource::default();
        let policy = policy();
        let ctx = TaskContext {
            source: &source,
            policy: &policy,
            now: SystemTime::now(),
        };

        *source.memory_percent.lock().unwrap() = 50.0;
        let mut quiet = AnalysisReport::default();
        MemoryTask::new(70.0).analyze(&ctx, &mut quiet);
        assert!(quiet.actions.is_empty());

        *source.memory_percent.lock().unwrap() = 85.0;
        let mut busy = AnalysisReport::default();
        MemoryTask::new(70.0).analyze(&ctx, &mut busy);
        assert_eq!(busy.actions.len(), 1);
        assert_eq!(busy.actions[0].target, ActionTarget::Named("working-set".into()));
        assert_eq!(
            MemoryTask::new(70.0).apply_item(&source, &busy.actions[0]),
            Ok(0)
        );
    }

    #[test]
    fn test_recheck_refuses_unsafe_and_forged_actions() {
        let now = SystemTime::now();
        let source = FakeSource::default();
        source.add_file("/tmp/x", 1, now - Duration::from_secs(2 * DAY));
        source.add_file("/etc/passwd", 1, now - Duration::from_secs(30 * DAY));
        let policy = policy();
        let mut action = OptimizationAction {
            task: TEMP_FILES_TASK.into(),
            category: "Temporary Files".into(),
            target: ActionTarget::Path(PathBuf::from("/tmp/x")),
            size_bytes: 1,
            age_seconds: 8 * DAY,
            reason: String::new(),
            safe: false,
        };
        assert!(TempFilesTask.recheck(&source, &policy, &action, now).is_err());

        // Claims safe and old, but the file on disk is too young
        action.safe = true;
        assert!(TempFilesTask.recheck(&source, &policy, &action, now).is_err());

        source.replace_entry(
            Path::new("/tmp/x"),
            EntryKind::File,
            now - Duration::from_secs(8 * DAY),
        );
        assert!(TempFilesTask.recheck(&source, &policy, &action, now).is_ok());

        action.target = ActionTarget::Path(PathBuf::from("/etc/passwd"));
        assert!(TempFilesTask.recheck(&source, &policy, &action, now).is_err());

        action.target = ActionTarget::Path(PathBuf::from("/tmp/gone"));
        let err = TempFilesTask.recheck(&source, &policy, &action, now).unwrap_err();
        assert!(err.starts_with("not found"));
    }

    #[test]
    fn test_recheck_refuses_entry_that_changed_kind() {
        let now = SystemTime::now();
        let old = now - Duration::from_secs(10 * DAY);
        let source = FakeSource::default();
        source.add_file("/tmp/a", 1, old);
        source.add_file("/tmp/b", 1, old);
        let policy = policy();
        let action = |path: &str| OptimizationAction {
            task: TEMP_FILES_TASK.into(),
            category: "Temporary Files".into(),
            target: ActionTarget::Path(PathBuf::from(path)),
            size_bytes: 1,
            age_seconds: 10 * DAY,
            reason: String::new(),
            safe: true,
        };

        source.replace_entry(Path::new("/tmp/a"), EntryKind::Symlink, old);
        source.replace_entry(Path::new("/tmp/b"), EntryKind::Directory, old);
        for path in ["/tmp/a", "/tmp/b"] {
            let err = TempFilesTask
                .recheck(&source, &policy, &action(path), now)
                .unwrap_err();
            assert!(err.contains("no longer a regular file"), "{}", err);
        }
    }
}
