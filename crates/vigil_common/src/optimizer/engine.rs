//! Task engine: runs registered tasks through analyze and apply.

use super::policy::SafetyPolicy;
use super::tasks::{MemoryTask, OptimizationTask, TaskContext, TempFilesTask};
use super::{AnalysisReport, ItemError, OptimizationAction, RunResult, TaskResult};
use crate::config::OptimizerConfig;
use crate::error::{Result, VigilError};
use crate::source::MetricSource;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Progress of an apply run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// 0.0 - 100.0 across the whole run
    pub percent_complete: f64,
    /// Label of the task being processed
    pub current_task: String,
    pub items_done: usize,
    pub items_total: usize,
    /// Set on the event emitted when a task finishes
    pub task_finished: bool,
}

/// Cooperative cancellation, checked before each item (never mid-item)
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Shared state handed to every worker of one task
struct Progress {
    sender: Option<UnboundedSender<ProgressEvent>>,
    done: AtomicUsize,
    total: usize,
    every: usize,
}

impl Progress {
    fn percent(&self, done: usize) -> f64 {
        if self.total == 0 {
            100.0
        } else {
            (done as f64 / self.total as f64 * 100.0).min(100.0)
        }
    }

    fn emit(&self, label: &str, done: usize, task_finished: bool) {
        if let Some(sender) = &self.sender {
            // A dropped receiver just means nobody is watching
            let _ = sender.send(ProgressEvent {
                percent_complete: self.percent(done),
                current_task: label.to_string(),
                items_done: done,
                items_total: self.total,
                task_finished,
            });
        }
    }

    /// Count one finished item and emit if it lands on the N-item boundary
    fn item_finished(&self, label: &str) {
        let done = self.done.fetch_add(1, Ordering::SeqCst) + 1;
        if done % self.every == 0 {
            self.emit(label, done, false);
        }
    }
}

/// What one worker produced for its partition
#[derive(Default)]
struct PartitionOutcome {
    processed: usize,
    bytes_freed: u64,
    /// (index in the task's approved list, error)
    errors: Vec<(usize, ItemError)>,
    cancelled: bool,
}

pub struct TaskEngine {
    source: Arc<dyn MetricSource>,
    policy: Arc<SafetyPolicy>,
    tasks: Vec<Arc<dyn OptimizationTask>>,
    workers: usize,
    progress_every: usize,
}

impl TaskEngine {
    /// Engine with the built-in tasks. Volatile roots are the platform's plus
    /// the configured ones.
    pub fn new(source: Arc<dyn MetricSource>, config: &OptimizerConfig) -> Self {
        let mut roots = source.list_volatile_roots();
        roots.extend(config.volatile_roots.iter().cloned());
        let policy = SafetyPolicy::new(config.min_age(), roots, config.protected_roots.clone());

        let mut engine = Self::with_policy(source, policy, config.workers, config.progress_every);
        engine.register(Arc::new(TempFilesTask));
        engine.register(Arc::new(MemoryTask::new(config.memory_threshold_percent)));
        engine
    }

    /// Engine with no tasks registered
    pub fn with_policy(
        source: Arc<dyn MetricSource>,
        policy: SafetyPolicy,
        workers: usize,
        progress_every: usize,
    ) -> Self {
        Self {
            source,
            policy: Arc::new(policy),
            tasks: Vec::new(),
            workers: workers.max(1),
            progress_every: progress_every.max(1),
        }
    }

    /// Add a task. A task with the same name replaces the old one in place.
    pub fn register(&mut self, task: Arc<dyn OptimizationTask>) {
        match self.tasks.iter().position(|t| t.name() == task.name()) {
            Some(pos) => self.tasks[pos] = task,
            None => self.tasks.push(task),
        }
    }

    pub fn task_names(&self) -> Vec<String> {
        self.tasks.iter().map(|t| t.name().to_string()).collect()
    }

    pub fn policy(&self) -> &SafetyPolicy {
        &self.policy
    }

    fn resolve(&self, names: &[&str]) -> Result<Vec<Arc<dyn OptimizationTask>>> {
        if names.is_empty() {
            return Ok(self.tasks.clone());
        }
        for name in names {
            if !self.tasks.iter().any(|t| t.name() == *name) {
                return Err(VigilError::UnknownTask(name.to_string()));
            }
        }
        // Registry order, not request order
        Ok(self
            .tasks
            .iter()
            .filter(|t| names.contains(&t.name()))
            .cloned()
            .collect())
    }

    /// Read-only analysis of the named tasks (all tasks when `names` is empty)
    pub fn analyze(&self, names: &[&str]) -> Result<AnalysisReport> {
        self.analyze_at(names, SystemTime::now())
    }

    /// Analysis with ages measured against `now`
    pub fn analyze_at(&self, names: &[&str], now: SystemTime) -> Result<AnalysisReport> {
        let tasks = self.resolve(names)?;
        let ctx = TaskContext {
            source: self.source.as_ref(),
            policy: &self.policy,
            now,
        };

        let mut report = AnalysisReport::default();
        for task in &tasks {
            let before = report.actions.len();
            task.analyze(&ctx, &mut report);
            debug!(
                "Task {} listed {} candidates",
                task.name(),
                report.actions.len() - before
            );
        }

        info!(
            "Analysis complete: {} candidates ({} safe, {} bytes), {} skipped locations",
            report.actions.len(),
            report.actions.iter().filter(|a| a.safe).count(),
            report.total_bytes(),
            report.skipped.len()
        );
        Ok(report)
    }

    /// Apply exactly the approved actions.
    ///
    /// Items are grouped by task (registry order) and each task's items are
    /// split into disjoint partitions, one per worker. A failing item is
    /// recorded against that item and never stops its siblings. Actions naming
    /// an unknown task are recorded as errors.
    pub async fn apply(
        &self,
        approved: Vec<OptimizationAction>,
        progress: Option<UnboundedSender<ProgressEvent>>,
        cancel: &CancelFlag,
    ) -> RunResult {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let started = Instant::now();
        let total = approved.len();
        info!("Apply run {} starting: {} approved items", run_id, total);

        let progress = Arc::new(Progress {
            sender: progress,
            done: AtomicUsize::new(0),
            total,
            every: self.progress_every,
        });

        let (groups, orphans) = self.group_by_task(approved);
        let mut results = Vec::new();
        let mut partial = false;

        for (task, items) in groups {
            if cancel.is_cancelled() {
                partial = true;
                break;
            }
            let (result, cancelled) = self.run_task(task, items, &progress, cancel).await;
            results.push(result);
            if cancelled {
                partial = true;
                break;
            }
        }

        if !orphans.is_empty() {
            results.push(TaskResult {
                task_name: "unknown".to_string(),
                items_processed: 0,
                bytes_freed: 0,
                errors: orphans
                    .iter()
                    .map(|a| ItemError {
                        item: a.target.to_string(),
                        cause: format!("no task named '{}'", a.task),
                    })
                    .collect(),
                duration: std::time::Duration::ZERO,
            });
        }

        let run = RunResult::from_tasks(run_id, started_at, results, partial, started.elapsed());
        info!(
            "Apply run {} finished: {} items, {} bytes freed, {} errors{}",
            run_id,
            run.items_processed,
            run.bytes_freed,
            run.error_count(),
            if run.partial { " (cancelled, partial)" } else { "" }
        );
        run
    }

    #[allow(clippy::type_complexity)]
    fn group_by_task(
        &self,
        approved: Vec<OptimizationAction>,
    ) -> (
        Vec<(Arc<dyn OptimizationTask>, Vec<OptimizationAction>)>,
        Vec<OptimizationAction>,
    ) {
        let mut groups: Vec<(Arc<dyn OptimizationTask>, Vec<OptimizationAction>)> = self
            .tasks
            .iter()
            .map(|t| (Arc::clone(t), Vec::new()))
            .collect();
        let mut orphans = Vec::new();

        for action in approved {
            match groups.iter_mut().find(|(t, _)| t.name() == action.task) {
                Some((_, items)) => items.push(action),
                None => orphans.push(action),
            }
        }

        groups.retain(|(_, items)| !items.is_empty());
        (groups, orphans)
    }

    async fn run_task(
        &self,
        task: Arc<dyn OptimizationTask>,
        items: Vec<OptimizationAction>,
        progress: &Arc<Progress>,
        cancel: &CancelFlag,
    ) -> (TaskResult, bool) {
        let started = Instant::now();
        let task_name = task.name().to_string();
        let label = task.label().to_string();
        let chunk_size = items.len().div_ceil(self.workers).max(1);
        debug!(
            "Task {}: {} items over {} partitions",
            task_name,
            items.len(),
            items.len().div_ceil(chunk_size)
        );

        let mut indexed: Vec<(usize, OptimizationAction)> = items.into_iter().enumerate().collect();
        let mut handles = Vec::new();
        while !indexed.is_empty() {
            let rest = indexed.split_off(chunk_size.min(indexed.len()));
            let partition = std::mem::replace(&mut indexed, rest);
            let first_index = partition.first().map(|(i, _)| *i).unwrap_or(0);

            let task = Arc::clone(&task);
            let source = Arc::clone(&self.source);
            let policy = Arc::clone(&self.policy);
            let progress = Arc::clone(progress);
            let cancel = cancel.clone();
            let handle = tokio::task::spawn_blocking(move || {
                run_partition(task.as_ref(), source.as_ref(), &policy, partition, &progress, &cancel)
            });
            handles.push((first_index, handle));
        }

        let mut outcome = PartitionOutcome::default();
        for (first_index, handle) in handles {
            match handle.await {
                Ok(part) => {
                    outcome.processed += part.processed;
                    outcome.bytes_freed += part.bytes_freed;
                    outcome.errors.extend(part.errors);
                    outcome.cancelled |= part.cancelled;
                }
                Err(e) => {
                    warn!("Worker for task {} failed: {}", task_name, e);
                    outcome.errors.push((
                        first_index,
                        ItemError {
                            item: format!("partition starting at item {}", first_index),
                            cause: format!("worker failed: {}", e),
                        },
                    ));
                }
            }
        }

        // Report errors in approval order regardless of which worker hit them
        outcome.errors.sort_by_key(|(index, _)| *index);

        let done = progress.done.load(Ordering::SeqCst);
        progress.emit(&label, done, true);

        let result = TaskResult {
            task_name,
            items_processed: outcome.processed,
            bytes_freed: outcome.bytes_freed,
            errors: outcome.errors.into_iter().map(|(_, e)| e).collect(),
            duration: started.elapsed(),
        };
        (result, outcome.cancelled)
    }
}

fn run_partition(
    task: &dyn OptimizationTask,
    source: &dyn MetricSource,
    policy: &SafetyPolicy,
    partition: Vec<(usize, OptimizationAction)>,
    progress: &Progress,
    cancel: &CancelFlag,
) -> PartitionOutcome {
    let mut outcome = PartitionOutcome::default();

    for (index, action) in partition {
        if cancel.is_cancelled() {
            outcome.cancelled = true;
            break;
        }

        let attempt = task
            .recheck(source, policy, &action, SystemTime::now())
            .and_then(|()| task.apply_item(source, &action).map_err(|e| e.to_string()));

        match attempt {
            Ok(bytes) => {
                outcome.processed += 1;
                outcome.bytes_freed += bytes;
            }
            Err(cause) => {
                debug!("Item {} failed: {}", action.target, cause);
                outcome.errors.push((
                    index,
                    ItemError {
                        item: action.target.to_string(),
                        cause,
                    },
                ));
            }
        }
        progress.item_finished(task.label());
    }

    outcome
}
