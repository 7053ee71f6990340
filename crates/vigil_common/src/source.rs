//! Metric Source Adapter - the capability boundary to the operating system.
//!
//! The core never queries the OS directly. Everything it needs (metric
//! samples, directory listings, removals, disk space, process names) comes
//! through this trait, so the engines can be driven by a fake in tests and
//! by the sysinfo-backed implementation in `vigild`.
//!
//! Every call may fail with PermissionDenied, NotFound or Unavailable. Callers
//! skip and continue; none of these is fatal. Calls may be slow and must not
//! be made from the dispatcher's task.

use crate::error::AdapterError;
use crate::types::{DiskUsage, EntryInfo, HostInfo, MetricSnapshot};
use std::path::{Path, PathBuf};

pub trait MetricSource: Send + Sync {
    /// Take one reading of CPU, memory, disk I/O and network I/O
    fn sample(&self) -> Result<MetricSnapshot, AdapterError>;

    /// Platform temp/cache locations suitable for cleanup consideration
    fn list_volatile_roots(&self) -> Vec<PathBuf>;

    /// Immediate children of `path`. Must not follow symlinks.
    fn scan_directory(&self, path: &Path) -> Result<Vec<EntryInfo>, AdapterError>;

    /// Current metadata of `path` itself. Must not follow a final symlink.
    fn stat_entry(&self, path: &Path) -> Result<EntryInfo, AdapterError>;

    /// Remove a single file or symlink (never a directory tree)
    fn remove_entry(&self, path: &Path) -> Result<(), AdapterError>;

    /// Free/total space of the filesystem mounted at `mount`
    fn disk_usage(&self, mount: &Path) -> Result<DiskUsage, AdapterError>;

    /// Recursive size of `path` in bytes, symlinks not followed
    fn directory_size(&self, path: &Path) -> Result<u64, AdapterError>;

    /// Names of all running processes
    fn process_names(&self) -> Result<Vec<String>, AdapterError>;

    /// Ask the platform to release unused memory. Returns bytes released when
    /// the platform can tell, otherwise 0.
    fn trim_memory(&self) -> Result<u64, AdapterError> {
        Err(AdapterError::Unavailable(
            "memory trimming not supported on this platform".to_string(),
        ))
    }

    fn host_info(&self) -> Result<HostInfo, AdapterError>;
}

#[cfg(test)]
pub(crate) mod fake {
    //! In-memory adapter for unit tests.

    use super::*;
    use crate::types::{DiskIoCounters, EntryKind, NetIoCounters};
    use chrono::Utc;
    use std::collections::{BTreeMap, HashMap, VecDeque};
    use std::sync::Mutex;
    use std::time::SystemTime;

    #[derive(Default)]
    pub struct FakeSource {
        pub samples: Mutex<VecDeque<Result<MetricSnapshot, AdapterError>>>,
        pub roots: Vec<PathBuf>,
        /// directory -> children
        pub tree: Mutex<BTreeMap<PathBuf, Vec<EntryInfo>>>,
        pub scan_failures: Mutex<HashMap<PathBuf, AdapterError>>,
        pub remove_failures: Mutex<HashMap<PathBuf, AdapterError>>,
        pub removed: Mutex<Vec<PathBuf>>,
        pub disk: Mutex<Option<DiskUsage>>,
        pub dir_sizes: Mutex<HashMap<PathBuf, u64>>,
        pub processes: Mutex<Vec<String>>,
        pub memory_percent: Mutex<f64>,
    }

    impl FakeSource {
        pub fn with_roots(roots: Vec<PathBuf>) -> Self {
            Self {
                roots,
                ..Default::default()
            }
        }

        pub fn add_file(&self, path: impl Into<PathBuf>, size_bytes: u64, modified: SystemTime) {
            self.add_entry(path.into(), EntryKind::File, size_bytes, modified);
        }

        pub fn add_entry(&self, path: PathBuf, kind: EntryKind, size_bytes: u64, modified: SystemTime) {
            let parent = path.parent().map(Path::to_path_buf).unwrap_or_default();
            let mut tree = self.tree.lock().unwrap();
            tree.entry(parent).or_default().push(EntryInfo {
                path,
                kind,
                size_bytes,
                modified,
            });
        }

        /// Change an existing entry in place, as if it were rewritten or replaced
        pub fn replace_entry(&self, path: &Path, kind: EntryKind, modified: SystemTime) {
            let mut tree = self.tree.lock().unwrap();
            for entry in tree.values_mut().flatten() {
                if entry.path == path {
                    entry.kind = kind;
                    entry.modified = modified;
                }
            }
        }

        pub fn push_sample(&self, cpu: f64, mem: f64) {
            self.samples.lock().unwrap().push_back(Ok(MetricSnapshot::new(
                Utc::now(),
                cpu,
                mem,
                DiskIoCounters::default(),
                NetIoCounters::default(),
            )));
        }

        pub fn removed(&self) -> Vec<PathBuf> {
            self.removed.lock().unwrap().clone()
        }
    }

    impl MetricSource for FakeSource {
        fn sample(&self) -> Result<MetricSnapshot, AdapterError> {
            if let Some(next) = self.samples.lock().unwrap().pop_front() {
                return next;
            }
            Ok(MetricSnapshot::new(
                Utc::now(),
                10.0,
                *self.memory_percent.lock().unwrap(),
                DiskIoCounters::default(),
                NetIoCounters::default(),
            ))
        }

        fn list_volatile_roots(&self) -> Vec<PathBuf> {
            self.roots.clone()
        }

        fn scan_directory(&self, path: &Path) -> Result<Vec<EntryInfo>, AdapterError> {
            if let Some(err) = self.scan_failures.lock().unwrap().get(path) {
                return Err(err.clone());
            }
            Ok(self.tree.lock().unwrap().get(path).cloned().unwrap_or_default())
        }

        fn stat_entry(&self, path: &Path) -> Result<EntryInfo, AdapterError> {
            self.tree
                .lock()
                .unwrap()
                .values()
                .flatten()
                .find(|e| e.path == path)
                .cloned()
                .ok_or_else(|| AdapterError::NotFound(path.display().to_string()))
        }

        fn remove_entry(&self, path: &Path) -> Result<(), AdapterError> {
            if let Some(err) = self.remove_failures.lock().unwrap().get(path) {
                return Err(err.clone());
            }
            let mut tree = self.tree.lock().unwrap();
            for children in tree.values_mut() {
                if let Some(pos) = children.iter().position(|e| e.path == path) {
                    children.remove(pos);
                    self.removed.lock().unwrap().push(path.to_path_buf());
                    return Ok(());
                }
            }
            Err(AdapterError::NotFound(path.display().to_string()))
        }

        fn disk_usage(&self, mount: &Path) -> Result<DiskUsage, AdapterError> {
            self.disk
                .lock()
                .unwrap()
                .ok_or_else(|| AdapterError::Unavailable(mount.display().to_string()))
        }

        fn directory_size(&self, path: &Path) -> Result<u64, AdapterError> {
            self.dir_sizes
                .lock()
                .unwrap()
                .get(path)
                .copied()
                .ok_or_else(|| AdapterError::NotFound(path.display().to_string()))
        }

        fn process_names(&self) -> Result<Vec<String>, AdapterError> {
            Ok(self.processes.lock().unwrap().clone())
        }

        fn trim_memory(&self) -> Result<u64, AdapterError> {
            Ok(0)
        }

        fn host_info(&self) -> Result<HostInfo, AdapterError> {
            Ok(HostInfo {
                cpu_count: 4,
                total_memory_bytes: 8 << 30,
                boot_time: 0,
            })
        }
    }
}
