//! Local machine adapter backed by sysinfo, walkdir and std::fs.

use chrono::Utc;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use sysinfo::{Disks, Networks, System};
use tracing::debug;
use vigil_common::{
    AdapterError, DiskIoCounters, DiskUsage, EntryInfo, EntryKind, HostInfo, MetricSnapshot,
    MetricSource, NetIoCounters,
};
use walkdir::WalkDir;

/// Reads the machine the daemon runs on.
///
/// `System` and `Networks` are kept between calls: CPU usage and network
/// counters are only meaningful relative to the previous refresh.
pub struct LocalSource {
    system: Mutex<System>,
    networks: Mutex<Networks>,
}

impl LocalSource {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu();
        system.refresh_memory();
        Self {
            system: Mutex::new(system),
            networks: Mutex::new(Networks::new_with_refreshed_list()),
        }
    }

    fn system(&self) -> MutexGuard<'_, System> {
        // A panic mid-refresh leaves nothing half-applied worth refusing over
        self.system.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for LocalSource {
    fn default() -> Self {
        Self::new()
    }
}

fn entry_kind(file_type: &fs::FileType) -> EntryKind {
    if file_type.is_symlink() {
        EntryKind::Symlink
    } else if file_type.is_dir() {
        EntryKind::Directory
    } else if file_type.is_file() {
        EntryKind::File
    } else {
        EntryKind::Other
    }
}

impl MetricSource for LocalSource {
    fn sample(&self) -> Result<MetricSnapshot, AdapterError> {
        let mut sys = self.system();
        sys.refresh_cpu();
        sys.refresh_memory();
        sys.refresh_processes();

        let cpu = sys.global_cpu_info().cpu_usage() as f64;
        let total = sys.total_memory();
        if total == 0 {
            return Err(AdapterError::Unavailable("memory totals not reported".into()));
        }
        let memory = sys.used_memory() as f64 / total as f64 * 100.0;

        // Cumulative I/O of live processes; the dispatcher turns it into deltas
        let mut disk_io = DiskIoCounters::default();
        for process in sys.processes().values() {
            let usage = process.disk_usage();
            disk_io.read_bytes = disk_io.read_bytes.saturating_add(usage.total_read_bytes);
            disk_io.written_bytes = disk_io.written_bytes.saturating_add(usage.total_written_bytes);
        }
        drop(sys);

        let mut net_io = NetIoCounters::default();
        {
            let mut networks = self.networks.lock().unwrap_or_else(|e| e.into_inner());
            networks.refresh();
            for (_name, data) in networks.iter() {
                net_io.received_bytes = net_io.received_bytes.saturating_add(data.total_received());
                net_io.transmitted_bytes =
                    net_io.transmitted_bytes.saturating_add(data.total_transmitted());
            }
        }

        Ok(MetricSnapshot::new(Utc::now(), cpu, memory, disk_io, net_io))
    }

    fn list_volatile_roots(&self) -> Vec<PathBuf> {
        let mut roots = vec![std::env::temp_dir()];
        let var_tmp = PathBuf::from("/var/tmp");
        if cfg!(unix) && var_tmp.is_dir() && !roots.contains(&var_tmp) {
            roots.push(var_tmp);
        }
        roots
    }

    fn scan_directory(&self, path: &Path) -> Result<Vec<EntryInfo>, AdapterError> {
        let reader = fs::read_dir(path).map_err(|e| AdapterError::from_io(&e, path.display()))?;

        let mut entries = Vec::new();
        for entry in reader {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    debug!("Unreadable entry in {}: {}", path.display(), e);
                    continue;
                }
            };
            // DirEntry::metadata does not traverse symlinks
            let metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                Err(e) => {
                    debug!("No metadata for {}: {}", entry.path().display(), e);
                    continue;
                }
            };
            let kind = entry_kind(&metadata.file_type());
            entries.push(EntryInfo {
                path: entry.path(),
                kind,
                size_bytes: if kind == EntryKind::File { metadata.len() } else { 0 },
                modified: metadata.modified().unwrap_or(std::time::UNIX_EPOCH),
            });
        }
        Ok(entries)
    }

    fn stat_entry(&self, path: &Path) -> Result<EntryInfo, AdapterError> {
        let metadata =
            fs::symlink_metadata(path).map_err(|e| AdapterError::from_io(&e, path.display()))?;
        let kind = entry_kind(&metadata.file_type());
        Ok(EntryInfo {
            path: path.to_path_buf(),
            kind,
            size_bytes: if kind == EntryKind::File { metadata.len() } else { 0 },
            modified: metadata.modified().unwrap_or(std::time::UNIX_EPOCH),
        })
    }

    fn remove_entry(&self, path: &Path) -> Result<(), AdapterError> {
        let metadata =
            fs::symlink_metadata(path).map_err(|e| AdapterError::from_io(&e, path.display()))?;
        if metadata.is_dir() {
            return Err(AdapterError::Unavailable(format!(
                "{}: refusing to remove a directory",
                path.display()
            )));
        }
        fs::remove_file(path).map_err(|e| AdapterError::from_io(&e, path.display()))
    }

    fn disk_usage(&self, mount: &Path) -> Result<DiskUsage, AdapterError> {
        let disks = Disks::new_with_refreshed_list();
        // Deepest mount point containing the requested path
        disks
            .list()
            .iter()
            .filter(|disk| mount.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().components().count())
            .map(|disk| DiskUsage {
                free_bytes: disk.available_space(),
                total_bytes: disk.total_space(),
            })
            .ok_or_else(|| AdapterError::NotFound(format!("no filesystem mounted at {}", mount.display())))
    }

    fn directory_size(&self, path: &Path) -> Result<u64, AdapterError> {
        fs::symlink_metadata(path).map_err(|e| AdapterError::from_io(&e, path.display()))?;

        let total = WalkDir::new(path)
            .follow_links(false)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .filter_map(|entry| entry.metadata().ok())
            .map(|metadata| metadata.len())
            .fold(0u64, u64::saturating_add);
        Ok(total)
    }

    fn process_names(&self) -> Result<Vec<String>, AdapterError> {
        let mut sys = self.system();
        sys.refresh_processes();
        let mut names: Vec<String> = sys
            .processes()
            .values()
            .map(|process| process.name().to_string())
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    fn trim_memory(&self) -> Result<u64, AdapterError> {
        trim_heap()?;
        // The platform does not say how much it returned
        Ok(0)
    }

    fn host_info(&self) -> Result<HostInfo, AdapterError> {
        let sys = self.system();
        Ok(HostInfo {
            cpu_count: sys.cpus().len(),
            total_memory_bytes: sys.total_memory(),
            boot_time: System::boot_time(),
        })
    }
}

/// Return freed heap pages of this process to the OS
#[cfg(all(target_os = "linux", target_env = "gnu"))]
fn trim_heap() -> Result<(), AdapterError> {
    // SAFETY: malloc_trim only walks allocator state; no pointers are passed
    unsafe {
        libc::malloc_trim(0);
    }
    Ok(())
}

#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
fn trim_heap() -> Result<(), AdapterError> {
    Err(AdapterError::Unavailable("memory trimming not supported on this platform".into()))
}
