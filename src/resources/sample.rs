use crate::error::{Error, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use sysinfo::{Disks, ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryUsage {
    pub total: u64,
    pub used: u64,
    pub free: u64,
    pub percent: f64,
}

impl MemoryUsage {
    pub fn new(total: u64, used: u64, free: u64) -> Self {
        Self {
            total,
            used,
            free,
            percent: percent_of(used, total),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskUsage {
    pub path: PathBuf,
    pub total: u64,
    pub used: u64,
    pub free: u64,
    pub percent: f64,
}

impl DiskUsage {
    pub fn new(path: impl Into<PathBuf>, total: u64, free: u64) -> Self {
        let used = total.saturating_sub(free);
        Self {
            path: path.into(),
            total,
            used,
            free,
            percent: percent_of(used, total),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
    pub cmdline: Vec<String>,
    pub memory: u64,
    pub virtual_memory: u64,
}

/// One host snapshot. Created per sampling tick and dropped after delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSample {
    pub pid: u32,
    pub virtual_memory: MemoryUsage,
    pub swap_memory: MemoryUsage,
    pub disk_usage: DiskUsage,
    pub processes: Vec<ProcessInfo>,
}

/// Selects processes by PID and/or command line. Unset filters match everything;
/// when both are set a process must satisfy both.
#[derive(Debug, Clone, Default)]
pub struct ProcessFilter {
    pids: Option<BTreeSet<u32>>,
    patterns: Vec<Regex>,
}

impl ProcessFilter {
    pub fn new(pids: Option<BTreeSet<u32>>, patterns: &[String]) -> Result<Self> {
        let patterns = patterns
            .iter()
            .map(|p| Regex::new(p).map_err(|e| Error::config(format!("process pattern {p:?}: {e}"))))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { pids, patterns })
    }

    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pids.get_or_insert_with(BTreeSet::new).insert(pid);
        self
    }

    pub fn matches(&self, pid: u32, cmdline: &str) -> bool {
        let pid_ok = self.pids.as_ref().is_none_or(|set| set.contains(&pid));
        let cmd_ok = self.patterns.is_empty() || self.patterns.iter().any(|r| r.is_match(cmdline));
        pid_ok && cmd_ok
    }
}

/// Source of host resource figures. The system implementation reads live
/// values; tests substitute fixed or scripted numbers.
pub trait ResourceProbe: Send + Sync {
    fn virtual_memory(&self) -> Result<MemoryUsage>;
    fn swap_memory(&self) -> Result<MemoryUsage>;
    fn disk_usage(&self, path: &Path) -> Result<DiskUsage>;
    fn processes(&self, filter: &ProcessFilter) -> Result<Vec<ProcessInfo>>;

    fn snapshot(&self, disk_path: &Path, filter: &ProcessFilter) -> Result<ResourceSample> {
        Ok(ResourceSample {
            pid: std::process::id(),
            virtual_memory: self.virtual_memory()?,
            swap_memory: self.swap_memory()?,
            disk_usage: self.disk_usage(disk_path)?,
            processes: self.processes(filter)?,
        })
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProbe;

impl ResourceProbe for SystemProbe {
    fn virtual_memory(&self) -> Result<MemoryUsage> {
        let mut sys = System::new();
        sys.refresh_memory();
        Ok(MemoryUsage::new(
            sys.total_memory(),
            sys.used_memory(),
            sys.available_memory(),
        ))
    }

    fn swap_memory(&self) -> Result<MemoryUsage> {
        let mut sys = System::new();
        sys.refresh_memory();
        Ok(MemoryUsage::new(
            sys.total_swap(),
            sys.used_swap(),
            sys.free_swap(),
        ))
    }

    fn disk_usage(&self, path: &Path) -> Result<DiskUsage> {
        let resolved = path
            .canonicalize()
            .map_err(|e| Error::io(format!("resolving disk path {}", path.display()), e))?;
        let disks = Disks::new_with_refreshed_list();
        // Longest matching mount point wins, so nested mounts resolve correctly.
        let disk = disks
            .iter()
            .filter(|d| resolved.starts_with(d.mount_point()))
            .max_by_key(|d| d.mount_point().as_os_str().len())
            .ok_or_else(|| {
                Error::io(
                    format!("no mounted disk holds {}", resolved.display()),
                    std::io::Error::from(std::io::ErrorKind::NotFound),
                )
            })?;
        Ok(DiskUsage::new(
            path,
            disk.total_space(),
            disk.available_space(),
        ))
    }

    fn processes(&self, filter: &ProcessFilter) -> Result<Vec<ProcessInfo>> {
        let mut sys = System::new();
        sys.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::nothing()
                .with_memory()
                .with_cmd(UpdateKind::OnlyIfNotSet),
        );
        let mut out: Vec<ProcessInfo> = sys
            .processes()
            .iter()
            .filter_map(|(pid, proc_)| {
                let cmdline: Vec<String> = proc_
                    .cmd()
                    .iter()
                    .map(|a| a.to_string_lossy().into_owned())
                    .collect();
                let pid = pid.as_u32();
                if !filter.matches(pid, &cmdline.join(" ")) {
                    return None;
                }
                Some(ProcessInfo {
                    pid,
                    name: proc_.name().to_string_lossy().into_owned(),
                    cmdline,
                    memory: proc_.memory(),
                    virtual_memory: proc_.virtual_memory(),
                })
            })
            .collect();
        out.sort_by_key(|p| p.pid);
        Ok(out)
    }
}

fn percent_of(part: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    part as f64 / total as f64 * 100.0
}
