use super::isolate::{IsolatedProcess, receive_reply};
use super::sample::{MemoryUsage, ProcessFilter, ResourceProbe, ResourceSample};
use super::sampler::ResourceSampler;
use crate::config::SupervisorConfig;
use crate::error::{Error, ResourceExceeded, Result};
use crate::hooks::{JobStatus, Notifier, StatusInfo, StatusReporter, notify_quietly, update_quietly};
use crate::util::format_bytes;
use serde::{Serialize, de::DeserializeOwned};
use std::path::Path;
use std::process::Command;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};

const WAIT_TICK: Duration = Duration::from_millis(5);

/// Work that can run either in the calling process or in a killable child.
///
/// The child started from [`isolated_command`](GovernedWork::isolated_command)
/// must print a single [`WorkerReply`](super::isolate::WorkerReply) with the
/// same output on stdout.
pub trait GovernedWork {
    type Output: Serialize + DeserializeOwned;

    fn run_inline(&self) -> Result<Self::Output>;

    fn isolated_command(&self) -> Result<Command>;

    /// Called once after the child's process group was killed. Releases what
    /// lives outside the group, such as containers run by a daemon.
    fn on_terminated(&self) {}
}

/// Callbacks invoked once when a governed run is stopped for a breach.
#[derive(Clone, Default)]
pub struct BreachHooks {
    pub job_id: String,
    pub reporter: Option<Arc<dyn StatusReporter>>,
    pub notifier: Option<Arc<dyn Notifier>>,
}

pub struct ResourceSupervisor {
    cfg: SupervisorConfig,
    probe: Arc<dyn ResourceProbe>,
    filter: ProcessFilter,
    hooks: BreachHooks,
}

impl ResourceSupervisor {
    pub fn new(cfg: SupervisorConfig, probe: Arc<dyn ResourceProbe>) -> Result<Self> {
        if cfg.poll_interval_seconds.is_nan() || cfg.poll_interval_seconds <= 0.0 {
            return Err(Error::config("resources.poll_interval_seconds must be positive"));
        }
        if cfg.disk_headroom_factor < 0.0 {
            return Err(Error::config("resources.disk_headroom_factor must not be negative"));
        }
        let filter = ProcessFilter::new(None, &cfg.process_patterns)?;
        Ok(Self {
            cfg,
            probe,
            filter,
            hooks: BreachHooks::default(),
        })
    }

    pub fn with_hooks(mut self, hooks: BreachHooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.cfg
    }

    /// Pre-flight memory gate.
    pub fn check_virtual_memory(&self) -> Result<()> {
        if !self.cfg.enabled {
            return Ok(());
        }
        let vm = self.probe.virtual_memory()?;
        debug!(
            percent = vm.percent,
            used = %format_bytes(vm.used),
            total = %format_bytes(vm.total),
            "virtual memory check"
        );
        match vmem_breach(&self.cfg, &vm) {
            Some(exceeded) => Err(exceeded.into()),
            None => Ok(()),
        }
    }

    /// Runs `load` and verifies that the disk still has
    /// `ceil(grown_bytes * disk_headroom_factor)` free afterwards.
    pub fn check_disk_space<T>(&self, load: impl FnOnce() -> Result<T>) -> Result<T> {
        if !self.cfg.enabled {
            return load();
        }
        let path = Path::new(&self.cfg.disk_usage_path);
        let before = self.probe.disk_usage(path)?;
        let value = load()?;
        let after = self.probe.disk_usage(path)?;

        let delta = after.used.saturating_sub(before.used);
        let needed = required_headroom(delta, self.cfg.disk_headroom_factor);
        info!(
            path = %path.display(),
            loaded = %format_bytes(delta),
            needed = %format_bytes(needed),
            free = %format_bytes(after.free),
            "disk headroom check"
        );
        if after.free < needed {
            return Err(ResourceExceeded::NotEnoughDiskSpace {
                path: path.to_path_buf(),
                bytes_needed: needed,
                bytes_free: after.free,
                bytes_total: after.total,
            }
            .into());
        }
        Ok(value)
    }

    /// Runs `work` under live monitoring. Disabled monitoring runs it inline.
    pub fn run_governed<W: GovernedWork>(&self, work: &W) -> Result<W::Output> {
        if !self.cfg.enabled {
            return work.run_inline();
        }

        let (process, rx) = IsolatedProcess::spawn(work.isolated_command()?)?;
        let process = Arc::new(process);
        let breach: Arc<Mutex<Option<ResourceExceeded>>> = Arc::new(Mutex::new(None));

        let mut sampler = ResourceSampler::new(
            Arc::clone(&self.probe),
            Duration::from_secs_f64(self.cfg.poll_interval_seconds),
            &self.cfg.disk_usage_path,
            self.filter.clone(),
        );
        let callback = {
            let cfg = self.cfg.clone();
            let process = Arc::clone(&process);
            let breach = Arc::clone(&breach);
            move |sample: &ResourceSample| -> Result<()> {
                log_sample(sample);
                if let Some(exceeded) = vmem_breach(&cfg, &sample.virtual_memory) {
                    error!(pid = process.pid(), "{exceeded}; terminating isolated worker");
                    *breach.lock().unwrap_or_else(|p| p.into_inner()) = Some(exceeded.clone());
                    process.terminate();
                    return Err(exceeded.into());
                }
                Ok(())
            }
        };
        if let Err(err) = sampler.start(callback) {
            process.terminate();
            return Err(err);
        }

        let status = loop {
            match process.try_wait() {
                Ok(Some(status)) => break Ok(status),
                Ok(None) => {}
                Err(err) => break Err(err),
            }
            // A dead sampler means nobody is watching any more.
            if !sampler.is_running() && process.terminate() {
                warn!(pid = process.pid(), "resource sampler stopped; terminating isolated worker");
            }
            std::thread::sleep(WAIT_TICK);
        };
        let sampler_outcome = sampler.stop();
        if process.was_terminated() {
            work.on_terminated();
        }

        let stashed = breach.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(exceeded) = stashed {
            self.report_breach(&exceeded);
            return Err(exceeded.into());
        }
        let status = status?;
        sampler_outcome?;
        if process.was_terminated() {
            return Err(Error::Isolation(format!("worker {} was terminated", process.pid())));
        }
        receive_reply(&rx, status)
    }

    fn report_breach(&self, exceeded: &ResourceExceeded) {
        let job_id = self.hooks.job_id.as_str();
        error!(job_id, "governed run aborted: {exceeded}");
        if let Some(reporter) = &self.hooks.reporter {
            let info = StatusInfo::from([("reason".to_string(), exceeded.to_string())]);
            update_quietly(reporter.as_ref(), JobStatus::Fail, job_id, &info);
        }
        if let Some(notifier) = &self.hooks.notifier {
            notify_quietly(
                notifier.as_ref(),
                &format!("resources exhausted for {job_id}"),
                &exceeded.to_string(),
            );
        }
    }
}

pub fn required_headroom(delta: u64, factor: f64) -> u64 {
    (delta as f64 * factor).ceil() as u64
}

fn vmem_breach(cfg: &SupervisorConfig, vm: &MemoryUsage) -> Option<ResourceExceeded> {
    let over_percent = cfg.max_vmem_percent.is_some_and(|max| vm.percent > max);
    let over_bytes = cfg.max_vmem_bytes.is_some_and(|max| vm.used > max);
    (over_percent || over_bytes).then(|| ResourceExceeded::VirtualMemoryExceeded {
        used: vm.used,
        free: vm.free,
        total: vm.total,
        percent: vm.percent,
    })
}

fn log_sample(sample: &ResourceSample) {
    let tracked_rss: u64 = sample.processes.iter().map(|p| p.memory).sum();
    debug!(
        vmem_percent = sample.virtual_memory.percent,
        swap_percent = sample.swap_memory.percent,
        disk_free = %format_bytes(sample.disk_usage.free),
        processes = sample.processes.len(),
        tracked_rss = %format_bytes(tracked_rss),
        "resource sample"
    );
}
