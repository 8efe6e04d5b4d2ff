use folio_ocr::config::SupervisorConfig;
use folio_ocr::error::{Error, ResourceExceeded, Result};
use folio_ocr::resources::{
    DiskUsage, MemoryUsage, ProcessFilter, ProcessInfo, ResourceProbe, ResourceSampler, ResourceSupervisor,
    required_headroom,
};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const TOTAL: u64 = 10_000;

/// Serves scripted free-disk figures, one per call, and a fixed memory picture.
struct ScriptedProbe {
    disk_free: Mutex<VecDeque<u64>>,
    memory: MemoryUsage,
    disk_calls: AtomicUsize,
}

impl ScriptedProbe {
    fn new(disk_free: &[u64], memory: MemoryUsage) -> Arc<Self> {
        Arc::new(Self {
            disk_free: Mutex::new(disk_free.iter().copied().collect()),
            memory,
            disk_calls: AtomicUsize::new(0),
        })
    }
}

impl ResourceProbe for ScriptedProbe {
    fn virtual_memory(&self) -> Result<MemoryUsage> {
        Ok(self.memory.clone())
    }

    fn swap_memory(&self) -> Result<MemoryUsage> {
        Ok(MemoryUsage::new(0, 0, 0))
    }

    fn disk_usage(&self, path: &Path) -> Result<DiskUsage> {
        self.disk_calls.fetch_add(1, Ordering::SeqCst);
        let free = self.disk_free.lock().unwrap().pop_front().unwrap_or(TOTAL);
        Ok(DiskUsage::new(path, TOTAL, free))
    }

    fn processes(&self, _filter: &ProcessFilter) -> Result<Vec<ProcessInfo>> {
        Ok(Vec::new())
    }
}

fn idle_memory() -> MemoryUsage {
    MemoryUsage::new(1000, 100, 900)
}

fn config(factor: f64) -> SupervisorConfig {
    SupervisorConfig {
        disk_headroom_factor: factor,
        poll_interval_seconds: 0.01,
        ..SupervisorConfig::default()
    }
}

#[test]
fn headroom_is_rounded_up() {
    assert_eq!(required_headroom(100, 3.0), 300);
    assert_eq!(required_headroom(10, 0.25), 3);
    assert_eq!(required_headroom(0, 3.0), 0);
}

#[test]
fn disk_check_passes_at_exact_headroom() {
    // 100 bytes loaded, factor 3: exactly 300 free afterwards is enough.
    let probe = ScriptedProbe::new(&[400, 300], idle_memory());
    let supervisor = ResourceSupervisor::new(config(3.0), probe).unwrap();
    assert_eq!(supervisor.check_disk_space(|| Ok("loaded")).unwrap(), "loaded");
}

#[test]
fn disk_check_fails_one_byte_short() {
    let probe = ScriptedProbe::new(&[399, 299], idle_memory());
    let supervisor = ResourceSupervisor::new(config(3.0), probe).unwrap();
    let err = supervisor.check_disk_space(|| Ok(())).unwrap_err();
    match err {
        Error::ResourceExceeded(ResourceExceeded::NotEnoughDiskSpace {
            bytes_needed,
            bytes_free,
            bytes_total,
            ..
        }) => {
            assert_eq!(bytes_needed, 300);
            assert_eq!(bytes_free, 299);
            assert_eq!(bytes_total, TOTAL);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn failing_load_skips_the_second_measurement() {
    let probe = ScriptedProbe::new(&[5000, 5000], idle_memory());
    let supervisor = ResourceSupervisor::new(config(3.0), Arc::clone(&probe) as Arc<dyn ResourceProbe>).unwrap();
    let err = supervisor
        .check_disk_space(|| -> Result<()> { Err(Error::config("load failed")) })
        .unwrap_err();
    assert!(matches!(err, Error::Configuration(_)));
    assert_eq!(probe.disk_calls.load(Ordering::SeqCst), 1);
}

#[test]
fn disabled_supervision_skips_checks() {
    let probe = ScriptedProbe::new(&[0, 0], MemoryUsage::new(1000, 999, 1));
    let cfg = SupervisorConfig {
        enabled: false,
        ..config(3.0)
    };
    let supervisor = ResourceSupervisor::new(cfg, Arc::clone(&probe) as Arc<dyn ResourceProbe>).unwrap();
    supervisor.check_virtual_memory().unwrap();
    supervisor.check_disk_space(|| Ok(())).unwrap();
    assert_eq!(probe.disk_calls.load(Ordering::SeqCst), 0);
}

#[test]
fn memory_check_uses_percent_and_byte_limits() {
    let busy = MemoryUsage::new(1000, 950, 50);
    let supervisor = ResourceSupervisor::new(config(3.0), ScriptedProbe::new(&[], busy.clone())).unwrap();
    let err = supervisor.check_virtual_memory().unwrap_err();
    assert!(matches!(
        err.resource_exceeded(),
        Some(ResourceExceeded::VirtualMemoryExceeded { used: 950, .. })
    ));

    let byte_cap = SupervisorConfig {
        max_vmem_percent: None,
        max_vmem_bytes: Some(500),
        ..config(3.0)
    };
    let supervisor = ResourceSupervisor::new(byte_cap, ScriptedProbe::new(&[], busy)).unwrap();
    assert!(supervisor.check_virtual_memory().is_err());

    let supervisor = ResourceSupervisor::new(config(3.0), ScriptedProbe::new(&[], idle_memory())).unwrap();
    assert!(supervisor.check_virtual_memory().is_ok());
}

#[test]
fn invalid_settings_are_rejected() {
    let probe = || -> Arc<dyn ResourceProbe> { ScriptedProbe::new(&[], idle_memory()) };
    let zero_poll = SupervisorConfig {
        poll_interval_seconds: 0.0,
        ..config(3.0)
    };
    assert!(ResourceSupervisor::new(zero_poll, probe()).is_err());
    assert!(ResourceSupervisor::new(config(-1.0), probe()).is_err());
    let bad_pattern = SupervisorConfig {
        process_patterns: vec!["(".into()],
        ..config(3.0)
    };
    assert!(ResourceSupervisor::new(bad_pattern, probe()).is_err());
}

#[test]
fn resource_errors_render_readable_sizes() {
    let err = ResourceExceeded::NotEnoughDiskSpace {
        path: "/data".into(),
        bytes_needed: 3 * 1024 * 1024 * 1024,
        bytes_free: 1536,
        bytes_total: 4 * 1024 * 1024 * 1024,
    };
    let text = err.to_string();
    assert!(text.contains("3.0 GiB"), "{text}");
    assert!(text.contains("1.5 KiB"), "{text}");
}

#[test]
fn sampler_start_and_stop_are_idempotent() {
    let probe: Arc<dyn ResourceProbe> = ScriptedProbe::new(&[], idle_memory());
    let mut sampler = ResourceSampler::new(probe, Duration::from_millis(5), "/", ProcessFilter::default());
    let seen = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&seen);
    assert!(sampler.start(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    })
    .unwrap());
    assert!(!sampler.start(|_| Ok(())).unwrap());

    while seen.load(Ordering::SeqCst) < 2 {
        std::thread::sleep(Duration::from_millis(1));
    }
    assert!(sampler.is_running());
    assert!(sampler.stop().unwrap());
    assert!(!sampler.is_running());
    assert!(!sampler.stop().unwrap());
}

#[test]
fn sampler_hands_back_callback_errors() {
    let probe: Arc<dyn ResourceProbe> = ScriptedProbe::new(&[], idle_memory());
    let mut sampler = ResourceSampler::new(probe, Duration::from_millis(5), "/", ProcessFilter::default());
    sampler
        .start(|sample| {
            assert_eq!(sample.disk_usage.total, TOTAL);
            Err(Error::config("stop sampling"))
        })
        .unwrap();
    while sampler.is_running() {
        std::thread::sleep(Duration::from_millis(1));
    }
    assert!(matches!(sampler.stop(), Err(Error::Configuration(_))));
}

#[test]
fn process_filter_combines_pid_and_pattern() {
    let patterns = vec!["tesseract".to_string()];
    let filter = ProcessFilter::new(None, &patterns).unwrap();
    assert!(filter.matches(1, "/usr/bin/tesseract page.tif out"));
    assert!(!filter.matches(1, "/usr/bin/convert"));

    let filter = filter.with_pid(42);
    assert!(filter.matches(42, "tesseract"));
    assert!(!filter.matches(7, "tesseract"));
    assert!(ProcessFilter::default().matches(7, "anything"));
}
