use super::sample::{ProcessFilter, ResourceProbe, ResourceSample};
use crate::error::{Error, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Wake-up quantum of the sampling loop. Keeps `stop()` responsive while
/// full samples are only taken every poll interval.
const TICK: Duration = Duration::from_millis(1);

pub struct ResourceSampler {
    probe: Arc<dyn ResourceProbe>,
    interval: Duration,
    disk_path: PathBuf,
    filter: ProcessFilter,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<Result<()>>>,
}

impl ResourceSampler {
    pub fn new(
        probe: Arc<dyn ResourceProbe>,
        interval: Duration,
        disk_path: impl Into<PathBuf>,
        filter: ProcessFilter,
    ) -> Self {
        Self {
            probe,
            interval,
            disk_path: disk_path.into(),
            filter,
            running: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Spawns the sampling thread. Returns `false` if it is already running.
    ///
    /// An error returned by the callback (or by the probe) ends the thread;
    /// it is handed back by the next [`stop`](Self::stop).
    pub fn start<F>(&mut self, mut callback: F) -> Result<bool>
    where
        F: FnMut(&ResourceSample) -> Result<()> + Send + 'static,
    {
        if self.handle.is_some() {
            return Ok(false);
        }
        self.running.store(true, Ordering::SeqCst);

        let running = Arc::clone(&self.running);
        let probe = Arc::clone(&self.probe);
        let interval = self.interval;
        let disk_path = self.disk_path.clone();
        let filter = self.filter.clone();

        let handle = std::thread::Builder::new()
            .name("resource-sampler".into())
            .spawn(move || -> Result<()> {
                let outcome = (|| -> Result<()> {
                    let mut last: Option<Instant> = None;
                    while running.load(Ordering::SeqCst) {
                        std::thread::sleep(TICK);
                        if last.is_some_and(|t| t.elapsed() < interval) {
                            continue;
                        }
                        let sample = probe.snapshot(&disk_path, &filter)?;
                        callback(&sample)?;
                        last = Some(Instant::now());
                    }
                    Ok(())
                })();
                running.store(false, Ordering::SeqCst);
                outcome
            })
            .map_err(|e| Error::io("spawning resource sampler", e))?;

        debug!(interval_ms = self.interval.as_millis() as u64, "resource sampler started");
        self.handle = Some(handle);
        Ok(true)
    }

    /// Signals the thread and joins it. Returns `Ok(false)` when nothing was running,
    /// or the error that ended the loop.
    pub fn stop(&mut self) -> Result<bool> {
        let Some(handle) = self.handle.take() else {
            return Ok(false);
        };
        self.running.store(false, Ordering::SeqCst);
        match handle.join() {
            Ok(outcome) => {
                debug!("resource sampler stopped");
                outcome.map(|()| true)
            }
            Err(_) => {
                warn!("resource sampler thread panicked");
                Err(Error::Isolation("resource sampler thread panicked".into()))
            }
        }
    }
}

impl Drop for ResourceSampler {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            debug!("resource sampler ended with error on drop: {err}");
        }
    }
}
