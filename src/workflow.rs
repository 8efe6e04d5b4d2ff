use crate::config::Config;
use crate::error::{Error, ExecutionMode, Result};
use crate::job::PipelineJob;
use crate::pipeline::{StepChain, StepState, StepStatistics};
use crate::probe::probe_image;
use crate::report::{BatchOutcome, BatchSummary, FailedJob, JobResult};
use crate::util::ensure_dir;
use rayon::prelude::*;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Fans page-jobs out over the step chain.
pub struct WorkflowRunner {
    chain: Arc<StepChain>,
    workers: usize,
    work_root: PathBuf,
}

type JobOutcome = std::result::Result<JobResult, FailedJob>;

impl WorkflowRunner {
    pub fn new(chain: StepChain, workers: usize, work_root: impl Into<PathBuf>) -> Self {
        Self {
            chain: Arc::new(chain),
            workers: workers.max(1),
            work_root: work_root.into(),
        }
    }

    pub fn from_config(cfg: &Config) -> Result<Self> {
        let chain = StepChain::from_config(&cfg.pipeline)?;
        Ok(Self::new(chain, cfg.global.workers, &cfg.paths.work_dir))
    }

    pub fn mode(&self) -> ExecutionMode {
        ExecutionMode::for_workers(self.workers)
    }

    /// Runs every job. Page-level failures are recorded in the outcome;
    /// anything else aborts the batch.
    pub fn run(&self, jobs: &[PipelineJob]) -> Result<BatchOutcome> {
        let mode = self.mode();
        let started = Instant::now();
        info!(jobs = jobs.len(), workers = self.workers, %mode, "batch start");

        let outcomes = match mode {
            ExecutionMode::Parallel => self.run_parallel(jobs),
            ExecutionMode::Sequential => jobs.iter().map(|job| self.run_job(job)).collect(),
        }
        .map_err(|e| Error::Batch {
            mode,
            source: Box::new(e),
        })?;

        let mut results = Vec::with_capacity(outcomes.len());
        let mut failures = Vec::new();
        for outcome in outcomes {
            match outcome {
                Ok(result) => results.push(result),
                Err(failed) => failures.push(failed),
            }
        }
        if results.len() + failures.len() != jobs.len() {
            return Err(Error::Batch {
                mode,
                source: Box::new(Error::Isolation(format!(
                    "{} jobs submitted but {} accounted for",
                    jobs.len(),
                    results.len() + failures.len()
                ))),
            });
        }

        let summary = BatchSummary::from_results(&results, failures.len());
        info!(
            succeeded = summary.succeeded,
            failed = summary.failed,
            total_size_mb = summary.total_size_mb,
            histogram = ?summary.megapixel_histogram,
            elapsed_s = started.elapsed().as_secs(),
            "batch done"
        );
        Ok(BatchOutcome {
            submitted: jobs.len(),
            results,
            failures,
            summary,
        })
    }

    fn run_parallel(&self, jobs: &[PipelineJob]) -> Result<Vec<JobOutcome>> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .thread_name(|i| format!("ocr-worker-{i}"))
            .build()
            .map_err(|e| Error::io("building worker pool", std::io::Error::other(e)))?;
        // Indexed collect keeps submission order whatever order jobs finish in.
        pool.install(|| jobs.par_iter().map(|job| self.run_job(job)).collect())
    }

    fn run_job(&self, job: &PipelineJob) -> Result<JobOutcome> {
        match self.process(job) {
            Ok(result) => Ok(Ok(result)),
            Err(err) if err.is_job_recoverable() => {
                warn!(
                    page = %job.page_identifier,
                    seq = job.sequence_index,
                    "page failed: {err}"
                );
                Ok(Err(FailedJob {
                    page_identifier: job.page_identifier.clone(),
                    sequence_index: job.sequence_index,
                    reason: err.to_string(),
                }))
            }
            Err(err) => Err(err),
        }
    }

    fn process(&self, job: &PipelineJob) -> Result<JobResult> {
        let image = probe_image(&job.source_image_path)?;
        let work_dir = job.work_dir(&self.work_root);
        ensure_dir(&work_dir)?;
        info!(
            page = %job.page_identifier,
            "[{}/{}] {}",
            job.sequence_index,
            job.total_count,
            job.source_image_path.display()
        );

        let state = StepState::new(&job.page_identifier, work_dir, &job.source_image_path);
        let run = self.chain.run(state)?;

        let stored_output_path = run.final_path.is_file().then_some(run.final_path);
        let quality = run.statistics.values().find_map(|s| match s {
            StepStatistics::Quality(q) => Some(q.clone()),
            _ => None,
        });
        Ok(JobResult {
            page_identifier: job.page_identifier.clone(),
            sequence_index: job.sequence_index,
            pages_produced: u32::from(stored_output_path.is_some()),
            stored_output_path,
            megapixels: image.megapixels(),
            file_size_mb: image.file_size_mb(),
            quality,
            step_statistics: run.statistics,
            step_timings_ms: run.timings_ms,
        })
    }
}
