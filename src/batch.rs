//! One batch end to end: pre-flight checks, input staging, the governed
//! workflow run and the written report.

use crate::config::{Config, StepSpec};
use crate::engine::container::kill_containers_command;
use crate::engine::{ContainerInvocation, run_tool};
use crate::error::{Error, Result};
use crate::hooks::{JobStatus, Notifier, StatusInfo, StatusReporter, notify_quietly, update_quietly};
use crate::job::{JobManifest, PipelineJob};
use crate::report::BatchOutcome;
use crate::resources::{BreachHooks, GovernedWork, ResourceProbe, ResourceSupervisor};
use crate::util::{ensure_dir, now_rfc3339, sha256_hex};
use crate::workflow::WorkflowRunner;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

pub const EFFECTIVE_CONFIG: &str = "effective-config.toml";
pub const STAGED_MANIFEST: &str = "manifest.json";
pub const REPORT_FILE: &str = "report.json";
pub const INDEX_FILE: &str = "index.json";

const CONTAINER_KILL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchReport {
    pub job_id: String,
    pub job_name: String,
    pub workers: usize,
    pub mode: String,
    pub started: String,
    pub finished: String,
    pub job_dir: PathBuf,
    pub outcome: BatchOutcome,
}

pub struct BatchExecution {
    cfg: Config,
    probe: Arc<dyn ResourceProbe>,
    reporter: Arc<dyn StatusReporter>,
    notifier: Arc<dyn Notifier>,
}

impl BatchExecution {
    pub fn new(
        cfg: Config,
        probe: Arc<dyn ResourceProbe>,
        reporter: Arc<dyn StatusReporter>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            cfg,
            probe,
            reporter,
            notifier,
        }
    }

    /// Batch id from the manifest, else a digest of config and manifest.
    pub fn job_id_for(&self, manifest: &JobManifest) -> Result<String> {
        if let Some(id) = manifest.job_id.as_deref().filter(|id| !id.trim().is_empty()) {
            if id.contains(['/', '\\']) || id.chars().all(|c| c == '.') {
                return Err(Error::config(format!("job id {id:?} is not a plain directory name")));
            }
            return Ok(id.to_string());
        }
        let cfg_hash = sha256_hex(self.cfg.normalized_for_hash().as_bytes());
        let jobs = serde_json::to_string(&manifest.jobs)
            .map_err(|e| Error::config(format!("serializing manifest: {e}")))?;
        let manifest_hash = sha256_hex(jobs.as_bytes());
        Ok(sha256_hex(format!("{cfg_hash}:{manifest_hash}").as_bytes()))
    }

    pub fn run(&self, manifest: &JobManifest) -> Result<BatchReport> {
        let job_id = self.job_id_for(manifest)?;
        let started = now_rfc3339();
        let supervisor = ResourceSupervisor::new(self.cfg.resources.clone(), Arc::clone(&self.probe))?
            .with_hooks(BreachHooks {
                job_id: job_id.clone(),
                reporter: Some(Arc::clone(&self.reporter)),
                notifier: Some(Arc::clone(&self.notifier)),
            });

        let prepared = match self.prepare(&supervisor, &job_id, manifest) {
            Ok(prepared) => prepared,
            Err(err) => {
                self.report_failure(&job_id, &err);
                return Err(err);
            }
        };

        update_quietly(
            self.reporter.as_ref(),
            JobStatus::Busy,
            &job_id,
            &StatusInfo::from([("pages".to_string(), prepared.jobs.len().to_string())]),
        );

        let work = BatchWork {
            runner: &prepared.runner,
            cfg: &self.cfg,
            jobs: &prepared.jobs,
            worker_exe: &self.cfg.resources.worker_exe,
            config_path: prepared.work_root.join(EFFECTIVE_CONFIG),
            manifest_path: prepared.work_root.join(STAGED_MANIFEST),
        };
        let outcome = match supervisor.run_governed(&work) {
            Ok(outcome) => outcome,
            Err(err) => {
                // Breaches were already reported by the supervisor.
                if err.resource_exceeded().is_none() {
                    self.report_failure(&job_id, &err);
                }
                return Err(err);
            }
        };

        let report = BatchReport {
            job_name: self.cfg.global.job_name.clone(),
            workers: self.cfg.global.workers,
            mode: prepared.runner.mode().to_string(),
            started,
            finished: now_rfc3339(),
            job_dir: prepared.job_dir.clone(),
            job_id,
            outcome,
        };
        write_report(&report)?;

        let info = StatusInfo::from([
            ("succeeded".to_string(), report.outcome.summary.succeeded.to_string()),
            ("failed".to_string(), report.outcome.summary.failed.to_string()),
        ]);
        update_quietly(self.reporter.as_ref(), JobStatus::Done, &report.job_id, &info);
        info!(
            job_id = %report.job_id,
            succeeded = report.outcome.summary.succeeded,
            failed = report.outcome.summary.failed,
            "batch report written to {}",
            report.job_dir.display()
        );
        Ok(report)
    }

    fn prepare(&self, supervisor: &ResourceSupervisor, job_id: &str, manifest: &JobManifest) -> Result<Prepared> {
        manifest.validate()?;
        if manifest.jobs.is_empty() {
            return Err(Error::config("manifest contains no jobs"));
        }
        let work_root = Path::new(&self.cfg.paths.work_dir).join(job_id);
        let job_dir = Path::new(&self.cfg.paths.out_dir).join(job_id);

        // The worker reloads this config, so it points straight at the batch's work root.
        let mut effective = self.cfg.clone();
        effective.paths.work_dir = work_root.to_string_lossy().into_owned();
        let runner = WorkflowRunner::from_config(&effective)?;

        supervisor.check_virtual_memory()?;
        let jobs = supervisor.check_disk_space(|| stage_inputs(&manifest.jobs, &work_root))?;

        let raw = toml::to_string(&effective)
            .map_err(|e| Error::config(format!("serializing effective config: {e}")))?;
        write_file(&work_root.join(EFFECTIVE_CONFIG), &raw)?;
        JobManifest {
            job_id: Some(job_id.to_string()),
            jobs: jobs.clone(),
        }
        .save(&work_root.join(STAGED_MANIFEST))?;

        ensure_dir(&job_dir)?;
        if self.cfg.global.dump_effective_config {
            write_file(&job_dir.join(EFFECTIVE_CONFIG), &raw)?;
        }
        info!(job_id, jobs = jobs.len(), work_root = %work_root.display(), "batch prepared");
        Ok(Prepared {
            runner,
            jobs,
            work_root,
            job_dir,
        })
    }

    fn report_failure(&self, job_id: &str, err: &Error) {
        let info = StatusInfo::from([("reason".to_string(), err.to_string())]);
        update_quietly(self.reporter.as_ref(), JobStatus::Fail, job_id, &info);
        notify_quietly(
            self.notifier.as_ref(),
            &format!("batch {job_id} failed"),
            &err.to_string(),
        );
    }
}

struct Prepared {
    runner: WorkflowRunner,
    jobs: Vec<PipelineJob>,
    work_root: PathBuf,
    job_dir: PathBuf,
}

struct BatchWork<'a> {
    runner: &'a WorkflowRunner,
    cfg: &'a Config,
    jobs: &'a [PipelineJob],
    worker_exe: &'a str,
    config_path: PathBuf,
    manifest_path: PathBuf,
}

impl GovernedWork for BatchWork<'_> {
    type Output = BatchOutcome;

    fn run_inline(&self) -> Result<BatchOutcome> {
        self.runner.run(self.jobs)
    }

    fn isolated_command(&self) -> Result<Command> {
        let exe = if self.worker_exe.trim().is_empty() {
            std::env::current_exe().map_err(|e| Error::io("locating worker executable", e))?
        } else {
            PathBuf::from(self.worker_exe)
        };
        let mut cmd = Command::new(exe);
        cmd.arg("--config")
            .arg(&self.config_path)
            .arg("worker")
            .arg("--manifest")
            .arg(&self.manifest_path);
        Ok(cmd)
    }

    fn on_terminated(&self) {
        let names: Vec<String> = self
            .jobs
            .iter()
            .map(|job| ContainerInvocation::container_name(&job.page_identifier))
            .collect();
        for runtime in container_runtimes(self.cfg) {
            info!(runtime, containers = names.len(), "stopping page containers of the killed worker");
            // Pages that were not running have no container; the runtime reports them and moves on.
            if let Err(err) = run_tool(
                "ocrd-container",
                kill_containers_command(runtime, &names),
                Some(CONTAINER_KILL_TIMEOUT),
            ) {
                debug!(runtime, "container kill after termination: {err}");
            }
        }
    }
}

fn container_runtimes(cfg: &Config) -> BTreeSet<&str> {
    cfg.pipeline
        .steps
        .values()
        .filter_map(|spec| match spec {
            StepSpec::OcrdContainer(step) => Some(step.runtime.as_str()),
            _ => None,
        })
        .collect()
}

/// Copies every source image into its job's working directory and returns
/// the jobs rewritten to read the copies.
pub fn stage_inputs(jobs: &[PipelineJob], work_root: &Path) -> Result<Vec<PipelineJob>> {
    jobs.iter()
        .map(|job| {
            let dir = job.work_dir(work_root);
            ensure_dir(&dir)?;
            let name = job.source_image_path.file_name().ok_or_else(|| {
                Error::config(format!(
                    "source image has no file name: {}",
                    job.source_image_path.display()
                ))
            })?;
            let target = dir.join(name);
            std::fs::copy(&job.source_image_path, &target).map_err(|e| {
                Error::io(format!("staging {}", job.source_image_path.display()), e)
            })?;
            Ok(PipelineJob {
                source_image_path: target,
                ..job.clone()
            })
        })
        .collect()
}

fn write_report(report: &BatchReport) -> Result<()> {
    ensure_dir(&report.job_dir)?;
    let raw = serde_json::to_string_pretty(report)
        .map_err(|e| Error::config(format!("serializing report: {e}")))?;
    write_file(&report.job_dir.join(REPORT_FILE), &raw)?;

    let outputs: Vec<&Path> = report
        .outcome
        .results
        .iter()
        .filter_map(|r| r.stored_output_path.as_deref())
        .collect();
    let index = serde_json::json!({
        "job_id": report.job_id,
        "started": report.started,
        "finished": report.finished,
        "report": REPORT_FILE,
        "submitted": report.outcome.submitted,
        "succeeded": report.outcome.summary.succeeded,
        "failed": report.outcome.summary.failed,
        "outputs": outputs,
    });
    let raw = serde_json::to_string_pretty(&index)
        .map_err(|e| Error::config(format!("serializing index: {e}")))?;
    write_file(&report.job_dir.join(INDEX_FILE), &raw)
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    std::fs::write(path, contents).map_err(|e| Error::io(format!("writing {}", path.display()), e))
}
