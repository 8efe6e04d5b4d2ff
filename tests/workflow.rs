#![cfg(unix)]

mod common;

use folio_ocr::batch::{BatchExecution, INDEX_FILE, REPORT_FILE};
use folio_ocr::config::Config;
use folio_ocr::error::{Error, Result};
use folio_ocr::hooks::{HookError, JobStatus, LogNotifier, StatusInfo, StatusReporter};
use folio_ocr::job::{JobManifest, PipelineJob};
use folio_ocr::report::BatchOutcome;
use folio_ocr::resources::{DiskUsage, MemoryUsage, ProcessFilter, ProcessInfo, ResourceProbe};
use folio_ocr::workflow::WorkflowRunner;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

const FAKE_TESSERACT: &str = r#"#!/bin/sh
case "$1" in
  *page_003*) echo "cannot read image" >&2; exit 1 ;;
esac
printf '<alto><TextLine><String CONTENT="Seite"/></TextLine></alto>' > "$2.xml"
"#;

/// Page images of varying size plus a fake recognizer.
struct Fixture {
    dir: tempfile::TempDir,
    tesseract: PathBuf,
}

impl Fixture {
    fn new(pages: u32) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let images = dir.path().join("images");
        std::fs::create_dir_all(&images).unwrap();
        for i in 1..=pages {
            let img = image::RgbImage::new(800 + 100 * i, 1000);
            img.save(images.join(format!("page_{i:03}.png"))).unwrap();
        }
        let tesseract = common::install_script(dir.path(), "fake-tesseract", FAKE_TESSERACT);
        Self { dir, tesseract }
    }

    fn path(&self) -> &Path {
        self.dir.path()
    }

    fn config(&self, workers: usize) -> Config {
        let raw = format!(
            r#"
[global]
workers = {workers}

[paths]
out_dir = "{out}"
work_dir = "{work}"

[logging]
write_to_file = false

[pipeline.step_01]
type = "tesseract"
binary = "{bin}"
timeout_seconds = 30
"#,
            out = self.path().join("out").display(),
            work = self.path().join(format!("work-{workers}")).display(),
            bin = self.tesseract.display(),
        );
        Config::parse(&raw).unwrap()
    }

    fn manifest(&self) -> JobManifest {
        JobManifest::from_image_dir(&self.path().join("images")).unwrap()
    }
}

fn page_ids<'a>(ids: impl Iterator<Item = &'a String>) -> Vec<&'a str> {
    ids.map(String::as_str).collect()
}

fn assert_failed_third_page(outcome: &BatchOutcome) {
    assert_eq!(outcome.submitted, 5);
    assert_eq!(
        page_ids(outcome.results.iter().map(|r| &r.page_identifier)),
        ["page_001", "page_002", "page_004", "page_005"]
    );
    assert_eq!(outcome.failures.len(), 1);
    assert_eq!(outcome.failures[0].page_identifier, "page_003");
    assert_eq!(outcome.failures[0].sequence_index, 3);
    assert!(outcome.failures[0].reason.contains("cannot read image"));
    assert!(!outcome.is_complete());
}

#[test]
fn manifest_from_image_dir_is_ordered() {
    let fx = Fixture::new(3);
    std::fs::write(fx.path().join("images").join("notes.txt"), "skip me").unwrap();
    let manifest = fx.manifest();
    assert_eq!(
        page_ids(manifest.jobs.iter().map(|j| &j.page_identifier)),
        ["page_001", "page_002", "page_003"]
    );
    assert!(manifest.jobs.iter().all(|j| j.total_count == 3));
    assert_eq!(manifest.jobs[2].sequence_index, 3);
}

#[test]
fn duplicate_page_identifiers_are_rejected() {
    let job = PipelineJob {
        source_image_path: "a.png".into(),
        page_identifier: "p 1".into(),
        sequence_index: 1,
        total_count: 2,
    };
    let twin = PipelineJob {
        page_identifier: "p_1".into(),
        sequence_index: 2,
        ..job.clone()
    };
    let manifest = JobManifest {
        job_id: None,
        jobs: vec![job, twin],
    };
    assert!(matches!(manifest.validate(), Err(Error::Configuration(_))));
}

#[test]
fn identifiers_must_name_a_directory_below_the_work_root() {
    for id in ["", ".", "..", "..."] {
        let manifest = JobManifest {
            job_id: None,
            jobs: vec![PipelineJob {
                source_image_path: "a.png".into(),
                page_identifier: id.into(),
                sequence_index: 1,
                total_count: 1,
            }],
        };
        let err = manifest.validate().unwrap_err();
        assert!(matches!(err, Error::Configuration(_)), "{id:?}: {err}");
    }

    // Separators are replaced, so these stay inside the work root.
    let manifest = JobManifest {
        job_id: None,
        jobs: vec![PipelineJob {
            source_image_path: "a.png".into(),
            page_identifier: "../p1".into(),
            sequence_index: 1,
            total_count: 1,
        }],
    };
    manifest.validate().unwrap();
    let root = Path::new("/work");
    assert_eq!(manifest.jobs[0].work_dir(root), root.join(".._p1"));

    let fx = Fixture::new(1);
    let mut escaping = fx.manifest();
    escaping.job_id = Some("../elsewhere".into());
    let execution = BatchExecution::new(
        fx.config(1),
        Arc::new(RoomyProbe),
        Arc::new(StatusLog::default()),
        Arc::new(LogNotifier),
    );
    assert!(matches!(execution.job_id_for(&escaping), Err(Error::Configuration(_))));
}

#[test]
fn failed_page_does_not_stop_the_batch() {
    let fx = Fixture::new(5);
    let manifest = fx.manifest();

    let parallel = WorkflowRunner::from_config(&fx.config(3)).unwrap();
    let outcome = parallel.run(&manifest.jobs).unwrap();
    assert_failed_third_page(&outcome);

    let first = &outcome.results[0];
    let output = first.stored_output_path.as_ref().expect("stored output");
    assert!(output.ends_with("page_001/page_001.xml"), "{}", output.display());
    assert_eq!(first.pages_produced, 1);
    assert_eq!(first.megapixels, 0.9);
    assert!(first.file_size_mb > 0.0);
    assert!(first.step_timings_ms.contains_key("step_01"));
}

#[test]
fn sequential_and_parallel_runs_agree() {
    let fx = Fixture::new(5);
    let manifest = fx.manifest();

    let sequential = WorkflowRunner::from_config(&fx.config(1)).unwrap();
    let parallel = WorkflowRunner::from_config(&fx.config(3)).unwrap();
    let one = sequential.run(&manifest.jobs).unwrap();
    let many = parallel.run(&manifest.jobs).unwrap();

    assert_failed_third_page(&one);
    assert_failed_third_page(&many);
    assert_eq!(one.summary, many.summary);
    assert_eq!(one.summary.succeeded, 4);
    assert_eq!(one.summary.failed, 1);
    assert_eq!(one.summary.pages_produced, 4);
    // 0.9, 1.0, 1.2 and 1.3 megapixels.
    assert_eq!(one.summary.megapixel_histogram.get(&0), Some(&1));
    assert_eq!(one.summary.megapixel_histogram.get(&1), Some(&3));
}

#[test]
fn missing_recognizer_aborts_the_batch() {
    let fx = Fixture::new(2);
    let mut cfg = fx.config(2);
    let raw = format!(
        "[pipeline.step_01]\ntype = \"tesseract\"\nbinary = \"{}\"\n",
        fx.path().join("no-such-binary").display()
    );
    cfg.pipeline = Config::parse(&raw).unwrap().pipeline;

    let err = WorkflowRunner::from_config(&cfg)
        .unwrap()
        .run(&fx.manifest().jobs)
        .unwrap_err();
    assert!(matches!(err, Error::Batch { .. }), "{err}");
    assert!(err.to_string().starts_with("parallel batch failed"), "{err}");
}

struct RoomyProbe;

impl ResourceProbe for RoomyProbe {
    fn virtual_memory(&self) -> Result<MemoryUsage> {
        Ok(MemoryUsage::new(1 << 34, 1 << 30, 15 << 30))
    }

    fn swap_memory(&self) -> Result<MemoryUsage> {
        Ok(MemoryUsage::new(0, 0, 0))
    }

    fn disk_usage(&self, path: &Path) -> Result<DiskUsage> {
        Ok(DiskUsage::new(path, 1 << 40, 1 << 39))
    }

    fn processes(&self, _filter: &ProcessFilter) -> Result<Vec<ProcessInfo>> {
        Ok(Vec::new())
    }
}

#[derive(Default)]
struct StatusLog(Mutex<Vec<JobStatus>>);

impl StatusReporter for StatusLog {
    fn update(&self, status: JobStatus, _job_id: &str, _info: &StatusInfo) -> std::result::Result<(), HookError> {
        self.0.lock().unwrap().push(status);
        Ok(())
    }
}

fn execute(cfg: Config, manifest: &JobManifest) -> (folio_ocr::batch::BatchReport, Vec<JobStatus>) {
    let statuses = Arc::new(StatusLog::default());
    let execution = BatchExecution::new(
        cfg,
        Arc::new(RoomyProbe),
        Arc::clone(&statuses) as Arc<dyn StatusReporter>,
        Arc::new(LogNotifier),
    );
    let report = execution.run(manifest).unwrap();
    let seen = statuses.0.lock().unwrap().clone();
    (report, seen)
}

#[test]
fn batch_writes_report_and_index() {
    let fx = Fixture::new(5);
    let mut cfg = fx.config(2);
    cfg.resources.enabled = false;
    let mut manifest = fx.manifest();
    manifest.job_id = Some("batch-001".into());

    let (report, statuses) = execute(cfg, &manifest);
    assert_eq!(statuses, [JobStatus::Busy, JobStatus::Done]);
    assert_eq!(report.job_id, "batch-001");
    assert_eq!(report.mode, "parallel");
    assert_failed_third_page(&report.outcome);

    let job_dir = fx.path().join("out").join("batch-001");
    assert_eq!(report.job_dir, job_dir);
    let index: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(job_dir.join(INDEX_FILE)).unwrap()).unwrap();
    assert_eq!(index["succeeded"], 4);
    assert_eq!(index["outputs"].as_array().map(Vec::len), Some(4));
    let stored: BatchOutcome = serde_json::from_value(
        serde_json::from_str::<serde_json::Value>(&std::fs::read_to_string(job_dir.join(REPORT_FILE)).unwrap())
            .unwrap()["outcome"]
            .clone(),
    )
    .unwrap();
    assert_eq!(stored.summary, report.outcome.summary);

    // Source images were staged into the per-job work directories.
    let staged = fx.path().join("work-2").join("batch-001").join("page_001").join("page_001.png");
    assert!(staged.is_file());
}

#[test]
fn derived_batch_id_is_stable() {
    let fx = Fixture::new(1);
    let cfg = fx.config(1);
    let execution = BatchExecution::new(
        cfg,
        Arc::new(RoomyProbe),
        Arc::new(StatusLog::default()),
        Arc::new(LogNotifier),
    );
    let manifest = fx.manifest();
    let id = execution.job_id_for(&manifest).unwrap();
    assert_eq!(id.len(), 64);
    assert_eq!(execution.job_id_for(&manifest).unwrap(), id);
}

#[test]
fn governed_batch_runs_in_an_isolated_worker() {
    let fx = Fixture::new(5);
    let mut cfg = fx.config(3);
    cfg.resources.enabled = true;
    cfg.resources.poll_interval_seconds = 0.05;
    cfg.resources.process_patterns = vec![];
    cfg.resources.disk_usage_path = fx.path().display().to_string();
    cfg.resources.worker_exe = env!("CARGO_BIN_EXE_folio-ocr").to_string();
    let mut manifest = fx.manifest();
    manifest.job_id = Some("isolated".into());

    let (report, statuses) = execute(cfg, &manifest);
    assert_eq!(statuses, [JobStatus::Busy, JobStatus::Done]);
    assert_failed_third_page(&report.outcome);
    assert!(fx.path().join("out").join("isolated").join(REPORT_FILE).is_file());
}

/// Reports 95% virtual memory once `trigger` exists.
struct ArmedProbe(PathBuf);

impl ResourceProbe for ArmedProbe {
    fn virtual_memory(&self) -> Result<MemoryUsage> {
        let used = if self.0.exists() { 95 } else { 10 };
        Ok(MemoryUsage::new(100, used, 100 - used))
    }

    fn swap_memory(&self) -> Result<MemoryUsage> {
        Ok(MemoryUsage::new(0, 0, 0))
    }

    fn disk_usage(&self, path: &Path) -> Result<DiskUsage> {
        Ok(DiskUsage::new(path, 1 << 40, 1 << 39))
    }

    fn processes(&self, _filter: &ProcessFilter) -> Result<Vec<ProcessInfo>> {
        Ok(Vec::new())
    }
}

#[test]
fn breach_stops_the_containers_of_the_killed_worker() {
    let fx = Fixture::new(2);
    let runtime = common::install_script(fx.path(), "fake-docker", common::FAKE_RUNTIME);
    let mut cfg = fx.config(1);
    let raw = format!(
        "[pipeline.step_01]\ntype = \"ocrd-container\"\nruntime = \"{}\"\nimage = \"hang\"\ntimeout_seconds = 60\n",
        runtime.display()
    );
    cfg.pipeline = Config::parse(&raw).unwrap().pipeline;
    cfg.resources.enabled = true;
    cfg.resources.poll_interval_seconds = 0.05;
    cfg.resources.process_patterns = vec![];
    cfg.resources.disk_usage_path = fx.path().display().to_string();
    cfg.resources.worker_exe = env!("CARGO_BIN_EXE_folio-ocr").to_string();
    let mut manifest = fx.manifest();
    manifest.job_id = Some("breach".into());

    let statuses = Arc::new(StatusLog::default());
    let execution = BatchExecution::new(
        cfg,
        Arc::new(ArmedProbe(fx.path().join("hanging"))),
        Arc::clone(&statuses) as Arc<dyn StatusReporter>,
        Arc::new(LogNotifier),
    );
    let err = execution.run(&manifest).unwrap_err();
    assert!(err.resource_exceeded().is_some(), "{err}");
    assert_eq!(*statuses.0.lock().unwrap(), [JobStatus::Busy, JobStatus::Fail]);

    let calls = common::runtime_calls(fx.path());
    assert!(calls.iter().any(|c| c.contains("ocrd process")), "{calls:?}");
    assert_eq!(
        calls.last().map(String::as_str),
        Some("kill folio-ocr-page_001 folio-ocr-page_002"),
        "{calls:?}"
    );
    assert!(!fx.path().join("out").join("breach").join(REPORT_FILE).exists());
}
