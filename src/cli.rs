use crate::{
    batch::BatchExecution,
    config::Config,
    hooks::{LogReporter, notifier_from_config},
    job::JobManifest,
    pipeline::{StepChain, registry},
    resources::{ProcessFilter, ResourceProbe, ResourceSupervisor, SystemProbe, WorkerReply, write_reply},
    util::{ensure_dir, format_bytes},
    workflow::WorkflowRunner,
};
use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "folio-ocr")]
#[command(about = "Resource-governed OCR batch runner for digitized page images")]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Command,

    /// Path to config TOML. If omitted, uses ./folio-ocr.toml if present.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Override log level (trace/debug/info/warn/error).
    #[arg(long, global = true)]
    pub log_level: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Recognize a batch of page images.
    Run {
        /// JSON manifest listing the page jobs.
        #[arg(long, required_unless_present = "images", conflicts_with = "images")]
        manifest: Option<PathBuf>,
        /// Directory of page images, one job per file.
        #[arg(long)]
        images: Option<PathBuf>,
        #[arg(long)]
        job_id: Option<String>,
        #[arg(long)]
        out_dir: Option<PathBuf>,
    },
    /// Validate the config and run the pre-flight resource checks.
    Check {},
    /// Print one resource sample as JSON.
    Snapshot {
        #[arg(long)]
        pid: Vec<u32>,
        /// Command-line regex; repeatable.
        #[arg(long)]
        pattern: Vec<String>,
    },
    /// List the configured step chain.
    Steps {},
    #[command(hide = true)]
    Worker {
        #[arg(long)]
        manifest: PathBuf,
    },
}

pub fn dispatch(args: Args) -> Result<()> {
    let cfg_path = resolve_config_path(args.config.as_deref());
    let cfg = Config::load(&cfg_path)?;

    match &args.cmd {
        Command::Run {
            manifest,
            images,
            job_id,
            out_dir,
        } => run(&args, cfg, manifest.as_deref(), images.as_deref(), job_id.as_deref(), out_dir.as_deref()),
        Command::Check {} => {
            let _guard = init_logging(&args, &cfg, None, LogTarget::Stdout)?;
            check(&cfg, &cfg_path)
        }
        Command::Snapshot { pid, pattern } => {
            let _guard = init_logging(&args, &cfg, None, LogTarget::Stderr)?;
            snapshot(&cfg, pid, pattern)
        }
        Command::Steps {} => {
            let _guard = init_logging(&args, &cfg, None, LogTarget::Stdout)?;
            steps(&cfg)
        }
        Command::Worker { manifest } => {
            let _guard = init_logging(&args, &cfg, None, LogTarget::Stderr)?;
            worker(&cfg, manifest)
        }
    }
}

fn resolve_config_path(user: Option<&Path>) -> PathBuf {
    if let Some(p) = user {
        return p.to_path_buf();
    }
    let default = PathBuf::from("folio-ocr.toml");
    if default.exists() {
        default
    } else {
        PathBuf::from("folio-ocr.example.toml")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogTarget {
    Stdout,
    /// Keeps stdout free for machine-readable output.
    Stderr,
}

fn init_logging(
    args: &Args,
    cfg: &Config,
    file_path: Option<&Path>,
    target: LogTarget,
) -> Result<Option<WorkerGuard>> {
    let level = args
        .log_level
        .as_deref()
        .unwrap_or(cfg.logging.level.as_str());

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let console_layer = match (cfg.logging.json, target) {
        (true, LogTarget::Stdout) => tracing_subscriber::fmt::layer().json().with_target(true).boxed(),
        (true, LogTarget::Stderr) => tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_writer(std::io::stderr)
            .boxed(),
        (false, LogTarget::Stdout) => tracing_subscriber::fmt::layer().with_target(true).boxed(),
        (false, LogTarget::Stderr) => tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_writer(std::io::stderr)
            .boxed(),
    };

    let (file_layer, guard) = if let Some(path) = file_path {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        ensure_dir(parent)?;
        let file = std::fs::File::create(path)
            .with_context(|| format!("create log file: {}", path.display()))?;
        let (non_blocking, guard) = tracing_appender::non_blocking(file);
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_target(true)
            .boxed();
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| anyhow!("failed to init logging: {e}"))?;

    Ok(guard)
}

fn run(
    args: &Args,
    mut cfg: Config,
    manifest_path: Option<&Path>,
    images: Option<&Path>,
    job_id: Option<&str>,
    out_override: Option<&Path>,
) -> Result<()> {
    if let Some(out) = out_override {
        cfg.paths.out_dir = out.to_string_lossy().into_owned();
    }
    let mut manifest = match (manifest_path, images) {
        (Some(path), _) => JobManifest::load(path)?,
        (None, Some(dir)) => JobManifest::from_image_dir(dir)?,
        (None, None) => return Err(anyhow!("either --manifest or --images is required")),
    };
    if let Some(id) = job_id {
        manifest.job_id = Some(id.to_string());
    }
    if manifest.jobs.is_empty() {
        return Err(anyhow!("no page images to process"));
    }

    let print_summary = cfg.global.print_summary;
    let execution = BatchExecution::new(
        cfg.clone(),
        Arc::new(SystemProbe),
        Arc::new(LogReporter),
        Arc::from(notifier_from_config(&cfg.notify)),
    );
    let job_id = execution.job_id_for(&manifest)?;
    let job_dir = PathBuf::from(&cfg.paths.out_dir).join(&job_id);
    let log_path = resolve_log_path(&cfg, Some(&job_dir));
    let _guard = init_logging(args, &cfg, log_path.as_deref(), LogTarget::Stdout)?;

    info!("job_id={job_id} pages={} out={}", manifest.jobs.len(), job_dir.display());
    let report = execution
        .run(&manifest)
        .with_context(|| format!("batch {job_id}"))?;

    if print_summary {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "job_id": report.job_id,
                "job_dir": report.job_dir,
                "mode": report.mode,
                "summary": report.outcome.summary,
                "failures": report.outcome.failures,
            }))?
        );
    }
    Ok(())
}

fn check(cfg: &Config, cfg_path: &Path) -> Result<()> {
    let chain = StepChain::from_config(&cfg.pipeline)?;
    let probe: Arc<dyn ResourceProbe> = Arc::new(SystemProbe);
    let supervisor = ResourceSupervisor::new(cfg.resources.clone(), Arc::clone(&probe))?;
    let vm = probe.virtual_memory()?;
    let disk = probe.disk_usage(Path::new(&cfg.resources.disk_usage_path))?;
    let memory_ok = supervisor.check_virtual_memory();

    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "config": cfg_path,
            "steps": chain.len(),
            "workers": cfg.global.workers,
            "supervision": cfg.resources.enabled,
            "virtual_memory": {
                "used": format_bytes(vm.used),
                "total": format_bytes(vm.total),
                "percent": vm.percent,
            },
            "disk": {
                "path": disk.path,
                "free": format_bytes(disk.free),
                "total": format_bytes(disk.total),
            },
            "memory_ok": memory_ok.is_ok(),
        }))?
    );
    memory_ok?;
    Ok(())
}

fn snapshot(cfg: &Config, pids: &[u32], patterns: &[String]) -> Result<()> {
    let pids = (!pids.is_empty()).then(|| pids.iter().copied().collect::<BTreeSet<_>>());
    let filter = ProcessFilter::new(pids, patterns)?;
    let sample = SystemProbe.snapshot(Path::new(&cfg.resources.disk_usage_path), &filter)?;
    println!("{}", serde_json::to_string_pretty(&sample)?);
    Ok(())
}

fn steps(cfg: &Config) -> Result<()> {
    let chain = StepChain::from_config(&cfg.pipeline)?;
    let configured: Vec<_> = chain
        .describe()
        .into_iter()
        .map(|(key, kind)| serde_json::json!({ "key": key, "type": kind }))
        .collect();
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "configured": configured,
            "available": registry::registered_types().collect::<Vec<_>>(),
        }))?
    );
    Ok(())
}

/// Isolated-worker entry point: runs the staged batch and answers on stdout.
fn worker(cfg: &Config, manifest_path: &Path) -> Result<()> {
    let result = JobManifest::load(manifest_path)
        .and_then(|manifest| WorkflowRunner::from_config(cfg)?.run(&manifest.jobs));
    match result {
        Ok(outcome) => {
            write_reply(&WorkerReply::Ok(outcome))?;
            Ok(())
        }
        Err(err) => {
            write_reply::<()>(&WorkerReply::Err(err.to_string()))?;
            Err(err.into())
        }
    }
}

fn resolve_log_path(cfg: &Config, job_dir: Option<&Path>) -> Option<PathBuf> {
    if !cfg.logging.write_to_file {
        return None;
    }

    if !cfg.logging.file_path.is_empty() {
        return Some(PathBuf::from(&cfg.logging.file_path));
    }

    if let Some(job_dir) = job_dir {
        return Some(job_dir.join("logs").join("folio-ocr.log"));
    }

    Some(PathBuf::from(&cfg.paths.out_dir).join("folio-ocr.log"))
}
