use crate::config::{ContainerStep, StepSpec, TesseractStep};
use crate::engine::container::METS_FILE;
use crate::engine::{ContainerInvocation, run_tool};
use crate::error::{Error, Result, StepError};
use crate::pipeline::registry::{StepFactory, mismatch};
use crate::pipeline::{HasStatistics, Step, StepState, StepStatistics};
use crate::util::{ensure_dir, move_file};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Bound for `<runtime> kill` after a timed-out container run.
const KILL_TIMEOUT: Duration = Duration::from_secs(30);

pub fn container_factory(spec: &StepSpec) -> Result<StepFactory> {
    let StepSpec::OcrdContainer(cfg) = spec else {
        return Err(mismatch("ocrd-container", spec));
    };
    if cfg.runtime.trim().is_empty() || cfg.image.trim().is_empty() {
        return Err(Error::config("ocrd-container needs runtime and image"));
    }
    if cfg.commands.is_empty() {
        return Err(Error::config("ocrd-container needs at least one command"));
    }
    if cfg.input_group.trim().is_empty() || cfg.output_group.trim().is_empty() {
        return Err(Error::config("ocrd-container needs input_group and output_group"));
    }
    let cfg = Arc::new(cfg.clone());
    Ok(Box::new(move || -> Box<dyn Step> {
        Box::new(OcrdContainer {
            cfg: Arc::clone(&cfg),
        })
    }))
}

pub fn tesseract_factory(spec: &StepSpec) -> Result<StepFactory> {
    let StepSpec::Tesseract(cfg) = spec else {
        return Err(mismatch("tesseract", spec));
    };
    if cfg.binary.trim().is_empty() {
        return Err(Error::config("tesseract needs a binary"));
    }
    let cfg = Arc::new(cfg.clone());
    Ok(Box::new(move || -> Box<dyn Step> {
        Box::new(Tesseract {
            cfg: Arc::clone(&cfg),
        })
    }))
}

/// Runs the OCR-D processor chain inside a container bound to the page's
/// working directory.
pub struct OcrdContainer {
    cfg: Arc<ContainerStep>,
}

impl Step for OcrdContainer {
    fn name(&self) -> &'static str {
        "ocrd-container"
    }

    fn execute(&mut self, state: &mut StepState) -> Result<()> {
        ensure_dir(&state.work_dir)?;
        let image = stage_into(&state.path_in, &state.work_dir)?;
        let image_name = file_name_of(&image)?;

        let invocation = ContainerInvocation::new(
            &self.cfg,
            &state.work_dir,
            ContainerInvocation::container_name(&state.page_id),
        );
        debug!(
            page = %state.page_id,
            direction = ?invocation.direction(),
            "running container {}",
            invocation.name()
        );
        if !state.work_dir.join(METS_FILE).is_file() {
            self.run_container(&invocation, invocation.init_command())?;
        }
        self.run_container(&invocation, invocation.add_command(&image_name, &state.page_id))?;
        self.run_container(&invocation, invocation.process_command())?;

        let group = &self.cfg.output_group;
        let produced = find_output(&state.work_dir.join(group), &self.cfg.output_suffix)?
            .ok_or_else(|| {
                StepError::failed(
                    self.name(),
                    format!("no .{} output in {group}", self.cfg.output_suffix),
                )
            })?;
        let target = state
            .work_dir
            .join(format!("{}.{}", state.page_id, self.cfg.output_suffix));
        move_file(&produced, &target)?;
        state.path_next = Some(target);
        Ok(())
    }
}

impl OcrdContainer {
    fn run_container(&self, invocation: &ContainerInvocation<'_>, cmd: Command) -> Result<()> {
        let result = run_tool(self.name(), cmd, timeout_of(self.cfg.timeout_seconds));
        if let Err(Error::Step(StepError::Timeout { .. })) = &result {
            // Killing the client does not stop the container itself.
            if let Err(err) = run_tool(self.name(), invocation.kill_command(), Some(KILL_TIMEOUT)) {
                warn!(container = invocation.name(), "container kill failed: {err}");
            }
        }
        result.map(drop)
    }
}

impl HasStatistics for OcrdContainer {
    fn statistics(&self) -> Option<StepStatistics> {
        None
    }
}

/// Local `tesseract <image> <outbase> -l <model> alto`.
pub struct Tesseract {
    cfg: Arc<TesseractStep>,
}

impl Step for Tesseract {
    fn name(&self) -> &'static str {
        "tesseract"
    }

    fn execute(&mut self, state: &mut StepState) -> Result<()> {
        ensure_dir(&state.work_dir)?;
        let outbase = state.work_dir.join(&state.page_id);
        let mut cmd = Command::new(&self.cfg.binary);
        cmd.arg(&state.path_in)
            .arg(&outbase)
            .args(["-l", self.cfg.model.as_str()])
            .args(&self.cfg.extra_args)
            .arg("alto");
        run_tool(self.name(), cmd, timeout_of(self.cfg.timeout_seconds))?;

        let mut produced = outbase.into_os_string();
        produced.push(".xml");
        let produced = PathBuf::from(produced);
        if !produced.is_file() {
            return Err(StepError::failed(
                self.name(),
                format!("expected output missing: {}", produced.display()),
            )
            .into());
        }
        state.path_next = Some(produced);
        Ok(())
    }
}

impl HasStatistics for Tesseract {
    fn statistics(&self) -> Option<StepStatistics> {
        None
    }
}

fn timeout_of(seconds: u64) -> Option<Duration> {
    (seconds > 0).then(|| Duration::from_secs(seconds))
}

/// The container only sees the working directory, so inputs from elsewhere are copied in.
fn stage_into(path: &Path, work_dir: &Path) -> Result<PathBuf> {
    if path.parent() == Some(work_dir) {
        return Ok(path.to_path_buf());
    }
    let target = work_dir.join(file_name_of(path)?);
    std::fs::copy(path, &target)
        .map_err(|e| Error::io(format!("staging {} into {}", path.display(), work_dir.display()), e))?;
    Ok(target)
}

fn file_name_of(path: &Path) -> Result<String> {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| Error::config(format!("path has no file name: {}", path.display())))
}

fn find_output(dir: &Path, suffix: &str) -> Result<Option<PathBuf>> {
    if !dir.is_dir() {
        return Ok(None);
    }
    let entries = std::fs::read_dir(dir).map_err(|e| Error::io(format!("reading {}", dir.display()), e))?;
    let mut found: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|e| e.eq_ignore_ascii_case(suffix)))
        .collect();
    found.sort();
    Ok(found.into_iter().next())
}
