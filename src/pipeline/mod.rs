//! Per-page step chain.
//!
//! Steps hand over by file path: whatever a step leaves in
//! [`StepState::path_next`] becomes the next step's [`StepState::path_in`].
//! A step that sets no next path works in place and the current path carries
//! over unchanged.

pub mod registry;
pub mod steps;

use crate::config::Pipeline;
use crate::error::{Error, Result, StepError};
use crate::report::QualityEstimate;
use registry::StepFactory;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info};

/// Cursor of one page moving through the chain. Owned by a single job.
#[derive(Debug, Clone)]
pub struct StepState {
    pub page_id: String,
    pub work_dir: PathBuf,
    pub path_in: PathBuf,
    pub path_next: Option<PathBuf>,
}

impl StepState {
    pub fn new(page_id: impl Into<String>, work_dir: impl Into<PathBuf>, path_in: impl Into<PathBuf>) -> Self {
        Self {
            page_id: page_id.into(),
            work_dir: work_dir.into(),
            path_in: path_in.into(),
            path_next: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatistics {
    Replacements(BTreeMap<String, usize>),
    Removal { removed: bool },
    Quality(QualityEstimate),
}

/// Whether a step exposes statistics after running. Every step implements
/// this, returning `None` when it has nothing to report.
pub trait HasStatistics {
    fn statistics(&self) -> Option<StepStatistics>;
}

pub trait Step: HasStatistics + Send {
    fn name(&self) -> &'static str;

    fn execute(&mut self, state: &mut StepState) -> Result<()>;
}

/// What one page left behind after the whole chain.
#[derive(Debug, Clone, Default)]
pub struct ChainRun {
    pub final_path: PathBuf,
    pub statistics: BTreeMap<String, StepStatistics>,
    pub timings_ms: BTreeMap<String, u64>,
}

struct ChainEntry {
    key: String,
    type_name: &'static str,
    factory: StepFactory,
}

/// Validated, ordered list of step factories. Each page gets fresh step
/// instances, so per-step counters never leak between pages.
pub struct StepChain {
    entries: Vec<ChainEntry>,
}

impl StepChain {
    pub fn from_config(pipeline: &Pipeline) -> Result<Self> {
        if pipeline.steps.is_empty() {
            return Err(Error::config("pipeline has no steps"));
        }
        let entries = pipeline
            .ordered()?
            .into_iter()
            .map(|(key, spec)| {
                let factory = registry::factory_for(spec)
                    .map_err(|e| Error::config(format!("pipeline.{key}: {e}")))?;
                Ok(ChainEntry {
                    key: key.to_string(),
                    type_name: spec.type_name(),
                    factory,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `(key, type)` pairs in run order.
    pub fn describe(&self) -> Vec<(String, &'static str)> {
        self.entries
            .iter()
            .map(|e| (e.key.clone(), e.type_name))
            .collect()
    }

    /// Runs every step in order. The first failing step ends the chain for this page.
    pub fn run(&self, mut state: StepState) -> Result<ChainRun> {
        let mut run = ChainRun::default();
        for entry in &self.entries {
            let mut step = (entry.factory)();
            state.path_next = None;
            let started = Instant::now();
            debug!(page = %state.page_id, step = %entry.key, input = %state.path_in.display(), "step start");
            step.execute(&mut state)?;
            let elapsed_ms = started.elapsed().as_millis() as u64;
            info!(page = %state.page_id, step = %entry.key, kind = step.name(), elapsed_ms, "step done");

            if let Some(next) = state.path_next.take() {
                state.path_in = next;
            }
            if let Some(stats) = step.statistics() {
                run.statistics.insert(entry.key.clone(), stats);
            }
            run.timings_ms.insert(entry.key.clone(), elapsed_ms);
        }
        run.final_path = state.path_in;
        Ok(run)
    }
}

/// Reads a recognizer output as text. Undecodable bytes fail only this page.
pub(crate) fn read_text(step: &str, path: &Path) -> Result<String> {
    let bytes = std::fs::read(path).map_err(|e| Error::io(format!("reading {}", path.display()), e))?;
    String::from_utf8(bytes).map_err(|e| {
        StepError::failed(
            step,
            format!("{} is not valid UTF-8: {}", path.display(), e.utf8_error()),
        )
        .into()
    })
}
