use crate::config::StepSpec;
use crate::error::{Error, Result};
use crate::pipeline::registry::{StepFactory, mismatch};
use crate::pipeline::{HasStatistics, Step, StepState, StepStatistics};
use crate::util::{ensure_dir, move_file};
use std::path::PathBuf;
use std::sync::Arc;

pub fn factory(spec: &StepSpec) -> Result<StepFactory> {
    let StepSpec::Relocate(cfg) = spec else {
        return Err(mismatch("relocate", spec));
    };
    if cfg.target_dir.trim().is_empty() {
        return Err(Error::config("relocate needs a target_dir"));
    }
    let target_dir = Arc::new(PathBuf::from(&cfg.target_dir));
    let create = cfg.create_target;
    Ok(Box::new(move || -> Box<dyn Step> {
        Box::new(Relocate {
            target_dir: Arc::clone(&target_dir),
            create,
        })
    }))
}

/// Moves the current file into the target directory, keeping its name.
pub struct Relocate {
    target_dir: Arc<PathBuf>,
    create: bool,
}

impl Step for Relocate {
    fn name(&self) -> &'static str {
        "relocate"
    }

    fn execute(&mut self, state: &mut StepState) -> Result<()> {
        if self.create {
            ensure_dir(&self.target_dir)?;
        }
        let name = state.path_in.file_name().ok_or_else(|| {
            Error::config(format!("cannot relocate {}: no file name", state.path_in.display()))
        })?;
        let target = self.target_dir.join(name);
        move_file(&state.path_in, &target)?;
        state.path_next = Some(target);
        Ok(())
    }
}

impl HasStatistics for Relocate {
    fn statistics(&self) -> Option<StepStatistics> {
        None
    }
}
