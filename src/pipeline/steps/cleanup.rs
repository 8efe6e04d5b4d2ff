use crate::config::StepSpec;
use crate::error::{Error, Result};
use crate::pipeline::registry::{StepFactory, mismatch};
use crate::pipeline::{HasStatistics, Step, StepState, StepStatistics};
use std::sync::Arc;
use tracing::debug;

pub fn factory(spec: &StepSpec) -> Result<StepFactory> {
    let StepSpec::RemoveFile(cfg) = spec else {
        return Err(mismatch("remove-file", spec));
    };
    let suffixes: Vec<String> = cfg
        .suffixes
        .iter()
        .map(|s| s.trim_start_matches('.').to_ascii_lowercase())
        .filter(|s| !s.is_empty())
        .collect();
    if suffixes.is_empty() {
        return Err(Error::config("remove-file needs at least one suffix"));
    }
    let suffixes = Arc::new(suffixes);
    Ok(Box::new(move || -> Box<dyn Step> {
        Box::new(RemoveFile {
            suffixes: Arc::clone(&suffixes),
            removed: false,
        })
    }))
}

/// Deletes the current file when its extension is one of the configured suffixes.
pub struct RemoveFile {
    suffixes: Arc<Vec<String>>,
    removed: bool,
}

impl Step for RemoveFile {
    fn name(&self) -> &'static str {
        "remove-file"
    }

    fn execute(&mut self, state: &mut StepState) -> Result<()> {
        let path = &state.path_in;
        let matches = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| self.suffixes.iter().any(|s| s.eq_ignore_ascii_case(e)));
        if matches && path.exists() {
            std::fs::remove_file(path).map_err(|e| Error::io(format!("removing {}", path.display()), e))?;
            debug!(page = %state.page_id, "removed {}", path.display());
            self.removed = true;
        }
        Ok(())
    }
}

impl HasStatistics for RemoveFile {
    fn statistics(&self) -> Option<StepStatistics> {
        Some(StepStatistics::Removal {
            removed: self.removed,
        })
    }
}
