use crate::config::{EstimateStep, StepSpec};
use crate::error::{Error, Result};
use crate::pipeline::registry::{StepFactory, mismatch};
use crate::pipeline::{HasStatistics, Step, StepState, StepStatistics, read_text};
use crate::postprocess::{alto_lines, normalize_for_scoring, word_count};
use crate::report::QualityEstimate;
use crate::scoring::ScoringClient;
use std::sync::Arc;
use tracing::info;

pub fn factory(spec: &StepSpec) -> Result<StepFactory> {
    let StepSpec::EstimateQuality(cfg) = spec else {
        return Err(mismatch("estimate-quality", spec));
    };
    if cfg.service_url.trim().is_empty() {
        return Err(Error::config("estimate-quality needs a service_url"));
    }
    let cfg = Arc::new(cfg.clone());
    let client = Arc::new(ScoringClient::new(&cfg));
    Ok(Box::new(move || -> Box<dyn Step> {
        Box::new(EstimateQuality {
            cfg: Arc::clone(&cfg),
            client: Arc::clone(&client),
            estimate: None,
        })
    }))
}

/// Scores the recognized text of the current ALTO file. Leaves the file untouched.
pub struct EstimateQuality {
    cfg: Arc<EstimateStep>,
    client: Arc<ScoringClient>,
    estimate: Option<QualityEstimate>,
}

impl Step for EstimateQuality {
    fn name(&self) -> &'static str {
        "estimate-quality"
    }

    fn execute(&mut self, state: &mut StepState) -> Result<()> {
        let path = &state.path_in;
        let xml = read_text(self.name(), path)?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let raw = alto_lines(&xml);
        let lines = normalize_for_scoring(&raw, &self.cfg.strip_chars, self.cfg.strip_diacritics);
        let words = word_count(&lines);
        if words == 0 {
            info!(page = %state.page_id, "no text lines; skipping estimation");
            self.estimate = Some(QualityEstimate::no_estimate(filename, raw.len()));
            return Ok(());
        }

        let errors = self.client.count_errors(&lines.join("\n"))?;
        let estimate = QualityEstimate::new(filename, raw.len(), lines.len(), words, errors);
        info!(
            page = %state.page_id,
            words,
            errors = estimate.error_count,
            hit_ratio = estimate.hit_ratio.unwrap_or_default(),
            "quality estimate"
        );
        self.estimate = Some(estimate);
        Ok(())
    }
}

impl HasStatistics for EstimateQuality {
    fn statistics(&self) -> Option<StepStatistics> {
        self.estimate.clone().map(StepStatistics::Quality)
    }
}
