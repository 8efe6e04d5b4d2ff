use crate::pipeline::StepStatistics;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Share of words the scoring service did not flag, in percent with three
/// decimals. Errors are capped at the word count.
pub fn hit_ratio(words: usize, errors: usize) -> f64 {
    if words == 0 {
        return 0.0;
    }
    let errors = errors.min(words);
    let ratio = (words - errors) as f64 / words as f64 * 100.0;
    (ratio * 1000.0).round() / 1000.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityEstimate {
    pub filename: String,
    /// `None` when the page had no text lines to score.
    pub hit_ratio: Option<f64>,
    pub word_count: usize,
    pub error_count: usize,
    pub line_count: usize,
    pub scored_line_count: usize,
}

impl QualityEstimate {
    pub fn new(
        filename: impl Into<String>,
        line_count: usize,
        scored_line_count: usize,
        word_count: usize,
        error_count: usize,
    ) -> Self {
        let error_count = error_count.min(word_count);
        Self {
            filename: filename.into(),
            hit_ratio: Some(hit_ratio(word_count, error_count)),
            word_count,
            error_count,
            line_count,
            scored_line_count,
        }
    }

    pub fn no_estimate(filename: impl Into<String>, line_count: usize) -> Self {
        Self {
            filename: filename.into(),
            hit_ratio: None,
            word_count: 0,
            error_count: 0,
            line_count,
            scored_line_count: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub page_identifier: String,
    pub sequence_index: usize,
    pub stored_output_path: Option<PathBuf>,
    pub pages_produced: u32,
    pub megapixels: f64,
    pub file_size_mb: f64,
    #[serde(default)]
    pub quality: Option<QualityEstimate>,
    #[serde(default)]
    pub step_statistics: BTreeMap<String, StepStatistics>,
    #[serde(default)]
    pub step_timings_ms: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedJob {
    pub page_identifier: String,
    pub sequence_index: usize,
    pub reason: String,
}

/// Order-independent batch aggregate, used for reporting only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub pages_produced: u64,
    pub total_size_mb: f64,
    pub total_megapixels: f64,
    /// Whole-megapixel bucket (`floor(mp)`) -> page count.
    pub megapixel_histogram: BTreeMap<u32, usize>,
    pub mean_hit_ratio: Option<f64>,
}

impl BatchSummary {
    pub fn from_results(results: &[JobResult], failed: usize) -> Self {
        let mut summary = BatchSummary {
            succeeded: results.len(),
            failed,
            ..Default::default()
        };
        let mut ratios = Vec::new();
        for r in results {
            summary.pages_produced += u64::from(r.pages_produced);
            summary.total_size_mb += r.file_size_mb;
            summary.total_megapixels += r.megapixels;
            *summary
                .megapixel_histogram
                .entry(r.megapixels.max(0.0).floor() as u32)
                .or_insert(0) += 1;
            if let Some(ratio) = r.quality.as_ref().and_then(|q| q.hit_ratio) {
                ratios.push(ratio);
            }
        }
        summary.total_size_mb = round3(summary.total_size_mb);
        summary.total_megapixels = round3(summary.total_megapixels);
        if !ratios.is_empty() {
            summary.mean_hit_ratio = Some(round3(ratios.iter().sum::<f64>() / ratios.len() as f64));
        }
        summary
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub submitted: usize,
    /// Successful jobs in submission order.
    pub results: Vec<JobResult>,
    pub failures: Vec<FailedJob>,
    pub summary: BatchSummary,
}

impl BatchOutcome {
    /// `false` when some pages failed; callers decide whether that is acceptable.
    pub fn is_complete(&self) -> bool {
        self.results.len() == self.submitted
    }
}

fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}
