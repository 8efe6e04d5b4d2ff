use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const IMAGE_EXTENSIONS: &[&str] = &["tif", "tiff", "jpg", "jpeg", "png", "jp2"];

/// One page image to recognize. Jobs never share state with each other.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineJob {
    pub source_image_path: PathBuf,
    pub page_identifier: String,
    pub sequence_index: usize,
    pub total_count: usize,
}

impl PipelineJob {
    /// Per-job working directory; disjoint across jobs as long as page identifiers are unique.
    pub fn work_dir(&self, work_root: &Path) -> PathBuf {
        work_root.join(sanitize_identifier(&self.page_identifier))
    }
}

/// The page list handed over by the metadata stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobManifest {
    #[serde(default)]
    pub job_id: Option<String>,
    pub jobs: Vec<PipelineJob>,
}

impl JobManifest {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::io(format!("reading manifest: {}", path.display()), e))?;
        let manifest: JobManifest = serde_json::from_str(&raw)
            .map_err(|e| Error::config(format!("parsing manifest {}: {e}", path.display())))?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let raw = serde_json::to_string_pretty(self)
            .map_err(|e| Error::config(format!("serializing manifest: {e}")))?;
        std::fs::write(path, raw)
            .map_err(|e| Error::io(format!("writing manifest: {}", path.display()), e))
    }

    /// Builds one job per image file in `dir`, ordered by file name.
    pub fn from_image_dir(dir: &Path) -> Result<Self> {
        let entries = std::fs::read_dir(dir)
            .map_err(|e| Error::io(format!("reading image dir: {}", dir.display()), e))?;
        let mut images: Vec<PathBuf> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.is_file() && is_image(p))
            .collect();
        images.sort();

        let total_count = images.len();
        let jobs = images
            .into_iter()
            .enumerate()
            .map(|(i, path)| PipelineJob {
                page_identifier: path
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_else(|| format!("page_{:05}", i + 1)),
                source_image_path: path,
                sequence_index: i + 1,
                total_count,
            })
            .collect();
        let manifest = Self { job_id: None, jobs };
        manifest.validate()?;
        Ok(manifest)
    }

    /// Page identifiers must be unique so per-job directories never collide,
    /// and must name a directory below the work root.
    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for job in &self.jobs {
            let dir_name = sanitize_identifier(&job.page_identifier);
            if dir_name.chars().all(|c| c == '.') {
                return Err(Error::config(format!(
                    "page identifier {:?} does not name a working directory",
                    job.page_identifier
                )));
            }
            if !seen.insert(dir_name) {
                return Err(Error::config(format!(
                    "duplicate page identifier in manifest: {}",
                    job.page_identifier
                )));
            }
        }
        Ok(())
    }
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
}

fn sanitize_identifier(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '_' })
        .collect()
}
