use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub global: Global,
    #[serde(default)]
    pub paths: Paths,
    #[serde(default)]
    pub resources: SupervisorConfig,
    #[serde(default)]
    pub logging: Logging,
    #[serde(default)]
    pub notify: Notify,
    #[serde(default)]
    pub pipeline: Pipeline,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::io(format!("reading config: {}", path.display()), e))?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let cfg: Config =
            toml::from_str(raw).map_err(|e| Error::config(format!("parsing TOML: {e}")))?;
        if cfg.global.workers == 0 {
            return Err(Error::config("global.workers must be at least 1"));
        }
        cfg.pipeline.ordered()?;
        Ok(cfg)
    }

    /// A stable, normalization-friendly string for hashing.
    pub fn normalized_for_hash(&self) -> String {
        toml::to_string(self).unwrap_or_default()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            global: Default::default(),
            paths: Default::default(),
            resources: Default::default(),
            logging: Default::default(),
            notify: Default::default(),
            pipeline: Default::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Global {
    pub job_name: String,
    /// Worker-pool size. `1` runs pages strictly one after another.
    pub workers: usize,
    pub print_summary: bool,
    pub dump_effective_config: bool,
}
impl Default for Global {
    fn default() -> Self {
        Self {
            job_name: "default".into(),
            workers: 4,
            print_summary: true,
            dump_effective_config: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Paths {
    pub out_dir: String,
    pub work_dir: String,
}
impl Default for Paths {
    fn default() -> Self {
        Self {
            out_dir: "out".into(),
            work_dir: ".folio-ocr-work".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub enabled: bool,
    pub poll_interval_seconds: f64,
    pub disk_usage_path: String,
    pub disk_headroom_factor: f64,
    pub max_vmem_percent: Option<f64>,
    pub max_vmem_bytes: Option<u64>,
    /// Command-line regexes selecting the processes listed in each sample.
    pub process_patterns: Vec<String>,
    /// Program spawned as the isolated worker. Empty means the running executable.
    pub worker_exe: String,
}
impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_seconds: 2.0,
            disk_usage_path: "/".into(),
            disk_headroom_factor: 3.0,
            max_vmem_percent: Some(90.0),
            max_vmem_bytes: None,
            process_patterns: vec!["ocrd".into(), "tesseract".into()],
            worker_exe: "".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Logging {
    pub level: String,
    pub json: bool,
    pub write_to_file: bool,
    pub file_path: String,
}
impl Default for Logging {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
            write_to_file: true,
            file_path: "".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Notify {
    /// When empty, notifications only go to the log.
    pub webhook_url: String,
    pub subject_prefix: String,
    pub timeout_seconds: u64,
}
impl Default for Notify {
    fn default() -> Self {
        Self {
            webhook_url: "".into(),
            subject_prefix: "[folio-ocr]".into(),
            timeout_seconds: 10,
        }
    }
}

/// Steps keyed by ordinal name (`step_1`, `step_02`, ...). Run order is the
/// numeric ordinal, so `step_2` runs before `step_10`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Pipeline {
    pub steps: BTreeMap<String, StepSpec>,
}

impl Pipeline {
    /// Steps in run order. Keys that are not `step_<number>`, or two keys with
    /// the same number (`step_1` and `step_01`), are rejected.
    pub fn ordered(&self) -> Result<Vec<(&str, &StepSpec)>> {
        let mut by_ordinal: BTreeMap<u64, (&str, &StepSpec)> = BTreeMap::new();
        for (key, spec) in &self.steps {
            let ordinal = step_ordinal(key).ok_or_else(|| {
                Error::config(format!("pipeline.{key}: step keys must look like step_<number>"))
            })?;
            if let Some((other, _)) = by_ordinal.insert(ordinal, (key.as_str(), spec)) {
                return Err(Error::config(format!(
                    "pipeline.{key}: same position as pipeline.{other}"
                )));
            }
        }
        Ok(by_ordinal.into_values().collect())
    }
}

fn step_ordinal(key: &str) -> Option<u64> {
    let digits = key.strip_prefix("step_")?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}
impl Default for Pipeline {
    fn default() -> Self {
        let mut steps = BTreeMap::new();
        steps.insert(
            "step_01".to_string(),
            StepSpec::OcrdContainer(ContainerStep::default()),
        );
        steps.insert(
            "step_02".to_string(),
            StepSpec::ReplaceChars(ReplaceStep {
                mapping: BTreeMap::from([
                    ("⸗".to_string(), "-".to_string()),
                    ("ꝛ".to_string(), "r".to_string()),
                ]),
                backup: false,
            }),
        );
        Self { steps }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StepSpec {
    OcrdContainer(ContainerStep),
    Tesseract(TesseractStep),
    ReplaceChars(ReplaceStep),
    ReplaceRegex(ReplaceStep),
    Relocate(RelocateStep),
    RemoveFile(RemoveFileStep),
    EstimateQuality(EstimateStep),
}

impl StepSpec {
    pub fn type_name(&self) -> &'static str {
        match self {
            StepSpec::OcrdContainer(_) => "ocrd-container",
            StepSpec::Tesseract(_) => "tesseract",
            StepSpec::ReplaceChars(_) => "replace-chars",
            StepSpec::ReplaceRegex(_) => "replace-regex",
            StepSpec::Relocate(_) => "relocate",
            StepSpec::RemoveFile(_) => "remove-file",
            StepSpec::EstimateQuality(_) => "estimate-quality",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerStep {
    pub runtime: String,
    pub image: String,
    pub container_workdir: String,
    pub user: String,
    pub memory_limit: String,
    pub memory_swap: String,
    /// Extra `host:container` mounts, e.g. recognition models.
    pub volumes: Vec<String>,
    pub timeout_seconds: u64,
    pub model: String,
    /// Model name fragments that mark right-to-left scripts.
    pub rtl_models: Vec<String>,
    /// File group the page image is added to; `{input}` in the templates.
    pub input_group: String,
    /// File group the last processor writes ALTO into; `{output}` in the templates.
    pub output_group: String,
    /// Processor templates; `{input}`, `{output}`, `{model}` and `{level}` are substituted.
    pub commands: Vec<String>,
    pub output_suffix: String,
}
impl Default for ContainerStep {
    fn default() -> Self {
        Self {
            runtime: "docker".into(),
            image: "ocrd/all:maximum".into(),
            container_workdir: "/data".into(),
            user: "".into(),
            memory_limit: "".into(),
            memory_swap: "".into(),
            volumes: vec![],
            timeout_seconds: 1800,
            model: "frk".into(),
            rtl_models: vec![
                "ara".into(),
                "fas".into(),
                "heb".into(),
                "syr".into(),
                "urd".into(),
            ],
            input_group: "OCR-D-IMG".into(),
            output_group: "FULLTEXT".into(),
            commands: vec![
                "olena-binarize -I {input} -O BIN -P impl sauvola-ms-split".into(),
                "tesserocr-segment-region -I BIN -O SEG-REGION".into(),
                "tesserocr-recognize -I SEG-REGION -O OCR -P segmentation_level line -P textequiv_level {level} -P model {model}".into(),
                "fileformat-transform -I OCR -O {output} -P from-to \"page alto\"".into(),
            ],
            output_suffix: "xml".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TesseractStep {
    pub binary: String,
    pub model: String,
    pub timeout_seconds: u64,
    pub extra_args: Vec<String>,
}
impl Default for TesseractStep {
    fn default() -> Self {
        Self {
            binary: "tesseract".into(),
            model: "deu".into(),
            timeout_seconds: 600,
            extra_args: vec![],
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplaceStep {
    /// Literal text (or regex, for `replace-regex`) mapped to its replacement.
    pub mapping: BTreeMap<String, String>,
    /// Keep `<file>.bak` from before the first destructive write.
    pub backup: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelocateStep {
    pub target_dir: String,
    pub create_target: bool,
}
impl Default for RelocateStep {
    fn default() -> Self {
        Self {
            target_dir: "out/alto".into(),
            create_target: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoveFileStep {
    pub suffixes: Vec<String>,
}
impl Default for RemoveFileStep {
    fn default() -> Self {
        Self {
            suffixes: vec!["bak".into()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimateStep {
    pub service_url: String,
    pub language: String,
    pub enabled_rules: Vec<String>,
    /// Characters removed from every line before scoring.
    pub strip_chars: String,
    pub strip_diacritics: bool,
    pub timeout_seconds: u64,
}
impl Default for EstimateStep {
    fn default() -> Self {
        Self {
            service_url: "http://localhost:8010/v2/check".into(),
            language: "de-DE".into(),
            enabled_rules: vec!["GERMAN_SPELLER_RULE".into()],
            strip_chars: ".,;:!?\"'()[]{}»«„“”‚‘’—–*/|".into(),
            strip_diacritics: false,
            timeout_seconds: 30,
        }
    }
}
