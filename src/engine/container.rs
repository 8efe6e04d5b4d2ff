use super::types::ScriptDirection;
use crate::config::ContainerStep;
use std::path::Path;
use std::process::Command;

/// Written by `ocrd workspace init` into the bound working directory.
pub const METS_FILE: &str = "mets.xml";

/// `docker run` (or compatible runtime) invocations against one page's
/// OCR-D workspace.
///
/// The working directory becomes the workspace: it is initialized once, the
/// page image is added to the input file group, and the processor chain then
/// reads that group by name.
pub struct ContainerInvocation<'a> {
    cfg: &'a ContainerStep,
    host_workdir: &'a Path,
    name: String,
}

impl<'a> ContainerInvocation<'a> {
    pub fn new(cfg: &'a ContainerStep, host_workdir: &'a Path, name: impl Into<String>) -> Self {
        Self {
            cfg,
            host_workdir,
            name: name.into(),
        }
    }

    /// Container name for a page, stable across the parent and the worker.
    pub fn container_name(page_id: &str) -> String {
        format!("folio-ocr-{}", container_safe(page_id))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn direction(&self) -> ScriptDirection {
        ScriptDirection::detect(&self.cfg.model, &self.cfg.rtl_models)
    }

    /// Processor calls with placeholders filled in. `{input}` and `{output}`
    /// are file groups of the workspace.
    pub fn render_commands(&self) -> Vec<String> {
        let level = self.direction().text_equiv_level();
        self.cfg
            .commands
            .iter()
            .map(|tpl| {
                tpl.replace("{input}", &self.cfg.input_group)
                    .replace("{output}", &self.cfg.output_group)
                    .replace("{model}", &self.cfg.model)
                    .replace("{level}", level.as_str())
            })
            .collect()
    }

    pub fn init_args(&self) -> Vec<String> {
        self.run_args(["ocrd", "workspace", "init", "."].map(String::from))
    }

    /// Registers `image_name` (relative to the working directory) as the
    /// page's only file in the input group.
    pub fn add_args(&self, image_name: &str, page_id: &str) -> Vec<String> {
        let page = container_safe(page_id);
        self.run_args([
            "ocrd".to_string(),
            "workspace".to_string(),
            "add".to_string(),
            "--force".to_string(),
            "-G".to_string(),
            self.cfg.input_group.clone(),
            "-i".to_string(),
            format!("{}_{page}", self.cfg.input_group),
            "-g".to_string(),
            page,
            "-m".to_string(),
            image_mimetype(image_name).to_string(),
            image_name.to_string(),
        ])
    }

    pub fn process_args(&self) -> Vec<String> {
        let mut tail = vec!["ocrd".to_string(), "process".to_string()];
        tail.extend(self.render_commands());
        self.run_args(tail)
    }

    pub fn init_command(&self) -> Command {
        self.runtime_command(self.init_args())
    }

    pub fn add_command(&self, image_name: &str, page_id: &str) -> Command {
        self.runtime_command(self.add_args(image_name, page_id))
    }

    pub fn process_command(&self) -> Command {
        self.runtime_command(self.process_args())
    }

    /// Stops a container left behind by a killed client.
    pub fn kill_command(&self) -> Command {
        kill_containers_command(&self.cfg.runtime, std::slice::from_ref(&self.name))
    }

    fn runtime_command(&self, args: Vec<String>) -> Command {
        let mut cmd = Command::new(&self.cfg.runtime);
        cmd.args(args);
        cmd
    }

    fn run_args(&self, tail: impl IntoIterator<Item = String>) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "--name".to_string(),
            self.name.clone(),
        ];
        if !self.cfg.user.is_empty() {
            args.extend(["-u".to_string(), self.cfg.user.clone()]);
        }
        args.extend([
            "-w".to_string(),
            self.cfg.container_workdir.clone(),
            "-v".to_string(),
            format!("{}:{}", self.host_workdir.display(), self.cfg.container_workdir),
        ]);
        if !self.cfg.memory_limit.is_empty() {
            args.extend(["--memory".to_string(), self.cfg.memory_limit.clone()]);
        }
        if !self.cfg.memory_swap.is_empty() {
            args.extend(["--memory-swap".to_string(), self.cfg.memory_swap.clone()]);
        }
        for volume in &self.cfg.volumes {
            args.extend(["-v".to_string(), volume.clone()]);
        }
        args.push(self.cfg.image.clone());
        args.extend(tail);
        args
    }
}

/// `<runtime> kill <name>...`
pub fn kill_containers_command(runtime: &str, names: &[String]) -> Command {
    let mut cmd = Command::new(runtime);
    cmd.arg("kill").args(names);
    cmd
}

pub fn image_mimetype(image_name: &str) -> &'static str {
    let ext = Path::new(image_name)
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "tif" | "tiff" => "image/tiff",
        "jpg" | "jpeg" => "image/jpeg",
        "jp2" => "image/jp2",
        "png" => "image/png",
        _ => "application/octet-stream",
    }
}

fn container_safe(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}
