use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::StageError;
use crate::model::{Prompt, PromptMode, RefineVariant, Stage};

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const PROMPT_PLACEHOLDER: &str = "{prompt}";

pub struct SegmentRequest<'a> {
    pub target: &'a str,
    pub image_id: &'a str,
    pub prompt: &'a Prompt,
    pub image_path: &'a Path,
    pub mask_dir: &'a Path,
    pub overlay_dir: &'a Path,
}

pub struct RefineRequest<'a> {
    pub variant: RefineVariant,
    pub target: &'a str,
    pub image_id: &'a str,
    pub mode: PromptMode,
    pub image_path: &'a Path,
    pub reference_mask: &'a Path,
    pub output_dir: &'a Path,
}

/// External segmentation collaborators. Implementations only report
/// success or failure; their outputs are found through the output layout.
pub trait StageOperations {
    fn segment(&mut self, request: &SegmentRequest<'_>) -> Result<(), StageError>;

    fn refine(&mut self, request: &RefineRequest<'_>) -> Result<(), StageError>;
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandTemplate {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandTemplate {
    pub fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|arg| arg.to_string()).collect(),
        }
    }

    /// Substitutes `{name}` placeholders. An argument that is exactly
    /// `{prompt}` is replaced by the prompt's own arguments.
    pub fn expand(&self, vars: &[(&str, String)], prompt: Option<&Prompt>) -> Vec<String> {
        let mut expanded = Vec::with_capacity(self.args.len() + 4);
        for arg in &self.args {
            if arg == PROMPT_PLACEHOLDER {
                if let Some(prompt) = prompt {
                    expanded.extend(prompt.command_args());
                }
                continue;
            }

            let mut value = arg.clone();
            for (name, replacement) in vars {
                let placeholder = format!("{{{name}}}");
                if value.contains(&placeholder) {
                    value = value.replace(&placeholder, replacement);
                }
            }
            expanded.push(value);
        }
        expanded
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageCommands {
    pub segment: CommandTemplate,
    pub refine_zero_shot: CommandTemplate,
    pub refine_fine_tuned: CommandTemplate,
}

impl StageCommands {
    pub fn refine(&self, variant: RefineVariant) -> &CommandTemplate {
        match variant {
            RefineVariant::ZeroShot => &self.refine_zero_shot,
            RefineVariant::FineTuned => &self.refine_fine_tuned,
        }
    }
}

impl Default for StageCommands {
    fn default() -> Self {
        let refine_args = [
            "-io",
            "{root}",
            "-ma",
            "{manufacturer}",
            "-t",
            "{target}",
            "-i",
            "{image}",
            "-m",
            "{mode}",
        ];
        Self {
            segment: CommandTemplate::new(
                "python",
                &[
                    "FastSAM_MIMUL.py",
                    "-d",
                    "{device}",
                    "-io",
                    "{root}",
                    "-ma",
                    "{manufacturer}",
                    "-t",
                    "{target}",
                    "-i",
                    "{image}",
                    "-m",
                    "{mode}",
                    PROMPT_PLACEHOLDER,
                ],
            ),
            refine_zero_shot: CommandTemplate::new(
                "python",
                &[&["perSAM_MIMUL.py"][..], &refine_args[..]].concat(),
            ),
            refine_fine_tuned: CommandTemplate::new(
                "python",
                &[&["PerSAM_F_MIMUL.py"][..], &refine_args[..]].concat(),
            ),
        }
    }
}

/// Runs each stage as a child process built from a command template.
pub struct CommandStageOperations {
    commands: StageCommands,
    root: PathBuf,
    manufacturer: String,
    device: String,
    checkpoint: String,
    timeout: Option<Duration>,
    working_dir: Option<PathBuf>,
}

impl CommandStageOperations {
    pub fn new(
        commands: StageCommands,
        root: &Path,
        manufacturer: &str,
        device: &str,
        checkpoint: &str,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            commands,
            root: root.to_path_buf(),
            manufacturer: manufacturer.to_string(),
            device: device.to_string(),
            checkpoint: checkpoint.to_string(),
            timeout,
            working_dir: None,
        }
    }

    pub fn with_working_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.working_dir = dir;
        self
    }

    fn base_vars(
        &self,
        target: &str,
        image_id: &str,
        mode: PromptMode,
    ) -> Vec<(&'static str, String)> {
        vec![
            ("device", self.device.clone()),
            ("checkpoint", self.checkpoint.clone()),
            ("root", self.root.display().to_string()),
            ("manufacturer", self.manufacturer.clone()),
            ("target", target.to_string()),
            ("image", image_id.to_string()),
            ("mode", mode.as_str().to_string()),
        ]
    }

    fn execute(
        &self,
        stage: Stage,
        image_id: &str,
        template: &CommandTemplate,
        args: Vec<String>,
    ) -> Result<(), StageError> {
        let mut command = Command::new(&template.program);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        debug!(
            stage = stage.as_str(),
            image = image_id,
            program = %template.program,
            args = ?args,
            "launching stage command"
        );

        let child = command.spawn().map_err(|source| StageError::Launch {
            stage,
            program: template.program.clone(),
            source,
        })?;

        let status = wait_with_timeout(child, self.timeout, stage, image_id)?;
        if status.success() {
            Ok(())
        } else {
            Err(StageError::OperationFailed {
                stage,
                image: image_id.to_string(),
                reason: format!("`{}` exited with {status}", template.program),
            })
        }
    }
}

impl StageOperations for CommandStageOperations {
    fn segment(&mut self, request: &SegmentRequest<'_>) -> Result<(), StageError> {
        let mode = request.prompt.mode();
        let mut vars = self.base_vars(request.target, request.image_id, mode);
        vars.push(("image_path", request.image_path.display().to_string()));
        vars.push(("mask_dir", request.mask_dir.display().to_string()));
        vars.push(("overlay_dir", request.overlay_dir.display().to_string()));

        let template = &self.commands.segment;
        let args = template.expand(&vars, Some(request.prompt));
        self.execute(Stage::Segment, request.image_id, template, args)
    }

    fn refine(&mut self, request: &RefineRequest<'_>) -> Result<(), StageError> {
        let mut vars = self.base_vars(request.target, request.image_id, request.mode);
        vars.push(("image_path", request.image_path.display().to_string()));
        vars.push(("reference_mask", request.reference_mask.display().to_string()));
        vars.push(("output_dir", request.output_dir.display().to_string()));

        let template = self.commands.refine(request.variant);
        let args = template.expand(&vars, None);
        self.execute(request.variant.stage(), request.image_id, template, args)
    }
}

fn wait_with_timeout(
    mut child: Child,
    timeout: Option<Duration>,
    stage: Stage,
    image_id: &str,
) -> Result<ExitStatus, StageError> {
    let wait_error = |err: std::io::Error| StageError::OperationFailed {
        stage,
        image: image_id.to_string(),
        reason: format!("failed to wait for child process: {err}"),
    };

    let Some(timeout) = timeout else {
        return child.wait().map_err(wait_error);
    };

    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait().map_err(wait_error)? {
            return Ok(status);
        }

        let now = Instant::now();
        if now >= deadline {
            warn!(
                stage = stage.as_str(),
                image = image_id,
                timeout_secs = timeout.as_secs(),
                "stage command timed out, killing child"
            );
            if let Err(err) = child.kill() {
                warn!(error = %err, "failed to kill timed out child");
            }
            let _ = child.wait();
            return Err(StageError::TimedOut {
                stage,
                image: image_id.to_string(),
                timeout,
            });
        }
        thread::sleep(POLL_INTERVAL.min(deadline - now));
    }
}
