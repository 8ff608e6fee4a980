use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use crate::cli::RunArgs;
use crate::mask::MaskPalette;
use crate::metrics::AggregationPolicy;
use crate::pipeline::layout::OutputLayout;
use crate::pipeline::operations::{CommandTemplate, StageCommands};

pub const DEFAULT_DEVICE: &str = "cpu";
pub const DEFAULT_CHECKPOINT: &str = "sam_vit_h_4b8939.pth";
pub const DEFAULT_STAGE_TIMEOUT_SECS: u64 = 3600;

/// Everything one pipeline run needs, resolved once and passed down explicitly.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub layout: OutputLayout,
    pub device: String,
    pub checkpoint: String,
    pub stage_timeout: Option<Duration>,
    pub aggregation: AggregationPolicy,
    pub remap_palette: bool,
    pub palette: MaskPalette,
    pub commands: StageCommands,
    pub scripts_dir: Option<PathBuf>,
    pub targets: Vec<String>,
}

impl PipelineConfig {
    pub fn new(layout: OutputLayout) -> Self {
        Self {
            layout,
            device: DEFAULT_DEVICE.to_string(),
            checkpoint: DEFAULT_CHECKPOINT.to_string(),
            stage_timeout: timeout_from_secs(DEFAULT_STAGE_TIMEOUT_SECS),
            aggregation: AggregationPolicy::default(),
            remap_palette: true,
            palette: MaskPalette::default(),
            commands: StageCommands::default(),
            scripts_dir: None,
            targets: Vec::new(),
        }
    }

    pub fn includes_target(&self, target: &str) -> bool {
        self.targets.is_empty() || self.targets.iter().any(|name| name == target)
    }

    /// CLI flags win over the config file, which wins over defaults.
    pub fn resolve(args: &RunArgs) -> Result<Self> {
        if args.manufacturer.trim().is_empty() {
            bail!("--manufacturer must not be empty");
        }

        let file = match &args.config {
            Some(path) => ConfigFile::from_toml_file(path)?,
            None => ConfigFile::default(),
        };

        // Stage commands may run from the scripts directory, so every path
        // handed to them has to be absolute.
        let root = std::path::absolute(&args.root)
            .with_context(|| format!("failed to resolve root {}", args.root.display()))?;
        let mut config = Self::new(OutputLayout::new(root, args.manufacturer.trim()));
        config.apply_file(file);

        if let Some(device) = &args.device {
            config.device = device.clone();
        }
        if let Some(checkpoint) = &args.checkpoint {
            config.checkpoint = checkpoint.clone();
        }
        if let Some(secs) = args.stage_timeout_secs {
            config.stage_timeout = timeout_from_secs(secs);
        }
        if let Some(policy) = args.aggregation {
            config.aggregation = policy;
        }
        if args.no_palette_remap {
            config.remap_palette = false;
        }
        if let Some(dir) = &args.scripts_dir {
            config.scripts_dir = Some(dir.clone());
        }
        if !args.targets.is_empty() {
            config.targets = args.targets.clone();
        }

        Ok(config)
    }

    fn apply_file(&mut self, file: ConfigFile) {
        if let Some(device) = file.device {
            self.device = device;
        }
        if let Some(checkpoint) = file.checkpoint {
            self.checkpoint = checkpoint;
        }
        if let Some(secs) = file.stage_timeout_secs {
            self.stage_timeout = timeout_from_secs(secs);
        }
        if let Some(policy) = file.aggregation {
            self.aggregation = policy;
        }
        if let Some(remap) = file.remap_palette {
            self.remap_palette = remap;
        }
        if let Some(dir) = file.scripts_dir {
            self.scripts_dir = Some(dir);
        }
        if let Some(targets) = file.targets {
            self.targets = targets;
        }

        let commands = file.commands;
        if let Some(segment) = commands.segment {
            self.commands.segment = segment;
        }
        if let Some(refine) = commands.refine_zero_shot {
            self.commands.refine_zero_shot = refine;
        }
        if let Some(refine) = commands.refine_fine_tuned {
            self.commands.refine_fine_tuned = refine;
        }
    }

    pub fn stage_timeout_secs(&self) -> Option<u64> {
        self.stage_timeout.map(|timeout| timeout.as_secs())
    }
}

fn timeout_from_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub device: Option<String>,
    pub checkpoint: Option<String>,
    pub stage_timeout_secs: Option<u64>,
    pub aggregation: Option<AggregationPolicy>,
    pub remap_palette: Option<bool>,
    pub scripts_dir: Option<PathBuf>,
    pub targets: Option<Vec<String>>,
    #[serde(default)]
    pub commands: CommandOverrides,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandOverrides {
    pub segment: Option<CommandTemplate>,
    pub refine_zero_shot: Option<CommandTemplate>,
    pub refine_fine_tuned: Option<CommandTemplate>,
}

impl ConfigFile {
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_toml(&content)
            .with_context(|| format!("failed to parse config {}", path.display()))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let file: ConfigFile = toml::from_str(content)?;
        for (name, template) in [
            ("segment", &file.commands.segment),
            ("refine_zero_shot", &file.commands.refine_zero_shot),
            ("refine_fine_tuned", &file.commands.refine_fine_tuned),
        ] {
            if let Some(template) = template
                && template.program.trim().is_empty()
            {
                bail!("command `{name}` has an empty program");
            }
        }
        Ok(file)
    }
}
