use std::fmt;

use serde::Serialize;
use serde_json::Value;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    Segment,
    RefineZeroShot,
    RefineFineTuned,
    Evaluate,
}

impl Stage {
    pub const ALL: [Stage; 4] = [
        Stage::Segment,
        Stage::RefineZeroShot,
        Stage::RefineFineTuned,
        Stage::Evaluate,
    ];

    pub fn index(self) -> u8 {
        match self {
            Self::Segment => 1,
            Self::RefineZeroShot => 2,
            Self::RefineFineTuned => 3,
            Self::Evaluate => 4,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Segment => "segment",
            Self::RefineZeroShot => "refine-zero-shot",
            Self::RefineFineTuned => "refine-fine-tuned",
            Self::Evaluate => "evaluate",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stage {} ({})", self.index(), self.as_str())
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RefineVariant {
    ZeroShot,
    FineTuned,
}

impl RefineVariant {
    pub const ALL: [RefineVariant; 2] = [RefineVariant::ZeroShot, RefineVariant::FineTuned];

    pub fn stage(self) -> Stage {
        match self {
            Self::ZeroShot => Stage::RefineZeroShot,
            Self::FineTuned => Stage::RefineFineTuned,
        }
    }

    /// Column prefix in manifests and ledgers.
    pub fn metric_prefix(self) -> &'static str {
        match self {
            Self::ZeroShot => "persam",
            Self::FineTuned => "persam_f",
        }
    }

    pub fn results_dir_name(self) -> &'static str {
        match self {
            Self::ZeroShot => "PerSAM results",
            Self::FineTuned => "PerSAM_F results",
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum PromptMode {
    Box,
    Points,
}

impl PromptMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "box" => Some(Self::Box),
            "points" => Some(Self::Points),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Box => "box",
            Self::Points => "points",
        }
    }
}

impl fmt::Display for PromptMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Segmenter prompt. The raw text is what gets handed to the segmenter;
/// the parsed values only exist to validate it.
#[derive(Clone, Debug, PartialEq)]
pub enum Prompt {
    Box {
        raw: String,
        coords: [f64; 4],
    },
    Points {
        raw_points: String,
        raw_labels: String,
        points: Vec<[f64; 2]>,
        labels: Vec<u8>,
    },
}

impl Prompt {
    pub fn from_fields(
        mode: &str,
        box_field: &str,
        points_field: &str,
        labels_field: &str,
    ) -> Result<Self, String> {
        let mode = PromptMode::parse(mode).ok_or_else(|| {
            format!("mode `{}` not supported, expected `box` or `points`", mode.trim())
        })?;

        match mode {
            PromptMode::Box => {
                if box_field.trim().is_empty() {
                    return Err("box mode requires the box field".to_string());
                }
                if !points_field.trim().is_empty() || !labels_field.trim().is_empty() {
                    return Err("box mode row must not carry points or point labels".to_string());
                }
                let coords = parse_box(box_field)?;
                Ok(Self::Box {
                    raw: box_field.trim().to_string(),
                    coords,
                })
            }
            PromptMode::Points => {
                if points_field.trim().is_empty() {
                    return Err("points mode requires the points field".to_string());
                }
                if labels_field.trim().is_empty() {
                    return Err("points mode requires the point_labels field".to_string());
                }
                if !box_field.trim().is_empty() {
                    return Err("points mode row must not carry a box".to_string());
                }
                let points = parse_points(points_field)?;
                let labels = parse_labels(labels_field)?;
                if points.len() != labels.len() {
                    return Err(format!(
                        "{} points but {} point labels",
                        points.len(),
                        labels.len()
                    ));
                }
                Ok(Self::Points {
                    raw_points: points_field.trim().to_string(),
                    raw_labels: labels_field.trim().to_string(),
                    points,
                    labels,
                })
            }
        }
    }

    pub fn mode(&self) -> PromptMode {
        match self {
            Self::Box { .. } => PromptMode::Box,
            Self::Points { .. } => PromptMode::Points,
        }
    }

    /// Segmenter arguments for this prompt, passed through verbatim.
    pub fn command_args(&self) -> Vec<String> {
        match self {
            Self::Box { raw, .. } => vec!["-b".to_string(), raw.clone()],
            Self::Points {
                raw_points,
                raw_labels,
                ..
            } => vec![
                "-p".to_string(),
                raw_points.clone(),
                "-pl".to_string(),
                raw_labels.clone(),
            ],
        }
    }
}

fn parse_list(raw: &str, what: &str) -> Result<Vec<Value>, String> {
    let value: Value = serde_json::from_str(raw.trim())
        .map_err(|err| format!("{what} `{}` is not a list: {err}", raw.trim()))?;
    match value {
        Value::Array(items) => Ok(items),
        _ => Err(format!("{what} `{}` is not a list", raw.trim())),
    }
}

fn as_number(value: &Value, what: &str) -> Result<f64, String> {
    value
        .as_f64()
        .ok_or_else(|| format!("{what} contains non-numeric value `{value}`"))
}

fn parse_box(raw: &str) -> Result<[f64; 4], String> {
    let items = parse_list(raw, "box")?;
    let nested = match items.as_slice() {
        [Value::Array(inner)] => Some(inner.clone()),
        _ => None,
    };
    let items = nested.unwrap_or(items);
    if items.len() != 4 {
        return Err(format!("box needs 4 numbers, found {}", items.len()));
    }

    let mut coords = [0.0; 4];
    for (slot, item) in coords.iter_mut().zip(&items) {
        *slot = as_number(item, "box")?;
    }
    Ok(coords)
}

fn parse_points(raw: &str) -> Result<Vec<[f64; 2]>, String> {
    let items = parse_list(raw, "points")?;
    if items.is_empty() {
        return Err("points list is empty".to_string());
    }

    items
        .iter()
        .map(|item| match item {
            Value::Array(pair) if pair.len() == 2 => {
                Ok([as_number(&pair[0], "points")?, as_number(&pair[1], "points")?])
            }
            other => Err(format!("point `{other}` is not an [x, y] pair")),
        })
        .collect()
}

fn parse_labels(raw: &str) -> Result<Vec<u8>, String> {
    parse_list(raw, "point_labels")?
        .iter()
        .map(|item| match item.as_u64() {
            Some(0) => Ok(0),
            Some(1) => Ok(1),
            _ => Err(format!("point label `{item}` must be 0 or 1")),
        })
        .collect()
}

/// Highest stage a manifest row has completed.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum Watermark {
    #[default]
    Empty,
    Stage(u8),
}

impl Watermark {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "" => Some(Self::Empty),
            value => match value.parse::<u8>() {
                Ok(level @ 0..=4) => Some(Self::Stage(level)),
                _ => None,
            },
        }
    }

    pub fn level(self) -> u8 {
        match self {
            Self::Empty => 0,
            Self::Stage(level) => level,
        }
    }

    pub fn is_eligible_for(self, stage: Stage) -> bool {
        match self {
            Self::Empty => true,
            Self::Stage(level) => level < stage.index(),
        }
    }

    pub fn completed(stage: Stage) -> Self {
        Self::Stage(stage.index())
    }
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => Ok(()),
            Self::Stage(level) => write!(f, "{level}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregateResult {
    pub target: String,
    pub rows: usize,
    pub persam_miou: f64,
    pub persam_macc: f64,
    pub persam_f_miou: f64,
    pub persam_f_macc: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StagePass {
    pub stage: Stage,
    pub rows: usize,
    pub eligible: usize,
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub blocked: usize,
    pub skipped: usize,
}

impl StagePass {
    pub fn new(stage: Stage) -> Self {
        Self {
            stage,
            rows: 0,
            eligible: 0,
            attempted: 0,
            succeeded: 0,
            failed: 0,
            blocked: 0,
            skipped: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TargetReport {
    pub target: String,
    pub manifest_path: String,
    pub manifest_sha256: Option<String>,
    pub status: String,
    pub failed_stage: Option<Stage>,
    pub failure_reason: Option<String>,
    pub stages: Vec<StagePass>,
    pub aggregate: Option<AggregateResult>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunPaths {
    pub root: String,
    pub manufacturer: String,
    pub manifest_dir: String,
    pub outputs_dir: String,
    pub manufacturer_summary_path: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSettings {
    pub device: String,
    pub checkpoint: String,
    pub stage_timeout_secs: Option<u64>,
    pub aggregation: String,
    pub remap_palette: bool,
    pub target_filter: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineRunReport {
    pub report_version: u32,
    pub run_id: String,
    pub status: String,
    pub started_at: String,
    pub updated_at: String,
    pub command: String,
    pub paths: RunPaths,
    pub settings: RunSettings,
    pub targets: Vec<TargetReport>,
    pub manufacturer_aggregate: Option<AggregateResult>,
    pub warnings: Vec<String>,
}
