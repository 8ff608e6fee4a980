use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::metrics::AggregationPolicy;

#[derive(Parser, Debug)]
#[command(
    name = "rollseg",
    version,
    about = "Resumable piano-roll segmentation and mask-agreement evaluation"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    Run(RunArgs),
    Status(StatusArgs),
    Evaluate(EvaluateArgs),
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    #[arg(long, default_value = ".")]
    pub root: PathBuf,

    #[arg(long)]
    pub manufacturer: String,

    #[arg(long)]
    pub config: Option<PathBuf>,

    #[arg(long)]
    pub device: Option<String>,

    #[arg(long)]
    pub checkpoint: Option<String>,

    /// Per-call limit for stage commands; 0 disables it.
    #[arg(long)]
    pub stage_timeout_secs: Option<u64>,

    #[arg(long, value_enum)]
    pub aggregation: Option<AggregationPolicy>,

    #[arg(long, default_value_t = false)]
    pub no_palette_remap: bool,

    #[arg(long)]
    pub scripts_dir: Option<PathBuf>,

    #[arg(long = "target")]
    pub targets: Vec<String>,
}

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    #[arg(long, default_value = ".")]
    pub root: PathBuf,

    #[arg(long)]
    pub manufacturer: String,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum PolicySelection {
    MeanOfRatios,
    PooledRatio,
    Both,
}

impl PolicySelection {
    pub fn policies(self) -> &'static [AggregationPolicy] {
        match self {
            Self::MeanOfRatios => &[AggregationPolicy::MeanOfRatios],
            Self::PooledRatio => &[AggregationPolicy::PooledRatio],
            Self::Both => &[AggregationPolicy::MeanOfRatios, AggregationPolicy::PooledRatio],
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct EvaluateArgs {
    #[arg(long)]
    pub reference_dir: PathBuf,

    #[arg(long)]
    pub candidate_dir: PathBuf,

    #[arg(long, value_enum, default_value_t = PolicySelection::Both)]
    pub policy: PolicySelection,

    #[arg(long)]
    pub ledger: Option<PathBuf>,

    /// Column prefix used in the ledger header.
    #[arg(long, default_value = "persam")]
    pub label: String,
}
