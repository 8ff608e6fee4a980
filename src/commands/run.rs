use anyhow::Result;
use chrono::Utc;
use tracing::{info, warn};

use crate::cli::RunArgs;
use crate::config::PipelineConfig;
use crate::model::{PipelineRunReport, RunPaths, RunSettings};
use crate::pipeline::operations::CommandStageOperations;
use crate::pipeline::run_pipeline;
use crate::util::{now_utc_string, utc_compact_string, write_json_pretty};

const REPORT_VERSION: u32 = 1;

pub fn run(args: RunArgs) -> Result<()> {
    let started_ts = Utc::now();
    let started_at = now_utc_string();
    let run_id = format!("run-{}", utc_compact_string(started_ts));

    let config = PipelineConfig::resolve(&args)?;
    let layout = &config.layout;
    let report_path = layout
        .run_report_dir()
        .join(format!("run_{}.json", utc_compact_string(started_ts)));

    info!(
        root = %layout.root().display(),
        manufacturer = layout.manufacturer(),
        run_id = %run_id,
        device = %config.device,
        aggregation = %config.aggregation,
        "starting pipeline run"
    );

    let mut report = PipelineRunReport {
        report_version: REPORT_VERSION,
        run_id: run_id.clone(),
        status: "running".to_string(),
        started_at,
        updated_at: now_utc_string(),
        command: render_run_command(&args),
        paths: RunPaths {
            root: layout.root().display().to_string(),
            manufacturer: layout.manufacturer().to_string(),
            manifest_dir: layout.manifest_dir().display().to_string(),
            outputs_dir: layout.outputs_dir().display().to_string(),
            manufacturer_summary_path: None,
        },
        settings: RunSettings {
            device: config.device.clone(),
            checkpoint: config.checkpoint.clone(),
            stage_timeout_secs: config.stage_timeout_secs(),
            aggregation: config.aggregation.to_string(),
            remap_palette: config.remap_palette,
            target_filter: config.targets.clone(),
        },
        targets: Vec::new(),
        manufacturer_aggregate: None,
        warnings: Vec::new(),
    };
    write_json_pretty(&report_path, &report)?;

    let mut operations = CommandStageOperations::new(
        config.commands.clone(),
        layout.root(),
        layout.manufacturer(),
        &config.device,
        &config.checkpoint,
        config.stage_timeout,
    )
    .with_working_dir(config.scripts_dir.clone());

    let outcome = match run_pipeline(&config, &mut operations) {
        Ok(outcome) => outcome,
        Err(err) => {
            report.status = "failed".to_string();
            report.updated_at = now_utc_string();
            report.warnings.push(format!("{err:#}"));
            write_json_pretty(&report_path, &report)?;
            return Err(err);
        }
    };

    let failed_targets = outcome.failed_targets();
    report.status = if failed_targets == 0 {
        "completed".to_string()
    } else {
        "completed_with_failures".to_string()
    };
    report.updated_at = now_utc_string();
    report.paths.manufacturer_summary_path = outcome
        .manufacturer_summary_path
        .as_ref()
        .map(|path| path.display().to_string());
    report.manufacturer_aggregate = outcome.manufacturer_aggregate;
    report.warnings = outcome.warnings;
    report.targets = outcome.targets;

    write_json_pretty(&report_path, &report)?;
    info!(path = %report_path.display(), "wrote run report");

    if failed_targets > 0 {
        warn!(
            failed_targets,
            targets = report.targets.len(),
            "pipeline finished with failed targets"
        );
    } else {
        info!(targets = report.targets.len(), "pipeline completed");
    }

    Ok(())
}

fn render_run_command(args: &RunArgs) -> String {
    let mut command = vec![
        "rollseg".to_string(),
        "run".to_string(),
        "--root".to_string(),
        args.root.display().to_string(),
        "--manufacturer".to_string(),
        args.manufacturer.clone(),
    ];

    if let Some(path) = &args.config {
        command.push("--config".to_string());
        command.push(path.display().to_string());
    }
    if let Some(device) = &args.device {
        command.push("--device".to_string());
        command.push(device.clone());
    }
    if let Some(checkpoint) = &args.checkpoint {
        command.push("--checkpoint".to_string());
        command.push(checkpoint.clone());
    }
    if let Some(secs) = args.stage_timeout_secs {
        command.push("--stage-timeout-secs".to_string());
        command.push(secs.to_string());
    }
    if let Some(policy) = args.aggregation {
        command.push("--aggregation".to_string());
        command.push(policy.to_string());
    }
    if args.no_palette_remap {
        command.push("--no-palette-remap".to_string());
    }
    if let Some(dir) = &args.scripts_dir {
        command.push("--scripts-dir".to_string());
        command.push(dir.display().to_string());
    }
    for target in &args.targets {
        command.push("--target".to_string());
        command.push(target.clone());
    }

    command.join(" ")
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::metrics::AggregationPolicy;

    #[test]
    fn rendered_command_lists_only_given_flags() {
        let args = RunArgs {
            root: PathBuf::from("/rolls"),
            manufacturer: "Welte".to_string(),
            config: None,
            device: Some("cuda".to_string()),
            checkpoint: None,
            stage_timeout_secs: Some(0),
            aggregation: Some(AggregationPolicy::PooledRatio),
            no_palette_remap: true,
            scripts_dir: None,
            targets: vec!["label".to_string(), "stamp".to_string()],
        };

        assert_eq!(
            render_run_command(&args),
            "rollseg run --root /rolls --manufacturer Welte --device cuda --stage-timeout-secs 0 \
             --aggregation pooled-ratio --no-palette-remap --target label --target stamp"
        );
    }
}
