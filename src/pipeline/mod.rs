pub mod evaluate;
pub mod layout;
pub mod manifest;
pub mod operations;
pub mod reports;
pub mod stage;

#[cfg(test)]
mod tests;

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use crate::config::PipelineConfig;
use crate::model::{AggregateResult, Stage, TargetReport};
use crate::pipeline::manifest::{ManifestRow, target_name};
use crate::pipeline::operations::StageOperations;
use crate::pipeline::reports::{aggregate_rows, write_summary};
use crate::pipeline::stage::{StageContext, run_stage};
use crate::util::{has_extension, sha256_file};

pub struct PipelineOutcome {
    pub targets: Vec<TargetReport>,
    pub manufacturer_aggregate: Option<AggregateResult>,
    pub manufacturer_summary_path: Option<PathBuf>,
    pub warnings: Vec<String>,
}

impl PipelineOutcome {
    pub fn failed_targets(&self) -> usize {
        self.targets
            .iter()
            .filter(|target| target.status == "failed")
            .count()
    }
}

/// Manifest files in sorted order, filtered by the configured targets.
pub fn discover_manifests(
    config: &PipelineConfig,
    warnings: &mut Vec<String>,
) -> Result<Vec<PathBuf>> {
    let dir = config.layout.manifest_dir();
    let mut paths = Vec::new();
    for entry in fs::read_dir(&dir)
        .with_context(|| format!("failed to read manifest directory {}", dir.display()))?
    {
        let entry = entry.with_context(|| {
            format!("failed to read manifest directory entry in {}", dir.display())
        })?;
        paths.push(entry.path());
    }
    paths.sort();

    let mut manifests = Vec::new();
    for path in paths {
        if !path.is_file() {
            continue;
        }
        if has_extension(&path, &["partial"]) {
            warn!(
                path = %path.display(),
                "interrupted manifest rewrite left behind, original manifest is intact"
            );
            warnings.push(format!("interrupted rewrite: {}", path.display()));
            continue;
        }
        if !has_extension(&path, &["csv"]) {
            warn!(path = %path.display(), "skipping non-CSV file in manifest directory");
            warnings.push(format!("skipped non-CSV file: {}", path.display()));
            continue;
        }

        let Some(target) = target_name(&path) else {
            warnings.push(format!("skipped manifest with non UTF-8 name: {}", path.display()));
            continue;
        };
        if config.includes_target(&target) {
            manifests.push(path);
        }
    }

    for wanted in &config.targets {
        let found = manifests
            .iter()
            .any(|path| target_name(path).as_deref() == Some(wanted.as_str()));
        if !found {
            warn!(target = %wanted, "requested target has no manifest");
            warnings.push(format!("no manifest for requested target {wanted}"));
        }
    }

    Ok(manifests)
}

/// Drives every discovered target through stages 1 to 4, then writes the
/// per-target and per-manufacturer summaries. Target failures are contained.
pub fn run_pipeline(
    config: &PipelineConfig,
    operations: &mut dyn StageOperations,
) -> Result<PipelineOutcome> {
    let mut warnings = Vec::new();
    let manifests = discover_manifests(config, &mut warnings)?;
    info!(
        manufacturer = config.layout.manufacturer(),
        manifests = manifests.len(),
        "discovered manifests"
    );

    let mut targets = Vec::with_capacity(manifests.len());
    let mut summaries = Vec::new();
    let mut finished_rows: Vec<ManifestRow> = Vec::new();

    for path in &manifests {
        let report = run_target(config, &mut *operations, path);
        if report.status == "failed" {
            warnings.push(format!(
                "target {} failed: {}",
                report.target,
                report.failure_reason.as_deref().unwrap_or("unknown")
            ));
        }
        if let Some(aggregate) = &report.aggregate {
            summaries.push(aggregate.clone());
        }
        if let Ok(manifest) = manifest::load(path) {
            finished_rows.extend(manifest.into_rows());
        }
        targets.push(report);
    }

    let manufacturer = config.layout.manufacturer();
    let manufacturer_aggregate = aggregate_rows(manufacturer, &finished_rows);
    let mut manufacturer_summary_path = None;
    match &manufacturer_aggregate {
        Some(aggregate) if !summaries.is_empty() => {
            let path = config.layout.manufacturer_summary();
            let mut rows = summaries.clone();
            rows.push(aggregate.clone());
            write_summary(&path, &rows).with_context(|| {
                format!("failed to write manufacturer summary {}", path.display())
            })?;
            info!(
                path = %path.display(),
                targets = summaries.len(),
                rows = aggregate.rows,
                persam_miou = aggregate.persam_miou,
                persam_f_miou = aggregate.persam_f_miou,
                "manufacturer summary written"
            );
            manufacturer_summary_path = Some(path);
        }
        _ => info!(
            manufacturer,
            "no target summarized in this run, manufacturer summary not written"
        ),
    }

    Ok(PipelineOutcome {
        targets,
        manufacturer_aggregate,
        manufacturer_summary_path,
        warnings,
    })
}

fn run_target(
    config: &PipelineConfig,
    operations: &mut dyn StageOperations,
    path: &Path,
) -> TargetReport {
    let target = target_name(path).unwrap_or_default();
    info!(target = %target, manifest = %path.display(), "processing target");

    let mut report = TargetReport {
        target: target.clone(),
        manifest_path: path.display().to_string(),
        manifest_sha256: None,
        status: "running".to_string(),
        failed_stage: None,
        failure_reason: None,
        stages: Vec::with_capacity(Stage::ALL.len()),
        aggregate: None,
    };

    let mut ctx = StageContext { config, operations };
    for stage in Stage::ALL {
        match run_stage(path, stage, &mut ctx) {
            Ok(pass) => report.stages.push(pass),
            Err(err) => {
                let err = anyhow::Error::new(err);
                error!(
                    target = %target,
                    stage = stage.as_str(),
                    error = %format!("{err:#}"),
                    "target failed"
                );
                report.status = "failed".to_string();
                report.failed_stage = Some(stage);
                report.failure_reason = Some(format!("{err:#}"));
                report.manifest_sha256 = sha256_file(path).ok();
                return report;
            }
        }
    }

    let evaluated = report
        .stages
        .last()
        .map(|pass| pass.succeeded)
        .unwrap_or(0);
    if evaluated > 0 {
        match summarize_target(config, path, &target) {
            Ok(aggregate) => report.aggregate = aggregate,
            Err(err) => {
                error!(
                    target = %target,
                    error = %format!("{err:#}"),
                    "failed to write target summary"
                );
                report.status = "failed".to_string();
                report.failure_reason = Some(format!("{err:#}"));
            }
        }
    } else {
        info!(target = %target, "no row reached stage 4 in this run, summary not written");
    }

    if report.status == "running" {
        report.status = "completed".to_string();
    }
    report.manifest_sha256 = match sha256_file(path) {
        Ok(hash) => Some(hash),
        Err(err) => {
            warn!(target = %target, error = %err, "failed to hash manifest");
            None
        }
    };
    report
}

fn summarize_target(
    config: &PipelineConfig,
    path: &Path,
    target: &str,
) -> Result<Option<AggregateResult>> {
    let manifest = manifest::load(path)?;
    let Some(aggregate) = aggregate_rows(target, manifest.rows()) else {
        return Ok(None);
    };

    let summary_path = config.layout.target_summary(target);
    write_summary(&summary_path, std::slice::from_ref(&aggregate))
        .with_context(|| format!("failed to write target summary {}", summary_path.display()))?;
    info!(
        target = %target,
        path = %summary_path.display(),
        rows = aggregate.rows,
        persam_miou = aggregate.persam_miou,
        persam_macc = aggregate.persam_macc,
        persam_f_miou = aggregate.persam_f_miou,
        persam_f_macc = aggregate.persam_f_macc,
        "target summary written"
    );
    Ok(Some(aggregate))
}
