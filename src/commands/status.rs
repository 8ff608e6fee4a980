use std::collections::BTreeMap;
use std::fs;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::cli::StatusArgs;
use crate::model::RefineVariant;
use crate::pipeline::layout::OutputLayout;
use crate::pipeline::manifest::{self, Manifest};
use crate::util::has_extension;

pub fn run(args: StatusArgs) -> Result<()> {
    let layout = OutputLayout::new(&args.root, &args.manufacturer);
    let manifest_dir = layout.manifest_dir();

    info!(
        root = %args.root.display(),
        manufacturer = %args.manufacturer,
        "status requested"
    );

    let mut paths = Vec::new();
    for entry in fs::read_dir(&manifest_dir)
        .with_context(|| format!("failed to read {}", manifest_dir.display()))?
    {
        let entry = entry.with_context(|| format!("failed to read {}", manifest_dir.display()))?;
        paths.push(entry.path());
    }
    paths.sort();

    for path in paths {
        if has_extension(&path, &["partial"]) {
            warn!(path = %path.display(), "interrupted manifest rewrite present");
            continue;
        }
        if !path.is_file() || !has_extension(&path, &["csv"]) {
            continue;
        }

        match manifest::load(&path) {
            Ok(manifest) => log_manifest(&manifest),
            Err(err) => warn!(path = %path.display(), error = %err, "manifest unreadable"),
        }

        if let Some(target) = manifest::target_name(&path) {
            let summary = layout.target_summary(&target);
            if summary.exists() {
                info!(target = %target, path = %summary.display(), "target summary present");
            }
        }
    }

    let manufacturer_summary = layout.manufacturer_summary();
    if manufacturer_summary.exists() {
        info!(path = %manufacturer_summary.display(), "manufacturer summary present");
    } else {
        warn!(path = %manufacturer_summary.display(), "manufacturer summary missing");
    }

    Ok(())
}

fn log_manifest(manifest: &Manifest) {
    let mut by_watermark: BTreeMap<String, usize> = BTreeMap::new();
    for row in manifest.rows() {
        let key = match row.done.to_string() {
            empty if empty.is_empty() => "empty".to_string(),
            level => level,
        };
        *by_watermark.entry(key).or_default() += 1;
    }

    let with_metrics = manifest
        .rows()
        .iter()
        .filter(|row| {
            RefineVariant::ALL
                .iter()
                .all(|variant| row.metrics(*variant).is_some())
        })
        .count();

    info!(
        target = %manifest.target(),
        rows = manifest.len(),
        watermarks = ?by_watermark,
        with_metrics,
        "manifest status"
    );
}
