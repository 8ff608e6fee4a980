use std::path::Path;

use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::error::{ManifestError, StageError};
use crate::mask::remap_mask_file;
use crate::model::{PromptMode, RefineVariant, Stage, StagePass, Watermark};
use crate::pipeline::evaluate::evaluate_row;
use crate::pipeline::manifest::{self, ManifestRewrite, ManifestRow};
use crate::pipeline::operations::{RefineRequest, SegmentRequest, StageOperations};

pub struct StageContext<'a> {
    pub config: &'a PipelineConfig,
    pub operations: &'a mut dyn StageOperations,
}

enum RowAction {
    Skip,
    Blocked,
    Run,
}

fn classify(done: Watermark, stage: Stage) -> RowAction {
    if !done.is_eligible_for(stage) {
        RowAction::Skip
    } else if done.level() + 1 < stage.index() {
        RowAction::Blocked
    } else {
        RowAction::Run
    }
}

/// One pass of `stage` over a manifest. Every row is written back exactly once,
/// in order; only rows that succeed advance their watermark.
pub fn run_stage(
    manifest_path: &Path,
    stage: Stage,
    ctx: &mut StageContext<'_>,
) -> Result<StagePass, ManifestError> {
    let manifest = manifest::load(manifest_path)?;
    let target = manifest.target().to_string();
    let mut rewrite = ManifestRewrite::begin(&manifest)?;

    let mut pass = StagePass::new(stage);
    pass.rows = manifest.len();

    for mut row in manifest.into_rows() {
        match classify(row.done, stage) {
            RowAction::Skip => pass.skipped += 1,
            RowAction::Blocked => {
                pass.eligible += 1;
                pass.blocked += 1;
                warn!(
                    target = %target,
                    image = %row.image,
                    stage = stage.as_str(),
                    done = %row.done,
                    "row blocked, previous stage has not completed"
                );
            }
            RowAction::Run => {
                pass.eligible += 1;
                pass.attempted += 1;
                match apply_stage(stage, &target, &mut row, ctx) {
                    Ok(()) => {
                        row.done = Watermark::completed(stage);
                        pass.succeeded += 1;
                        debug!(
                            target = %target,
                            image = %row.image,
                            stage = stage.as_str(),
                            "row advanced"
                        );
                    }
                    Err(err) => {
                        pass.failed += 1;
                        warn!(
                            target = %target,
                            image = %row.image,
                            stage = stage.as_str(),
                            error = %err,
                            "row failed, will retry on next run"
                        );
                    }
                }
            }
        }
        rewrite.append_row(&row)?;
    }

    let written = rewrite.rows_written();
    rewrite.commit(manifest_path)?;

    info!(
        target = %target,
        stage = stage.as_str(),
        rows = written,
        attempted = pass.attempted,
        succeeded = pass.succeeded,
        failed = pass.failed,
        blocked = pass.blocked,
        skipped = pass.skipped,
        "stage pass committed"
    );
    Ok(pass)
}

fn row_mode(row: &ManifestRow) -> Result<PromptMode, StageError> {
    row.prompt_mode().ok_or_else(|| StageError::InvalidPrompt {
        image: row.image.clone(),
        reason: format!("mode `{}` not supported", row.mode.trim()),
    })
}

fn apply_stage(
    stage: Stage,
    target: &str,
    row: &mut ManifestRow,
    ctx: &mut StageContext<'_>,
) -> Result<(), StageError> {
    match stage {
        Stage::Segment => segment_row(target, row, ctx),
        Stage::RefineZeroShot => refine_row(RefineVariant::ZeroShot, target, row, ctx),
        Stage::RefineFineTuned => refine_row(RefineVariant::FineTuned, target, row, ctx),
        Stage::Evaluate => {
            let mode = row_mode(row)?;
            let evaluation = evaluate_row(
                &ctx.config.layout,
                target,
                mode,
                row.image_id(),
                ctx.config.aggregation,
            )?;
            for variant in RefineVariant::ALL {
                row.set_metrics(variant, evaluation.score(variant));
            }
            Ok(())
        }
    }
}

fn segment_row(
    target: &str,
    row: &ManifestRow,
    ctx: &mut StageContext<'_>,
) -> Result<(), StageError> {
    let prompt = row.prompt().map_err(|reason| StageError::InvalidPrompt {
        image: row.image.clone(),
        reason,
    })?;
    let layout = &ctx.config.layout;
    let image_id = row.image_id();
    let mode = prompt.mode();

    ctx.operations.segment(&SegmentRequest {
        target,
        image_id,
        prompt: &prompt,
        image_path: &layout.source_image(image_id),
        mask_dir: &layout.segment_mask_dir(target, mode),
        overlay_dir: &layout.overlay_dir(target, mode),
    })?;

    let mask_path = layout.segment_mask(target, mode, image_id);
    if !mask_path.is_file() {
        return Err(StageError::OperationFailed {
            stage: Stage::Segment,
            image: row.image.clone(),
            reason: format!("no mask produced at {}", mask_path.display()),
        });
    }

    if ctx.config.remap_palette {
        let changed = remap_mask_file(&mask_path, &ctx.config.palette)?;
        debug!(mask = %mask_path.display(), changed, "palette remapped");
    }
    Ok(())
}

fn refine_row(
    variant: RefineVariant,
    target: &str,
    row: &ManifestRow,
    ctx: &mut StageContext<'_>,
) -> Result<(), StageError> {
    let layout = &ctx.config.layout;
    let mode = row_mode(row)?;
    let image_id = row.image_id();

    let reference_mask = layout.segment_mask(target, mode, image_id);
    if !reference_mask.is_file() {
        return Err(StageError::OperationFailed {
            stage: variant.stage(),
            image: row.image.clone(),
            reason: format!("coarse mask missing at {}", reference_mask.display()),
        });
    }

    ctx.operations.refine(&RefineRequest {
        variant,
        target,
        image_id,
        mode,
        image_path: &layout.source_image(image_id),
        reference_mask: &reference_mask,
        output_dir: &layout.refine_dir(variant, target, mode, image_id),
    })?;

    let mask_dir = layout.refine_mask_dir(variant, target, mode, image_id);
    if !mask_dir.is_dir() {
        return Err(StageError::OperationFailed {
            stage: variant.stage(),
            image: row.image.clone(),
            reason: format!("no masks produced in {}", mask_dir.display()),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_follows_watermark() {
        assert!(matches!(classify(Watermark::Empty, Stage::Segment), RowAction::Run));
        assert!(matches!(classify(Watermark::Stage(0), Stage::Segment), RowAction::Run));
        assert!(matches!(classify(Watermark::Stage(1), Stage::RefineZeroShot), RowAction::Run));
        assert!(matches!(classify(Watermark::Stage(3), Stage::RefineZeroShot), RowAction::Skip));
        assert!(matches!(classify(Watermark::Empty, Stage::Evaluate), RowAction::Blocked));
        assert!(matches!(
            classify(Watermark::Stage(1), Stage::RefineFineTuned),
            RowAction::Blocked
        ));
        assert!(matches!(classify(Watermark::Stage(4), Stage::Evaluate), RowAction::Skip));
    }

    #[cfg(unix)]
    #[test]
    fn relative_root_survives_a_separate_scripts_dir() {
        use std::fs;
        use std::path::PathBuf;

        use crate::cli::RunArgs;
        use crate::pipeline::operations::{CommandStageOperations, CommandTemplate};

        let root = tempfile::tempdir_in(".").expect("relative root");
        let scripts = tempfile::tempdir().expect("scripts dir");
        let relative_root = PathBuf::from(".").join(root.path().file_name().expect("dir name"));
        let args = RunArgs {
            root: relative_root,
            manufacturer: "Welte".to_string(),
            config: None,
            device: None,
            checkpoint: None,
            stage_timeout_secs: Some(30),
            aggregation: None,
            no_palette_remap: true,
            scripts_dir: Some(scripts.path().to_path_buf()),
            targets: Vec::new(),
        };
        let mut config = PipelineConfig::resolve(&args).expect("resolve");
        let writer = CommandTemplate::new(
            "sh",
            &["-c", "mkdir -p \"$0\" && printf x > \"$0/$1.png\"", "{mask_dir}", "{image}"],
        );
        config.commands.segment = writer;

        let manifest_dir = config.layout.manifest_dir();
        fs::create_dir_all(&manifest_dir).expect("manifest dir");
        let path = manifest_dir.join("label.csv");
        fs::write(
            &path,
            "image;mode;box;points;point_labels;done;persam_IoU;persam_Acc;persam_f_IoU;persam_f_Acc\n\
             roll_001;box;[0, 0, 10, 10];;;;;;;\n",
        )
        .expect("write manifest");

        let mut operations = CommandStageOperations::new(
            config.commands.clone(),
            config.layout.root(),
            config.layout.manufacturer(),
            &config.device,
            &config.checkpoint,
            config.stage_timeout,
        )
        .with_working_dir(config.scripts_dir.clone());
        let mut ctx = StageContext {
            config: &config,
            operations: &mut operations,
        };

        let pass = run_stage(&path, Stage::Segment, &mut ctx).expect("segment pass");

        assert_eq!(pass.succeeded, 1);
        assert_eq!(pass.failed, 0);
        assert!(config.layout.segment_mask("label", PromptMode::Box, "roll_001").is_file());
        assert_eq!(manifest::load(&path).expect("reload").rows()[0].done, Watermark::Stage(1));
        assert!(fs::read_dir(scripts.path()).expect("scripts dir").next().is_none());
    }
}
