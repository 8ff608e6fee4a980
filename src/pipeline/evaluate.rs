use std::path::Path;

use tracing::{debug, error, info};

use crate::error::StageError;
use crate::mask::{list_mask_files, load_binary_mask};
use crate::metrics::{AggregationPolicy, BatchEvaluation, Score};
use crate::model::{PromptMode, RefineVariant};
use crate::pipeline::layout::OutputLayout;
use crate::pipeline::reports::EvaluationLedger;

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct RowEvaluation {
    pub zero_shot: Score,
    pub fine_tuned: Score,
}

impl RowEvaluation {
    pub fn score(&self, variant: RefineVariant) -> Score {
        match variant {
            RefineVariant::ZeroShot => self.zero_shot,
            RefineVariant::FineTuned => self.fine_tuned,
        }
    }
}

/// Scores every reference mask against the same-named file in `candidate_dir`.
/// Pairs that cannot be scored are recorded as failures and skipped.
pub fn evaluate_directories(
    reference_dir: &Path,
    candidate_dir: &Path,
    mut ledger: Option<&mut EvaluationLedger>,
) -> Result<BatchEvaluation, StageError> {
    let mut batch = BatchEvaluation::new();

    for reference_path in list_mask_files(reference_dir)? {
        let Some(file_name) = reference_path.file_name() else {
            continue;
        };
        let name = reference_path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();

        let candidate_path = candidate_dir.join(file_name);
        if !candidate_path.is_file() {
            error!(
                mask = %name,
                candidate = %candidate_path.display(),
                "candidate mask missing, pair skipped"
            );
            batch.record_failure(&name, format!("missing {}", candidate_path.display()));
            continue;
        }

        let masks = load_binary_mask(&reference_path).and_then(|reference| {
            load_binary_mask(&candidate_path).map(|candidate| (reference, candidate))
        });
        let (reference, candidate) = match masks {
            Ok(masks) => masks,
            Err(err) => {
                error!(mask = %name, error = %err, "mask unreadable, pair skipped");
                batch.record_failure(&name, err.to_string());
                continue;
            }
        };

        match batch.record(&name, &candidate, &reference) {
            Ok(pair) => {
                debug!(
                    mask = %name,
                    intersection = pair.counts.intersection,
                    union = pair.counts.union,
                    reference_area = reference.area(),
                    "pair scored"
                );
                let score = pair.score;
                if let Some(ledger) = ledger.as_deref_mut() {
                    ledger.append(&name, score)?;
                }
            }
            Err(err) => {
                error!(mask = %name, error = %err, "pair skipped");
            }
        }
    }

    Ok(batch)
}

/// Stage 4 for one manifest row: both refinement variants against the coarse masks.
pub fn evaluate_row(
    layout: &OutputLayout,
    target: &str,
    mode: PromptMode,
    image_id: &str,
    policy: AggregationPolicy,
) -> Result<RowEvaluation, StageError> {
    let reference_dir = layout.segment_mask_dir(target, mode);
    let mut scores = [Score::default(); 2];

    for (slot, variant) in scores.iter_mut().zip(RefineVariant::ALL) {
        let candidate_dir = layout.refine_mask_dir(variant, target, mode, image_id);
        let mut ledger = EvaluationLedger::create(
            &layout.ledger_path(variant, target, mode, image_id),
            variant.metric_prefix(),
        )?;

        let batch = evaluate_directories(&reference_dir, &candidate_dir, Some(&mut ledger))?;
        let summary = batch.summarize(policy).ok_or_else(|| StageError::Evaluation {
            image: image_id.to_string(),
            reason: format!(
                "no {} mask pairs could be scored in {}",
                variant.metric_prefix(),
                candidate_dir.display()
            ),
        })?;

        let percent = summary.percent();
        info!(
            target = %target,
            image = image_id,
            variant = variant.metric_prefix(),
            pairs = batch.meter().count(),
            failed_pairs = batch.failures().len(),
            policy = %policy,
            iou = percent.iou,
            acc = percent.accuracy,
            "evaluated refinement"
        );
        *slot = summary;
    }

    Ok(RowEvaluation {
        zero_shot: scores[0],
        fine_tuned: scores[1],
    })
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::mask::save_binary_mask;
    use crate::metrics::BinaryMask;

    fn square(size: u32, edge: u32) -> BinaryMask {
        BinaryMask::from_fn(size, size, |x, y| x < edge && y < edge)
    }

    #[test]
    fn pairs_by_file_name_and_skips_missing_candidates() {
        let dir = tempfile::tempdir().expect("tempdir");
        let reference_dir = dir.path().join("reference");
        let candidate_dir = dir.path().join("candidate");
        fs::create_dir_all(&reference_dir).expect("reference dir");
        fs::create_dir_all(&candidate_dir).expect("candidate dir");

        save_binary_mask(&square(8, 4), &reference_dir.join("roll_001.png")).expect("ref 1");
        save_binary_mask(&square(8, 4), &reference_dir.join("roll_002.png")).expect("ref 2");
        save_binary_mask(&square(8, 2), &candidate_dir.join("roll_001.png")).expect("cand 1");

        let ledger_path = dir.path().join("evaluation.csv");
        let mut ledger = EvaluationLedger::create(&ledger_path, "persam").expect("ledger");
        let batch = evaluate_directories(&reference_dir, &candidate_dir, Some(&mut ledger))
            .expect("evaluate");

        assert_eq!(batch.pairs().len(), 1);
        assert_eq!(batch.pairs()[0].name, "roll_001");
        assert_eq!(batch.failures().len(), 1);
        assert_eq!(batch.failures()[0].name, "roll_002");

        let percent = batch
            .summarize(AggregationPolicy::MeanOfRatios)
            .expect("one pair")
            .percent();
        assert!((percent.iou - 25.0).abs() < 1e-6);
        assert!((percent.accuracy - 25.0).abs() < 1e-6);

        assert_eq!(
            fs::read_to_string(&ledger_path).expect("ledger"),
            "image;persam_IoU;persam_Acc\nroll_001;25.00;25.00\n"
        );
    }

    #[test]
    fn shape_mismatch_is_a_pair_failure() {
        let dir = tempfile::tempdir().expect("tempdir");
        let reference_dir = dir.path().join("reference");
        let candidate_dir = dir.path().join("candidate");
        fs::create_dir_all(&reference_dir).expect("reference dir");
        fs::create_dir_all(&candidate_dir).expect("candidate dir");

        save_binary_mask(&square(8, 4), &reference_dir.join("roll_001.png")).expect("ref");
        save_binary_mask(&square(6, 4), &candidate_dir.join("roll_001.png")).expect("cand");

        let batch = evaluate_directories(&reference_dir, &candidate_dir, None).expect("evaluate");
        assert!(batch.pairs().is_empty());
        assert_eq!(batch.failures().len(), 1);
        assert!(batch.summarize(AggregationPolicy::PooledRatio).is_none());
    }

    #[test]
    fn row_without_scorable_pairs_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        let layout = OutputLayout::new(dir.path(), "Welte");
        let reference_dir = layout.segment_mask_dir("label", PromptMode::Box);
        fs::create_dir_all(&reference_dir).expect("reference dir");
        save_binary_mask(&square(8, 4), &reference_dir.join("roll_001.png")).expect("ref");

        let err = evaluate_row(
            &layout,
            "label",
            PromptMode::Box,
            "roll_001",
            AggregationPolicy::MeanOfRatios,
        )
        .unwrap_err();
        assert!(matches!(err, StageError::Evaluation { .. }));
        assert!(
            layout
                .ledger_path(RefineVariant::ZeroShot, "label", PromptMode::Box, "roll_001")
                .is_file()
        );
    }
}
