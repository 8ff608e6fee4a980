use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use image::{Rgb, RgbImage};

use super::*;
use crate::error::StageError;
use crate::mask::{list_mask_files, save_binary_mask};
use crate::metrics::BinaryMask;
use crate::model::{PromptMode, RefineVariant, Watermark};
use crate::pipeline::layout::OutputLayout;
use crate::pipeline::operations::{RefineRequest, SegmentRequest};

const HEADER: &str = "image;mode;box;points;point_labels;done;persam_IoU;persam_Acc;persam_f_IoU;persam_f_Acc";

/// Writes viridis-colored coarse masks like the real segmenter and a fixed
/// candidate mask for every coarse mask on refine.
struct FakeOperations {
    coarse: BinaryMask,
    zero_shot: BinaryMask,
    fine_tuned: BinaryMask,
    fail_segment: HashSet<String>,
    calls: Vec<(Stage, String)>,
}

impl FakeOperations {
    fn new() -> Self {
        Self {
            coarse: BinaryMask::from_fn(20, 20, |x, y| x < 10 && y < 10),
            zero_shot: BinaryMask::from_fn(20, 20, |x, y| x < 10 && y < 5),
            fine_tuned: BinaryMask::from_fn(20, 20, |x, y| x < 10 && y < 10),
            fail_segment: HashSet::new(),
            calls: Vec::new(),
        }
    }

    fn failing(images: &[&str]) -> Self {
        let mut ops = Self::new();
        ops.fail_segment = images.iter().map(|image| image.to_string()).collect();
        ops
    }
}

fn create_dir(stage: Stage, image: &str, dir: &Path) -> Result<(), StageError> {
    fs::create_dir_all(dir).map_err(|err| StageError::OperationFailed {
        stage,
        image: image.to_string(),
        reason: err.to_string(),
    })
}

impl StageOperations for FakeOperations {
    fn segment(&mut self, request: &SegmentRequest<'_>) -> Result<(), StageError> {
        self.calls.push((Stage::Segment, request.image_id.to_string()));
        if self.fail_segment.contains(request.image_id) {
            return Err(StageError::OperationFailed {
                stage: Stage::Segment,
                image: request.image_id.to_string(),
                reason: "segmenter crashed".to_string(),
            });
        }

        create_dir(Stage::Segment, request.image_id, request.mask_dir)?;
        let coarse = &self.coarse;
        let image = RgbImage::from_fn(coarse.width(), coarse.height(), |x, y| {
            if coarse.get(x, y) {
                Rgb([253, 231, 36])
            } else {
                Rgb([68, 1, 84])
            }
        });
        let path = request.mask_dir.join(format!("{}.png", request.image_id));
        image.save(&path).map_err(|err| StageError::OperationFailed {
            stage: Stage::Segment,
            image: request.image_id.to_string(),
            reason: err.to_string(),
        })
    }

    fn refine(&mut self, request: &RefineRequest<'_>) -> Result<(), StageError> {
        let stage = request.variant.stage();
        self.calls.push((stage, request.image_id.to_string()));

        let mask_dir = request.output_dir.join("Masks");
        create_dir(stage, request.image_id, &mask_dir)?;
        let candidate = match request.variant {
            RefineVariant::ZeroShot => &self.zero_shot,
            RefineVariant::FineTuned => &self.fine_tuned,
        };

        let coarse_dir = request.reference_mask.parent().unwrap_or(Path::new("."));
        for coarse in list_mask_files(coarse_dir)? {
            if let Some(name) = coarse.file_name() {
                save_binary_mask(candidate, &mask_dir.join(name))?;
            }
        }
        Ok(())
    }
}

struct Fixture {
    _dir: tempfile::TempDir,
    config: PipelineConfig,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = PipelineConfig::new(OutputLayout::new(dir.path(), "Welte"));
        fs::create_dir_all(config.layout.manifest_dir()).expect("manifest dir");
        Self { _dir: dir, config }
    }

    fn layout(&self) -> &OutputLayout {
        &self.config.layout
    }

    fn write_manifest(&self, target: &str, body: &str) -> PathBuf {
        let path = self.layout().manifest_dir().join(format!("{target}.csv"));
        fs::write(&path, body).expect("write manifest");
        path
    }

    fn read(&self, path: &Path) -> String {
        fs::read_to_string(path).expect("read file")
    }
}

fn bom_crlf_manifest(rows: &[&str]) -> String {
    let mut body = format!("\u{feff}{HEADER}\r\n");
    for row in rows {
        body.push_str(row);
        body.push_str("\r\n");
    }
    body
}

#[test]
fn happy_path_runs_all_stages_and_writes_summaries() {
    let fixture = Fixture::new();
    let path = fixture.write_manifest(
        "label",
        &bom_crlf_manifest(&[
            "roll_001;box;[0, 0, 10, 10];;;;;;;",
            "roll_002.jpg;box;[[0, 0, 10, 10]];;;;;;;",
        ]),
    );
    let mut ops = FakeOperations::new();

    let outcome = run_pipeline(&fixture.config, &mut ops).expect("pipeline");

    assert_eq!(outcome.failed_targets(), 0);
    assert_eq!(ops.calls.len(), 6);
    let report = &outcome.targets[0];
    assert_eq!(report.status, "completed");
    assert_eq!(report.stages.len(), 4);
    assert!(report.stages.iter().all(|pass| pass.succeeded == 2));
    assert!(report.manifest_sha256.is_some());

    let manifest = manifest::load(&path).expect("reload");
    assert!(manifest.format().byte_order_mark);
    assert!(manifest.format().crlf);
    for row in manifest.rows() {
        assert_eq!(row.done, Watermark::Stage(4));
        assert_eq!(row.persam_iou, "50.00");
        assert_eq!(row.persam_acc, "50.00");
        assert_eq!(row.persam_f_iou, "100.00");
        assert_eq!(row.persam_f_acc, "100.00");
    }
    assert_eq!(manifest.rows()[1].image, "roll_002.jpg");

    let layout = fixture.layout();
    assert!(
        layout
            .refine_mask_dir(RefineVariant::FineTuned, "label", PromptMode::Box, "roll_002")
            .join("roll_001.png")
            .is_file()
    );
    assert_eq!(
        fixture.read(&layout.ledger_path(
            RefineVariant::ZeroShot,
            "label",
            PromptMode::Box,
            "roll_001"
        )),
        "image;persam_IoU;persam_Acc\nroll_001;50.00;50.00\nroll_002;50.00;50.00\n"
    );
    assert_eq!(
        fixture.read(&layout.target_summary("label")),
        "target;persam_mIoU;persam_mAcc;persam_f_mIoU;persam_f_mAcc\nlabel;50.00;50.00;100.00;100.00\n"
    );
    assert_eq!(
        fixture.read(&layout.manufacturer_summary()),
        "target;persam_mIoU;persam_mAcc;persam_f_mIoU;persam_f_mAcc\nlabel;50.00;50.00;100.00;100.00\nWelte;50.00;50.00;100.00;100.00\n"
    );
    assert_eq!(outcome.manufacturer_summary_path, Some(layout.manufacturer_summary()));
}

#[test]
fn coarse_masks_are_palette_remapped_after_segmentation() {
    let fixture = Fixture::new();
    fixture.write_manifest("label", &bom_crlf_manifest(&["roll_001;box;[0, 0, 10, 10];;;;;;;"]));
    let mut ops = FakeOperations::new();

    run_pipeline(&fixture.config, &mut ops).expect("pipeline");

    let mask = image::open(fixture.layout().segment_mask("label", PromptMode::Box, "roll_001"))
        .expect("coarse mask")
        .to_rgb8();
    assert_eq!(mask.get_pixel(0, 0).0, [128, 0, 0]);
    assert_eq!(mask.get_pixel(19, 19).0, [0, 0, 0]);
}

#[test]
fn crash_mid_pipeline_resumes_only_unfinished_rows() {
    let fixture = Fixture::new();
    let path = fixture.write_manifest(
        "label",
        &bom_crlf_manifest(&[
            "roll_001;box;[0, 0, 10, 10];;;;;;;",
            "roll_002;points;;[[5, 5]];[1];;;;;",
        ]),
    );

    let mut crashing = FakeOperations::failing(&["roll_002"]);
    let outcome = run_pipeline(&fixture.config, &mut crashing).expect("first run");
    let stages = &outcome.targets[0].stages;
    assert_eq!(stages[0].failed, 1);
    assert_eq!(stages[1].blocked, 1);
    assert_eq!(stages[3].blocked, 1);

    let after_crash = manifest::load(&path).expect("reload");
    assert_eq!(after_crash.rows()[0].done, Watermark::Stage(4));
    assert_eq!(after_crash.rows()[1].done, Watermark::Empty);
    assert_eq!(after_crash.rows()[1].persam_iou, "");

    let mut healthy = FakeOperations::new();
    run_pipeline(&fixture.config, &mut healthy).expect("second run");
    assert_eq!(
        healthy.calls,
        vec![
            (Stage::Segment, "roll_002".to_string()),
            (Stage::RefineZeroShot, "roll_002".to_string()),
            (Stage::RefineFineTuned, "roll_002".to_string()),
        ]
    );

    let resumed = manifest::load(&path).expect("reload");
    assert!(resumed.rows().iter().all(|row| row.done == Watermark::Stage(4)));
    assert_eq!(resumed.rows()[1].persam_f_iou, "100.00");
}

#[test]
fn crash_after_first_stage_keeps_committed_watermarks() {
    let fixture = Fixture::new();
    let path = fixture.write_manifest(
        "label",
        &bom_crlf_manifest(&[
            "roll_001;box;[0, 0, 10, 10];;;;;;;",
            "roll_002;box;[0, 0, 10, 10];;;;;;;",
        ]),
    );

    let mut crashing = FakeOperations::failing(&["roll_002"]);
    let first = run_stage(
        &path,
        Stage::Segment,
        &mut StageContext {
            config: &fixture.config,
            operations: &mut crashing,
        },
    )
    .expect("first segment pass");
    assert_eq!(first.succeeded, 1);
    assert_eq!(first.failed, 1);

    // Process stops here, before stage 2 ever runs.
    let committed = manifest::load(&path).expect("reload");
    assert_eq!(committed.rows()[0].done, Watermark::Stage(1));
    assert_eq!(committed.rows()[1].done, Watermark::Empty);
    assert!(!crate::util::partial_path(&path).exists());

    let mut healthy = FakeOperations::new();
    let second = run_stage(
        &path,
        Stage::Segment,
        &mut StageContext {
            config: &fixture.config,
            operations: &mut healthy,
        },
    )
    .expect("second segment pass");
    assert_eq!(healthy.calls, vec![(Stage::Segment, "roll_002".to_string())]);
    assert_eq!(second.skipped, 1);
    assert_eq!(second.succeeded, 1);

    let resumed = manifest::load(&path).expect("reload");
    assert!(resumed.rows().iter().all(|row| row.done == Watermark::Stage(1)));
    let images: Vec<&str> = resumed.rows().iter().map(|row| row.image.as_str()).collect();
    assert_eq!(images, vec!["roll_001", "roll_002"]);
}

#[test]
fn rerun_of_finished_manifest_is_byte_identical() {
    let fixture = Fixture::new();
    let body = bom_crlf_manifest(&[
        "roll_001;box;[0, 0, 10, 10];;;4;50.00;50.00;100.00;100.00",
        "roll_002;points;;[[5, 5], [9, 9]];[1, 0];4;87.53;90.10;99.99;100.00",
    ]);
    let path = fixture.write_manifest("label", &body);
    let mut ops = FakeOperations::new();

    let outcome = run_pipeline(&fixture.config, &mut ops).expect("pipeline");

    assert!(ops.calls.is_empty());
    assert_eq!(fs::read(&path).expect("read"), body.as_bytes());
    assert!(outcome.targets[0].stages.iter().all(|pass| pass.skipped == 2));
    assert!(!fixture.layout().target_summary("label").exists());
    assert!(outcome.manufacturer_summary_path.is_none());
}

#[test]
fn every_pass_keeps_row_count_and_order() {
    let fixture = Fixture::new();
    let path = fixture.write_manifest(
        "label",
        "image;mode;box;points;point_labels;done;persam_IoU;persam_Acc;persam_f_IoU;persam_f_Acc\n\
         roll_001;box;[0, 0, 10, 10];;;;;;;\n\
         roll_002;box;[0, 0, 10];;;;;;;\n\
         roll_003;lasso;[0, 0, 10, 10];;;0;;;;\n\
         roll_004;box;[0, 0, 10, 10];;;4;1.00;2.00;3.00;4.00\n\
         roll_005;box;[0, 0, 10, 10];;;;;;;\n",
    );
    let mut ops = FakeOperations::failing(&["roll_005"]);

    let outcome = run_pipeline(&fixture.config, &mut ops).expect("pipeline");

    let manifest = manifest::load(&path).expect("reload");
    let images: Vec<&str> = manifest.rows().iter().map(|row| row.image.as_str()).collect();
    assert_eq!(images, vec!["roll_001", "roll_002", "roll_003", "roll_004", "roll_005"]);
    let done: Vec<Watermark> = manifest.rows().iter().map(|row| row.done).collect();
    assert_eq!(
        done,
        vec![
            Watermark::Stage(4),
            Watermark::Empty,
            Watermark::Stage(0),
            Watermark::Stage(4),
            Watermark::Empty,
        ]
    );
    assert_eq!(manifest.rows()[3].persam_iou, "1.00");
    assert!(!manifest.format().byte_order_mark);
    assert!(!manifest.format().crlf);

    let segment = &outcome.targets[0].stages[0];
    assert_eq!(segment.rows, 5);
    assert_eq!(segment.attempted, 4);
    assert_eq!(segment.succeeded, 1);
    assert_eq!(segment.failed, 3);
    assert_eq!(segment.skipped, 1);
    assert!(
        !ops.calls
            .iter()
            .any(|(_, image)| image == "roll_002" || image == "roll_003")
    );
}

#[test]
fn bad_manifests_and_stray_files_do_not_stop_other_targets() {
    let fixture = Fixture::new();
    let manifest_dir = fixture.layout().manifest_dir();
    let broken_body = HEADER.replace(';', ",") + "\nroll_001,box,\"[0, 0, 10, 10]\",,,,,,,\n";
    let broken = fixture.write_manifest("broken", &broken_body);
    fs::write(manifest_dir.join("notes.txt"), "not a manifest").expect("stray file");
    fs::write(manifest_dir.join("stamp.csv.partial"), "half written").expect("leftover");
    fixture.write_manifest("stamp", &bom_crlf_manifest(&["roll_001;box;[0, 0, 10, 10];;;;;;;"]));
    let mut ops = FakeOperations::new();

    let outcome = run_pipeline(&fixture.config, &mut ops).expect("pipeline");

    let targets: Vec<&str> = outcome.targets.iter().map(|report| report.target.as_str()).collect();
    assert_eq!(targets, vec!["broken", "stamp"]);
    assert_eq!(outcome.targets[0].status, "failed");
    assert_eq!(outcome.targets[0].failed_stage, Some(Stage::Segment));
    assert!(
        outcome.targets[0]
            .failure_reason
            .as_deref()
            .unwrap_or_default()
            .contains("field set mismatch")
    );
    assert_eq!(outcome.targets[1].status, "completed");
    assert_eq!(fixture.read(&broken), broken_body);
    assert_eq!(outcome.failed_targets(), 1);

    assert!(outcome.warnings.iter().any(|warning| warning.contains("notes.txt")));
    assert!(outcome.warnings.iter().any(|warning| warning.contains("interrupted rewrite")));
    assert!(outcome.warnings.iter().any(|warning| warning.contains("target broken failed")));
}

#[test]
fn target_filter_restricts_the_run() {
    let mut fixture = Fixture::new();
    fixture.write_manifest("label", &bom_crlf_manifest(&["roll_001;box;[0, 0, 10, 10];;;;;;;"]));
    let stamp = fixture.write_manifest(
        "stamp",
        &bom_crlf_manifest(&["roll_009;box;[0, 0, 10, 10];;;;;;;"]),
    );
    fixture.config.targets = vec!["stamp".to_string(), "missing".to_string()];
    let mut ops = FakeOperations::new();

    let outcome = run_pipeline(&fixture.config, &mut ops).expect("pipeline");

    assert_eq!(outcome.targets.len(), 1);
    assert_eq!(outcome.targets[0].manifest_path, stamp.display().to_string());
    assert!(ops.calls.iter().all(|(_, image)| image == "roll_009"));
    assert!(outcome.warnings.iter().any(|warning| warning.contains("missing")));
}
