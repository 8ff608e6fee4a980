use std::fs::{self, File};
use std::path::{Path, PathBuf};

use csv::{Writer, WriterBuilder};

use crate::error::ReportError;
use crate::metrics::Score;
use crate::model::{AggregateResult, RefineVariant, Watermark};
use crate::pipeline::manifest::{DELIMITER, ManifestRow};
use crate::util::{format_percent, partial_path};

pub const SUMMARY_FIELDS: [&str; 5] = [
    "target",
    "persam_mIoU",
    "persam_mAcc",
    "persam_f_mIoU",
    "persam_f_mAcc",
];

/// Per-pair scores for one refinement output directory, one row per mask.
pub struct EvaluationLedger {
    path: PathBuf,
    writer: Writer<File>,
}

impl EvaluationLedger {
    /// Starts a fresh ledger, replacing any earlier one at `path`.
    pub fn create(path: &Path, prefix: &str) -> Result<Self, ReportError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| ReportError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let file = File::create(path).map_err(|source| ReportError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let mut ledger = Self {
            path: path.to_path_buf(),
            writer: WriterBuilder::new().delimiter(DELIMITER).from_writer(file),
        };
        ledger.write_record(&[
            "image".to_string(),
            format!("{prefix}_IoU"),
            format!("{prefix}_Acc"),
        ])?;
        Ok(ledger)
    }

    /// Appends one pair; `score` is a fraction and is persisted as a percentage.
    pub fn append(&mut self, name: &str, score: Score) -> Result<(), ReportError> {
        let percent = score.percent();
        self.write_record(&[
            name.to_string(),
            format_percent(percent.iou),
            format_percent(percent.accuracy),
        ])
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_record(&mut self, record: &[String]) -> Result<(), ReportError> {
        self.writer
            .write_record(record)
            .map_err(|source| ReportError::Csv {
                path: self.path.clone(),
                source,
            })?;
        self.writer.flush().map_err(|source| ReportError::Io {
            path: self.path.clone(),
            source,
        })
    }
}

/// Unweighted mean of the persisted per-row percentages over rows at stage 4.
pub fn aggregate_rows<'a>(
    label: &str,
    rows: impl IntoIterator<Item = &'a ManifestRow>,
) -> Option<AggregateResult> {
    let mut count = 0_usize;
    let mut sums = [0.0_f64; 4];

    for row in rows {
        if row.done != Watermark::Stage(4) {
            continue;
        }
        let (Some(zero_shot), Some(fine_tuned)) = (
            row.metrics(RefineVariant::ZeroShot),
            row.metrics(RefineVariant::FineTuned),
        ) else {
            continue;
        };

        sums[0] += zero_shot.iou;
        sums[1] += zero_shot.accuracy;
        sums[2] += fine_tuned.iou;
        sums[3] += fine_tuned.accuracy;
        count += 1;
    }

    if count == 0 {
        return None;
    }
    let n = count as f64;
    Some(AggregateResult {
        target: label.to_string(),
        rows: count,
        persam_miou: sums[0] / n,
        persam_macc: sums[1] / n,
        persam_f_miou: sums[2] / n,
        persam_f_macc: sums[3] / n,
    })
}

/// Writes a summary CSV through a sibling temp file and a rename.
pub fn write_summary(path: &Path, results: &[AggregateResult]) -> Result<(), ReportError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| ReportError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    let staging = partial_path(path);
    let csv_error = |source| ReportError::Csv {
        path: staging.clone(),
        source,
    };

    let mut writer = WriterBuilder::new()
        .delimiter(DELIMITER)
        .from_path(&staging)
        .map_err(csv_error)?;
    writer.write_record(SUMMARY_FIELDS).map_err(csv_error)?;
    for result in results {
        writer
            .write_record([
                result.target.clone(),
                format_percent(result.persam_miou),
                format_percent(result.persam_macc),
                format_percent(result.persam_f_miou),
                format_percent(result.persam_f_macc),
            ])
            .map_err(csv_error)?;
    }
    writer.flush().map_err(|source| ReportError::Io {
        path: staging.clone(),
        source,
    })?;
    drop(writer);

    fs::rename(&staging, path).map_err(|source| ReportError::Io {
        path: path.to_path_buf(),
        source,
    })
}
