use std::path::{Path, PathBuf};

use crate::model::{PromptMode, RefineVariant};

const SEGMENT_RESULTS_DIR: &str = "FastSAM results";

/// Every path the pipeline reads or writes, derived from
/// (root, manufacturer, target, mode, image id) only.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutputLayout {
    root: PathBuf,
    manufacturer: String,
}

impl OutputLayout {
    pub fn new(root: impl Into<PathBuf>, manufacturer: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            manufacturer: manufacturer.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manufacturer(&self) -> &str {
        &self.manufacturer
    }

    fn manufacturer_dir(&self) -> PathBuf {
        self.root.join(&self.manufacturer)
    }

    pub fn manifest_dir(&self) -> PathBuf {
        self.manufacturer_dir().join("Input").join("CSV")
    }

    pub fn source_image(&self, image_id: &str) -> PathBuf {
        self.manufacturer_dir().join("Input").join(format!("{image_id}.jpg"))
    }

    pub fn outputs_dir(&self) -> PathBuf {
        self.manufacturer_dir().join("Outputs")
    }

    fn target_dir(&self, target: &str) -> PathBuf {
        self.outputs_dir().join(target)
    }

    pub fn segment_dir(&self, target: &str, mode: PromptMode) -> PathBuf {
        self.target_dir(target).join(SEGMENT_RESULTS_DIR).join(mode.as_str())
    }

    pub fn segment_mask_dir(&self, target: &str, mode: PromptMode) -> PathBuf {
        self.segment_dir(target, mode).join("Masks")
    }

    pub fn segment_mask(&self, target: &str, mode: PromptMode, image_id: &str) -> PathBuf {
        self.segment_mask_dir(target, mode).join(format!("{image_id}.png"))
    }

    pub fn overlay_dir(&self, target: &str, mode: PromptMode) -> PathBuf {
        self.segment_dir(target, mode).join("Images")
    }

    pub fn refine_dir(
        &self,
        variant: RefineVariant,
        target: &str,
        mode: PromptMode,
        image_id: &str,
    ) -> PathBuf {
        self.target_dir(target)
            .join(variant.results_dir_name())
            .join(mode.as_str())
            .join(format!("input_{image_id}"))
    }

    pub fn refine_mask_dir(
        &self,
        variant: RefineVariant,
        target: &str,
        mode: PromptMode,
        image_id: &str,
    ) -> PathBuf {
        self.refine_dir(variant, target, mode, image_id).join("Masks")
    }

    pub fn ledger_path(
        &self,
        variant: RefineVariant,
        target: &str,
        mode: PromptMode,
        image_id: &str,
    ) -> PathBuf {
        self.refine_dir(variant, target, mode, image_id).join("evaluation.csv")
    }

    pub fn target_summary(&self, target: &str) -> PathBuf {
        self.outputs_dir().join("Summary").join(format!("{target}.csv"))
    }

    pub fn manufacturer_summary(&self) -> PathBuf {
        self.outputs_dir().join(format!("{}_summary.csv", self.manufacturer))
    }

    pub fn run_report_dir(&self) -> PathBuf {
        self.outputs_dir().join("Runs")
    }
}
