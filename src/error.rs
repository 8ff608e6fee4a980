use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::model::Stage;

#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("manifest not found: {}", .path.display())]
    NotFound { path: PathBuf },

    #[error("malformed manifest {}: {reason}", .path.display())]
    Malformed { path: PathBuf, reason: String },

    #[error("failed to access manifest {}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write manifest rewrite {}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("permission denied while replacing manifest {}", .path.display())]
    CommitPermissionDenied {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MetricError {
    #[error(
        "mask shape mismatch: candidate is {candidate_width}x{candidate_height}, reference is {reference_width}x{reference_height}"
    )]
    ShapeMismatch {
        candidate_width: u32,
        candidate_height: u32,
        reference_width: u32,
        reference_height: u32,
    },
}

#[derive(Error, Debug)]
pub enum MaskError {
    #[error("failed to read mask image {}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("failed to write mask image {}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("failed to list masks in {}", .path.display())]
    List {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("failed to create {}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write csv {}", .path.display())]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
}

#[derive(Error, Debug)]
pub enum StageError {
    #[error("{stage} failed for image {image}: {reason}")]
    OperationFailed {
        stage: Stage,
        image: String,
        reason: String,
    },

    #[error("{stage} timed out for image {image} after {}s", .timeout.as_secs())]
    TimedOut {
        stage: Stage,
        image: String,
        timeout: Duration,
    },

    #[error("failed to launch `{program}` for {stage}")]
    Launch {
        stage: Stage,
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid prompt for image {image}: {reason}")]
    InvalidPrompt { image: String, reason: String },

    #[error("evaluation failed for image {image}: {reason}")]
    Evaluation { image: String, reason: String },

    #[error(transparent)]
    Mask(#[from] MaskError),

    #[error(transparent)]
    Report(#[from] ReportError),
}
