//! Pixel agreement between binary masks and the two ways of aggregating it.

use std::fmt;

use clap::ValueEnum;
use image::GrayImage;
use serde::{Deserialize, Serialize};

use crate::error::MetricError;

/// Keeps IoU and accuracy finite when both masks are empty.
pub const EPSILON: f64 = 1e-10;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BinaryMask {
    width: u32,
    height: u32,
    pixels: Vec<bool>,
}

impl BinaryMask {
    pub fn from_fn(width: u32, height: u32, mut foreground: impl FnMut(u32, u32) -> bool) -> Self {
        let mut pixels = Vec::with_capacity(width as usize * height as usize);
        for y in 0..height {
            for x in 0..width {
                pixels.push(foreground(x, y));
            }
        }
        Self {
            width,
            height,
            pixels,
        }
    }

    /// Any non-zero luma counts as foreground.
    pub fn from_luma(image: &GrayImage) -> Self {
        Self::from_fn(image.width(), image.height(), |x, y| image.get_pixel(x, y).0[0] > 0)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn get(&self, x: u32, y: u32) -> bool {
        self.pixels[y as usize * self.width as usize + x as usize]
    }

    pub fn area(&self) -> u64 {
        self.pixels.iter().filter(|&&value| value).count() as u64
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct AreaCounts {
    pub intersection: u64,
    pub union: u64,
    pub target: u64,
}

impl AreaCounts {
    pub fn iou(&self) -> f64 {
        self.intersection as f64 / (self.union as f64 + EPSILON)
    }

    pub fn accuracy(&self) -> f64 {
        self.intersection as f64 / (self.target as f64 + EPSILON)
    }

    pub fn score(&self) -> Score {
        Score {
            iou: self.iou(),
            accuracy: self.accuracy(),
        }
    }

    fn add(&mut self, other: AreaCounts) {
        self.intersection += other.intersection;
        self.union += other.union;
        self.target += other.target;
    }
}

/// Counts agreement of `output` against the reference mask `target`.
/// The target area is always taken from `target`, so accuracy is asymmetric.
pub fn intersection_and_union(
    output: &BinaryMask,
    target: &BinaryMask,
) -> Result<AreaCounts, MetricError> {
    if output.width != target.width || output.height != target.height {
        return Err(MetricError::ShapeMismatch {
            candidate_width: output.width,
            candidate_height: output.height,
            reference_width: target.width,
            reference_height: target.height,
        });
    }

    let mut counts = AreaCounts::default();
    for (&out, &tgt) in output.pixels.iter().zip(&target.pixels) {
        counts.intersection += u64::from(out && tgt);
        counts.union += u64::from(out || tgt);
        counts.target += u64::from(tgt);
    }
    Ok(counts)
}

/// Fractions in [0, 1]; `percent()` scales for presentation.
#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize)]
pub struct Score {
    pub iou: f64,
    pub accuracy: f64,
}

impl Score {
    pub fn percent(self) -> Self {
        Self {
            iou: self.iou * 100.0,
            accuracy: self.accuracy * 100.0,
        }
    }
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum AggregationPolicy {
    /// Average of per-pair ratios.
    #[default]
    MeanOfRatios,
    /// Sum the pixel counts first, divide once.
    PooledRatio,
}

impl AggregationPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MeanOfRatios => "mean-of-ratios",
            Self::PooledRatio => "pooled-ratio",
        }
    }
}

impl fmt::Display for AggregationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Running totals for one batch; both aggregation policies read from it.
#[derive(Clone, Debug, Default)]
pub struct AreaMeter {
    totals: AreaCounts,
    iou_sum: f64,
    accuracy_sum: f64,
    count: usize,
}

impl AreaMeter {
    pub fn update(&mut self, counts: AreaCounts) -> Score {
        let score = counts.score();
        self.totals.add(counts);
        self.iou_sum += score.iou;
        self.accuracy_sum += score.accuracy;
        self.count += 1;
        score
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn totals(&self) -> AreaCounts {
        self.totals
    }

    pub fn mean_of_ratios(&self) -> Option<Score> {
        if self.count == 0 {
            return None;
        }
        let count = self.count as f64;
        Some(Score {
            iou: self.iou_sum / count,
            accuracy: self.accuracy_sum / count,
        })
    }

    pub fn pooled_ratio(&self) -> Option<Score> {
        if self.count == 0 {
            return None;
        }
        Some(self.totals.score())
    }

    pub fn summarize(&self, policy: AggregationPolicy) -> Option<Score> {
        match policy {
            AggregationPolicy::MeanOfRatios => self.mean_of_ratios(),
            AggregationPolicy::PooledRatio => self.pooled_ratio(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct PairResult {
    pub name: String,
    pub counts: AreaCounts,
    pub score: Score,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PairFailure {
    pub name: String,
    pub reason: String,
}

/// Outcome of scoring one set of candidate masks against their references.
#[derive(Clone, Debug, Default)]
pub struct BatchEvaluation {
    pairs: Vec<PairResult>,
    failures: Vec<PairFailure>,
    meter: AreaMeter,
}

impl BatchEvaluation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(
        &mut self,
        name: &str,
        candidate: &BinaryMask,
        reference: &BinaryMask,
    ) -> Result<&PairResult, MetricError> {
        let counts = match intersection_and_union(candidate, reference) {
            Ok(counts) => counts,
            Err(err) => {
                self.record_failure(name, err.to_string());
                return Err(err);
            }
        };

        let score = self.meter.update(counts);
        self.pairs.push(PairResult {
            name: name.to_string(),
            counts,
            score,
        });
        Ok(&self.pairs[self.pairs.len() - 1])
    }

    pub fn record_failure(&mut self, name: &str, reason: String) {
        self.failures.push(PairFailure {
            name: name.to_string(),
            reason,
        });
    }

    pub fn pairs(&self) -> &[PairResult] {
        &self.pairs
    }

    pub fn failures(&self) -> &[PairFailure] {
        &self.failures
    }

    pub fn meter(&self) -> &AreaMeter {
        &self.meter
    }

    pub fn summarize(&self, policy: AggregationPolicy) -> Option<Score> {
        self.meter.summarize(policy)
    }
}
