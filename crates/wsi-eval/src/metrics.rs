// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Au-Zone Technologies. All Rights Reserved.

//! Micro-averaged metrics across slides and IoU thresholds.

use crate::{
    Error,
    matcher::{MatchResult, f1_score},
};
use serde::{Deserialize, Serialize};

/// The COCO sweep `0.50:0.95:0.05`.
pub const DEFAULT_THRESHOLDS: [f64; 10] = [0.5, 0.55, 0.6, 0.65, 0.7, 0.75, 0.8, 0.85, 0.9, 0.95];

/// Smallest range step; values are rounded to two decimals.
pub const MIN_THRESHOLD_STEP: f64 = 0.01;

/// Largest sweep a range may expand to.
pub const MAX_THRESHOLDS: usize = 101;

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

fn parse_value(token: &str) -> Result<f64, Error> {
    token
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| Error::Configuration(format!("invalid IoU threshold '{}'", token)))
}

/// Parse an IoU threshold sweep.
///
/// Accepts nothing (the COCO sweep), a single `start:end:step` range whose
/// values are rounded to two decimals, or an explicit list.
pub fn parse_thresholds(values: &[String]) -> Result<Vec<f64>, Error> {
    let thresholds = match values {
        [] => DEFAULT_THRESHOLDS.to_vec(),
        [range] if range.contains(':') => {
            let parts: Vec<&str> = range.split(':').collect();
            let [start, end, step] = parts[..] else {
                return Err(Error::Configuration(format!(
                    "threshold range '{}' must be start:end:step",
                    range
                )));
            };
            let (start, end, step) = (parse_value(start)?, parse_value(end)?, parse_value(step)?);
            if step < MIN_THRESHOLD_STEP - 1e-12 {
                return Err(Error::Configuration(format!(
                    "threshold step {} below {}",
                    step, MIN_THRESHOLD_STEP
                )));
            }
            if !(0.0..=1.0).contains(&start) || !(0.0..=1.0).contains(&end) || start > end {
                return Err(Error::Configuration(format!(
                    "threshold range '{}' must lie within [0, 1] with start <= end",
                    range
                )));
            }
            let count = ((end - start + 1e-9) / step).floor() as usize + 1;
            if count > MAX_THRESHOLDS {
                return Err(Error::Configuration(format!(
                    "threshold range '{}' expands to {} values, at most {} allowed",
                    range, count, MAX_THRESHOLDS
                )));
            }
            (0..count).map(|i| round2(start + i as f64 * step)).collect()
        }
        list => list
            .iter()
            .flat_map(|v| v.split(','))
            .filter(|v| !v.trim().is_empty())
            .map(parse_value)
            .collect::<Result<Vec<_>, _>>()?,
    };

    if thresholds.is_empty() {
        return Err(Error::Configuration("empty IoU threshold sweep".to_string()));
    }
    if let Some(bad) = thresholds.iter().find(|t| !(0.0..=1.0).contains(*t)) {
        return Err(Error::Configuration(format!(
            "IoU threshold {} outside [0, 1]",
            bad
        )));
    }
    Ok(thresholds)
}

/// All match results of one slide, one per threshold of the sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlideEvaluation {
    pub slide_id: String,
    pub tile_count: usize,
    pub results: Vec<MatchResult>,
}

/// Pooled metrics for one threshold across every slide.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateResult {
    pub iou_threshold: f64,
    pub tp: usize,
    pub fp: usize,
    #[serde(rename = "fn")]
    pub fn_: usize,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    /// Mean of per-slide mean IoU weighted by each slide's tp.
    pub mean_iou: f64,
    pub mean_dice: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateReport {
    pub per_threshold: Vec<AggregateResult>,
    /// Arithmetic mean of the aggregate F1 over the sweep.
    pub mean_f1: f64,
}

#[derive(Default)]
struct Accumulator {
    tp: usize,
    fp: usize,
    fn_: usize,
    iou_sum: f64,
    dice_sum: f64,
}

impl Accumulator {
    fn add(&mut self, r: &MatchResult) {
        self.tp += r.tp;
        self.fp += r.fp;
        self.fn_ += r.fn_;
        if r.tp > 0 {
            self.iou_sum += r.mean_iou * r.tp as f64;
            self.dice_sum += r.mean_dice * r.tp as f64;
        }
    }

    fn finish(self, iou_threshold: f64) -> AggregateResult {
        let precision = if self.tp + self.fp > 0 {
            self.tp as f64 / (self.tp + self.fp) as f64
        } else {
            0.0
        };
        let recall = if self.tp + self.fn_ > 0 {
            self.tp as f64 / (self.tp + self.fn_) as f64
        } else {
            0.0
        };
        let (mean_iou, mean_dice) = if self.tp > 0 {
            (
                self.iou_sum / self.tp as f64,
                self.dice_sum / self.tp as f64,
            )
        } else {
            (0.0, 0.0)
        };
        AggregateResult {
            iou_threshold,
            tp: self.tp,
            fp: self.fp,
            fn_: self.fn_,
            precision,
            recall,
            f1: f1_score(precision, recall),
            mean_iou,
            mean_dice,
        }
    }
}

/// Pool per-slide results into micro averages.
///
/// Every slide must carry one result per threshold, in sweep order.
/// Counts are summed before any ratio is derived, so slides with many
/// instances weigh proportionally more.
pub fn aggregate(thresholds: &[f64], slides: &[SlideEvaluation]) -> Result<AggregateReport, Error> {
    let mut accumulators: Vec<Accumulator> = thresholds.iter().map(|_| Accumulator::default()).collect();
    for slide in slides {
        if slide.results.len() != thresholds.len() {
            return Err(Error::InvalidParameters(format!(
                "slide {} has {} results for {} thresholds",
                slide.slide_id,
                slide.results.len(),
                thresholds.len()
            )));
        }
        for ((acc, result), &t) in accumulators.iter_mut().zip(&slide.results).zip(thresholds) {
            if (result.iou_threshold - t).abs() > 1e-9 {
                return Err(Error::InvalidParameters(format!(
                    "slide {} result at IoU {} does not line up with threshold {}",
                    slide.slide_id, result.iou_threshold, t
                )));
            }
            acc.add(result);
        }
    }

    let per_threshold: Vec<AggregateResult> = accumulators
        .into_iter()
        .zip(thresholds)
        .map(|(acc, &t)| acc.finish(t))
        .collect();
    let mean_f1 = if per_threshold.is_empty() {
        0.0
    } else {
        per_threshold.iter().map(|r| r.f1).sum::<f64>() / per_threshold.len() as f64
    };
    Ok(AggregateReport {
        per_threshold,
        mean_f1,
    })
}
