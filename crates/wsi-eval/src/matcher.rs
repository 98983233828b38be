// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Au-Zone Technologies. All Rights Reserved.

//! Greedy one-to-one instance matching by polygon IoU.
//!
//! Candidate pairs are enumerated prediction-major, sorted by IoU (stable, so
//! ties keep enumeration order) and assigned greedily until the first pair
//! below the threshold. This is not an optimal assignment: a prediction that
//! takes its best ground truth may leave another prediction unmatched even
//! though a different assignment would match both. Results are intentionally
//! comparable with COCO-style greedy evaluation.

use crate::types::Instance;
use geo::{Area, BooleanOps, Rect};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// One accepted ground truth / prediction pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatchedPair {
    pub gt_index: usize,
    pub pred_index: usize,
    pub iou: f64,
    pub dice: f64,
}

/// Counts and ratios for one slide at one IoU threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub iou_threshold: f64,
    pub tp: usize,
    pub fp: usize,
    #[serde(rename = "fn")]
    pub fn_: usize,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    /// Mean IoU over matched pairs; 0 when there are none.
    pub mean_iou: f64,
    /// Mean Dice over matched pairs; 0 when there are none.
    pub mean_dice: f64,
    pub n_gt: usize,
    pub n_pred: usize,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub pairs: Vec<MatchedPair>,
}

#[derive(Clone, Copy)]
struct Candidate {
    gt: usize,
    pred: usize,
    iou: f64,
    dice: f64,
}

struct Prepared<'a> {
    instance: &'a Instance,
    area: f64,
    bounds: Option<Rect<f64>>,
}

impl<'a> Prepared<'a> {
    fn new(instance: &'a Instance) -> Self {
        Self {
            instance,
            area: instance.area(),
            bounds: instance.bounds(),
        }
    }
}

fn boxes_overlap(a: &Option<Rect<f64>>, b: &Option<Rect<f64>>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => {
            a.min().x <= b.max().x
                && b.min().x <= a.max().x
                && a.min().y <= b.max().y
                && b.min().y <= a.max().y
        }
        _ => false,
    }
}

fn overlap(a: &Prepared, b: &Prepared) -> (f64, f64) {
    let intersection = a
        .instance
        .polygon
        .intersection(&b.instance.polygon)
        .unsigned_area();
    let union = a.area + b.area - intersection;
    let iou = if union > 0.0 {
        intersection / union
    } else {
        0.0
    };
    let total = a.area + b.area;
    let dice = if total > 0.0 {
        2.0 * intersection / total
    } else {
        0.0
    };
    (iou, dice)
}

/// Intersection over union of two instances.
pub fn iou(a: &Instance, b: &Instance) -> f64 {
    overlap(&Prepared::new(a), &Prepared::new(b)).0
}

fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

pub(crate) fn f1_score(precision: f64, recall: f64) -> f64 {
    if precision + recall > 0.0 {
        2.0 * precision * recall / (precision + recall)
    } else {
        0.0
    }
}

fn empty_result(threshold: f64, n_gt: usize, n_pred: usize) -> MatchResult {
    let (precision, recall, f1) = match (n_gt, n_pred) {
        (0, 0) => (1.0, 1.0, 1.0),
        (_, 0) => (1.0, 0.0, 0.0),
        _ => (0.0, 1.0, 0.0),
    };
    MatchResult {
        iou_threshold: threshold,
        tp: 0,
        fp: n_pred,
        fn_: n_gt,
        precision,
        recall,
        f1,
        mean_iou: 0.0,
        mean_dice: 0.0,
        n_gt,
        n_pred,
        pairs: vec![],
    }
}

fn candidates(gt: &[Prepared], pred: &[Prepared], class_agnostic: bool) -> Vec<Candidate> {
    pred.par_iter()
        .enumerate()
        .flat_map_iter(|(pi, p)| {
            gt.iter().enumerate().filter_map(move |(gi, g)| {
                if !class_agnostic && g.instance.class_id != p.instance.class_id {
                    return None;
                }
                if !boxes_overlap(&g.bounds, &p.bounds) {
                    return None;
                }
                let (iou, dice) = overlap(g, p);
                (iou > 0.0).then_some(Candidate {
                    gt: gi,
                    pred: pi,
                    iou,
                    dice,
                })
            })
        })
        .collect()
}

fn assign(mut pairs: Vec<Candidate>, threshold: f64, n_gt: usize, n_pred: usize) -> MatchResult {
    // stable: equal IoU keeps prediction-major encounter order
    pairs.sort_by(|a, b| b.iou.total_cmp(&a.iou));

    let mut gt_used = vec![false; n_gt];
    let mut pred_used = vec![false; n_pred];
    let mut matched = Vec::new();
    for c in pairs {
        if c.iou < threshold {
            break;
        }
        if gt_used[c.gt] || pred_used[c.pred] {
            continue;
        }
        gt_used[c.gt] = true;
        pred_used[c.pred] = true;
        matched.push(MatchedPair {
            gt_index: c.gt,
            pred_index: c.pred,
            iou: c.iou,
            dice: c.dice,
        });
    }

    let tp = matched.len();
    let precision = ratio(tp, n_pred);
    let recall = ratio(tp, n_gt);
    let (mean_iou, mean_dice) = if tp > 0 {
        (
            matched.iter().map(|m| m.iou).sum::<f64>() / tp as f64,
            matched.iter().map(|m| m.dice).sum::<f64>() / tp as f64,
        )
    } else {
        (0.0, 0.0)
    };
    MatchResult {
        iou_threshold: threshold,
        tp,
        fp: n_pred - tp,
        fn_: n_gt - tp,
        precision,
        recall,
        f1: f1_score(precision, recall),
        mean_iou,
        mean_dice,
        n_gt,
        n_pred,
        pairs: matched,
    }
}

/// Match predictions against ground truth at a single IoU threshold.
///
/// Both collections must be in the same coordinate space. Pairs of different
/// classes are never considered unless `class_agnostic` is set; they are
/// not counted as class confusions either.
pub fn match_instances(
    gt: &[Instance],
    pred: &[Instance],
    threshold: f64,
    class_agnostic: bool,
) -> MatchResult {
    match_sweep(gt, pred, &[threshold], class_agnostic)
        .pop()
        .unwrap_or_else(|| empty_result(threshold, gt.len(), pred.len()))
}

/// Match at every threshold, computing the pairwise overlaps once.
pub fn match_sweep(
    gt: &[Instance],
    pred: &[Instance],
    thresholds: &[f64],
    class_agnostic: bool,
) -> Vec<MatchResult> {
    if gt.is_empty() || pred.is_empty() {
        return thresholds
            .iter()
            .map(|&t| empty_result(t, gt.len(), pred.len()))
            .collect();
    }
    let gt_prepared: Vec<Prepared> = gt.iter().map(Prepared::new).collect();
    let pred_prepared: Vec<Prepared> = pred.iter().map(Prepared::new).collect();
    let pairs = candidates(&gt_prepared, &pred_prepared, class_agnostic);

    thresholds
        .iter()
        .map(|&t| assign(pairs.clone(), t, gt.len(), pred.len()))
        .collect()
}
