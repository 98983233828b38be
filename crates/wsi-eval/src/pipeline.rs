// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Au-Zone Technologies. All Rights Reserved.

//! Slide-level drivers: prediction over a slide and evaluation of a tileset.
//!
//! Slides are processed one after another. Inside a slide, cropping, image
//! decoding and reconciliation run on the rayon pool with order-preserving
//! collection, and segmentation is called in batches of
//! `evaluation.batch_size` tiles. Progress is published on a
//! [`tokio::sync::watch`] channel with `send_replace`, so observers only ever
//! see the latest state and never slow the pipeline down.

use crate::{
    Error,
    config::EvalConfig,
    geojson::write_feature_collection,
    instrument::stage_span,
    label::read_labels,
    matcher::match_sweep,
    metrics::{SlideEvaluation, aggregate},
    reader::SlideSource,
    reconcile::{ReconcileOptions, reconcile_detections, reconcile_labels},
    report::{EvaluationReport, FailedSlide},
    segment::{Segmenter, TileImage, segment_batch},
    tile_id::TileId,
    tiler::{TileGrid, TileOrigin},
    tileset::write_jpeg,
    types::{Instance, Slide},
};
use itertools::Itertools;
use log::{debug, error, info, warn};
use rayon::prelude::*;
use serde::Serialize;
use std::{
    fs,
    path::{Path, PathBuf},
};
use tokio::sync::watch;

/// Image extensions recognised as tiles.
pub const TILE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

/// Image extensions searched when looking up a slide by id.
pub const SLIDE_EXTENSIONS: [&str; 4] = ["tif", "tiff", "png", "jpg"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    #[default]
    Idle,
    Tiling,
    Predicting,
    Matching,
    Writing,
    Done,
}

/// Latest state of a running job.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Progress {
    pub stage: Stage,
    pub slide: String,
    /// Tiles processed so far in this stage.
    pub current: usize,
    pub total: usize,
    /// Objects detected so far.
    pub objects: usize,
}

pub type ProgressSender = watch::Sender<Progress>;

pub(crate) fn publish(progress: Option<&ProgressSender>, update: Progress) {
    if let Some(tx) = progress {
        tx.send_replace(update);
    }
}

fn has_extension(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| extensions.iter().any(|x| e.eq_ignore_ascii_case(x)))
        .unwrap_or(false)
}

/// Locate `<dir>/<slide_id>.<ext>` for any of the slide extensions.
pub fn find_slide(dir: &Path, slide_id: &str) -> Option<PathBuf> {
    SLIDE_EXTENSIONS
        .iter()
        .map(|ext| dir.join(format!("{}.{}", slide_id, ext)))
        .find(|p| p.is_file())
}

/// Segment and reconcile a whole slide.
///
/// Tiles are selected by the grid, bounded subsampling and the tissue
/// filter; accepted tiles go to `segmenter` in batches. When `tiles_out` is
/// given every accepted tile is also written there as JPEG. The returned
/// instances are in slide pixels, clipped to the slide extent.
pub fn predict_slide(
    source: &dyn SlideSource,
    slide_id: &str,
    segmenter: &dyn Segmenter,
    config: &EvalConfig,
    tiles_out: Option<&Path>,
    progress: Option<&ProgressSender>,
) -> Result<Vec<Instance>, Error> {
    let _span = stage_span("predict", slide_id);
    let tiling = &config.tiling;
    let slide = Slide::new(slide_id, source.width(), source.height());
    let (width, height) = (slide.width(), slide.height());
    let grid = TileGrid::new(width, height, tiling.tile_size, tiling.stride)?;
    let origins = grid.subsample(tiling.max_tiles, tiling.seed);
    let options = config.evaluation.reconcile_options(Some(&slide));
    if let Some(dir) = tiles_out {
        fs::create_dir_all(dir)?;
    }
    info!(
        "{}: {}x{} px, {} of {} tiles selected",
        slide.id(),
        width,
        height,
        origins.len(),
        grid.len()
    );

    let total = origins.len();
    let mut processed = 0;
    let mut accepted = 0;
    let mut instances = Vec::new();
    publish(
        progress,
        Progress {
            stage: Stage::Tiling,
            slide: slide_id.to_string(),
            current: 0,
            total,
            objects: 0,
        },
    );

    for chunk in origins.chunks(config.evaluation.batch_size.max(1)) {
        let cropped: Vec<Option<TileImage>> = chunk
            .par_iter()
            .map(|&origin| crop_tile(source, slide_id, origin, config, tiles_out))
            .collect::<Result<_, Error>>()?;
        let batch: Vec<TileImage> = cropped.into_iter().flatten().collect();
        processed += chunk.len();
        accepted += batch.len();

        if !batch.is_empty() {
            let detections = segment_batch(segmenter, &batch)?;
            let reconciled: Vec<Vec<Instance>> = batch
                .par_iter()
                .zip(detections.par_iter())
                .map(|(tile, dets)| reconcile_detections(&tile.id, dets, &options))
                .collect();
            instances.extend(reconciled.into_iter().flatten());
        }

        publish(
            progress,
            Progress {
                stage: Stage::Predicting,
                slide: slide_id.to_string(),
                current: processed,
                total,
                objects: instances.len(),
            },
        );
    }

    info!(
        "{}: {} tiles passed the tissue filter, {} objects",
        slide_id,
        accepted,
        instances.len()
    );
    publish(
        progress,
        Progress {
            stage: Stage::Done,
            slide: slide_id.to_string(),
            current: total,
            total,
            objects: instances.len(),
        },
    );
    Ok(instances)
}

fn crop_tile(
    source: &dyn SlideSource,
    slide_id: &str,
    origin: TileOrigin,
    config: &EvalConfig,
    tiles_out: Option<&Path>,
) -> Result<Option<TileImage>, Error> {
    let size = config.tiling.tile_size;
    let image = source.crop(origin.x, origin.y, size, size)?;
    if !config.tissue.accepts(&image) {
        return Ok(None);
    }
    let id = TileId::new(slide_id, origin.x, origin.y)?;
    if let Some(dir) = tiles_out {
        write_jpeg(&dir.join(format!("{}.jpg", id)), &image, config.tiling.jpeg_quality)?;
    }
    Ok(Some(TileImage { id, image }))
}

/// Inputs of [`evaluate_tileset`].
#[derive(Debug, Clone)]
pub struct TilesetPaths {
    pub tiles_dir: PathBuf,
    pub labels_dir: PathBuf,
    /// Directory of the source slides, used for their pixel extent.
    pub slide_dir: Option<PathBuf>,
    /// Root for `gt/`, `pred/` and `eval/` outputs.
    pub out_root: PathBuf,
}

/// Tiles of one slide.
struct SlideTiles {
    slide_id: String,
    tiles: Vec<(TileId, PathBuf)>,
}

fn collect_tiles(tiles_dir: &Path, only_slide: Option<&str>) -> Result<Vec<SlideTiles>, Error> {
    let mut tiles = Vec::new();
    for entry in walkdir::WalkDir::new(tiles_dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
    {
        let entry = entry?;
        let path = entry.path();
        if !entry.file_type().is_file() || !has_extension(path, &TILE_EXTENSIONS) {
            continue;
        }
        match TileId::from_path(path) {
            Ok(id) => tiles.push((id, path.to_path_buf())),
            Err(err) => debug!("skipping {:?}: {}", path, err),
        }
    }

    let groups = tiles
        .into_iter()
        .filter(|(id, _)| only_slide.is_none_or(|s| id.slide() == s))
        .into_group_map_by(|(id, _)| id.slide().to_string());
    Ok(groups
        .into_iter()
        .sorted_by(|a, b| a.0.cmp(&b.0))
        .map(|(slide_id, tiles)| SlideTiles { slide_id, tiles })
        .collect())
}

fn tile_dimensions(path: &Path, fallback: u32) -> (u32, u32) {
    match imagesize::size(path) {
        Ok(size) => (size.width as u32, size.height as u32),
        Err(err) => {
            warn!("cannot read size of {:?} ({}), assuming {} px", path, err, fallback);
            (fallback, fallback)
        }
    }
}

fn load_ground_truth(
    slide: &SlideTiles,
    labels_dir: &Path,
    tile_size: u32,
    options: &ReconcileOptions,
) -> Result<Vec<Instance>, Error> {
    let per_tile: Vec<Vec<Instance>> = slide
        .tiles
        .par_iter()
        .map(|(id, image_path)| {
            let label_path = labels_dir.join(format!("{}.txt", id));
            if !label_path.is_file() {
                // background tiles may have no label file
                return Ok(vec![]);
            }
            let records = read_labels(&label_path)?;
            let (w, h) = tile_dimensions(image_path, tile_size);
            Ok(reconcile_labels(id, &records, w, h, options))
        })
        .collect::<Result<_, Error>>()?;
    Ok(per_tile.into_iter().flatten().collect())
}

fn load_tile(id: &TileId, path: &Path) -> Result<TileImage, Error> {
    let image = image::ImageReader::open(path)?
        .with_guessed_format()?
        .decode()?
        .to_rgb8();
    Ok(TileImage {
        id: id.clone(),
        image,
    })
}

fn predict_tiles(
    slide: &SlideTiles,
    segmenter: &dyn Segmenter,
    batch_size: usize,
    options: &ReconcileOptions,
    progress: Option<&ProgressSender>,
) -> Result<Vec<Instance>, Error> {
    let total = slide.tiles.len();
    let mut instances = Vec::new();
    let mut processed = 0;
    for chunk in slide.tiles.chunks(batch_size.max(1)) {
        let batch: Vec<TileImage> = chunk
            .par_iter()
            .map(|(id, path)| load_tile(id, path))
            .collect::<Result<_, Error>>()?;
        let detections = segment_batch(segmenter, &batch)?;
        let reconciled: Vec<Vec<Instance>> = batch
            .par_iter()
            .zip(detections.par_iter())
            .map(|(tile, dets)| reconcile_detections(&tile.id, dets, options))
            .collect();
        instances.extend(reconciled.into_iter().flatten());
        processed += chunk.len();
        publish(
            progress,
            Progress {
                stage: Stage::Predicting,
                slide: slide.slide_id.clone(),
                current: processed,
                total,
                objects: instances.len(),
            },
        );
    }
    Ok(instances)
}

fn slide_extent(slide_dir: Option<&Path>, slide_id: &str) -> Option<Slide> {
    let dir = slide_dir?;
    let Some(path) = find_slide(dir, slide_id) else {
        warn!("{}: slide not found in {:?}, geometry is not clipped", slide_id, dir);
        return None;
    };
    match imagesize::size(&path) {
        Ok(size) => Some(Slide::new(slide_id, size.width as u32, size.height as u32)),
        Err(err) => {
            warn!("{}: cannot read slide size ({}), geometry is not clipped", slide_id, err);
            None
        }
    }
}

fn evaluate_slide(
    slide: &SlideTiles,
    paths: &TilesetPaths,
    segmenter: &dyn Segmenter,
    config: &EvalConfig,
    thresholds: &[f64],
    progress: Option<&ProgressSender>,
) -> Result<SlideEvaluation, Error> {
    let slide_id = slide.slide_id.as_str();
    let _span = stage_span("evaluate", slide_id);
    info!("{}: {} tiles", slide_id, slide.tiles.len());

    let extent = slide_extent(paths.slide_dir.as_deref(), slide_id);
    let options = config.evaluation.reconcile_options(extent.as_ref());

    let gt = load_ground_truth(slide, &paths.labels_dir, config.tiling.tile_size, &options)?;
    let pred = predict_tiles(
        slide,
        segmenter,
        config.evaluation.batch_size,
        &options,
        progress,
    )?;

    publish(
        progress,
        Progress {
            stage: Stage::Writing,
            slide: slide_id.to_string(),
            current: slide.tiles.len(),
            total: slide.tiles.len(),
            objects: pred.len(),
        },
    );
    let gt_path = paths
        .out_root
        .join("gt")
        .join(slide_id)
        .join("geojson")
        .join(format!("{}.geojson", slide_id));
    write_feature_collection(&gt_path, &gt)?;
    let pred_path = paths
        .out_root
        .join("pred")
        .join(slide_id)
        .join("geojson")
        .join(format!("{}.geojson", slide_id));
    write_feature_collection(&pred_path, &pred)?;
    debug!("{}: wrote {:?} and {:?}", slide_id, gt_path, pred_path);

    publish(
        progress,
        Progress {
            stage: Stage::Matching,
            slide: slide_id.to_string(),
            current: slide.tiles.len(),
            total: slide.tiles.len(),
            objects: pred.len(),
        },
    );
    let results = {
        let _span = stage_span("match", slide_id);
        match_sweep(&gt, &pred, thresholds, config.evaluation.class_agnostic)
    };
    for r in results
        .iter()
        .filter(|r| [0.5, 0.75].iter().any(|t| (r.iou_threshold - t).abs() < 1e-9))
    {
        info!(
            "{} @IoU {:.2}: P={:.4} R={:.4} F1={:.4} (TP={} FP={} FN={})",
            slide_id, r.iou_threshold, r.precision, r.recall, r.f1, r.tp, r.fp, r.fn_
        );
    }

    Ok(SlideEvaluation {
        slide_id: slide_id.to_string(),
        tile_count: slide.tiles.len(),
        results,
    })
}

/// Evaluate a tileset against ground truth labels.
///
/// Tiles are grouped by slide through their names. Ground truth comes from
/// the per-tile label files, predictions from `segmenter`; both are
/// reconciled into slide space, written as GeoJSON under `gt/` and `pred/`,
/// matched at every threshold and aggregated. Reports go to `eval/`.
///
/// Configuration problems and segmentation failures abort the run. Any other
/// failure on one slide is logged, the slide is listed in the report's
/// failed slides and the remaining slides are still evaluated.
pub fn evaluate_tileset(
    paths: &TilesetPaths,
    segmenter: &dyn Segmenter,
    config: &EvalConfig,
    only_slide: Option<&str>,
    progress: Option<&ProgressSender>,
) -> Result<EvaluationReport, Error> {
    let thresholds = config.evaluation.thresholds()?;
    if !paths.tiles_dir.is_dir() {
        return Err(Error::Configuration(format!(
            "tiles directory {:?} not found",
            paths.tiles_dir
        )));
    }
    if !paths.labels_dir.is_dir() {
        return Err(Error::Configuration(format!(
            "labels directory {:?} not found",
            paths.labels_dir
        )));
    }
    let slides = collect_tiles(&paths.tiles_dir, only_slide)?;
    if slides.is_empty() {
        return Err(Error::Configuration(format!(
            "no tiles to evaluate in {:?}",
            paths.tiles_dir
        )));
    }
    info!(
        "Evaluating {} slides at IoU {:?}{}",
        slides.len(),
        thresholds,
        if config.evaluation.class_agnostic {
            " (class agnostic)"
        } else {
            ""
        }
    );

    let mut evaluations = Vec::new();
    let mut failed = Vec::new();
    for slide in &slides {
        match evaluate_slide(slide, paths, segmenter, config, &thresholds, progress) {
            Ok(evaluation) => evaluations.push(evaluation),
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => {
                error!("{}: evaluation failed: {}", slide.slide_id, err);
                failed.push(FailedSlide {
                    slide_id: slide.slide_id.clone(),
                    error: err.to_string(),
                });
            }
        }
    }

    let aggregate = aggregate(&thresholds, &evaluations)?;
    let report = EvaluationReport::new(
        &config.evaluation.model,
        &thresholds,
        config.evaluation.class_agnostic,
        &evaluations,
        &aggregate,
        failed,
    );
    report.write(&paths.out_root.join("eval"))?;
    info!(
        "Mean F1 over {} IoU thresholds: {:.4}",
        thresholds.len(),
        report.mean_f1
    );
    publish(
        progress,
        Progress {
            stage: Stage::Done,
            slide: String::new(),
            current: slides.len(),
            total: slides.len(),
            objects: 0,
        },
    );
    Ok(report)
}
