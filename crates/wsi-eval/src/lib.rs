// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Au-Zone Technologies. All Rights Reserved.

//! # Whole-Slide Instance Evaluation
//!
//! Tiling, coordinate reconciliation and object-level evaluation for instance
//! segmentation on gigapixel whole-slide images.
//!
//! A slide is cut into a regular grid of square tiles. Ground truth and model
//! predictions live in tile space as normalized polygon label files; this
//! crate brings both back into slide space, repairs and filters the
//! geometry, matches predictions to ground truth greedily by IoU and reports
//! precision, recall and F1 per slide and micro-averaged over slides across a
//! sweep of IoU thresholds.
//!
//! ## Features
//!
//! - **Tiling**: stride grid, bounded seeded subsampling and a pixel-only
//!   tissue filter
//! - **Tilesets**: JPEG tiles and label files per cross-validation fold
//! - **Reconciliation**: repair, flatten, translate, clip and area filter
//! - **Evaluation**: greedy one-to-one matching and micro aggregation with
//!   CSV, JSON and Arrow reports
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use wsi_eval::{
//!     EvalConfig, Error, StoredPredictions, TilesetPaths, evaluate_tileset,
//! };
//!
//! fn main() -> Result<(), Error> {
//!     let config = EvalConfig::load(None)?;
//!     let segmenter = StoredPredictions::new("predictions")?;
//!     let paths = TilesetPaths {
//!         tiles_dir: "Fold0/TEST/images".into(),
//!         labels_dir: "Fold0/TEST/labels".into(),
//!         slide_dir: None,
//!         out_root: "runs/Fold0".into(),
//!     };
//!     let report = evaluate_tileset(&paths, &segmenter, &config, None, None)?;
//!     println!("{}", report);
//!     Ok(())
//! }
//! ```
//!
//! ## Optional Features
//!
//! - `polars`: writes `results.arrow` next to the CSV and JSON reports
//! - `profiling`: `tracing` spans around the pipeline stages

pub mod config;
pub mod coords;
mod error;
pub mod geojson;
pub mod geometry;
mod instrument;
pub mod label;
pub mod matcher;
pub mod metrics;
pub mod pipeline;
pub mod reader;
pub mod reconcile;
pub mod report;
pub mod segment;
pub mod summary;
pub mod tile_id;
pub mod tiler;
pub mod tileset;
pub mod types;

pub use crate::{
    config::{ClassTable, EvalConfig, EvaluationConfig, FoldSpec, TilingConfig},
    error::Error,
    geometry::Shape,
    matcher::{MatchResult, match_instances, match_sweep},
    metrics::{AggregateReport, SlideEvaluation, aggregate, parse_thresholds},
    pipeline::{Progress, Stage, TilesetPaths, evaluate_tileset, predict_slide},
    reader::{ImageSlide, SlideSource},
    report::EvaluationReport,
    segment::{RawDetection, Segmenter, StoredPredictions, TileImage},
    summary::{FoldSummary, SplitSummary, summarize_folds, summarize_split},
    tile_id::TileId,
    tiler::{TileGrid, TileOrigin, TissueFilter},
    tileset::{FoldPaths, Split, build_folds, build_slide_tiles},
    types::{CoordSpace, Instance, Slide},
};

#[cfg(test)]
mod tests {
    #[ctor::ctor]
    fn init() {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    }
}
