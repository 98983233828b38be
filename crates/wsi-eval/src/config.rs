// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Au-Zone Technologies. All Rights Reserved.

//! Run configuration.
//!
//! Settings are layered: built-in defaults, then an optional TOML, JSON or
//! YAML file, then `WSI_EVAL__<SECTION>__<KEY>` environment variables. When
//! no file is given the platform config directory is searched for
//! `wsi-eval.toml`.
//!
//! ```toml
//! [tiling]
//! tile_size = 640
//! stride = 640
//! max_tiles = 2000
//!
//! [evaluation]
//! iou_thresholds = "0.5:0.95:0.05"
//!
//! [[classes.rules]]
//! pattern = "adenine"
//! class_id = 0
//!
//! [[folds]]
//! name = "Fold0"
//! test = ["WT1-Adenine_x20", "WT4-Normal_x20"]
//! ```

use crate::{
    Error, metrics::parse_thresholds, reconcile::ReconcileOptions, tiler::TissueFilter,
    tile_id::TileId,
    types::Slide,
};
use directories::ProjectDirs;
use log::debug;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const ENV_PREFIX: &str = "WSI_EVAL";
const CONFIG_FILE: &str = "wsi-eval.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TilingConfig {
    pub tile_size: u32,
    pub stride: u32,
    /// Upper bound on tiles per slide; the grid is subsampled beyond it.
    pub max_tiles: Option<usize>,
    pub seed: u64,
    pub jpeg_quality: u8,
    /// Factor applied to ground truth coordinates before tiling.
    pub coord_scale: f64,
    pub min_area: f64,
    pub repair_invalid: bool,
    /// Write empty label files even when ground truth exists.
    pub skip_labels: bool,
}

impl Default for TilingConfig {
    fn default() -> Self {
        Self {
            tile_size: 640,
            stride: 640,
            max_tiles: None,
            seed: 42,
            jpeg_quality: 90,
            coord_scale: 1.0,
            min_area: 1500.0,
            repair_invalid: true,
            skip_labels: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationConfig {
    /// Name written to the `model` column of reports.
    pub model: String,
    /// Range `start:end:step` or comma separated list.
    pub iou_thresholds: String,
    pub class_agnostic: bool,
    pub min_area: f64,
    pub repair_invalid: bool,
    /// Clip reconciled geometry to the slide extent when it is known.
    pub clip_to_slide: bool,
    pub batch_size: usize,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            model: "model".to_string(),
            iou_thresholds: "0.5:0.95:0.05".to_string(),
            class_agnostic: false,
            min_area: 1500.0,
            repair_invalid: true,
            clip_to_slide: true,
            batch_size: 32,
        }
    }
}

impl EvaluationConfig {
    pub fn thresholds(&self) -> Result<Vec<f64>, Error> {
        parse_thresholds(&[self.iou_thresholds.clone()])
    }

    /// Reconcile options for `slide`. Geometry is clipped to its extent when
    /// the slide is known and clipping is enabled.
    pub fn reconcile_options(&self, slide: Option<&Slide>) -> ReconcileOptions {
        ReconcileOptions {
            min_area: self.min_area,
            repair_invalid: self.repair_invalid,
            clip: slide
                .filter(|_| self.clip_to_slide)
                .map(|s| (s.width(), s.height())),
        }
    }
}

/// Case-insensitive substring rule mapping slide ids to a class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassRule {
    pub pattern: String,
    pub class_id: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassTable {
    pub rules: Vec<ClassRule>,
    /// Class names, indexed by class id.
    pub names: Vec<String>,
}

impl Default for ClassTable {
    fn default() -> Self {
        Self {
            rules: vec![
                ClassRule {
                    pattern: "adenine".to_string(),
                    class_id: 0,
                },
                ClassRule {
                    pattern: "normal".to_string(),
                    class_id: 1,
                },
            ],
            names: vec![
                "glomerulus_adenine".to_string(),
                "glomerulus_normal".to_string(),
            ],
        }
    }
}

impl ClassTable {
    /// Class of the first rule whose pattern occurs in `slide_id`.
    pub fn resolve(&self, slide_id: &str) -> Result<i32, Error> {
        let lower = slide_id.to_lowercase();
        self.rules
            .iter()
            .find(|rule| lower.contains(&rule.pattern.to_lowercase()))
            .map(|rule| rule.class_id)
            .ok_or_else(|| Error::UnknownClass(slide_id.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FoldSpec {
    pub name: String,
    /// Slides held out for testing; every other slide trains.
    pub test: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvalConfig {
    pub tiling: TilingConfig,
    pub tissue: TissueFilter,
    pub evaluation: EvaluationConfig,
    pub classes: ClassTable,
    /// Every slide of the study.
    pub slides: Vec<String>,
    pub folds: Vec<FoldSpec>,
}

impl Default for EvalConfig {
    fn default() -> Self {
        let slides: Vec<String> = [
            "WT1-Adenine_x20",
            "WT2-Adenine_x20",
            "WT3-Adenine_x20",
            "WT4-Normal_x20",
            "WT5-Normal_x20",
            "WT6-Normal_x20",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        let folds = (0..3)
            .map(|i| FoldSpec {
                name: format!("Fold{}", i),
                test: vec![slides[i].clone(), slides[i + 3].clone()],
            })
            .collect();
        Self {
            tiling: TilingConfig::default(),
            tissue: TissueFilter::default(),
            evaluation: EvaluationConfig::default(),
            classes: ClassTable::default(),
            slides,
            folds,
        }
    }
}

/// Default configuration file in the platform config directory.
pub fn default_path() -> Option<PathBuf> {
    ProjectDirs::from("com", "Au-Zone", "wsi-eval").map(|dirs| dirs.config_dir().join(CONFIG_FILE))
}

impl EvalConfig {
    /// Load and validate the layered configuration.
    ///
    /// An explicit `path` must exist; the default location is optional.
    pub fn load(path: Option<&Path>) -> Result<Self, Error> {
        let mut builder = config::Config::builder();
        match path {
            Some(path) => {
                debug!("Loading configuration from {:?}", path);
                builder = builder.add_source(config::File::from(path).required(true));
            }
            None => {
                if let Some(default) = default_path() {
                    debug!("Looking for configuration in {:?}", default);
                    builder = builder.add_source(config::File::from(default).required(false));
                }
            }
        }
        let config: EvalConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would fail only after tile work started.
    pub fn validate(&self) -> Result<(), Error> {
        if self.tiling.tile_size == 0 || self.tiling.stride == 0 {
            return Err(Error::Configuration(
                "tile size and stride must be positive".to_string(),
            ));
        }
        if self.tiling.jpeg_quality == 0 || self.tiling.jpeg_quality > 100 {
            return Err(Error::Configuration(format!(
                "JPEG quality {} outside 1..=100",
                self.tiling.jpeg_quality
            )));
        }
        if !(self.tiling.coord_scale.is_finite() && self.tiling.coord_scale > 0.0) {
            return Err(Error::Configuration(format!(
                "invalid coordinate scale {}",
                self.tiling.coord_scale
            )));
        }
        if self.evaluation.batch_size == 0 {
            return Err(Error::Configuration("batch size must be positive".to_string()));
        }
        self.evaluation.thresholds()?;
        for slide in &self.slides {
            TileId::new(slide.as_str(), 0, 0)
                .map_err(|err| Error::Configuration(format!("slide '{}': {}", slide, err)))?;
        }
        for fold in &self.folds {
            if let Some(unknown) = fold.test.iter().find(|s| !self.slides.contains(s)) {
                return Err(Error::Configuration(format!(
                    "fold {} tests unknown slide {}",
                    fold.name, unknown
                )));
            }
        }
        Ok(())
    }

    pub fn fold(&self, name: &str) -> Result<&FoldSpec, Error> {
        self.folds
            .iter()
            .find(|f| f.name == name)
            .ok_or_else(|| Error::Configuration(format!("unknown fold {}", name)))
    }

    /// Training slides of `fold`: every slide not held out, in study order.
    pub fn train_slides(&self, fold: &FoldSpec) -> Vec<String> {
        self.slides
            .iter()
            .filter(|s| !fold.test.contains(s))
            .cloned()
            .collect()
    }
}
