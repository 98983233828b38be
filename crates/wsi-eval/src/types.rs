// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Au-Zone Technologies. All Rights Reserved.

//! Core data model shared by the tiler, the codecs and the matcher.

use geo::{Area, BoundingRect, Polygon, Rect};
use serde::{Deserialize, Serialize};

/// Class id used when the segmentation capability reports no class.
pub const UNKNOWN_CLASS: i32 = -1;

/// A whole-slide image: identifier plus global pixel extent.
///
/// The extent is the source of truth for clipping reconciled geometry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Slide {
    id: String,
    width: u32,
    height: u32,
}

impl Slide {
    pub fn new(id: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            id: id.into(),
            width,
            height,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }
}

/// Coordinate space an [`Instance`] polygon is expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordSpace {
    /// Tile-local, normalized to `[0, 1]` per axis.
    TileNormalized,
    /// Tile-local pixels.
    TilePixel,
    /// Slide-global pixels.
    SlidePixel,
}

/// One labelled or detected object.
///
/// Instances are never mutated once built; every transform produces a new
/// value through [`Instance::with_polygon`].
#[derive(Debug, Clone, PartialEq)]
pub struct Instance {
    pub polygon: Polygon<f64>,
    pub class_id: i32,
    /// Confidence in `[0, 1]`; present only for predictions.
    pub score: Option<f64>,
    pub space: CoordSpace,
}

impl Instance {
    /// Ground-truth instance (no score).
    pub fn ground_truth(polygon: Polygon<f64>, class_id: i32, space: CoordSpace) -> Self {
        Self {
            polygon,
            class_id,
            score: None,
            space,
        }
    }

    /// Predicted instance; the score is clamped into `[0, 1]`.
    pub fn prediction(polygon: Polygon<f64>, class_id: i32, score: f64, space: CoordSpace) -> Self {
        Self {
            polygon,
            class_id,
            score: Some(if score.is_finite() {
                score.clamp(0.0, 1.0)
            } else {
                0.0
            }),
            space,
        }
    }

    /// Same class and score, new geometry in `space`.
    pub fn with_polygon(&self, polygon: Polygon<f64>, space: CoordSpace) -> Self {
        Self {
            polygon,
            class_id: self.class_id,
            score: self.score,
            space,
        }
    }

    pub fn area(&self) -> f64 {
        self.polygon.unsigned_area()
    }

    pub fn bounds(&self) -> Option<Rect<f64>> {
        self.polygon.bounding_rect()
    }
}
