// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Au-Zone Technologies. All Rights Reserved.

//! Tile-local detections and labels into slide space.
//!
//! Every polygon goes through the same chain: repair, flatten, area floor,
//! translate by the tile origin, optional clip to the slide extent, flatten
//! again and apply the area floor once more. The floor is in pixels, which
//! are the same unit in tile and slide space.

use crate::{
    Error,
    coords::{clip_to_bounds, instance_to_global},
    geometry::{Shape, filter_by_area, polygon_from_points, sanitize},
    label::LabelRecord,
    segment::RawDetection,
    tile_id::TileId,
    types::{CoordSpace, Instance},
};
use log::trace;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReconcileOptions {
    /// Area floor in pixels squared.
    pub min_area: f64,
    /// Heal invalid polygons instead of passing them through.
    pub repair_invalid: bool,
    /// Slide extent to clip against.
    pub clip: Option<(u32, u32)>,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            min_area: 1500.0,
            repair_invalid: true,
            clip: None,
        }
    }
}

/// Reconcile a tile-pixel instance of the tile `id` into slide instances
/// carrying its class and score.
pub fn reconcile_instance(
    id: &TileId,
    local: &Instance,
    options: &ReconcileOptions,
) -> Vec<Instance> {
    let shape = Shape::Polygon(local.polygon.clone());
    sanitize(&shape, options.min_area, options.repair_invalid)
        .into_iter()
        .flat_map(|p| {
            let piece = local.with_polygon(p, CoordSpace::TilePixel);
            let global = instance_to_global(&piece, id.x0(), id.y0());
            match options.clip {
                Some((w, h)) => {
                    filter_by_area(clip_to_bounds(&global.polygon, w, h), options.min_area)
                        .into_iter()
                        .map(|q| global.with_polygon(q, CoordSpace::SlidePixel))
                        .collect()
                }
                None => vec![global],
            }
        })
        .collect()
}

fn detection_instance(det: &RawDetection) -> Result<Instance, Error> {
    let polygon = polygon_from_points(&det.polygon).ok_or_else(|| {
        Error::GeometryError(format!(
            "detection needs 3 finite vertices, found {}",
            det.polygon.len()
        ))
    })?;
    Ok(Instance::prediction(polygon, det.class_id, det.confidence, CoordSpace::TilePixel))
}

/// Reconcile raw segmenter output of the tile `id`.
///
/// Detections without a usable outline are dropped.
pub fn reconcile_detections(
    id: &TileId,
    detections: &[RawDetection],
    options: &ReconcileOptions,
) -> Vec<Instance> {
    detections
        .iter()
        .flat_map(|det| match detection_instance(det) {
            Ok(local) => reconcile_instance(id, &local, options),
            Err(err) => {
                trace!("{}: dropping detection: {}", id, err);
                vec![]
            }
        })
        .collect()
}

/// Reconcile decoded ground-truth labels of the tile `id`, whose image is
/// `tile_width` x `tile_height` pixels.
pub fn reconcile_labels(
    id: &TileId,
    records: &[LabelRecord],
    tile_width: u32,
    tile_height: u32,
    options: &ReconcileOptions,
) -> Vec<Instance> {
    records
        .iter()
        .filter_map(|r| r.to_instance(tile_width, tile_height))
        .flat_map(|inst| reconcile_instance(id, &inst, options))
        .collect()
}
