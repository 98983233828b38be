// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Au-Zone Technologies. All Rights Reserved.

//! GeoJSON FeatureCollection reading and writing.
//!
//! Written collections hold one `Polygon` feature per instance with a single
//! closed exterior ring in slide pixels. Reading accepts `Polygon` and
//! `MultiPolygon` geometries; other geometry types and features without
//! geometry are ignored.

use crate::{
    Error,
    geometry::{Shape, flatten, repair},
    types::{CoordSpace, Instance, UNKNOWN_CLASS},
};
use geo::{Coord, LineString, MultiPolygon, Polygon, Scale};
use log::debug;
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureCollection {
    #[serde(rename = "type")]
    pub kind: String,
    pub features: Vec<Feature>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    #[serde(rename = "type")]
    pub kind: String,
    pub geometry: Option<GeoJsonGeometry>,
    #[serde(default)]
    pub properties: Option<Properties>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Properties {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub class_id: Option<i32>,
}

type Ring = Vec<Vec<f64>>;

/// The subset of GeoJSON geometries this crate understands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum GeoJsonGeometry {
    Polygon { coordinates: Vec<Ring> },
    MultiPolygon { coordinates: Vec<Vec<Ring>> },
    #[serde(other)]
    Unsupported,
}

fn ring_to_line_string(ring: &Ring) -> Option<LineString<f64>> {
    let coords: Vec<Coord<f64>> = ring
        .iter()
        .map(|xy| match xy.as_slice() {
            [x, y, ..] => Some(Coord { x: *x, y: *y }),
            _ => None,
        })
        .collect::<Option<_>>()?;
    (coords.len() >= 3).then(|| LineString::new(coords))
}

fn rings_to_polygon(rings: &[Ring]) -> Option<Polygon<f64>> {
    let (exterior, interiors) = rings.split_first()?;
    let exterior = ring_to_line_string(exterior)?;
    let interiors = interiors.iter().filter_map(ring_to_line_string).collect();
    Some(Polygon::new(exterior, interiors))
}

impl GeoJsonGeometry {
    pub fn to_shape(&self) -> Shape {
        match self {
            GeoJsonGeometry::Polygon { coordinates } => rings_to_polygon(coordinates)
                .map(Shape::Polygon)
                .unwrap_or(Shape::Empty),
            GeoJsonGeometry::MultiPolygon { coordinates } => {
                let parts: Vec<Polygon<f64>> = coordinates
                    .iter()
                    .filter_map(|rings| rings_to_polygon(rings))
                    .collect();
                if parts.is_empty() {
                    Shape::Empty
                } else {
                    Shape::MultiPolygon(MultiPolygon::new(parts))
                }
            }
            GeoJsonGeometry::Unsupported => Shape::Empty,
        }
    }

    fn from_polygon(polygon: &Polygon<f64>) -> Self {
        let mut ring: Ring = polygon.exterior().coords().map(|c| vec![c.x, c.y]).collect();
        if ring.first() != ring.last() {
            if let Some(first) = ring.first().cloned() {
                ring.push(first);
            }
        }
        GeoJsonGeometry::Polygon {
            coordinates: vec![ring],
        }
    }
}

impl FeatureCollection {
    /// One feature per instance, carrying its score and class when known.
    pub fn from_instances(instances: &[Instance]) -> Self {
        let features = instances
            .iter()
            .map(|inst| Feature {
                kind: "Feature".to_string(),
                geometry: Some(GeoJsonGeometry::from_polygon(&inst.polygon)),
                properties: Some(Properties {
                    score: inst.score,
                    class_id: Some(inst.class_id),
                }),
            })
            .collect();
        FeatureCollection {
            kind: "FeatureCollection".to_string(),
            features,
        }
    }

    /// Every polygonal feature as one shape with its properties.
    pub fn shapes(&self) -> Vec<(Shape, Properties)> {
        self.features
            .iter()
            .filter_map(|f| {
                let shape = f.geometry.as_ref()?.to_shape();
                if shape.is_empty() {
                    debug!("skipping feature without polygonal geometry");
                    return None;
                }
                Some((shape, f.properties.clone().unwrap_or_default()))
            })
            .collect()
    }
}

pub fn read_feature_collection(path: &Path) -> Result<FeatureCollection, Error> {
    let text = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}

pub fn write_feature_collection(path: &Path, instances: &[Instance]) -> Result<(), Error> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let collection = FeatureCollection::from_instances(instances);
    fs::write(path, serde_json::to_string(&collection)?)?;
    Ok(())
}

/// Load slide-space ground truth polygons.
///
/// Geometry is optionally repaired, then scaled by `coord_scale` about the
/// origin (annotations drawn on a downsampled pyramid level). Holes are
/// dropped and zero-area pieces discarded. Features without a `class_id`
/// property get `default_class`.
pub fn read_ground_truth(
    path: &Path,
    coord_scale: f64,
    repair_invalid: bool,
    default_class: i32,
) -> Result<Vec<Instance>, Error> {
    let collection = read_feature_collection(path)?;
    let mut instances = Vec::new();
    for (shape, properties) in collection.shapes() {
        let shape = if repair_invalid { repair(&shape) } else { shape };
        let class_id = properties.class_id.unwrap_or(default_class);
        for polygon in flatten(&shape) {
            let polygon = if coord_scale != 1.0 {
                polygon.scale_around_point(coord_scale, coord_scale, Coord { x: 0.0, y: 0.0 })
            } else {
                polygon
            };
            let instance = Instance::ground_truth(polygon, class_id, CoordSpace::SlidePixel);
            if instance.area() > 0.0 {
                instances.push(instance);
            }
        }
    }
    Ok(instances)
}

/// Load a written prediction collection back into instances.
pub fn read_predictions(path: &Path) -> Result<Vec<Instance>, Error> {
    let collection = read_feature_collection(path)?;
    Ok(collection
        .shapes()
        .into_iter()
        .flat_map(|(shape, properties)| {
            flatten(&shape).into_iter().map(move |p| {
                let class_id = properties.class_id.unwrap_or(UNKNOWN_CLASS);
                match properties.score {
                    Some(score) => Instance::prediction(p, class_id, score, CoordSpace::SlidePixel),
                    None => Instance::ground_truth(p, class_id, CoordSpace::SlidePixel),
                }
            })
        })
        .collect())
}
