// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Au-Zone Technologies. All Rights Reserved.

//! Polygon label text format.
//!
//! One instance per line:
//!
//! ```text
//! <class> x1 y1 x2 y2 ... xn yn [confidence]
//! ```
//!
//! Coordinates are normalized to the tile's pixel size. The class may be
//! written as an integer or an integral float (`1.0`). Prediction files may append a
//! confidence, recognised by the odd number of values after the class. An
//! empty file means the tile has no instances.

use crate::{
    Error,
    coords::{denormalize, instance_denormalize, normalize},
    geometry::polygon_from_points,
    types::{CoordSpace, Instance},
};
use geo::Polygon;
use log::debug;
use std::{fs, path::Path};

/// Minimum tokens on a line: class + three points.
const MIN_TOKENS: usize = 7;

/// One decoded label line, still in normalized tile coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelRecord {
    pub class_id: i32,
    pub points: Vec<(f64, f64)>,
    pub confidence: Option<f64>,
}

impl LabelRecord {
    /// Polygon in tile pixels for a tile of the given pixel size.
    pub fn polygon(&self, tile_width: u32, tile_height: u32) -> Option<Polygon<f64>> {
        polygon_from_points(&self.points).map(|p| denormalize(&p, tile_width, tile_height))
    }

    /// The record as a normalized instance. Predictions keep their
    /// confidence.
    pub fn normalized_instance(&self) -> Option<Instance> {
        let polygon = polygon_from_points(&self.points)?;
        Some(match self.confidence {
            Some(score) => {
                Instance::prediction(polygon, self.class_id, score, CoordSpace::TileNormalized)
            }
            None => Instance::ground_truth(polygon, self.class_id, CoordSpace::TileNormalized),
        })
    }

    /// The record as an instance in tile pixels.
    pub fn to_instance(&self, tile_width: u32, tile_height: u32) -> Option<Instance> {
        self.normalized_instance()
            .map(|inst| instance_denormalize(&inst, tile_width, tile_height))
    }
}

fn is_close(a: f64, b: f64) -> bool {
    (a - b).abs() <= 1e-8 + 1e-5 * b.abs()
}

fn parse_line(line: &str, allow_confidence: bool) -> Result<LabelRecord, Error> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.len() < MIN_TOKENS {
        return Err(Error::ParseError(format!(
            "expected at least {} values, found {}",
            MIN_TOKENS,
            tokens.len()
        )));
    }
    let class: f64 = tokens[0]
        .parse()
        .map_err(|_| Error::ParseError(format!("invalid class '{}'", tokens[0])))?;
    if !class.is_finite()
        || class.fract() != 0.0
        || class < i32::MIN as f64
        || class > i32::MAX as f64
    {
        return Err(Error::ParseError(format!("invalid class '{}'", tokens[0])));
    }

    let mut values = tokens[1..]
        .iter()
        .map(|t| {
            t.parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .ok_or_else(|| Error::ParseError(format!("invalid value '{}'", t)))
        })
        .collect::<Result<Vec<f64>, Error>>()?;

    let confidence = if values.len() % 2 == 1 {
        if !allow_confidence {
            return Err(Error::ParseError(
                "odd number of coordinates".to_string(),
            ));
        }
        values.pop()
    } else {
        None
    };

    let mut points: Vec<(f64, f64)> = values
        .chunks_exact(2)
        .map(|xy| (xy[0].clamp(0.0, 1.0), xy[1].clamp(0.0, 1.0)))
        .collect();
    if points.len() >= 2 {
        let (first, last) = (points[0], points[points.len() - 1]);
        if is_close(last.0, first.0) && is_close(last.1, first.1) {
            points.pop();
        }
    }
    if points.len() < 3 {
        return Err(Error::ParseError(format!(
            "polygon needs 3 points, found {}",
            points.len()
        )));
    }

    Ok(LabelRecord {
        class_id: class as i32,
        points,
        confidence,
    })
}

/// Decode a ground-truth line.
pub fn decode_line(line: &str) -> Result<LabelRecord, Error> {
    parse_line(line, false)
}

/// Decode a prediction line, which may carry a trailing confidence.
pub fn decode_prediction_line(line: &str) -> Result<LabelRecord, Error> {
    parse_line(line, true)
}

fn decode_with(text: &str, parse: fn(&str) -> Result<LabelRecord, Error>) -> Vec<LabelRecord> {
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .filter_map(|(n, line)| match parse(line) {
            Ok(record) => Some(record),
            Err(err) => {
                debug!("skipping label line {}: {}", n + 1, err);
                None
            }
        })
        .collect()
}

/// Decode every well-formed line; malformed lines are skipped.
pub fn decode_str(text: &str) -> Vec<LabelRecord> {
    decode_with(text, decode_line)
}

/// Like [`decode_str`] for prediction files.
pub fn decode_prediction_str(text: &str) -> Vec<LabelRecord> {
    decode_with(text, decode_prediction_line)
}

pub fn read_labels(path: &Path) -> Result<Vec<LabelRecord>, Error> {
    Ok(decode_str(&fs::read_to_string(path)?))
}

/// Encode one tile-pixel polygon; `None` when fewer than three vertices
/// remain.
pub fn encode_polygon(
    polygon: &Polygon<f64>,
    class_id: i32,
    tile_width: u32,
    tile_height: u32,
) -> Option<String> {
    let normalized = normalize(polygon, tile_width, tile_height);
    let mut coords = normalized.exterior().0.clone();
    if coords.len() >= 2 && coords.first() == coords.last() {
        coords.pop();
    }
    if coords.len() < 3 {
        return None;
    }
    let mut line = class_id.to_string();
    for c in coords {
        line.push_str(&format!(" {:.6} {:.6}", c.x, c.y));
    }
    Some(line)
}

/// Encode instances held in tile pixels into label file content.
pub fn encode(instances: &[Instance], tile_width: u32, tile_height: u32) -> String {
    let mut out = String::new();
    for instance in instances {
        if let Some(line) = encode_polygon(&instance.polygon, instance.class_id, tile_width, tile_height)
        {
            out.push_str(&line);
            out.push('\n');
        }
    }
    out
}

pub fn write_labels(
    path: &Path,
    instances: &[Instance],
    tile_width: u32,
    tile_height: u32,
) -> Result<(), Error> {
    fs::write(path, encode(instances, tile_width, tile_height))?;
    Ok(())
}
