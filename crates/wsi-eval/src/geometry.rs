// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Au-Zone Technologies. All Rights Reserved.

//! Polygon repair and decomposition.
//!
//! Segmentation output and hand-drawn annotations routinely contain bow-ties,
//! collinear slivers and rings that touch themselves. Everything that reaches
//! the matcher goes through this module first:
//!
//! 1. [`repair`] keeps valid geometry untouched and heals invalid geometry with
//!    a zero-width overlay (the polygon is unioned with itself, which resolves
//!    self-intersections into proper rings).
//! 2. [`flatten`] decomposes whatever came out into simple exterior-only
//!    polygons, discarding lines and points.
//! 3. [`filter_by_area`] drops fragments below the area floor.
//!
//! All three are idempotent.

use geo::{
    Area, BooleanOps, Coord, Geometry, GeometryCollection, LineString, MultiPolygon, Polygon,
    Validation,
};

/// Closed set of geometry kinds that repair and clipping can produce.
#[derive(Debug, Clone, PartialEq)]
pub enum Shape {
    Empty,
    Polygon(Polygon<f64>),
    MultiPolygon(MultiPolygon<f64>),
    /// Heterogeneous collection, possibly holding lines or points.
    Mixed(GeometryCollection<f64>),
}

impl Shape {
    pub fn is_empty(&self) -> bool {
        match self {
            Shape::Empty => true,
            Shape::Polygon(_) => false,
            Shape::MultiPolygon(mp) => mp.0.is_empty(),
            Shape::Mixed(gc) => gc.0.is_empty(),
        }
    }

    /// Collapse a list of polygons to the narrowest variant.
    pub fn from_polygons(mut polygons: Vec<Polygon<f64>>) -> Self {
        match polygons.len() {
            0 => Shape::Empty,
            1 => Shape::Polygon(polygons.remove(0)),
            _ => Shape::MultiPolygon(MultiPolygon::new(polygons)),
        }
    }
}

impl From<Polygon<f64>> for Shape {
    fn from(polygon: Polygon<f64>) -> Self {
        Shape::Polygon(polygon)
    }
}

impl From<MultiPolygon<f64>> for Shape {
    fn from(mp: MultiPolygon<f64>) -> Self {
        Shape::MultiPolygon(mp)
    }
}

impl From<Geometry<f64>> for Shape {
    fn from(geometry: Geometry<f64>) -> Self {
        match geometry {
            Geometry::Polygon(p) => Shape::Polygon(p),
            Geometry::MultiPolygon(mp) => Shape::MultiPolygon(mp),
            Geometry::Rect(r) => Shape::Polygon(r.to_polygon()),
            Geometry::Triangle(t) => Shape::Polygon(t.to_polygon()),
            Geometry::GeometryCollection(gc) => Shape::Mixed(gc),
            other => Shape::Mixed(GeometryCollection::new_from(vec![other])),
        }
    }
}

/// Build a polygon from raw vertices, dropping an explicit closing vertex.
///
/// Returns `None` when fewer than three vertices remain or any coordinate is
/// not finite.
pub fn polygon_from_points(points: &[(f64, f64)]) -> Option<Polygon<f64>> {
    let mut coords: Vec<Coord<f64>> = points.iter().map(|&(x, y)| Coord { x, y }).collect();
    if coords.iter().any(|c| !c.x.is_finite() || !c.y.is_finite()) {
        return None;
    }
    if coords.len() >= 2 && coords.first() == coords.last() {
        coords.pop();
    }
    if coords.len() < 3 {
        return None;
    }
    Some(Polygon::new(LineString::new(coords), vec![]))
}

fn is_finite(polygon: &Polygon<f64>) -> bool {
    polygon
        .exterior()
        .coords()
        .chain(polygon.interiors().iter().flat_map(|ring| ring.coords()))
        .all(|c| c.x.is_finite() && c.y.is_finite())
}

fn is_sound(polygon: &Polygon<f64>) -> bool {
    is_finite(polygon) && polygon.is_valid() && polygon.unsigned_area() > 0.0
}

fn heal(polygon: &Polygon<f64>) -> Vec<Polygon<f64>> {
    if !is_finite(polygon) || polygon.exterior().0.len() < 4 {
        return vec![];
    }
    polygon
        .union(polygon)
        .into_iter()
        .filter(is_sound)
        .collect()
}

/// Repair a shape.
///
/// Valid polygons are returned unchanged. Invalid ones are healed; pieces that
/// are still invalid or have no area are dropped, and [`Shape::Empty`] is
/// returned when nothing survives. Multi-part shapes are repaired component
/// by component so already valid parts are never rewritten.
pub fn repair(shape: &Shape) -> Shape {
    match shape {
        Shape::Empty => Shape::Empty,
        Shape::Polygon(p) if is_sound(p) => Shape::Polygon(p.clone()),
        Shape::Polygon(p) => Shape::from_polygons(heal(p)),
        Shape::MultiPolygon(mp) => {
            let parts: Vec<Polygon<f64>> = mp
                .iter()
                .flat_map(|p| {
                    if is_sound(p) {
                        vec![p.clone()]
                    } else {
                        heal(p)
                    }
                })
                .collect();
            if parts.len() == mp.0.len() && parts.iter().zip(mp.iter()).all(|(a, b)| a == b) {
                Shape::MultiPolygon(mp.clone())
            } else {
                Shape::from_polygons(parts)
            }
        }
        Shape::Mixed(gc) => {
            let parts: Vec<Geometry<f64>> = gc
                .iter()
                .filter_map(|g| match g {
                    Geometry::Polygon(_)
                    | Geometry::MultiPolygon(_)
                    | Geometry::Rect(_)
                    | Geometry::Triangle(_)
                    | Geometry::GeometryCollection(_) => {
                        match repair(&Shape::from(g.clone())) {
                            Shape::Empty => None,
                            Shape::Polygon(p) => Some(Geometry::Polygon(p)),
                            Shape::MultiPolygon(mp) => Some(Geometry::MultiPolygon(mp)),
                            Shape::Mixed(inner) => Some(Geometry::GeometryCollection(inner)),
                        }
                    }
                    // non-areal members pass through; flatten discards them
                    other => Some(other.clone()),
                })
                .collect();
            if parts.is_empty() {
                Shape::Empty
            } else {
                Shape::Mixed(GeometryCollection::new_from(parts))
            }
        }
    }
}

/// Decompose any shape into simple exterior-only polygons.
///
/// Holes are dropped: instances are described by their outline only.
pub fn flatten(shape: &Shape) -> Vec<Polygon<f64>> {
    match shape {
        Shape::Empty => vec![],
        Shape::Polygon(p) => exterior_only(p).into_iter().collect(),
        Shape::MultiPolygon(mp) => mp.iter().filter_map(exterior_only).collect(),
        Shape::Mixed(gc) => gc
            .iter()
            .flat_map(|g| match g {
                Geometry::Polygon(_)
                | Geometry::MultiPolygon(_)
                | Geometry::Rect(_)
                | Geometry::Triangle(_)
                | Geometry::GeometryCollection(_) => flatten(&Shape::from(g.clone())),
                _ => vec![],
            })
            .collect(),
    }
}

fn exterior_only(polygon: &Polygon<f64>) -> Option<Polygon<f64>> {
    if polygon.exterior().0.len() < 4 {
        return None;
    }
    if polygon.interiors().is_empty() {
        Some(polygon.clone())
    } else {
        Some(Polygon::new(polygon.exterior().clone(), vec![]))
    }
}

/// Drop polygons whose area is below `min_area`.
///
/// The floor is interpreted in whatever coordinate space the polygons are
/// currently in; callers scale it beforehand.
pub fn filter_by_area(polygons: Vec<Polygon<f64>>, min_area: f64) -> Vec<Polygon<f64>> {
    polygons
        .into_iter()
        .filter(|p| {
            let area = p.unsigned_area();
            area > 0.0 && area >= min_area
        })
        .collect()
}

/// `repair` (optional), `flatten` and `filter_by_area` in one call.
pub fn sanitize(shape: &Shape, min_area: f64, repair_invalid: bool) -> Vec<Polygon<f64>> {
    let shape = if repair_invalid {
        repair(shape)
    } else {
        shape.clone()
    };
    filter_by_area(flatten(&shape), min_area)
}
