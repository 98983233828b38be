// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Au-Zone Technologies. All Rights Reserved.

//! Coordinate conversion between tile-local and slide-global space.
//!
//! ## Coordinate Systems
//!
//! - **Tile normalized**: `[0, 1]` per axis relative to the tile's actual pixel
//!   size (edge tiles are not square in general)
//! - **Tile pixel**: pixels, origin at the tile's top-left corner
//! - **Slide pixel**: pixels, origin at the slide's top-left corner
//!
//! Translation is a plain per-vertex offset. `to_local(to_global(p))`
//! returns `p` exactly when every sum `p + origin` is representable in
//! `f64`. Otherwise each vertex lands within one ULP of its slide
//! coordinate `p + origin`, so the error grows with the tile origin.

use crate::{
    geometry::{Shape, flatten},
    types::{CoordSpace, Instance},
};
use geo::{BooleanOps, Coord, LineString, MapCoords, Polygon, Rect, Translate};

/// Translate a tile-local pixel polygon into slide space.
pub fn to_global(polygon: &Polygon<f64>, x0: u32, y0: u32) -> Polygon<f64> {
    polygon.translate(x0 as f64, y0 as f64)
}

/// Inverse of [`to_global`].
pub fn to_local(polygon: &Polygon<f64>, x0: u32, y0: u32) -> Polygon<f64> {
    polygon.translate(-(x0 as f64), -(y0 as f64))
}

/// Intersect a polygon with the rectangle `[0, width] x [0, height]`.
///
/// Clipping can split a concave outline, so the result is a list of zero or
/// more simple polygons.
pub fn clip_to_bounds(polygon: &Polygon<f64>, width: u32, height: u32) -> Vec<Polygon<f64>> {
    let bounds = Rect::new(
        Coord { x: 0.0, y: 0.0 },
        Coord {
            x: width as f64,
            y: height as f64,
        },
    )
    .to_polygon();
    flatten(&Shape::MultiPolygon(polygon.intersection(&bounds)))
}

/// Map tile pixel coordinates into `[0, 1]` per axis.
///
/// Out-of-range values are clamped silently.
pub fn normalize(polygon: &Polygon<f64>, tile_width: u32, tile_height: u32) -> Polygon<f64> {
    let w = tile_width.max(1) as f64;
    let h = tile_height.max(1) as f64;
    map_exterior(polygon, |c| Coord {
        x: (c.x / w).clamp(0.0, 1.0),
        y: (c.y / h).clamp(0.0, 1.0),
    })
}

/// Map normalized coordinates back to tile pixels.
pub fn denormalize(polygon: &Polygon<f64>, tile_width: u32, tile_height: u32) -> Polygon<f64> {
    let w = tile_width as f64;
    let h = tile_height as f64;
    map_exterior(polygon, |c| Coord {
        x: c.x * w,
        y: c.y * h,
    })
}

fn map_exterior(polygon: &Polygon<f64>, f: impl Fn(Coord<f64>) -> Coord<f64> + Copy) -> Polygon<f64> {
    let exterior: LineString<f64> = polygon.exterior().map_coords(f);
    Polygon::new(exterior, vec![])
}

/// Move a tile-pixel instance into slide space at origin `(x0, y0)`.
pub fn instance_to_global(instance: &Instance, x0: u32, y0: u32) -> Instance {
    instance.with_polygon(to_global(&instance.polygon, x0, y0), CoordSpace::SlidePixel)
}

/// Convert a normalized instance into tile pixels.
pub fn instance_denormalize(instance: &Instance, tile_width: u32, tile_height: u32) -> Instance {
    instance.with_polygon(
        denormalize(&instance.polygon, tile_width, tile_height),
        CoordSpace::TilePixel,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::{Area, polygon};

    #[test]
    fn test_global_local_roundtrip() {
        let p = polygon![
            (x: 0.5, y: 1.25),
            (x: 639.75, y: 3.0),
            (x: 320.125, y: 639.5),
        ];
        for &(x0, y0) in &[(0u32, 0u32), (640, 0), (1_234_560, 9_876_480), (u32::MAX / 2, 7)] {
            let back = to_local(&to_global(&p, x0, y0), x0, y0);
            assert_eq!(back, p);
        }
    }

    #[test]
    fn test_global_local_roundtrip_within_one_ulp() {
        let p = polygon![
            (x: 0.1, y: 3.3),
            (x: 639.7, y: 0.2),
            (x: 123.456789, y: 600.9),
        ];
        for &(x0, y0) in &[(640u32, 1280u32), (98_765, 43_210), (u32::MAX / 2, 7)] {
            let back = to_local(&to_global(&p, x0, y0), x0, y0);
            for (a, b) in p.exterior().coords().zip(back.exterior().coords()) {
                // |v| * EPSILON is at least one ULP of v
                let ulp_x = (a.x + x0 as f64).abs() * f64::EPSILON;
                let ulp_y = (a.y + y0 as f64).abs() * f64::EPSILON;
                assert!((a.x - b.x).abs() <= ulp_x, "{} vs {}", a.x, b.x);
                assert!((a.y - b.y).abs() <= ulp_y, "{} vs {}", a.y, b.y);
            }
        }
    }

    #[test]
    fn test_to_global_offsets_every_vertex() {
        let p = polygon![(x: 1.0, y: 2.0), (x: 3.0, y: 2.0), (x: 3.0, y: 5.0)];
        let g = to_global(&p, 640, 1280);
        let first = g.exterior().0[0];
        assert_eq!(first, Coord { x: 641.0, y: 1282.0 });
    }

    #[test]
    fn test_clip_to_bounds_inside_unchanged_area() {
        let p = polygon![
            (x: 10.0, y: 10.0),
            (x: 20.0, y: 10.0),
            (x: 20.0, y: 20.0),
            (x: 10.0, y: 20.0),
        ];
        let clipped = clip_to_bounds(&p, 100, 100);
        assert_eq!(clipped.len(), 1);
        assert!((clipped[0].unsigned_area() - 100.0).abs() < 1e-6);
    }

    #[test]
    fn test_clip_to_bounds_partial_and_outside() {
        let p = polygon![
            (x: 90.0, y: 90.0),
            (x: 110.0, y: 90.0),
            (x: 110.0, y: 110.0),
            (x: 90.0, y: 110.0),
        ];
        let clipped = clip_to_bounds(&p, 100, 100);
        let area: f64 = clipped.iter().map(|q| q.unsigned_area()).sum();
        assert!((area - 100.0).abs() < 1e-6);

        let outside = polygon![(x: 200.0, y: 200.0), (x: 210.0, y: 200.0), (x: 210.0, y: 210.0)];
        assert!(clip_to_bounds(&outside, 100, 100).is_empty());
    }

    #[test]
    fn test_clip_to_bounds_splits_concave() {
        // U shape whose bottom bar lies outside the slide
        let u = polygon![
            (x: 0.0, y: 0.0),
            (x: 10.0, y: 0.0),
            (x: 10.0, y: 30.0),
            (x: 20.0, y: 30.0),
            (x: 20.0, y: 0.0),
            (x: 30.0, y: 0.0),
            (x: 30.0, y: 40.0),
            (x: 0.0, y: 40.0),
        ];
        // keep only y in [0, 25]: the two legs
        let clipped = clip_to_bounds(&u, 40, 25);
        assert_eq!(clipped.len(), 2);
    }

    #[test]
    fn test_normalize_non_square_and_clamped() {
        let p = polygon![(x: 0.0, y: 0.0), (x: 200.0, y: 0.0), (x: 250.0, y: 50.0)];
        let n = normalize(&p, 200, 100);
        let coords = &n.exterior().0;
        assert_eq!(coords[1], Coord { x: 1.0, y: 0.0 });
        // 250 / 200 clamps to 1.0, 50 / 100 = 0.5
        assert_eq!(coords[2], Coord { x: 1.0, y: 0.5 });
        let d = denormalize(&n, 200, 100);
        assert_eq!(d.exterior().0[2], Coord { x: 200.0, y: 50.0 });
    }
}
