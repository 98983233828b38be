// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Au-Zone Technologies. All Rights Reserved.

//! Grid tiling over a slide.
//!
//! The grid is row-major (y outer, x inner) and covers the slide completely:
//! edge tiles are kept even when they are smaller than the tile size, the
//! reader zero-pads them to a full tile.

use crate::Error;
use image::{RgbImage, imageops::FilterType};
use rand::{SeedableRng, rngs::StdRng, seq::index};
use serde::{Deserialize, Serialize};

/// Top-left corner of one tile in slide pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TileOrigin {
    pub x: u32,
    pub y: u32,
}

impl TileOrigin {
    pub fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }
}

/// Deterministic tile layout for one slide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileGrid {
    width: u32,
    height: u32,
    tile_size: u32,
    stride: u32,
}

impl TileGrid {
    pub fn new(width: u32, height: u32, tile_size: u32, stride: u32) -> Result<Self, Error> {
        if tile_size == 0 {
            return Err(Error::Configuration("tile size must be positive".to_string()));
        }
        if stride == 0 {
            return Err(Error::Configuration("stride must be positive".to_string()));
        }
        Ok(Self {
            width,
            height,
            tile_size,
            stride,
        })
    }

    pub fn tile_size(&self) -> u32 {
        self.tile_size
    }

    pub fn stride(&self) -> u32 {
        self.stride
    }

    fn columns(&self) -> usize {
        self.width.div_ceil(self.stride) as usize
    }

    fn rows(&self) -> usize {
        self.height.div_ceil(self.stride) as usize
    }

    pub fn len(&self) -> usize {
        self.columns() * self.rows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Row-major iterator over every tile origin. Each call restarts.
    pub fn iter(&self) -> TileIter {
        TileIter {
            grid: *self,
            next: 0,
            len: self.len(),
        }
    }

    /// Actual pixel extent of the tile at `origin`, clamped to the slide.
    pub fn extent(&self, origin: TileOrigin) -> (u32, u32) {
        (
            self.tile_size.min(self.width.saturating_sub(origin.x)),
            self.tile_size.min(self.height.saturating_sub(origin.y)),
        )
    }

    /// Select at most `max_tiles` origins.
    ///
    /// The whole grid is returned when it already fits (or when `max_tiles`
    /// is `None`). Otherwise exactly `max_tiles` origins are drawn uniformly
    /// without replacement from a generator seeded with `seed`, and returned
    /// in row-major order.
    pub fn subsample(&self, max_tiles: Option<usize>, seed: u64) -> Vec<TileOrigin> {
        let len = self.len();
        match max_tiles {
            Some(max) if max < len => {
                let mut rng = StdRng::seed_from_u64(seed);
                let mut picked = index::sample(&mut rng, len, max).into_vec();
                picked.sort_unstable();
                picked.into_iter().map(|i| self.origin_at(i)).collect()
            }
            _ => self.iter().collect(),
        }
    }

    fn origin_at(&self, index: usize) -> TileOrigin {
        let columns = self.columns();
        let col = (index % columns) as u32;
        let row = (index / columns) as u32;
        TileOrigin::new(col * self.stride, row * self.stride)
    }
}

impl IntoIterator for &TileGrid {
    type Item = TileOrigin;
    type IntoIter = TileIter;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Iterator returned by [`TileGrid::iter`].
#[derive(Debug, Clone)]
pub struct TileIter {
    grid: TileGrid,
    next: usize,
    len: usize,
}

impl Iterator for TileIter {
    type Item = TileOrigin;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.len {
            return None;
        }
        let origin = self.grid.origin_at(self.next);
        self.next += 1;
        Some(origin)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.len - self.next;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for TileIter {}

/// Fraction of non-background pixels in `image`.
///
/// A pixel is foreground when any of its channels is below `white_cutoff`.
/// Crops larger than `downsample` on either side are first resized to
/// `downsample` x `downsample` with bilinear filtering.
pub fn tissue_ratio(image: &RgbImage, white_cutoff: u8, downsample: u32) -> f64 {
    let resized;
    let view = if downsample > 0 && (image.width() > downsample || image.height() > downsample) {
        resized = image::imageops::resize(image, downsample, downsample, FilterType::Triangle);
        &resized
    } else {
        image
    };
    let total = view.width() as usize * view.height() as usize;
    if total == 0 {
        return 0.0;
    }
    let foreground = view
        .pixels()
        .filter(|p| p.0.iter().any(|&c| c < white_cutoff))
        .count();
    foreground as f64 / total as f64
}

/// Background rejection based on [`tissue_ratio`].
///
/// Decisions depend on pixels only.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TissueFilter {
    /// Minimum foreground ratio; zero or below disables the filter.
    pub threshold: f64,
    pub white_cutoff: u8,
    pub downsample: u32,
}

impl Default for TissueFilter {
    fn default() -> Self {
        Self {
            threshold: 0.02,
            white_cutoff: 235,
            downsample: 128,
        }
    }
}

impl TissueFilter {
    pub fn is_enabled(&self) -> bool {
        self.threshold > 0.0
    }

    pub fn accepts(&self, image: &RgbImage) -> bool {
        if !self.is_enabled() {
            return true;
        }
        tissue_ratio(image, self.white_cutoff, self.downsample) >= self.threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_grid_full_tiles() {
        let grid = TileGrid::new(1280, 960, 640, 640).unwrap();
        let origins: Vec<_> = grid.iter().collect();
        assert_eq!(
            origins,
            vec![
                TileOrigin::new(0, 0),
                TileOrigin::new(640, 0),
                TileOrigin::new(0, 640),
                TileOrigin::new(640, 640),
            ]
        );
        assert_eq!(grid.extent(TileOrigin::new(640, 640)), (640, 320));
    }

    #[test]
    fn test_grid_smaller_than_tile() {
        let grid = TileGrid::new(100, 50, 640, 640).unwrap();
        let origins: Vec<_> = grid.iter().collect();
        assert_eq!(origins, vec![TileOrigin::new(0, 0)]);
        assert_eq!(grid.extent(origins[0]), (100, 50));
    }

    #[test]
    fn test_grid_overlapping_stride() {
        let grid = TileGrid::new(1000, 500, 640, 320).unwrap();
        assert_eq!(grid.len(), 4 * 2);
        assert_eq!(grid.iter().len(), grid.len());
        assert!(grid.iter().all(|o| o.x < 1000 && o.y < 500));
    }

    #[test]
    fn test_grid_restartable() {
        let grid = TileGrid::new(2000, 1500, 512, 512).unwrap();
        let a: Vec<_> = grid.iter().collect();
        let b: Vec<_> = (&grid).into_iter().collect();
        assert_eq!(a, b);
    }

    #[test]
    fn test_grid_rejects_zero() {
        assert!(matches!(
            TileGrid::new(100, 100, 0, 640),
            Err(Error::Configuration(_))
        ));
        assert!(matches!(
            TileGrid::new(100, 100, 640, 0),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_subsample_deterministic() {
        let grid = TileGrid::new(6400, 6400, 640, 640).unwrap();
        let a = grid.subsample(Some(10), 42);
        let b = grid.subsample(Some(10), 42);
        assert_eq!(a.len(), 10);
        assert_eq!(a, b);

        let mut sorted = a.clone();
        sorted.sort_by_key(|o| (o.y, o.x));
        assert_eq!(a, sorted);
        sorted.dedup();
        assert_eq!(sorted.len(), 10);

        let full: Vec<_> = grid.iter().collect();
        assert!(a.iter().all(|o| full.contains(o)));
    }

    #[test]
    fn test_subsample_no_limit() {
        let grid = TileGrid::new(1280, 1280, 640, 640).unwrap();
        assert_eq!(grid.subsample(None, 1).len(), 4);
        assert_eq!(grid.subsample(Some(4), 1).len(), 4);
        assert_eq!(grid.subsample(Some(100), 1).len(), 4);
    }

    #[test]
    fn test_tissue_filter_white_rejected() {
        let white = RgbImage::from_pixel(256, 256, Rgb([255, 255, 255]));
        let filter = TissueFilter::default();
        assert_eq!(tissue_ratio(&white, 235, 128), 0.0);
        assert!(!filter.accepts(&white));
    }

    #[test]
    fn test_tissue_filter_stained_accepted() {
        let mut img = RgbImage::from_pixel(64, 64, Rgb([250, 250, 250]));
        // a 16x16 stained patch is 6.25% of the crop
        for y in 0..16 {
            for x in 0..16 {
                img.put_pixel(x, y, Rgb([200, 120, 180]));
            }
        }
        let ratio = tissue_ratio(&img, 235, 128);
        assert!((ratio - 0.0625).abs() < 1e-12);
        assert!(TissueFilter::default().accepts(&img));
    }

    #[test]
    fn test_tissue_filter_disabled() {
        let white = RgbImage::from_pixel(32, 32, Rgb([255, 255, 255]));
        let filter = TissueFilter {
            threshold: 0.0,
            ..Default::default()
        };
        assert!(filter.accepts(&white));
    }
}
