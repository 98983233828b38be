// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Au-Zone Technologies. All Rights Reserved.

//! Boundary to the instance segmentation capability.

use crate::{
    Error,
    label::decode_prediction_str,
    tile_id::TileId,
    types::UNKNOWN_CLASS,
};
use image::RgbImage;
use std::{
    fs, io,
    path::{Path, PathBuf},
};

/// One tile handed to a [`Segmenter`].
#[derive(Debug, Clone)]
pub struct TileImage {
    pub id: TileId,
    pub image: RgbImage,
}

/// One detection in tile pixel coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct RawDetection {
    pub polygon: Vec<(f64, f64)>,
    pub confidence: f64,
    /// [`UNKNOWN_CLASS`] when the model reports no class.
    pub class_id: i32,
}

/// A trained instance segmentation model.
///
/// Implementations return exactly one detection list per input tile, in
/// input order.
pub trait Segmenter: Send + Sync {
    fn segment(&self, batch: &[TileImage]) -> Result<Vec<Vec<RawDetection>>, Error>;
}

/// Run `segmenter` on `batch`, enforcing the arity contract.
pub fn segment_batch(
    segmenter: &dyn Segmenter,
    batch: &[TileImage],
) -> Result<Vec<Vec<RawDetection>>, Error> {
    let detections = segmenter.segment(batch)?;
    if detections.len() != batch.len() {
        return Err(Error::SegmentationError(format!(
            "segmenter returned {} results for a batch of {} tiles",
            detections.len(),
            batch.len()
        )));
    }
    Ok(detections)
}

/// Predictions produced offline and stored as one label file per tile.
///
/// Files are looked up as `<dir>/<tile id>.txt`. A missing file means the
/// model found nothing on that tile. Lines without a trailing confidence
/// score 1.0.
#[derive(Debug, Clone)]
pub struct StoredPredictions {
    dir: PathBuf,
}

impl StoredPredictions {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, Error> {
        let dir = dir.into();
        if !dir.is_dir() {
            return Err(Error::Configuration(format!(
                "prediction directory {:?} does not exist",
                dir
            )));
        }
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn read_tile(&self, tile: &TileImage) -> Result<Vec<RawDetection>, Error> {
        let path = self.dir.join(format!("{}.txt", tile.id));
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(vec![]),
            Err(err) => {
                return Err(Error::SegmentationError(format!(
                    "failed to read predictions {:?}: {}",
                    path, err
                )));
            }
        };
        let (w, h) = (tile.image.width() as f64, tile.image.height() as f64);
        Ok(decode_prediction_str(&text)
            .into_iter()
            .map(|record| RawDetection {
                polygon: record.points.iter().map(|&(x, y)| (x * w, y * h)).collect(),
                confidence: record.confidence.unwrap_or(1.0),
                class_id: record.class_id.max(UNKNOWN_CLASS),
            })
            .collect())
    }
}

impl Segmenter for StoredPredictions {
    fn segment(&self, batch: &[TileImage]) -> Result<Vec<Vec<RawDetection>>, Error> {
        batch.iter().map(|tile| self.read_tile(tile)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct Short;

    impl Segmenter for Short {
        fn segment(&self, _batch: &[TileImage]) -> Result<Vec<Vec<RawDetection>>, Error> {
            Ok(vec![])
        }
    }

    fn tile(slide: &str, x: u32, y: u32, size: u32) -> TileImage {
        TileImage {
            id: TileId::new(slide, x, y).unwrap(),
            image: RgbImage::new(size, size),
        }
    }

    #[test]
    fn test_segment_batch_arity() {
        let batch = vec![tile("s", 0, 0, 8)];
        assert!(matches!(
            segment_batch(&Short, &batch),
            Err(Error::SegmentationError(_))
        ));
        assert!(segment_batch(&Short, &[]).unwrap().is_empty());
    }

    #[test]
    fn test_stored_predictions() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("s__x0000000_y0000000.txt"),
            "1 0.1 0.1 0.5 0.1 0.5 0.5 0.9\n0 0.6 0.6 0.9 0.6 0.9 0.9\n",
        )
        .unwrap();
        let stored = StoredPredictions::new(dir.path()).unwrap();
        let batch = vec![tile("s", 0, 0, 100), tile("s", 100, 0, 100)];
        let out = segment_batch(&stored, &batch).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].len(), 2);
        assert!(out[1].is_empty());

        let first = &out[0][0];
        assert_eq!(first.class_id, 1);
        assert_eq!(first.confidence, 0.9);
        assert!((first.polygon[1].0 - 50.0).abs() < 1e-9);
        assert_eq!(out[0][1].confidence, 1.0);
    }

    #[test]
    fn test_stored_predictions_missing_dir() {
        assert!(StoredPredictions::new("/nonexistent/predictions").is_err());
    }
}
