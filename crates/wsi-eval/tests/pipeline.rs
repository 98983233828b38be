// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Au-Zone Technologies. All Rights Reserved.

use image::{Rgb, RgbImage};
use std::{fs, path::Path};
use tempfile::TempDir;
use wsi_eval::{
    EvalConfig, Error, RawDetection, Segmenter, StoredPredictions, TileImage, TilesetPaths,
    evaluate_tileset, geojson::read_predictions, report::MICRO_SLIDE_ID,
};

const SQUARE: &str = "0 0.1 0.1 0.9 0.1 0.9 0.9 0.1 0.9";

struct Failing;

impl Segmenter for Failing {
    fn segment(&self, _batch: &[TileImage]) -> Result<Vec<Vec<RawDetection>>, Error> {
        Err(Error::SegmentationError("model unavailable".to_string()))
    }
}

fn config() -> EvalConfig {
    let mut config = EvalConfig::default();
    config.tiling.tile_size = 64;
    config.tiling.stride = 64;
    config.evaluation.iou_thresholds = "0.5,0.75".to_string();
    config.evaluation.min_area = 100.0;
    config.evaluation.batch_size = 2;
    config
}

fn write_tile(dir: &Path, name: &str) {
    RgbImage::from_pixel(64, 64, Rgb([150, 80, 150]))
        .save(dir.join(format!("{}.png", name)))
        .unwrap();
}

/// Two slides of two tiles each. Slide A has one object per tile and one
/// matching prediction; slide B has one object and one displaced prediction.
struct Fixture {
    _root: TempDir,
    paths: TilesetPaths,
    predictions: std::path::PathBuf,
}

fn fixture() -> Fixture {
    let root = TempDir::new().unwrap();
    let images = root.path().join("images");
    let labels = root.path().join("labels");
    let predictions = root.path().join("predictions");
    for dir in [&images, &labels, &predictions] {
        fs::create_dir_all(dir).unwrap();
    }

    for name in [
        "A-adenine__x0000000_y0000000",
        "A-adenine__x0000064_y0000000",
        "B-normal__x0000000_y0000000",
        "B-normal__x0000000_y0000064",
    ] {
        write_tile(&images, name);
    }
    fs::write(labels.join("A-adenine__x0000000_y0000000.txt"), SQUARE).unwrap();
    fs::write(labels.join("A-adenine__x0000064_y0000000.txt"), SQUARE).unwrap();
    fs::write(labels.join("B-normal__x0000000_y0000000.txt"), SQUARE).unwrap();
    // background tile without a label file
    fs::write(
        predictions.join("A-adenine__x0000000_y0000000.txt"),
        format!("{} 0.80\n", SQUARE),
    )
    .unwrap();
    fs::write(
        predictions.join("B-normal__x0000000_y0000064.txt"),
        SQUARE,
    )
    .unwrap();

    Fixture {
        paths: TilesetPaths {
            tiles_dir: images,
            labels_dir: labels,
            slide_dir: None,
            out_root: root.path().join("out"),
        },
        predictions,
        _root: root,
    }
}

#[test]
fn test_evaluate_tileset() {
    let fixture = fixture();
    let segmenter = StoredPredictions::new(&fixture.predictions).unwrap();
    let report = evaluate_tileset(&fixture.paths, &segmenter, &config(), None, None).unwrap();

    assert!(report.failed_slides.is_empty());
    assert_eq!(report.iou_thresholds, vec![0.5, 0.75]);

    let slide_a = report
        .per_slide
        .iter()
        .find(|r| r.slide == "A-adenine" && r.iou_threshold == 0.5)
        .unwrap();
    assert_eq!(slide_a.tile_count, Some(2));
    assert_eq!((slide_a.tp, slide_a.fp, slide_a.fn_), (1, 0, 1));

    let slide_b = report
        .per_slide
        .iter()
        .find(|r| r.slide == "B-normal" && r.iou_threshold == 0.5)
        .unwrap();
    assert_eq!((slide_b.tp, slide_b.fp, slide_b.fn_), (0, 1, 1));

    let micro = report
        .micro
        .iter()
        .find(|r| r.iou_threshold == 0.5)
        .unwrap();
    assert_eq!(micro.slide, MICRO_SLIDE_ID);
    assert_eq!((micro.tp, micro.fp, micro.fn_), (1, 1, 2));
    assert!((micro.precision - 0.5).abs() < 1e-9);
    assert!((micro.recall - 1.0 / 3.0).abs() < 1e-9);
    assert!((micro.mean_iou_tp - 1.0).abs() < 1e-6);

    let out = &fixture.paths.out_root;
    let csv = fs::read_to_string(out.join("eval/results.csv")).unwrap();
    assert_eq!(csv.lines().count(), 1 + 2 * 2 + 2);
    assert!(out.join("eval/results.json").is_file());

    let pred = read_predictions(&out.join("pred/A-adenine/geojson/A-adenine.geojson")).unwrap();
    assert_eq!(pred.len(), 1);
    assert_eq!(pred[0].score, Some(0.8));
    assert!(out.join("gt/B-normal/geojson/B-normal.geojson").is_file());
}

#[test]
fn test_evaluate_single_slide() {
    let fixture = fixture();
    let segmenter = StoredPredictions::new(&fixture.predictions).unwrap();
    let report =
        evaluate_tileset(&fixture.paths, &segmenter, &config(), Some("B-normal"), None).unwrap();
    assert!(report.per_slide.iter().all(|r| r.slide == "B-normal"));
    assert!(!fixture.paths.out_root.join("gt/A-adenine").exists());
}

#[test]
fn test_segmenter_failure_propagates() {
    let fixture = fixture();
    let result = evaluate_tileset(&fixture.paths, &Failing, &config(), None, None);
    assert!(matches!(result, Err(Error::SegmentationError(_))));
}

#[test]
fn test_unreadable_tile_fails_only_its_slide() {
    let fixture = fixture();
    fs::write(
        fixture
            .paths
            .tiles_dir
            .join("C-normal__x0000000_y0000000.png"),
        b"not an image",
    )
    .unwrap();
    let segmenter = StoredPredictions::new(&fixture.predictions).unwrap();
    let report = evaluate_tileset(&fixture.paths, &segmenter, &config(), None, None).unwrap();
    assert_eq!(report.failed_slides.len(), 1);
    assert_eq!(report.failed_slides[0].slide_id, "C-normal");
    assert!(report.per_slide.iter().any(|r| r.slide == "A-adenine"));
}

#[test]
fn test_invalid_thresholds_rejected_before_work() {
    let fixture = fixture();
    let mut config = config();
    config.evaluation.iou_thresholds = "0.5:1.5:0.1".to_string();
    let segmenter = StoredPredictions::new(&fixture.predictions).unwrap();
    let result = evaluate_tileset(&fixture.paths, &segmenter, &config, None, None);
    assert!(matches!(result, Err(Error::Configuration(_))));
    assert!(!fixture.paths.out_root.exists());
}
