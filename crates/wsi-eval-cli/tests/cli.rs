// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Au-Zone Technologies. All Rights Reserved.

use assert_cmd::Command;
use image::{Rgb, RgbImage};
use std::fs;
use tempfile::TempDir;

const SQUARE: &str = "0 0.1 0.1 0.9 0.1 0.9 0.9 0.1 0.9";

fn write_split(dir: &std::path::Path) {
    let images = dir.join("images");
    let labels = dir.join("labels");
    fs::create_dir_all(&images).unwrap();
    fs::create_dir_all(&labels).unwrap();
    for name in ["S-adenine__x0000000_y0000000", "S-adenine__x0000064_y0000000"] {
        RgbImage::from_pixel(64, 64, Rgb([150, 80, 150]))
            .save(images.join(format!("{}.png", name)))
            .unwrap();
        fs::write(labels.join(format!("{}.txt", name)), SQUARE).unwrap();
    }
}

#[test]
fn test_version() -> Result<(), Box<dyn std::error::Error>> {
    let mut cmd = Command::cargo_bin("wsi-eval")?;
    cmd.arg("--version");
    cmd.assert()
        .success()
        .stdout(predicates::str::contains(env!("CARGO_PKG_VERSION")));
    Ok(())
}

#[test]
fn test_summarize_split() -> Result<(), Box<dyn std::error::Error>> {
    let dir = TempDir::new()?;
    write_split(dir.path());

    let mut cmd = Command::cargo_bin("wsi-eval")?;
    cmd.arg("summarize").arg(dir.path());
    cmd.assert()
        .success()
        .stdout(predicates::str::contains("total instances        : 2"))
        .stdout(predicates::str::contains("instances by class     : 0:2"));
    Ok(())
}

#[test]
fn test_summarize_without_folds_fails() -> Result<(), Box<dyn std::error::Error>> {
    let dir = TempDir::new()?;
    let mut cmd = Command::cargo_bin("wsi-eval")?;
    cmd.arg("summarize").arg(dir.path());
    cmd.assert().failure();
    Ok(())
}

#[test]
fn test_evaluate() -> Result<(), Box<dyn std::error::Error>> {
    let dir = TempDir::new()?;
    let split = dir.path().join("TEST");
    write_split(&split);
    let predictions = dir.path().join("predictions");
    fs::create_dir_all(&predictions)?;
    fs::write(
        predictions.join("S-adenine__x0000000_y0000000.txt"),
        format!("{} 0.9\n", SQUARE),
    )?;
    let output = dir.path().join("run");

    let mut cmd = Command::cargo_bin("wsi-eval")?;
    cmd.args(["--quiet", "evaluate", "--model", "cli-test"])
        .arg("--images")
        .arg(split.join("images"))
        .arg("--labels")
        .arg(split.join("labels"))
        .arg("--predictions")
        .arg(&predictions)
        .arg("--output")
        .arg(&output)
        .args(["--iou-thresholds", "0.5", "0.75", "--min-area", "100"]);
    cmd.assert()
        .success()
        .stdout(predicates::str::contains("MICRO AGGREGATE"));

    let csv = fs::read_to_string(output.join("eval/results.csv"))?;
    assert!(csv.starts_with("model,slide,iouThreshold"));
    assert!(csv.contains("cli-test,S-adenine,0.50,2,2,1,1,0,1,"));
    assert!(csv.contains("cli-test,__MICRO__,0.75,,,,"));
    Ok(())
}

#[test]
fn test_evaluate_bad_thresholds() -> Result<(), Box<dyn std::error::Error>> {
    let dir = TempDir::new()?;
    write_split(dir.path());
    let mut cmd = Command::cargo_bin("wsi-eval")?;
    cmd.args(["--quiet", "evaluate"])
        .arg("--images")
        .arg(dir.path().join("images"))
        .arg("--labels")
        .arg(dir.path().join("labels"))
        .arg("--predictions")
        .arg(dir.path())
        .arg("--output")
        .arg(dir.path().join("run"))
        .args(["--iou-thresholds", "abc"]);
    cmd.assert().failure();
    Ok(())
}
