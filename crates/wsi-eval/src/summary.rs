// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Au-Zone Technologies. All Rights Reserved.

//! Statistics over built tilesets.

use crate::{
    Error,
    label::decode_str,
    pipeline::TILE_EXTENSIONS,
    tileset::Split,
};
use log::debug;
use serde::Serialize;
use std::{
    collections::BTreeMap,
    fmt, fs,
    path::{Path, PathBuf},
};
use walkdir::WalkDir;

/// Images whose size is read when summarizing a split.
pub const DEFAULT_SIZE_SAMPLE: usize = 200;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SplitSummary {
    pub images: usize,
    pub labels_present: usize,
    pub labels_missing: usize,
    pub labels_empty: usize,
    pub tiles_with_instances: usize,
    pub total_instances: usize,
    pub instances_by_class: BTreeMap<i32, usize>,
    /// `(min width, max width, min height, max height)` over the sample.
    pub size_range: Option<(u32, u32, u32, u32)>,
    pub size_sample: usize,
}

impl SplitSummary {
    pub fn empty_ratio(&self) -> f64 {
        if self.labels_present == 0 {
            0.0
        } else {
            self.labels_empty as f64 / self.labels_present as f64
        }
    }

    pub fn avg_instances_per_tile(&self) -> f64 {
        if self.tiles_with_instances == 0 {
            0.0
        } else {
            self.total_instances as f64 / self.tiles_with_instances as f64
        }
    }
}

fn list_images(dir: &Path) -> Result<Vec<PathBuf>, Error> {
    if !dir.is_dir() {
        return Ok(vec![]);
    }
    let mut images = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1).sort_by_file_name() {
        let entry = entry?;
        let is_image = entry
            .path()
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| TILE_EXTENSIONS.iter().any(|x| e.eq_ignore_ascii_case(x)));
        if entry.file_type().is_file() && is_image {
            images.push(entry.into_path());
        }
    }
    Ok(images)
}

/// Summarize the `images/` and `labels/` directories under `split_dir`.
///
/// Labels are matched to images by file stem. Only the first `size_sample`
/// images have their dimensions read.
pub fn summarize_split(split_dir: &Path, size_sample: usize) -> Result<SplitSummary, Error> {
    let images = list_images(&split_dir.join("images"))?;
    let labels_dir = split_dir.join("labels");
    let mut summary = SplitSummary {
        images: images.len(),
        ..Default::default()
    };

    let mut sizes = Vec::new();
    for path in images.iter().take(size_sample) {
        match imagesize::size(path) {
            Ok(size) => sizes.push((size.width as u32, size.height as u32)),
            Err(err) => debug!("cannot read size of {:?}: {}", path, err),
        }
    }
    summary.size_sample = sizes.len();
    if !sizes.is_empty() {
        let widths = sizes.iter().map(|s| s.0);
        let heights = sizes.iter().map(|s| s.1);
        summary.size_range = Some((
            widths.clone().min().unwrap_or(0),
            widths.max().unwrap_or(0),
            heights.clone().min().unwrap_or(0),
            heights.max().unwrap_or(0),
        ));
    }

    for path in &images {
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let label_path = labels_dir.join(format!("{}.txt", stem));
        if !label_path.is_file() {
            summary.labels_missing += 1;
            continue;
        }
        summary.labels_present += 1;
        let text = fs::read_to_string(&label_path)?;
        if text.trim().is_empty() {
            summary.labels_empty += 1;
            continue;
        }
        summary.tiles_with_instances += 1;
        for record in decode_str(&text) {
            *summary.instances_by_class.entry(record.class_id).or_default() += 1;
            summary.total_instances += 1;
        }
    }
    Ok(summary)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FoldSummary {
    pub name: String,
    pub train: Option<SplitSummary>,
    pub test: Option<SplitSummary>,
}

/// Summarize every `Fold*` directory under `root`, in name order.
pub fn summarize_folds(root: &Path, size_sample: usize) -> Result<Vec<FoldSummary>, Error> {
    let mut folds = Vec::new();
    for entry in WalkDir::new(root).min_depth(1).max_depth(1).sort_by_file_name() {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if !entry.file_type().is_dir() || !name.to_lowercase().starts_with("fold") {
            continue;
        }
        let split = |split: Split| -> Result<Option<SplitSummary>, Error> {
            let dir = entry.path().join(split.to_string());
            if dir.is_dir() {
                summarize_split(&dir, size_sample).map(Some)
            } else {
                Ok(None)
            }
        };
        folds.push(FoldSummary {
            train: split(Split::Train)?,
            test: split(Split::Test)?,
            name,
        });
    }
    if folds.is_empty() {
        return Err(Error::Configuration(format!(
            "no fold directories under {:?}",
            root
        )));
    }
    Ok(folds)
}

impl fmt::Display for SplitSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "║   images                 : {}", self.images)?;
        writeln!(
            f,
            "║   labels (present/missing): {} / {}",
            self.labels_present, self.labels_missing
        )?;
        writeln!(
            f,
            "║   empty-label tiles      : {} ({:.1}%)",
            self.labels_empty,
            self.empty_ratio() * 100.0
        )?;
        writeln!(f, "║   tiles with instances   : {}", self.tiles_with_instances)?;
        writeln!(f, "║   total instances        : {}", self.total_instances)?;
        writeln!(
            f,
            "║   avg per non-empty tile : {:.2}",
            self.avg_instances_per_tile()
        )?;
        let classes = if self.instances_by_class.is_empty() {
            "-".to_string()
        } else {
            self.instances_by_class
                .iter()
                .map(|(k, v)| format!("{}:{}", k, v))
                .collect::<Vec<_>>()
                .join(", ")
        };
        writeln!(f, "║   instances by class     : {}", classes)?;
        if let Some((w0, w1, h0, h1)) = self.size_range {
            writeln!(
                f,
                "║   image size (sample)    : {}~{} x {}~{} ({} images)",
                w0, w1, h0, h1, self.size_sample
            )?;
        }
        Ok(())
    }
}

impl fmt::Display for FoldSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "╔══════════════════════════════════════════════════════════════╗"
        )?;
        writeln!(f, "║ {}", self.name)?;
        for (split, summary) in [(Split::Train, &self.train), (Split::Test, &self.test)] {
            writeln!(
                f,
                "╠══════════════════════════════════════════════════════════════╣"
            )?;
            match summary {
                Some(summary) => {
                    writeln!(f, "║ {}", split)?;
                    write!(f, "{}", summary)?;
                }
                None => writeln!(f, "║ {}: (missing)", split)?,
            }
        }
        writeln!(
            f,
            "╚══════════════════════════════════════════════════════════════╝"
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use tempfile::TempDir;

    fn split_fixture() -> TempDir {
        let dir = TempDir::new().unwrap();
        let images = dir.path().join("images");
        let labels = dir.path().join("labels");
        fs::create_dir_all(&images).unwrap();
        fs::create_dir_all(&labels).unwrap();
        for name in ["a", "b", "c", "d"] {
            RgbImage::from_pixel(32, 16, Rgb([1, 2, 3]))
                .save(images.join(format!("{}.png", name)))
                .unwrap();
        }
        fs::write(
            labels.join("a.txt"),
            "0 0.1 0.1 0.5 0.1 0.5 0.5\n1 0.6 0.6 0.9 0.6 0.9 0.9\n",
        )
        .unwrap();
        fs::write(labels.join("b.txt"), "0 0.1 0.1 0.5 0.1 0.5 0.5\n").unwrap();
        fs::write(labels.join("c.txt"), "\n").unwrap();
        dir
    }

    #[test]
    fn test_summarize_split() {
        let dir = split_fixture();
        let summary = summarize_split(dir.path(), DEFAULT_SIZE_SAMPLE).unwrap();
        assert_eq!(summary.images, 4);
        assert_eq!(summary.labels_present, 3);
        assert_eq!(summary.labels_missing, 1);
        assert_eq!(summary.labels_empty, 1);
        assert_eq!(summary.tiles_with_instances, 2);
        assert_eq!(summary.total_instances, 3);
        assert_eq!(summary.instances_by_class.get(&0), Some(&2));
        assert_eq!(summary.instances_by_class.get(&1), Some(&1));
        assert!((summary.avg_instances_per_tile() - 1.5).abs() < 1e-12);
        assert_eq!(summary.size_range, Some((32, 32, 16, 16)));

        let text = summary.to_string();
        assert!(text.contains("instances by class     : 0:2, 1:1"));
    }

    #[test]
    fn test_size_sample_bounded() {
        let dir = split_fixture();
        let summary = summarize_split(dir.path(), 1).unwrap();
        assert_eq!(summary.size_sample, 1);
    }

    #[test]
    fn test_summarize_folds() {
        let root = TempDir::new().unwrap();
        fs::create_dir_all(root.path().join("Fold0/TRAIN/images")).unwrap();
        fs::create_dir_all(root.path().join("other")).unwrap();
        let folds = summarize_folds(root.path(), 10).unwrap();
        assert_eq!(folds.len(), 1);
        assert_eq!(folds[0].train.as_ref().map(|s| s.images), Some(0));
        assert!(folds[0].test.is_none());
        assert!(folds[0].to_string().contains("TEST: (missing)"));

        let empty = TempDir::new().unwrap();
        assert!(summarize_folds(empty.path(), 10).is_err());
    }
}
