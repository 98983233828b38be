// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Au-Zone Technologies. All Rights Reserved.

//! Training tilesets: JPEG tiles plus polygon label files, laid out per
//! cross-validation fold.
//!
//! ```text
//! <out_root>/<fold>/data.yaml
//! <out_root>/<fold>/TRAIN/{images,labels}/<tile id>.{jpg,txt}
//! <out_root>/<fold>/TEST/{images,labels}/<tile id>.{jpg,txt}
//! ```
//!
//! Tile selection depends on pixels only; ground truth decides the label
//! content of a tile, never whether the tile exists.

use crate::{
    Error,
    config::{EvalConfig, FoldSpec},
    coords::{clip_to_bounds, to_local},
    geojson::read_ground_truth,
    geometry::filter_by_area,
    instrument::stage_span,
    label::write_labels,
    pipeline::{Progress, ProgressSender, Stage, find_slide, publish},
    reader::SlideSource,
    report::FailedSlide,
    tile_id::TileId,
    tiler::{TileGrid, TileOrigin},
    types::{CoordSpace, Instance},
};
use geo::{Coord, Intersects, Rect};
use image::{RgbImage, codecs::jpeg::JpegEncoder};
use log::{debug, error, info, warn};
use rayon::prelude::*;
use std::{
    fmt, fs,
    io::BufWriter,
    path::{Path, PathBuf},
};

/// Tiles cropped and written per parallel chunk.
const CHUNK_SIZE: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Split {
    Train,
    Test,
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Split::Train => write!(f, "TRAIN"),
            Split::Test => write!(f, "TEST"),
        }
    }
}

/// Image and label directories of one split.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitDirs {
    pub images: PathBuf,
    pub labels: PathBuf,
}

impl SplitDirs {
    pub fn new(fold_dir: &Path, split: Split) -> Self {
        let root = fold_dir.join(split.to_string());
        Self {
            images: root.join("images"),
            labels: root.join("labels"),
        }
    }

    pub fn create(&self) -> Result<(), Error> {
        fs::create_dir_all(&self.images)?;
        fs::create_dir_all(&self.labels)?;
        Ok(())
    }
}

/// Outcome of tiling one slide.
#[derive(Debug, Clone, PartialEq)]
pub struct TileBuildSummary {
    pub slide_id: String,
    pub width: u32,
    pub height: u32,
    /// Tiles in the full grid.
    pub grid: usize,
    /// Tiles left after subsampling.
    pub selected: usize,
    /// Tiles written, i.e. those passing the tissue filter.
    pub tiles: Vec<TileId>,
    /// Written tiles with at least one label line.
    pub labelled: usize,
}

pub fn write_jpeg(path: &Path, image: &RgbImage, quality: u8) -> Result<(), Error> {
    let file = fs::File::create(path)?;
    let mut encoder = JpegEncoder::new_with_quality(BufWriter::new(file), quality);
    encoder.encode_image(image)?;
    Ok(())
}

/// Ground truth prepared for repeated tile intersection.
struct GroundTruthIndex<'a> {
    entries: Vec<(Rect<f64>, &'a Instance)>,
}

impl<'a> GroundTruthIndex<'a> {
    fn new(instances: &'a [Instance]) -> Self {
        Self {
            entries: instances
                .iter()
                .filter_map(|i| i.bounds().map(|b| (b, i)))
                .collect(),
        }
    }

    /// Tile-pixel instances of the tile at `origin`, all labelled `class_id`.
    fn tile_instances(
        &self,
        origin: TileOrigin,
        tile_size: u32,
        class_id: i32,
        min_area: f64,
    ) -> Vec<Instance> {
        let (x0, y0) = (origin.x as f64, origin.y as f64);
        let tile = Rect::new(
            Coord { x: x0, y: y0 },
            Coord {
                x: x0 + tile_size as f64,
                y: y0 + tile_size as f64,
            },
        );
        self.entries
            .iter()
            .filter(|(bounds, _)| bounds.intersects(&tile))
            .flat_map(|(_, instance)| {
                let local = to_local(&instance.polygon, origin.x, origin.y);
                filter_by_area(clip_to_bounds(&local, tile_size, tile_size), min_area)
            })
            .map(|p| Instance::ground_truth(p, class_id, CoordSpace::TilePixel))
            .collect()
    }
}

/// Tile one slide into `dirs`.
///
/// Every selected tile that passes the tissue filter is written as a
/// `tile_size` square JPEG, zero-padded at the slide edge, next to a label
/// file. Label files hold the ground truth clipped to the full tile box with
/// the slide's class; they are empty when `ground_truth` is `None` or
/// `tiling.skip_labels` is set.
pub fn build_slide_tiles(
    source: &dyn SlideSource,
    slide_id: &str,
    class_id: i32,
    ground_truth: Option<&[Instance]>,
    config: &EvalConfig,
    dirs: &SplitDirs,
    progress: Option<&ProgressSender>,
) -> Result<TileBuildSummary, Error> {
    let _span = stage_span("tile", slide_id);
    let tiling = &config.tiling;
    let grid = TileGrid::new(source.width(), source.height(), tiling.tile_size, tiling.stride)?;
    let origins = grid.subsample(tiling.max_tiles, tiling.seed);
    dirs.create()?;

    let labels = ground_truth.filter(|_| !tiling.skip_labels).unwrap_or(&[]);
    let index = GroundTruthIndex::new(labels);
    let total = origins.len();
    let mut tiles = Vec::new();
    let mut labelled = 0;

    for (chunk_index, chunk) in origins.chunks(CHUNK_SIZE).enumerate() {
        let written: Vec<Option<(TileId, bool)>> = chunk
            .par_iter()
            .map(|&origin| {
                let image = source.crop(origin.x, origin.y, tiling.tile_size, tiling.tile_size)?;
                if !config.tissue.accepts(&image) {
                    return Ok(None);
                }
                let id = TileId::new(slide_id, origin.x, origin.y)?;
                write_jpeg(
                    &dirs.images.join(format!("{}.jpg", id)),
                    &image,
                    tiling.jpeg_quality,
                )?;
                let instances =
                    index.tile_instances(origin, tiling.tile_size, class_id, tiling.min_area);
                write_labels(
                    &dirs.labels.join(format!("{}.txt", id)),
                    &instances,
                    tiling.tile_size,
                    tiling.tile_size,
                )?;
                Ok(Some((id, !instances.is_empty())))
            })
            .collect::<Result<_, Error>>()?;

        for (id, has_labels) in written.into_iter().flatten() {
            labelled += has_labels as usize;
            tiles.push(id);
        }
        publish(
            progress,
            Progress {
                stage: Stage::Tiling,
                slide: slide_id.to_string(),
                current: (chunk_index * CHUNK_SIZE + chunk.len()).min(total),
                total,
                objects: labelled,
            },
        );
    }

    info!(
        "{}: {} of {} selected tiles kept, {} labelled",
        slide_id,
        tiles.len(),
        total,
        labelled
    );
    Ok(TileBuildSummary {
        slide_id: slide_id.to_string(),
        width: source.width(),
        height: source.height(),
        grid: grid.len(),
        selected: total,
        tiles,
        labelled,
    })
}

/// Opens a slide file for tiling.
pub type SlideOpener<'a> = &'a (dyn Fn(&Path) -> Result<Box<dyn SlideSource>, Error> + Sync);

/// Inputs of [`build_folds`].
#[derive(Debug, Clone)]
pub struct FoldPaths {
    pub slide_dir: PathBuf,
    /// Directory of `<slide id>.geojson` ground truth files.
    pub gt_dir: Option<PathBuf>,
    pub out_root: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FoldBuildReport {
    pub slides: Vec<TileBuildSummary>,
    pub failed: Vec<FailedSlide>,
}

fn data_yaml(fold_dir: &Path, names: &[String]) -> Result<String, Error> {
    let path = fs::canonicalize(fold_dir)?;
    let quoted = names
        .iter()
        .map(|n| format!("'{}'", n))
        .collect::<Vec<_>>()
        .join(", ");
    Ok(format!(
        "path: {}\ntrain: TRAIN/images\nval: TRAIN/images\ntest: TEST/images\nnc: {}\nnames: [{}]\n",
        path.display(),
        names.len(),
        quoted
    ))
}

fn prepare_fold(config: &EvalConfig, out_root: &Path, fold: &FoldSpec, force: bool) -> Result<(), Error> {
    let fold_dir = out_root.join(&fold.name);
    if force && fold_dir.exists() {
        warn!("Removing existing fold directory {:?}", fold_dir);
        fs::remove_dir_all(&fold_dir)?;
    }
    for split in [Split::Train, Split::Test] {
        SplitDirs::new(&fold_dir, split).create()?;
    }
    fs::write(
        fold_dir.join("data.yaml"),
        data_yaml(&fold_dir, &config.classes.names)?,
    )?;
    Ok(())
}

fn copy_tiles(tiles: &[TileId], from: &SplitDirs, to: &SplitDirs) -> Result<(), Error> {
    to.create()?;
    tiles.par_iter().try_for_each(|id| {
        let image = format!("{}.jpg", id);
        let label = format!("{}.txt", id);
        fs::copy(from.images.join(&image), to.images.join(&image))?;
        fs::copy(from.labels.join(&label), to.labels.join(&label))?;
        Ok(())
    })
}

/// Build the cross-validation tileset.
///
/// Every slide of the configuration is tiled once, into its split of the
/// first fold, and copied into its split of every other fold. `only_fold`
/// restricts the run to one fold and `force` clears fold directories first.
///
/// An invalid configuration, unlocatable slides and slides without a class
/// abort before any tile is written. A slide that fails later is logged and reported while the other
/// slides continue.
pub fn build_folds(
    config: &EvalConfig,
    paths: &FoldPaths,
    open: SlideOpener<'_>,
    only_fold: Option<&str>,
    force: bool,
    progress: Option<&ProgressSender>,
) -> Result<FoldBuildReport, Error> {
    config.validate()?;
    let folds: Vec<&FoldSpec> = match only_fold {
        Some(name) => vec![config.fold(name)?],
        None => config.folds.iter().collect(),
    };
    if folds.is_empty() {
        return Err(Error::Configuration("no folds configured".to_string()));
    }

    let mut slides = Vec::with_capacity(config.slides.len());
    for slide_id in &config.slides {
        let path = find_slide(&paths.slide_dir, slide_id)
            .ok_or_else(|| Error::MissingSlide(slide_id.clone()))?;
        let class_id = config.classes.resolve(slide_id)?;
        slides.push((slide_id.as_str(), path, class_id));
    }

    for fold in &folds {
        prepare_fold(config, &paths.out_root, fold, force)?;
    }

    let mut report = FoldBuildReport::default();
    for (slide_id, path, class_id) in slides {
        let targets: Vec<SplitDirs> = folds
            .iter()
            .map(|fold| {
                let split = if fold.test.iter().any(|s| s == slide_id) {
                    Split::Test
                } else {
                    Split::Train
                };
                SplitDirs::new(&paths.out_root.join(&fold.name), split)
            })
            .collect();

        match build_one(config, paths, open, slide_id, &path, class_id, &targets, progress) {
            Ok(summary) => report.slides.push(summary),
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => {
                error!("{}: tiling failed: {}", slide_id, err);
                report.failed.push(FailedSlide {
                    slide_id: slide_id.to_string(),
                    error: err.to_string(),
                });
            }
        }
    }
    Ok(report)
}

#[allow(clippy::too_many_arguments)]
fn build_one(
    config: &EvalConfig,
    paths: &FoldPaths,
    open: SlideOpener<'_>,
    slide_id: &str,
    path: &Path,
    class_id: i32,
    targets: &[SplitDirs],
    progress: Option<&ProgressSender>,
) -> Result<TileBuildSummary, Error> {
    let Some((first, rest)) = targets.split_first() else {
        return Err(Error::InvalidParameters("no split targets".to_string()));
    };
    let ground_truth = match &paths.gt_dir {
        Some(dir) => {
            let gt_path = dir.join(format!("{}.geojson", slide_id));
            if gt_path.is_file() {
                let instances = read_ground_truth(
                    &gt_path,
                    config.tiling.coord_scale,
                    config.tiling.repair_invalid,
                    class_id,
                )?;
                debug!("{}: {} ground truth polygons", slide_id, instances.len());
                Some(instances)
            } else {
                warn!("{}: no ground truth at {:?}, labels will be empty", slide_id, gt_path);
                None
            }
        }
        None => None,
    };

    info!("{}: opening {:?}", slide_id, path);
    let source = open(path)?;
    let summary = build_slide_tiles(
        source.as_ref(),
        slide_id,
        class_id,
        ground_truth.as_deref(),
        config,
        first,
        progress,
    )?;
    for target in rest.iter().filter(|t| *t != first) {
        copy_tiles(&summary.tiles, first, target)?;
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{label::read_labels, reader::ImageSlide};
    use geo::polygon;
    use image::Rgb;
    use tempfile::TempDir;

    fn config(tile_size: u32) -> EvalConfig {
        let mut config = EvalConfig::default();
        config.tiling.tile_size = tile_size;
        config.tiling.stride = tile_size;
        config.tiling.min_area = 10.0;
        config
    }

    #[test]
    fn test_split_dirs() {
        let dirs = SplitDirs::new(Path::new("/out/Fold0"), Split::Test);
        assert_eq!(dirs.images, PathBuf::from("/out/Fold0/TEST/images"));
        assert_eq!(dirs.labels, PathBuf::from("/out/Fold0/TEST/labels"));
        assert_eq!(Split::Train.to_string(), "TRAIN");
    }

    #[test]
    fn test_tile_labels_clipped_to_tile_box() {
        let gt = vec![Instance::ground_truth(
            polygon![(x: 50.0, y: 10.0), (x: 150.0, y: 10.0), (x: 150.0, y: 60.0), (x: 50.0, y: 60.0)],
            7,
            CoordSpace::SlidePixel,
        )];
        let index = GroundTruthIndex::new(&gt);
        let left = index.tile_instances(TileOrigin::new(0, 0), 100, 1, 10.0);
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].class_id, 1);
        assert!((left[0].area() - 50.0 * 50.0).abs() < 1e-6);

        let right = index.tile_instances(TileOrigin::new(100, 0), 100, 1, 10.0);
        assert_eq!(right.len(), 1);
        assert!((right[0].area() - 50.0 * 50.0).abs() < 1e-6);

        assert!(index.tile_instances(TileOrigin::new(0, 100), 100, 1, 10.0).is_empty());
    }

    #[test]
    fn test_build_slide_tiles() {
        let dir = TempDir::new().unwrap();
        let dirs = SplitDirs::new(dir.path(), Split::Train);
        // stained left half, white right half
        let mut image = RgbImage::from_pixel(200, 100, Rgb([255, 255, 255]));
        for y in 0..100 {
            for x in 0..100 {
                image.put_pixel(x, y, Rgb([150, 80, 150]));
            }
        }
        let gt = vec![Instance::ground_truth(
            polygon![(x: 10.0, y: 10.0), (x: 60.0, y: 10.0), (x: 60.0, y: 60.0), (x: 10.0, y: 60.0)],
            0,
            CoordSpace::SlidePixel,
        )];
        let summary = build_slide_tiles(
            &ImageSlide::new(image),
            "WT1-Adenine",
            0,
            Some(&gt),
            &config(100),
            &dirs,
            None,
        )
        .unwrap();

        assert_eq!(summary.grid, 2);
        assert_eq!(summary.tiles.len(), 1);
        assert_eq!(summary.labelled, 1);
        let id = &summary.tiles[0];
        assert_eq!(id.to_string(), "WT1-Adenine__x0000000_y0000000");
        assert!(dirs.images.join(format!("{}.jpg", id)).is_file());
        let records = read_labels(&dirs.labels.join(format!("{}.txt", id))).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].class_id, 0);
        assert!(!dirs.images.join("WT1-Adenine__x0000100_y0000000.jpg").exists());
    }

    #[test]
    fn test_skip_labels_writes_empty_files() {
        let dir = TempDir::new().unwrap();
        let dirs = SplitDirs::new(dir.path(), Split::Test);
        let mut config = config(64);
        config.tiling.skip_labels = true;
        let gt = vec![Instance::ground_truth(
            polygon![(x: 0.0, y: 0.0), (x: 60.0, y: 0.0), (x: 60.0, y: 60.0), (x: 0.0, y: 60.0)],
            0,
            CoordSpace::SlidePixel,
        )];
        let slide = ImageSlide::new(RgbImage::from_pixel(64, 64, Rgb([100, 50, 100])));
        let summary = build_slide_tiles(&slide, "s", 0, Some(&gt), &config, &dirs, None).unwrap();
        assert_eq!(summary.labelled, 0);
        let label = dirs.labels.join(format!("{}.txt", summary.tiles[0]));
        assert_eq!(fs::read_to_string(label).unwrap(), "");
    }

    #[test]
    fn test_build_folds() {
        let root = TempDir::new().unwrap();
        let slide_dir = root.path().join("slides");
        fs::create_dir_all(&slide_dir).unwrap();
        for name in ["A-adenine", "B-normal"] {
            RgbImage::from_pixel(64, 64, Rgb([120, 60, 120]))
                .save(slide_dir.join(format!("{}.png", name)))
                .unwrap();
        }
        let mut config = config(64);
        config.slides = vec!["A-adenine".to_string(), "B-normal".to_string()];
        config.folds = vec![
            FoldSpec {
                name: "Fold0".to_string(),
                test: vec!["A-adenine".to_string()],
            },
            FoldSpec {
                name: "Fold1".to_string(),
                test: vec!["B-normal".to_string()],
            },
        ];
        let paths = FoldPaths {
            slide_dir,
            gt_dir: None,
            out_root: root.path().join("out"),
        };
        let open = |p: &Path| -> Result<Box<dyn SlideSource>, Error> {
            Ok(Box::new(ImageSlide::open(p)?))
        };
        let report = build_folds(&config, &paths, &open, None, false, None).unwrap();
        assert_eq!(report.slides.len(), 2);
        assert!(report.failed.is_empty());

        let out = &paths.out_root;
        assert!(out.join("Fold0/TEST/images/A-adenine__x0000000_y0000000.jpg").is_file());
        assert!(out.join("Fold1/TRAIN/images/A-adenine__x0000000_y0000000.jpg").is_file());
        assert!(out.join("Fold1/TEST/labels/B-normal__x0000000_y0000000.txt").is_file());
        let yaml = fs::read_to_string(out.join("Fold0/data.yaml")).unwrap();
        assert!(yaml.contains("test: TEST/images\n"));
        assert!(yaml.contains("nc: 2\n"));
        assert!(yaml.ends_with("names: ['glomerulus_adenine', 'glomerulus_normal']\n"));
    }

    #[test]
    fn test_build_folds_rejects_reserved_slide_id() {
        let root = TempDir::new().unwrap();
        let slide_dir = root.path().join("slides");
        fs::create_dir_all(&slide_dir).unwrap();
        RgbImage::from_pixel(64, 64, Rgb([120, 60, 120]))
            .save(slide_dir.join("A__x1-adenine.png"))
            .unwrap();
        let mut config = config(64);
        config.slides = vec!["A__x1-adenine".to_string()];
        config.folds = vec![FoldSpec {
            name: "Fold0".to_string(),
            test: vec!["A__x1-adenine".to_string()],
        }];
        let paths = FoldPaths {
            slide_dir,
            gt_dir: None,
            out_root: root.path().join("out"),
        };
        let open = |p: &Path| -> Result<Box<dyn SlideSource>, Error> {
            Ok(Box::new(ImageSlide::open(p)?))
        };
        let result = build_folds(&config, &paths, &open, None, false, None);
        assert!(matches!(result, Err(Error::Configuration(_))));
        assert!(!paths.out_root.exists());
    }

    #[test]
    fn test_build_folds_missing_slide() {
        let root = TempDir::new().unwrap();
        let paths = FoldPaths {
            slide_dir: root.path().to_path_buf(),
            gt_dir: None,
            out_root: root.path().join("out"),
        };
        let open = |p: &Path| -> Result<Box<dyn SlideSource>, Error> {
            Ok(Box::new(ImageSlide::open(p)?))
        };
        let result = build_folds(&EvalConfig::default(), &paths, &open, None, false, None);
        assert!(matches!(result, Err(Error::MissingSlide(_))));
        assert!(!paths.out_root.exists());
    }
}
