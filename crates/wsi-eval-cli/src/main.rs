// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Au-Zone Technologies. All Rights Reserved.

use clap::{Parser, Subcommand};
use log::{info, warn};
use std::{
    fs,
    path::{Path, PathBuf},
};
use tokio::{sync::watch, task::JoinHandle};
use wsi_eval::{
    EvalConfig, Error, FoldPaths, ImageSlide, Progress, SlideSource, StoredPredictions,
    TilesetPaths, build_folds, evaluate_tileset, geojson::write_feature_collection,
    predict_slide, summarize_folds, summarize_split, summary::DEFAULT_SIZE_SAMPLE,
};

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (TOML, JSON or YAML); defaults to the platform
    /// config directory.
    #[clap(long, env = "WSI_EVAL_CONFIG")]
    config: Option<PathBuf>,

    /// Disable the progress bar.
    #[clap(long, short)]
    quiet: bool,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, PartialEq, Clone, Debug)]
enum Command {
    /// Build the cross-validation tileset: JPEG tiles and label files for
    /// every configured fold.
    Tile {
        /// Directory holding the slide images.
        #[clap(long)]
        slides: PathBuf,

        /// Directory holding `<slide>.geojson` ground truth; labels are
        /// empty when omitted.
        #[clap(long)]
        gt: Option<PathBuf>,

        /// Output root for the fold directories.
        #[clap(long, short)]
        output: PathBuf,

        /// Build only this fold.
        #[clap(long)]
        fold: Option<String>,

        /// Remove existing fold directories first.
        #[clap(long)]
        force: bool,

        /// Upper bound on tiles per slide.
        #[clap(long)]
        max_tiles: Option<usize>,

        #[clap(long)]
        tile_size: Option<u32>,

        #[clap(long)]
        stride: Option<u32>,
    },
    /// Predict a whole slide from per-tile prediction files and write the
    /// reconciled polygons as GeoJSON.
    Predict {
        /// Slide image.
        #[clap(long)]
        slide: PathBuf,

        /// Directory of `<tile id>.txt` prediction label files.
        #[clap(long)]
        predictions: PathBuf,

        /// Output GeoJSON file.
        #[clap(long, short)]
        output: PathBuf,

        /// Also write every accepted tile as JPEG into this directory.
        #[clap(long)]
        tiles: Option<PathBuf>,

        /// Write the latest progress as JSON into this file.
        #[clap(long)]
        progress: Option<PathBuf>,

        #[clap(long)]
        max_tiles: Option<usize>,
    },
    /// Evaluate per-tile predictions against the ground truth labels of a
    /// tileset.
    Evaluate {
        /// Directory of tile images.
        #[clap(long)]
        images: PathBuf,

        /// Directory of ground truth label files.
        #[clap(long)]
        labels: PathBuf,

        /// Directory of `<tile id>.txt` prediction label files.
        #[clap(long)]
        predictions: PathBuf,

        /// Output root for `gt/`, `pred/` and `eval/`.
        #[clap(long, short)]
        output: PathBuf,

        /// Directory of source slides, used to clip geometry to the slide.
        #[clap(long)]
        slides: Option<PathBuf>,

        /// Evaluate only this slide.
        #[clap(long)]
        slide: Option<String>,

        /// Model name written to the reports.
        #[clap(long)]
        model: Option<String>,

        /// IoU thresholds: `start:end:step` or a list of values.
        #[clap(long, num_args = 1..)]
        iou_thresholds: Vec<String>,

        /// Ignore classes when matching.
        #[clap(long)]
        class_agnostic: bool,

        /// Area floor in pixels squared.
        #[clap(long)]
        min_area: Option<f64>,

        /// Do not clip geometry to the slide extent.
        #[clap(long)]
        no_clip: bool,

        /// Write the latest progress as JSON into this file.
        #[clap(long)]
        progress: Option<PathBuf>,
    },
    /// Summarize a tileset: a fold root or a single split directory.
    Summarize {
        /// Fold root, or a split directory holding `images/` and `labels/`.
        root: PathBuf,

        /// Number of images whose size is sampled.
        #[clap(long, default_value_t = DEFAULT_SIZE_SAMPLE)]
        sample: usize,
    },
}

/// Drive an indicatif bar, and optionally a JSON progress file, from the
/// pipeline's watch channel until the sender is dropped.
fn progress_reporter(
    quiet: bool,
    progress_file: Option<PathBuf>,
) -> (watch::Sender<Progress>, JoinHandle<()>) {
    use indicatif::{ProgressBar, ProgressStyle};

    let bar = if quiet {
        ProgressBar::hidden()
    } else {
        ProgressBar::new(0)
    };
    bar.set_style(
        ProgressStyle::with_template(
            "[{elapsed_precise} ETA: {eta}] {msg}: {wide_bar:.yellow} {human_pos}/{human_len}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▇▆▅▄▃▂▁  "),
    );

    let (tx, mut rx) = watch::channel(Progress::default());
    let handle = tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            let progress = rx.borrow_and_update().clone();
            if progress.total > 0 {
                bar.set_message(format!("{:?} {}", progress.stage, progress.slide));
                bar.set_length(progress.total as u64);
                bar.set_position(progress.current as u64);
            }
            if let Some(path) = &progress_file {
                match serde_json::to_string(&progress) {
                    Ok(json) => {
                        if let Err(err) = fs::write(path, json) {
                            warn!("cannot write progress to {:?}: {}", path, err);
                        }
                    }
                    Err(err) => warn!("cannot encode progress: {}", err),
                }
            }
        }
        bar.finish_and_clear();
    });
    (tx, handle)
}

fn open_slide(path: &Path) -> Result<Box<dyn SlideSource>, Error> {
    Ok(Box::new(ImageSlide::open(path)?))
}

fn slide_id(path: &Path) -> Result<String, Error> {
    path.file_stem()
        .and_then(|s| s.to_str())
        .map(|s| s.to_string())
        .ok_or_else(|| Error::Configuration(format!("cannot derive slide id from {:?}", path)))
}

#[allow(clippy::too_many_arguments)]
async fn handle_tile(
    mut config: EvalConfig,
    quiet: bool,
    slides: PathBuf,
    gt: Option<PathBuf>,
    output: PathBuf,
    fold: Option<String>,
    force: bool,
    max_tiles: Option<usize>,
    tile_size: Option<u32>,
    stride: Option<u32>,
) -> Result<(), Error> {
    if let Some(max_tiles) = max_tiles {
        config.tiling.max_tiles = Some(max_tiles);
    }
    if let Some(tile_size) = tile_size {
        config.tiling.tile_size = tile_size;
    }
    if let Some(stride) = stride {
        config.tiling.stride = stride;
    }
    config.validate()?;

    let paths = FoldPaths {
        slide_dir: slides,
        gt_dir: gt,
        out_root: output,
    };
    let (tx, reporter) = progress_reporter(quiet, None);
    let result = tokio::task::block_in_place(|| {
        build_folds(&config, &paths, &open_slide, fold.as_deref(), force, Some(&tx))
    });
    drop(tx);
    let _ = reporter.await;
    let report = result?;

    for summary in &report.slides {
        println!(
            "{}: {}x{} px, grid {}, selected {}, kept {}, labelled {}",
            summary.slide_id,
            summary.width,
            summary.height,
            summary.grid,
            summary.selected,
            summary.tiles.len(),
            summary.labelled
        );
    }
    for failed in &report.failed {
        warn!("{} failed: {}", failed.slide_id, failed.error);
    }
    info!("Tileset written to {:?}", paths.out_root);
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn handle_predict(
    mut config: EvalConfig,
    quiet: bool,
    slide: PathBuf,
    predictions: PathBuf,
    output: PathBuf,
    tiles: Option<PathBuf>,
    progress: Option<PathBuf>,
    max_tiles: Option<usize>,
) -> Result<(), Error> {
    if max_tiles.is_some() {
        config.tiling.max_tiles = max_tiles;
    }
    let slide_id = slide_id(&slide)?;
    let segmenter = StoredPredictions::new(predictions)?;
    let source = ImageSlide::open(&slide)?;

    let (tx, reporter) = progress_reporter(quiet, progress);
    let result = tokio::task::block_in_place(|| {
        predict_slide(
            &source,
            &slide_id,
            &segmenter,
            &config,
            tiles.as_deref(),
            Some(&tx),
        )
    });
    drop(tx);
    let _ = reporter.await;
    let instances = result?;

    write_feature_collection(&output, &instances)?;
    println!("{}: {} objects written to {:?}", slide_id, instances.len(), output);
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn handle_evaluate(
    mut config: EvalConfig,
    quiet: bool,
    paths: TilesetPaths,
    predictions: PathBuf,
    slide: Option<String>,
    model: Option<String>,
    iou_thresholds: Vec<String>,
    class_agnostic: bool,
    min_area: Option<f64>,
    no_clip: bool,
    progress: Option<PathBuf>,
) -> Result<(), Error> {
    if let Some(model) = model {
        config.evaluation.model = model;
    }
    if !iou_thresholds.is_empty() {
        config.evaluation.iou_thresholds = iou_thresholds.join(",");
    }
    if class_agnostic {
        config.evaluation.class_agnostic = true;
    }
    if let Some(min_area) = min_area {
        config.evaluation.min_area = min_area;
    }
    if no_clip {
        config.evaluation.clip_to_slide = false;
    }
    config.validate()?;

    let segmenter = StoredPredictions::new(predictions)?;
    let (tx, reporter) = progress_reporter(quiet, progress);
    let result = tokio::task::block_in_place(|| {
        evaluate_tileset(&paths, &segmenter, &config, slide.as_deref(), Some(&tx))
    });
    drop(tx);
    let _ = reporter.await;
    let report = result?;

    println!("{}", report);
    println!("Reports written to {:?}", paths.out_root.join("eval"));
    Ok(())
}

fn handle_summarize(root: PathBuf, sample: usize) -> Result<(), Error> {
    if root.join("images").is_dir() {
        let summary = summarize_split(&root, sample)?;
        println!("{:?}", root);
        print!("{}", summary);
        return Ok(());
    }
    for fold in summarize_folds(&root, sample)? {
        print!("{}", fold);
    }
    Ok(())
}

#[cfg(feature = "profiling")]
fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(EnvFilter::from_default_env())
        .try_init();
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    #[cfg(feature = "profiling")]
    init_tracing();
    #[cfg(not(feature = "profiling"))]
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = EvalConfig::load(args.config.as_deref())?;

    match args.cmd {
        Command::Tile {
            slides,
            gt,
            output,
            fold,
            force,
            max_tiles,
            tile_size,
            stride,
        } => {
            handle_tile(
                config, args.quiet, slides, gt, output, fold, force, max_tiles, tile_size, stride,
            )
            .await
        }
        Command::Predict {
            slide,
            predictions,
            output,
            tiles,
            progress,
            max_tiles,
        } => {
            handle_predict(
                config,
                args.quiet,
                slide,
                predictions,
                output,
                tiles,
                progress,
                max_tiles,
            )
            .await
        }
        Command::Evaluate {
            images,
            labels,
            predictions,
            output,
            slides,
            slide,
            model,
            iou_thresholds,
            class_agnostic,
            min_area,
            no_clip,
            progress,
        } => {
            let paths = TilesetPaths {
                tiles_dir: images,
                labels_dir: labels,
                slide_dir: slides,
                out_root: output,
            };
            handle_evaluate(
                config,
                args.quiet,
                paths,
                predictions,
                slide,
                model,
                iou_thresholds,
                class_agnostic,
                min_area,
                no_clip,
                progress,
            )
            .await
        }
        Command::Summarize { root, sample } => handle_summarize(root, sample),
    }
}
