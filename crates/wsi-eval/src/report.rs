// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Au-Zone Technologies. All Rights Reserved.

//! Evaluation reports: CSV, JSON and (with `polars`) Arrow IPC.
//!
//! The table has one row per (slide, threshold) followed by the aggregate
//! rows, which use the sentinel slide id [`MICRO_SLIDE_ID`] and leave the
//! tile and instance counts blank.

use crate::{
    Error,
    metrics::{AggregateReport, AggregateResult, SlideEvaluation},
};
use serde::{Deserialize, Serialize};
use std::{borrow::Cow, fmt, fs, path::Path};

#[cfg(feature = "polars")]
use polars::prelude::*;

/// Slide id used for aggregate rows.
pub const MICRO_SLIDE_ID: &str = "__MICRO__";

pub const CSV_HEADER: &str = "model,slide,iouThreshold,tileCount,gtCount,predCount,tp,fp,fn,precision,recall,f1,meanIoU_tp,meanDice_tp";

/// One row of the report table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportRow {
    pub model: String,
    pub slide: String,
    pub iou_threshold: f64,
    pub tile_count: Option<usize>,
    pub gt_count: Option<usize>,
    pub pred_count: Option<usize>,
    pub tp: usize,
    pub fp: usize,
    #[serde(rename = "fn")]
    pub fn_: usize,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub mean_iou_tp: f64,
    pub mean_dice_tp: f64,
}

/// Quote a CSV field when it holds a delimiter, a quote or a line break.
fn csv_field(value: &str) -> Cow<'_, str> {
    if value.contains([',', '"', '\n', '\r']) {
        Cow::Owned(format!("\"{}\"", value.replace('"', "\"\"")))
    } else {
        Cow::Borrowed(value)
    }
}

impl ReportRow {
    fn aggregate(model: &str, r: &AggregateResult) -> Self {
        Self {
            model: model.to_string(),
            slide: MICRO_SLIDE_ID.to_string(),
            iou_threshold: r.iou_threshold,
            tile_count: None,
            gt_count: None,
            pred_count: None,
            tp: r.tp,
            fp: r.fp,
            fn_: r.fn_,
            precision: r.precision,
            recall: r.recall,
            f1: r.f1,
            mean_iou_tp: r.mean_iou,
            mean_dice_tp: r.mean_dice,
        }
    }

    pub fn is_aggregate(&self) -> bool {
        self.slide == MICRO_SLIDE_ID
    }

    fn to_csv_line(&self) -> String {
        let count = |c: Option<usize>| c.map(|c| c.to_string()).unwrap_or_default();
        format!(
            "{},{},{:.2},{},{},{},{},{},{},{:.6},{:.6},{:.6},{:.6},{:.6}",
            csv_field(&self.model),
            csv_field(&self.slide),
            self.iou_threshold,
            count(self.tile_count),
            count(self.gt_count),
            count(self.pred_count),
            self.tp,
            self.fp,
            self.fn_,
            self.precision,
            self.recall,
            self.f1,
            self.mean_iou_tp,
            self.mean_dice_tp
        )
    }
}

/// Per-slide rows in slide order, each slide's thresholds in sweep order.
pub fn slide_rows(model: &str, slides: &[SlideEvaluation]) -> Vec<ReportRow> {
    slides
        .iter()
        .flat_map(|slide| {
            slide.results.iter().map(move |r| ReportRow {
                model: model.to_string(),
                slide: slide.slide_id.clone(),
                iou_threshold: r.iou_threshold,
                tile_count: Some(slide.tile_count),
                gt_count: Some(r.n_gt),
                pred_count: Some(r.n_pred),
                tp: r.tp,
                fp: r.fp,
                fn_: r.fn_,
                precision: r.precision,
                recall: r.recall,
                f1: r.f1,
                mean_iou_tp: r.mean_iou,
                mean_dice_tp: r.mean_dice,
            })
        })
        .collect()
}

pub fn aggregate_rows(model: &str, aggregate: &AggregateReport) -> Vec<ReportRow> {
    aggregate
        .per_threshold
        .iter()
        .map(|r| ReportRow::aggregate(model, r))
        .collect()
}

/// CSV text including the header and a trailing newline.
pub fn to_csv(rows: &[ReportRow]) -> String {
    let mut out = String::from(CSV_HEADER);
    out.push('\n');
    for row in rows {
        out.push_str(&row.to_csv_line());
        out.push('\n');
    }
    out
}

/// A slide that could not be evaluated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedSlide {
    pub slide_id: String,
    pub error: String,
}

/// Complete evaluation output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub model: String,
    pub iou_thresholds: Vec<f64>,
    pub class_agnostic: bool,
    pub micro: Vec<ReportRow>,
    pub mean_f1: f64,
    pub per_slide: Vec<ReportRow>,
    pub failed_slides: Vec<FailedSlide>,
}

impl EvaluationReport {
    pub fn new(
        model: &str,
        iou_thresholds: &[f64],
        class_agnostic: bool,
        slides: &[SlideEvaluation],
        aggregate: &AggregateReport,
        failed_slides: Vec<FailedSlide>,
    ) -> Self {
        Self {
            model: model.to_string(),
            iou_thresholds: iou_thresholds.to_vec(),
            class_agnostic,
            micro: aggregate_rows(model, aggregate),
            mean_f1: aggregate.mean_f1,
            per_slide: slide_rows(model, slides),
            failed_slides,
        }
    }

    /// Per-slide rows followed by the aggregate rows.
    pub fn rows(&self) -> Vec<ReportRow> {
        self.per_slide
            .iter()
            .chain(self.micro.iter())
            .cloned()
            .collect()
    }

    /// Write `results.csv`, `results.json` and, with `polars`,
    /// `results.arrow` into `dir`.
    pub fn write(&self, dir: &Path) -> Result<(), Error> {
        fs::create_dir_all(dir)?;
        let rows = self.rows();
        fs::write(dir.join("results.csv"), to_csv(&rows))?;
        fs::write(
            dir.join("results.json"),
            serde_json::to_string_pretty(self)?,
        )?;
        #[cfg(feature = "polars")]
        write_arrow(&dir.join("results.arrow"), &rows)?;
        Ok(())
    }

    fn micro_at(&self, threshold: f64) -> Option<&ReportRow> {
        self.micro
            .iter()
            .find(|r| (r.iou_threshold - threshold).abs() < 1e-9)
    }
}

impl fmt::Display for EvaluationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "╔══════════════════════════════════════════════════════════════╗"
        )?;
        writeln!(
            f,
            "║                 MICRO AGGREGATE (slide level)                ║"
        )?;
        writeln!(
            f,
            "╠══════════════════════════════════════════════════════════════╣"
        )?;
        writeln!(f, "║ Model:       {}", self.model)?;
        writeln!(
            f,
            "║ Slides:      {} evaluated, {} failed",
            self.per_slide
                .iter()
                .map(|r| r.slide.as_str())
                .collect::<std::collections::BTreeSet<_>>()
                .len(),
            self.failed_slides.len()
        )?;
        for failed in self.failed_slides.iter().take(5) {
            writeln!(f, "║              - {}: {}", failed.slide_id, failed.error)?;
        }
        if self.failed_slides.len() > 5 {
            writeln!(
                f,
                "║              ... and {} more",
                self.failed_slides.len() - 5
            )?;
        }
        writeln!(
            f,
            "╠══════════════════════════════════════════════════════════════╣"
        )?;
        for threshold in [0.5, 0.75] {
            if let Some(r) = self.micro_at(threshold) {
                writeln!(
                    f,
                    "║ @IoU {:.2}:  P={:.4} R={:.4} F1={:.4} meanIoU={:.4} meanDice={:.4}",
                    threshold, r.precision, r.recall, r.f1, r.mean_iou_tp, r.mean_dice_tp
                )?;
            }
        }
        writeln!(
            f,
            "║ Mean F1 over {} IoU thresholds: {:.4}",
            self.iou_thresholds.len(),
            self.mean_f1
        )?;
        writeln!(
            f,
            "╚══════════════════════════════════════════════════════════════╝"
        )?;
        Ok(())
    }
}

/// Build the report table as a DataFrame.
#[cfg(feature = "polars")]
pub fn report_dataframe(rows: &[ReportRow]) -> Result<DataFrame, Error> {
    let count = |f: fn(&ReportRow) -> Option<usize>| -> Vec<Option<u64>> {
        rows.iter().map(|r| f(r).map(|c| c as u64)).collect()
    };
    let models: Vec<&str> = rows.iter().map(|r| r.model.as_str()).collect();
    let slides: Vec<&str> = rows.iter().map(|r| r.slide.as_str()).collect();
    let thresholds: Vec<f64> = rows.iter().map(|r| r.iou_threshold).collect();
    let tp: Vec<u64> = rows.iter().map(|r| r.tp as u64).collect();
    let fp: Vec<u64> = rows.iter().map(|r| r.fp as u64).collect();
    let fn_: Vec<u64> = rows.iter().map(|r| r.fn_ as u64).collect();
    let precision: Vec<f64> = rows.iter().map(|r| r.precision).collect();
    let recall: Vec<f64> = rows.iter().map(|r| r.recall).collect();
    let f1: Vec<f64> = rows.iter().map(|r| r.f1).collect();
    let mean_iou: Vec<f64> = rows.iter().map(|r| r.mean_iou_tp).collect();
    let mean_dice: Vec<f64> = rows.iter().map(|r| r.mean_dice_tp).collect();

    Ok(DataFrame::new(vec![
        Series::new("model".into(), models).into(),
        Series::new("slide".into(), slides).into(),
        Series::new("iouThreshold".into(), thresholds).into(),
        Series::new("tileCount".into(), count(|r| r.tile_count)).into(),
        Series::new("gtCount".into(), count(|r| r.gt_count)).into(),
        Series::new("predCount".into(), count(|r| r.pred_count)).into(),
        Series::new("tp".into(), tp).into(),
        Series::new("fp".into(), fp).into(),
        Series::new("fn".into(), fn_).into(),
        Series::new("precision".into(), precision).into(),
        Series::new("recall".into(), recall).into(),
        Series::new("f1".into(), f1).into(),
        Series::new("meanIoU_tp".into(), mean_iou).into(),
        Series::new("meanDice_tp".into(), mean_dice).into(),
    ])?)
}

#[cfg(feature = "polars")]
pub fn write_arrow(path: &Path, rows: &[ReportRow]) -> Result<(), Error> {
    let mut df = report_dataframe(rows)?;
    let mut file = fs::File::create(path)?;
    IpcWriter::new(&mut file).finish(&mut df)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{matcher::MatchResult, metrics::aggregate};

    fn evaluation() -> (Vec<SlideEvaluation>, AggregateReport) {
        let result = |t: f64, tp: usize, fp: usize, fn_: usize| MatchResult {
            iou_threshold: t,
            tp,
            fp,
            fn_,
            precision: tp as f64 / (tp + fp) as f64,
            recall: tp as f64 / (tp + fn_) as f64,
            f1: 0.5,
            mean_iou: 0.8,
            mean_dice: 0.875,
            n_gt: tp + fn_,
            n_pred: tp + fp,
            pairs: vec![],
        };
        let slides = vec![SlideEvaluation {
            slide_id: "WT1-Adenine_x20".to_string(),
            tile_count: 12,
            results: vec![result(0.5, 3, 1, 1), result(0.75, 2, 2, 2)],
        }];
        let report = aggregate(&[0.5, 0.75], &slides).unwrap();
        (slides, report)
    }

    #[test]
    fn test_csv_layout() {
        let (slides, agg) = evaluation();
        let report = EvaluationReport::new("yolo", &[0.5, 0.75], false, &slides, &agg, vec![]);
        let csv = to_csv(&report.rows());
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], CSV_HEADER);
        assert_eq!(lines.len(), 1 + 2 + 2);
        assert_eq!(
            lines[1],
            "yolo,WT1-Adenine_x20,0.50,12,4,4,3,1,1,0.750000,0.750000,0.500000,0.800000,0.875000"
        );
        assert!(lines[3].starts_with("yolo,__MICRO__,0.50,,,,3,1,1,0.750000,0.750000,"));
        assert!(csv.ends_with('\n'));
    }

    #[test]
    fn test_csv_quotes_text_fields() {
        assert_eq!(csv_field("yolo"), "yolo");
        assert_eq!(csv_field("a,b"), "\"a,b\"");
        assert_eq!(csv_field("say \"hi\""), "\"say \"\"hi\"\"\"");
        assert_eq!(csv_field("two\nlines"), "\"two\nlines\"");

        let (slides, agg) = evaluation();
        let report = EvaluationReport::new("run,v2", &[0.5, 0.75], false, &slides, &agg, vec![]);
        let csv = to_csv(&report.rows());
        let header_columns = CSV_HEADER.split(',').count();
        for line in csv.lines().skip(1) {
            assert!(line.starts_with("\"run,v2\","), "{}", line);
            // one extra comma sits inside the quoted model name
            assert_eq!(line.split(',').count(), header_columns + 1);
        }
    }

    #[test]
    fn test_report_files_written() {
        let (slides, agg) = evaluation();
        let failed = vec![FailedSlide {
            slide_id: "WT2-Adenine_x20".to_string(),
            error: "I/O error: missing".to_string(),
        }];
        let report = EvaluationReport::new("yolo", &[0.5, 0.75], true, &slides, &agg, failed);
        let dir = tempfile::TempDir::new().unwrap();
        report.write(dir.path()).unwrap();

        assert!(dir.path().join("results.csv").exists());
        let json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(dir.path().join("results.json")).unwrap())
                .unwrap();
        assert_eq!(json["failed_slides"][0]["slide_id"], "WT2-Adenine_x20");
        assert_eq!(json["micro"][0]["slide"], MICRO_SLIDE_ID);
        assert_eq!(json["micro"][0]["tile_count"], serde_json::Value::Null);
        #[cfg(feature = "polars")]
        assert!(dir.path().join("results.arrow").exists());

        let text = report.to_string();
        assert!(text.contains("1 evaluated, 1 failed"));
        assert!(text.contains("@IoU 0.75"));
    }

    #[cfg(feature = "polars")]
    #[test]
    fn test_report_dataframe_shape() {
        let (slides, agg) = evaluation();
        let report = EvaluationReport::new("yolo", &[0.5, 0.75], false, &slides, &agg, vec![]);
        let df = report_dataframe(&report.rows()).unwrap();
        assert_eq!(df.shape(), (4, 14));
        assert_eq!(df.column("tileCount").unwrap().null_count(), 2);
    }
}
