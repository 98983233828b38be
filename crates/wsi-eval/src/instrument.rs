// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Au-Zone Technologies. All Rights Reserved.

//! Conditional instrumentation support.
//!
//! With the `profiling` feature the pipeline stages open `tracing` spans
//! (slide, batch, match). Without it the helpers compile to no-ops so the
//! hot loops carry no tracing dependency.
//!
//! ```rust,ignore
//! use crate::instrument::stage_span;
//!
//! let _span = stage_span("match", slide_id);
//! // span ends when dropped
//! ```

/// Guard returned by [`stage_span`].
#[cfg(feature = "profiling")]
pub type StageGuard = tracing::span::EnteredSpan;

/// Guard returned by [`stage_span`].
#[cfg(not(feature = "profiling"))]
pub type StageGuard = ();

/// Enter a span for a named pipeline stage of one slide.
#[cfg(feature = "profiling")]
pub fn stage_span(stage: &'static str, slide: &str) -> StageGuard {
    tracing::info_span!("stage", stage, slide).entered()
}

/// Enter a span for a named pipeline stage of one slide.
#[cfg(not(feature = "profiling"))]
#[inline(always)]
pub fn stage_span(_stage: &'static str, _slide: &str) -> StageGuard {}
