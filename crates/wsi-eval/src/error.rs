// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Au-Zone Technologies. All Rights Reserved.

/// Error type for slide tiling, reconciliation and evaluation.
///
/// Configuration problems are fatal and surface before any tile is touched.
/// Parse and geometry problems are normally recovered locally (the record or
/// instance is skipped) and only reach callers through the explicit parsing
/// APIs. Segmentation failures always propagate.
#[derive(Debug)]
pub enum Error {
    /// An I/O error occurred during file operations.
    IoError(std::io::Error),
    /// Configuration file parsing or loading error.
    ConfigError(config::ConfigError),
    /// JSON serialization or deserialization error.
    JsonError(serde_json::Error),
    /// Image decoding or encoding error.
    ImageError(image::ImageError),
    /// Image header probing error.
    ImageSizeError(imagesize::ImageError),
    /// Directory traversal error.
    WalkDirError(walkdir::Error),
    /// Invalid evaluation or tiling configuration.
    Configuration(String),
    /// A slide referenced by the configuration could not be located.
    MissingSlide(String),
    /// No class could be resolved for the given slide identifier.
    UnknownClass(String),
    /// A record (label line, tile name, threshold) failed to parse.
    ParseError(String),
    /// A polygon was degenerate or could not be repaired.
    GeometryError(String),
    /// The external segmentation capability failed.
    SegmentationError(String),
    /// Invalid parameters provided to an operation.
    InvalidParameters(String),
    /// Polars dataframe operation error (only with "polars" feature).
    #[cfg(feature = "polars")]
    PolarsError(polars::error::PolarsError),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IoError(err)
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::ConfigError(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::JsonError(err)
    }
}

impl From<image::ImageError> for Error {
    fn from(err: image::ImageError) -> Self {
        Error::ImageError(err)
    }
}

impl From<imagesize::ImageError> for Error {
    fn from(err: imagesize::ImageError) -> Self {
        Error::ImageSizeError(err)
    }
}

impl From<walkdir::Error> for Error {
    fn from(err: walkdir::Error) -> Self {
        Error::WalkDirError(err)
    }
}

#[cfg(feature = "polars")]
impl From<polars::error::PolarsError> for Error {
    fn from(err: polars::error::PolarsError) -> Self {
        Error::PolarsError(err)
    }
}

impl Error {
    /// Returns true for errors that must abort the whole run rather than the
    /// current item.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::ConfigError(_)
                | Error::Configuration(_)
                | Error::MissingSlide(_)
                | Error::UnknownClass(_)
                | Error::SegmentationError(_)
        )
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::IoError(e) => write!(f, "I/O error: {}", e),
            Error::ConfigError(e) => write!(f, "Configuration error: {}", e),
            Error::JsonError(e) => write!(f, "JSON error: {}", e),
            Error::ImageError(e) => write!(f, "Image error: {}", e),
            Error::ImageSizeError(e) => write!(f, "Image size error: {}", e),
            Error::WalkDirError(e) => write!(f, "Directory walk error: {}", e),
            Error::Configuration(s) => write!(f, "Invalid configuration: {}", s),
            Error::MissingSlide(s) => write!(f, "Missing slide: {}", s),
            Error::UnknownClass(s) => write!(f, "Cannot resolve class for slide: {}", s),
            Error::ParseError(s) => write!(f, "Parse error: {}", s),
            Error::GeometryError(s) => write!(f, "Geometry error: {}", s),
            Error::SegmentationError(s) => write!(f, "Segmentation failed: {}", s),
            Error::InvalidParameters(s) => write!(f, "Invalid parameters: {}", s),
            #[cfg(feature = "polars")]
            Error::PolarsError(e) => write!(f, "Polars error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::IoError(e) => Some(e),
            Error::ConfigError(e) => Some(e),
            Error::JsonError(e) => Some(e),
            Error::ImageError(e) => Some(e),
            Error::ImageSizeError(e) => Some(e),
            Error::WalkDirError(e) => Some(e),
            #[cfg(feature = "polars")]
            Error::PolarsError(e) => Some(e),
            _ => None,
        }
    }
}
