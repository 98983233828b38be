// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Au-Zone Technologies. All Rights Reserved.

//! Tile identity encoding: `<slide>__x<0000000>_y<0000000>`.

use crate::Error;
use std::{fmt, path::Path, str::FromStr};

const X_SEPARATOR: &str = "__x";
const Y_SEPARATOR: &str = "_y";

/// Identity of one tile: the slide it belongs to and its origin.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileId {
    slide: String,
    x0: u32,
    y0: u32,
}

impl TileId {
    /// Create a tile id, rejecting slide ids that would not parse back.
    pub fn new(slide: impl Into<String>, x0: u32, y0: u32) -> Result<Self, Error> {
        let slide = slide.into();
        if slide.is_empty() {
            return Err(Error::InvalidParameters("slide id is empty".to_string()));
        }
        if slide.contains(X_SEPARATOR) {
            return Err(Error::InvalidParameters(format!(
                "slide id '{}' contains the reserved separator '{}'",
                slide, X_SEPARATOR
            )));
        }
        Ok(Self { slide, x0, y0 })
    }

    pub fn slide(&self) -> &str {
        &self.slide
    }

    pub fn x0(&self) -> u32 {
        self.x0
    }

    pub fn y0(&self) -> u32 {
        self.y0
    }

    /// Parse the tile id from a file path's stem.
    pub fn from_path(path: &Path) -> Result<Self, Error> {
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| Error::ParseError(format!("no file stem in {:?}", path)))?;
        stem.parse()
    }
}

impl fmt::Display for TileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{:07}{}{:07}",
            self.slide, X_SEPARATOR, self.x0, Y_SEPARATOR, self.y0
        )
    }
}

fn parse_coordinate(digits: &str, stem: &str) -> Result<u32, Error> {
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::ParseError(format!(
            "tile name '{}' does not match <slide>__x0000000_y0000000",
            stem
        )));
    }
    digits
        .parse()
        .map_err(|e| Error::ParseError(format!("tile name '{}': {}", stem, e)))
}

impl FromStr for TileId {
    type Err = Error;

    fn from_str(stem: &str) -> Result<Self, Self::Err> {
        let malformed = || {
            Error::ParseError(format!(
                "tile name '{}' does not match <slide>__x0000000_y0000000",
                stem
            ))
        };
        let (slide, rest) = stem.split_once(X_SEPARATOR).ok_or_else(malformed)?;
        let (x, y) = rest.split_once(Y_SEPARATOR).ok_or_else(malformed)?;
        let x0 = parse_coordinate(x, stem)?;
        let y0 = parse_coordinate(y, stem)?;
        TileId::new(slide, x0, y0).map_err(|_| malformed())
    }
}
