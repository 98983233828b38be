// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Au-Zone Technologies. All Rights Reserved.

//! Random-access slide pixel sources.

use crate::Error;
use image::{RgbImage, imageops};
use std::path::Path;

/// Random-access RGB reader over one slide.
///
/// Gigapixel pyramid formats are served by external readers implementing
/// this trait; [`ImageSlide`] covers anything small enough to decode whole.
pub trait SlideSource: Send + Sync {
    fn width(&self) -> u32;
    fn height(&self) -> u32;

    /// Read a `width` x `height` region at `(x, y)`.
    ///
    /// Pixels outside the slide are black, so edge tiles always come back at
    /// the requested size.
    fn crop(&self, x: u32, y: u32, width: u32, height: u32) -> Result<RgbImage, Error>;
}

/// A slide held fully in memory.
#[derive(Debug, Clone)]
pub struct ImageSlide {
    image: RgbImage,
}

impl ImageSlide {
    pub fn new(image: RgbImage) -> Self {
        Self { image }
    }

    pub fn open(path: &Path) -> Result<Self, Error> {
        let image = image::ImageReader::open(path)?
            .with_guessed_format()?
            .decode()?
            .to_rgb8();
        Ok(Self { image })
    }
}

impl SlideSource for ImageSlide {
    fn width(&self) -> u32 {
        self.image.width()
    }

    fn height(&self) -> u32 {
        self.image.height()
    }

    fn crop(&self, x: u32, y: u32, width: u32, height: u32) -> Result<RgbImage, Error> {
        let mut out = RgbImage::new(width, height);
        let cw = width.min(self.image.width().saturating_sub(x));
        let ch = height.min(self.image.height().saturating_sub(y));
        if cw > 0 && ch > 0 {
            let region = imageops::crop_imm(&self.image, x, y, cw, ch).to_image();
            imageops::replace(&mut out, &region, 0, 0);
        }
        Ok(out)
    }
}
