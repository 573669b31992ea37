//! Texture atlas assembly.
//!
//! Every part's baked images are packed into one square atlas per channel.
//! The rectangle assignment is computed once, from the primary (diffuse)
//! bakes, and reused for every auxiliary channel and for the geometry UV
//! remap so all maps stay spatially aligned.

use std::collections::BTreeMap;

use image::{Rgba, RgbaImage};
#[cfg(feature = "persist")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::part::NORMAL_CHANNEL;

mod dilation;
mod packer;

pub use dilation::{dilate, dilate_channels, invalid_count};
pub use packer::{AtlasPacker, PackedAtlas};

/// Part name → atlas rectangle, ordered by name.
pub type RectMap = BTreeMap<String, BakeRect>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PackError {
    #[error("{parts} part bakes do not fit a {atlas_size}x{atlas_size} atlas")]
    Overflow { parts: usize, atlas_size: u32 },

    #[error("Part '{0}' was baked more than once")]
    DuplicatePart(String),
}

/// Pixel-space rectangle inside an atlas, excluding padding.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "persist", derive(Serialize, Deserialize))]
pub struct PixelRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl PixelRect {
    pub fn overlaps(&self, other: &PixelRect) -> bool {
        self.x < other.x + other.width
            && other.x < self.x + self.width
            && self.y < other.y + other.height
            && other.y < self.y + self.height
    }
}

/// Region of the atlas assigned to one part.
///
/// `x`, `y`, `width`, `height` are normalized to 0-1 atlas space; `pixels`
/// is the same region in texels.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "persist", derive(Serialize, Deserialize))]
pub struct BakeRect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub pixels: PixelRect,
}

impl BakeRect {
    pub fn from_pixels(pixels: PixelRect, atlas_size: u32) -> Self {
        let size = atlas_size as f32;
        Self {
            x: pixels.x as f32 / size,
            y: pixels.y as f32 / size,
            width: pixels.width as f32 / size,
            height: pixels.height as f32 / size,
            pixels,
        }
    }

    /// `origin + uv * size`.
    #[inline]
    pub fn remap_uv(&self, uv: [f32; 2]) -> [f32; 2] {
        [self.x + uv[0] * self.width, self.y + uv[1] * self.height]
    }
}

/// One atlas per channel, all sharing the same size and rectangle layout.
#[derive(Clone, Debug)]
pub struct AtlasSet {
    pub diffuse: RgbaImage,
    /// Auxiliary channels keyed by name (`normal`, custom map names).
    pub channels: BTreeMap<String, RgbaImage>,
}

impl AtlasSet {
    /// Fully transparent atlases; transparent texels count as empty for
    /// [`dilate`].
    pub fn new<'a>(size: u32, channels: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            diffuse: RgbaImage::new(size, size),
            channels: channels
                .into_iter()
                .map(|name| (name.to_string(), RgbaImage::new(size, size)))
                .collect(),
        }
    }

    pub fn size(&self) -> u32 {
        self.diffuse.width()
    }

    pub fn channel(&self, name: &str) -> Option<&RgbaImage> {
        self.channels.get(name)
    }

    /// Copy of one part's region of the diffuse atlas.
    pub fn crop_diffuse(&self, rect: &BakeRect) -> RgbaImage {
        let p = rect.pixels;
        image::imageops::crop_imm(&self.diffuse, p.x, p.y, p.width, p.height).to_image()
    }
}

/// Fill value for a channel a part did not provide.
pub fn neutral_texel(channel: &str) -> Rgba<u8> {
    if channel == NORMAL_CHANNEL {
        // Flat tangent-space normal.
        Rgba([128, 128, 255, 255])
    } else {
        Rgba([128, 128, 128, 255])
    }
}
