//! Merge configuration.

use std::path::PathBuf;

use bevy::prelude::*;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SettingsError {
    #[error("Atlas size {size} is not a power of two")]
    NotPowerOfTwo { size: u32 },

    #[error("Bake resolution {resolution} must be non-zero and no larger than the atlas ({atlas_size})")]
    InvalidBakeResolution { resolution: u32, atlas_size: u32 },

    #[error("Padding {padding} leaves no room in a {atlas_size} atlas")]
    PaddingTooLarge { padding: u32, atlas_size: u32 },

    #[error("Readback timeout ({timeout}) must exceed the settle delay ({settle})")]
    TimeoutBeforeSettle { settle: u32, timeout: u32 },
}

/// Tunables for character merging.
///
/// Read when a merge starts; changing it does not affect merges in flight.
#[derive(Resource, Clone, Debug)]
pub struct MergeSettings {
    /// Side length of every (square) atlas in texels.
    pub atlas_size: u32,
    /// Side length of each part's bake before packing.
    pub bake_resolution: u32,
    /// Gutter in texels around each packed rectangle.
    pub padding: u32,
    /// Seam dilation passes over every atlas channel.
    pub dilation_iterations: u32,
    /// Collapse all parts into one submesh sharing one atlas material.
    pub merge_atlas: bool,
    /// Diffuse color used for parts whose bake failed.
    pub neutral_fill: Color,
    /// Frames to render a GPU bake before requesting its readback.
    pub settle_frames: u32,
    /// Frames after dispatch at which an unfinished GPU bake is failed.
    pub readback_timeout_frames: u32,
    /// Where saved characters are written. `None` disables saving.
    pub save_directory: Option<PathBuf>,
}

impl Default for MergeSettings {
    fn default() -> Self {
        Self {
            atlas_size: 2048,
            bake_resolution: 512,
            padding: 2,
            dilation_iterations: 8,
            merge_atlas: true,
            neutral_fill: Color::srgb(0.5, 0.5, 0.5),
            settle_frames: 2,
            readback_timeout_frames: 120,
            save_directory: None,
        }
    }
}

impl MergeSettings {
    pub fn with_atlas_size(mut self, size: u32) -> Self {
        self.atlas_size = size;
        self
    }

    pub fn with_bake_resolution(mut self, resolution: u32) -> Self {
        self.bake_resolution = resolution;
        self
    }

    pub fn with_padding(mut self, padding: u32) -> Self {
        self.padding = padding;
        self
    }

    pub fn with_dilation_iterations(mut self, iterations: u32) -> Self {
        self.dilation_iterations = iterations;
        self
    }

    pub fn with_merge_atlas(mut self, enable: bool) -> Self {
        self.merge_atlas = enable;
        self
    }

    pub fn with_neutral_fill(mut self, color: Color) -> Self {
        self.neutral_fill = color;
        self
    }

    pub fn with_readback_frames(mut self, settle: u32, timeout: u32) -> Self {
        self.settle_frames = settle;
        self.readback_timeout_frames = timeout;
        self
    }

    pub fn with_save_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.save_directory = Some(dir.into());
        self
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if !self.atlas_size.is_power_of_two() {
            return Err(SettingsError::NotPowerOfTwo {
                size: self.atlas_size,
            });
        }

        if self.bake_resolution == 0 || self.bake_resolution > self.atlas_size {
            return Err(SettingsError::InvalidBakeResolution {
                resolution: self.bake_resolution,
                atlas_size: self.atlas_size,
            });
        }

        if self.padding.saturating_mul(2) >= self.atlas_size {
            return Err(SettingsError::PaddingTooLarge {
                padding: self.padding,
                atlas_size: self.atlas_size,
            });
        }

        if self.readback_timeout_frames <= self.settle_frames {
            return Err(SettingsError::TimeoutBeforeSettle {
                settle: self.settle_frames,
                timeout: self.readback_timeout_frames,
            });
        }

        Ok(())
    }
}
