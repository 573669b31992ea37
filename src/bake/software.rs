//! CPU bake backend.

use std::collections::BTreeMap;

use bevy::prelude::*;
use bevy::tasks::{AsyncComputeTaskPool, TaskPool};
use image::{Rgba, RgbaImage};

use super::raster::{coverage, sample, shade, to_texel};
use super::{BakeBackend, BakeError, BakeRequest, BakeTicket, BakedPart};

/// Rasterizes bakes on the async compute pool.
///
/// Produces the same composite as the GPU path without needing a render
/// device, which makes it the backend for headless runs and tests.
#[derive(Clone, Copy, Debug, Default)]
pub struct SoftwareBaker;

impl SoftwareBaker {
    /// Bake synchronously on the calling thread.
    pub fn bake(request: &BakeRequest) -> Result<BakedPart, BakeError> {
        if request.geometry.triangle_count() == 0 {
            return Err(BakeError::NoGeometry(request.part.clone()));
        }

        let res = request.resolution;
        let covered = coverage(&request.geometry, res);
        let aux = request.material.aux_maps();

        let mut diffuse = RgbaImage::new(res, res);
        let mut channels: BTreeMap<String, RgbaImage> = aux
            .iter()
            .map(|(name, _)| (name.to_string(), RgbaImage::new(res, res)))
            .collect();

        for (i, _) in covered.iter().enumerate().filter(|(_, c)| **c) {
            let x = i as u32 % res;
            let y = i as u32 / res;
            let uv = Vec2::new(x as f32 + 0.5, y as f32 + 0.5) / res as f32;

            diffuse.put_pixel(x, y, to_texel(shade(&request.material, uv)));
            for (name, texture) in &aux {
                if let Some(channel) = channels.get_mut(*name) {
                    let Rgba([r, g, b, _]) = to_texel(sample(texture, uv));
                    channel.put_pixel(x, y, Rgba([r, g, b, 255]));
                }
            }
        }

        Ok(BakedPart {
            part: request.part.clone(),
            diffuse,
            channels,
        })
    }
}

impl BakeBackend for SoftwareBaker {
    fn submit(&self, request: BakeRequest) -> BakeTicket {
        let (completer, ticket) = BakeTicket::pair(&request.part);
        AsyncComputeTaskPool::get_or_init(TaskPool::default)
            .spawn(async move {
                let result = Self::bake(&request);
                if let Err(e) = &result {
                    warn!("Bake failed: {}", e);
                }
                completer.complete(result);
            })
            .detach();
        ticket
    }
}
