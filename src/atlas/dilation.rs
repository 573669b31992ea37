//! Seam dilation: grow packed regions outward into empty texels.

use bevy::prelude::*;
use bevy::tasks::{AsyncComputeTaskPool, TaskPool};
use futures::future::join_all;
use image::RgbaImage;

use super::AtlasSet;

/// Neighbour offsets in lookup order. The first valid one wins.
const NEIGHBOURS: [(i32, i32); 8] = [
    (-1, 0),
    (1, 0),
    (0, -1),
    (0, 1),
    (-1, -1),
    (1, -1),
    (-1, 1),
    (1, 1),
];

#[inline]
fn is_valid(pixel: &image::Rgba<u8>) -> bool {
    pixel.0[3] == 255
}

/// Fill empty texels from their neighbours, ring by ring.
///
/// A texel is valid when fully opaque. Each iteration, every invalid texel
/// copies the first valid neighbour in [`NEIGHBOURS`] order, where validity
/// is taken from the state at the start of the iteration. Returns the number
/// of texels filled.
pub fn dilate(image: &mut RgbaImage, iterations: u32) -> usize {
    let (width, height) = image.dimensions();
    let mut valid: Vec<bool> = image.pixels().map(is_valid).collect();
    let mut filled_total = 0;

    for _ in 0..iterations {
        let mut filled = Vec::new();
        for y in 0..height {
            for x in 0..width {
                if valid[(y * width + x) as usize] {
                    continue;
                }
                for (dx, dy) in NEIGHBOURS {
                    let nx = x as i32 + dx;
                    let ny = y as i32 + dy;
                    if nx < 0 || ny < 0 || nx >= width as i32 || ny >= height as i32 {
                        continue;
                    }
                    if valid[(ny as u32 * width + nx as u32) as usize] {
                        filled.push((x, y, *image.get_pixel(nx as u32, ny as u32)));
                        break;
                    }
                }
            }
        }

        if filled.is_empty() {
            break;
        }
        filled_total += filled.len();
        for (x, y, pixel) in filled {
            image.put_pixel(x, y, pixel);
            valid[(y * width + x) as usize] = true;
        }
    }

    filled_total
}

/// Number of texels [`dilate`] would treat as empty.
pub fn invalid_count(image: &RgbaImage) -> usize {
    image.pixels().filter(|p| !is_valid(p)).count()
}

/// Dilate every channel of an atlas set on the async compute pool.
pub async fn dilate_channels(atlases: AtlasSet, iterations: u32) -> AtlasSet {
    let pool = AsyncComputeTaskPool::get_or_init(TaskPool::default);

    let AtlasSet {
        mut diffuse,
        channels,
    } = atlases;

    let aux: Vec<_> = channels
        .into_iter()
        .map(|(name, mut image)| {
            pool.spawn(async move {
                dilate(&mut image, iterations);
                (name, image)
            })
        })
        .collect();
    let primary = pool.spawn(async move {
        let filled = dilate(&mut diffuse, iterations);
        (filled, diffuse)
    });

    let channels = join_all(aux).await.into_iter().collect();
    let (filled, diffuse) = primary.await;
    debug!("Dilated diffuse atlas: {} texels filled", filled);

    AtlasSet { diffuse, channels }
}
