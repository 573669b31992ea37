//! CPU rasterization and compositing in UV space.
//!
//! Colors are handled as stored (sRGB-encoded) values in 0-1, the same
//! convention the GPU bake uses by uploading sources as `Rgba8Unorm`.

use bevy::prelude::*;
use image::{Rgba, RgbaImage, imageops::FilterType};

use crate::part::{PartGeometry, PartMaterial, PatternBlend, TintedMaterial};

/// Texel-centre coverage of the geometry's UV triangles, row-major.
pub(crate) fn coverage(geometry: &PartGeometry, resolution: u32) -> Vec<bool> {
    let size = resolution as usize;
    let res = resolution as f32;
    let mut covered = vec![false; size * size];

    for [a, b, c] in geometry.triangles() {
        let uv = |i: u32| Vec2::from(geometry.uv0[i as usize]) * res;
        let (a, b, c) = (uv(a), uv(b), uv(c));
        let area = edge(a, b, c);
        if area.abs() < f32::EPSILON {
            continue;
        }

        let min = a.min(b).min(c).floor().max(Vec2::ZERO);
        let max = a.max(b).max(c).ceil().min(Vec2::splat(res));
        for y in min.y as usize..max.y as usize {
            for x in min.x as usize..max.x as usize {
                let p = Vec2::new(x as f32 + 0.5, y as f32 + 0.5);
                let w0 = edge(b, c, p) / area;
                let w1 = edge(c, a, p) / area;
                let w2 = edge(a, b, p) / area;
                if w0 >= -1e-5 && w1 >= -1e-5 && w2 >= -1e-5 {
                    covered[y * size + x] = true;
                }
            }
        }
    }

    covered
}

#[inline]
fn edge(a: Vec2, b: Vec2, p: Vec2) -> f32 {
    (b - a).perp_dot(p - a)
}

/// Bilinear sample with clamp-to-edge addressing.
pub(crate) fn sample(texture: &RgbaImage, uv: Vec2) -> Vec4 {
    let (w, h) = texture.dimensions();
    if w == 0 || h == 0 {
        return Vec4::ONE;
    }
    let p = uv * Vec2::new(w as f32, h as f32) - 0.5;
    let base = p.floor();
    let t = p - base;

    let texel = |x: f32, y: f32| {
        let x = (x as i64).clamp(0, w as i64 - 1) as u32;
        let y = (y as i64).clamp(0, h as i64 - 1) as u32;
        let Rgba(c) = *texture.get_pixel(x, y);
        Vec4::new(c[0] as f32, c[1] as f32, c[2] as f32, c[3] as f32) / 255.0
    };

    let top = texel(base.x, base.y).lerp(texel(base.x + 1.0, base.y), t.x);
    let bottom = texel(base.x, base.y + 1.0).lerp(texel(base.x + 1.0, base.y + 1.0), t.x);
    top.lerp(bottom, t.y)
}

#[inline]
pub(crate) fn encoded(color: Color) -> Vec4 {
    let c = color.to_srgba();
    Vec4::new(c.red, c.green, c.blue, c.alpha)
}

pub(crate) fn to_texel(color: Vec4) -> Rgba<u8> {
    let c = (color.clamp(Vec4::ZERO, Vec4::ONE) * 255.0).round();
    Rgba([c.x as u8, c.y as u8, c.z as u8, c.w as u8])
}

/// Fully composited, opaque color of the material at `uv`.
pub(crate) fn shade(material: &PartMaterial, uv: Vec2) -> Vec4 {
    let rgb = match material {
        PartMaterial::Tinted(m) => shade_tinted(m, uv),
        PartMaterial::CustomShader(m) => sample(&m.texture, uv).truncate(),
    };
    rgb.extend(1.0)
}

fn shade_tinted(m: &TintedMaterial, uv: Vec2) -> Vec3 {
    let base = m.base.as_ref().map_or(Vec4::ONE, |t| sample(t, uv)) * encoded(m.base_color);
    let tint = match &m.tint_mask {
        Some(mask) => {
            let k = sample(mask, uv);
            (0..3).fold(Vec3::ONE, |acc, i| {
                acc * Vec3::ONE.lerp(encoded(m.tint_colors[i]).truncate(), k[i])
            })
        }
        None => encoded(m.tint_colors[0]).truncate(),
    };
    let mut color = base.truncate() * tint;

    if let Some(pattern) = &m.pattern {
        let tiled = uv * pattern.scale;
        let p = sample(&pattern.texture, tiled - tiled.floor()) * encoded(pattern.color);
        let blended = match pattern.blend {
            PatternBlend::Multiply => color * p.truncate(),
            PatternBlend::Mix => p.truncate(),
            PatternBlend::Overlay => overlay(color, p.truncate()),
        };
        color = color.lerp(blended, (pattern.strength * p.w).clamp(0.0, 1.0));
    }

    if let Some(decal) = &m.decal {
        if let Some(local) = decal.local_uv(uv) {
            let d = sample(&decal.texture, local);
            color = color.lerp(d.truncate(), (d.w * decal.opacity).clamp(0.0, 1.0));
        }
    }

    color
}

fn overlay(base: Vec3, blend: Vec3) -> Vec3 {
    let channel = |a: f32, b: f32| {
        if a < 0.5 {
            2.0 * a * b
        } else {
            1.0 - 2.0 * (1.0 - a) * (1.0 - b)
        }
    };
    Vec3::new(
        channel(base.x, blend.x),
        channel(base.y, blend.y),
        channel(base.z, blend.z),
    )
}

/// Resample to `resolution`, keeping only texels inside `mask` (alpha 255)
/// and clearing the rest.
pub(crate) fn resample_masked(texture: &RgbaImage, resolution: u32, mask: &RgbaImage) -> RgbaImage {
    let mut out = image::imageops::resize(texture, resolution, resolution, FilterType::Triangle);
    for (texel, m) in out.pixels_mut().zip(mask.pixels()) {
        if m.0[3] == 255 {
            texel.0[3] = 255;
        } else {
            *texel = Rgba([0, 0, 0, 0]);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::part::{DecalLayer, PatternLayer};
    use crate::testing::{solid, strip};

    #[test]
    fn test_full_quad_covers_everything() {
        let covered = coverage(&strip(4), 8);
        assert!(covered.iter().all(|&c| c));
    }

    #[test]
    fn test_half_triangle_coverage() {
        let mut geometry = strip(4);
        // Keep only the lower-left triangle of the quad.
        geometry.submeshes[0].truncate(3);
        let covered = coverage(&geometry, 8);
        let count = covered.iter().filter(|&&c| c).count();
        assert!(count > 24 && count < 48, "{count}");
    }

    #[test]
    fn test_sample_solid() {
        let texture = solid(4, 4, [255, 0, 0, 255]);
        assert_eq!(sample(&texture, Vec2::new(0.3, 0.7)), Vec4::new(1.0, 0.0, 0.0, 1.0));
    }

    #[test]
    fn test_tint_without_mask_multiplies() {
        let mut m = TintedMaterial::new(Color::WHITE);
        m.tint_colors[0] = Color::srgb(1.0, 0.0, 0.0);
        let c = shade(&PartMaterial::Tinted(m), Vec2::splat(0.5));
        assert_eq!(c, Vec4::new(1.0, 0.0, 0.0, 1.0));
    }

    #[test]
    fn test_tint_mask_selects_channel() {
        let mask = solid(2, 2, [0, 255, 0, 255]);
        let m = TintedMaterial::new(Color::WHITE).with_tints(
            mask,
            [
                Color::srgb(1.0, 0.0, 0.0),
                Color::srgb(0.0, 0.0, 1.0),
                Color::srgb(0.0, 1.0, 0.0),
            ],
        );
        let c = shade(&PartMaterial::Tinted(m), Vec2::splat(0.5));
        assert!((c.truncate() - Vec3::new(0.0, 0.0, 1.0)).length() < 1e-5);
    }

    #[test]
    fn test_decal_only_inside_its_rect() {
        let decal = DecalLayer::new(
            solid(2, 2, [0, 0, 0, 255]),
            Vec2::ZERO,
            Vec2::splat(0.5),
        );
        let material = PartMaterial::Tinted(TintedMaterial::new(Color::WHITE).with_decal(decal));
        assert_eq!(shade(&material, Vec2::splat(0.25)).truncate(), Vec3::ZERO);
        assert_eq!(shade(&material, Vec2::splat(0.75)).truncate(), Vec3::ONE);
    }

    #[test]
    fn test_pattern_strength_zero_is_noop() {
        let mut pattern = PatternLayer::new(solid(2, 2, [0, 0, 0, 255]));
        pattern.strength = 0.0;
        let material =
            PartMaterial::Tinted(TintedMaterial::new(Color::WHITE).with_pattern(pattern));
        assert_eq!(shade(&material, Vec2::splat(0.5)).truncate(), Vec3::ONE);
    }
}
