//! Shared fixtures for unit tests.

use std::sync::Arc;

use bevy::prelude::*;
use image::{Rgba, RgbaImage};

use crate::part::{
    BoneWeights, OutfitPart, PartGeometry, PartMaterial, Texture, TintedMaterial,
};
use crate::skeleton::{Bone, Skeleton, SkeletonId};

/// A two-row strip of `vertex_count` vertices (rounded down to even), two
/// triangles per quad, UVs covering the unit square.
pub(crate) fn strip(vertex_count: usize) -> PartGeometry {
    let n = vertex_count.max(4) / 2 * 2;
    let half = n / 2;
    let mut geometry = PartGeometry::default();
    for i in 0..n {
        let column = (i % half) as f32 / (half - 1) as f32;
        let row = (i / half) as f32;
        geometry.positions.push([column, row, 0.0]);
        geometry.normals.push([0.0, 0.0, 1.0]);
        geometry.tangents.push([1.0, 0.0, 0.0, 1.0]);
        geometry.uv0.push([column, row]);
    }
    let half = half as u32;
    let mut indices = Vec::new();
    for c in 0..half - 1 {
        indices.extend_from_slice(&[c, c + 1, c + 1 + half, c, c + 1 + half, c + half]);
    }
    geometry.submeshes.push(indices);
    geometry
}

/// Base rig: root, hips, spine_1, spine_2, neck, head, then `bone_N` limbs
/// parented to hips until `count` bones exist.
pub(crate) fn base_skeleton(count: usize) -> Skeleton {
    let named = ["root", "hips", "spine_1", "spine_2", "neck", "head"];
    let mut bones = Vec::with_capacity(count);
    for i in 0..count.max(named.len()) {
        let (name, parent) = match named.get(i) {
            Some(n) => (n.to_string(), i.checked_sub(1)),
            None => (format!("bone_{i}"), Some(1)),
        };
        bones.push(Bone::new(name, parent, Transform::from_xyz(0.0, 0.25, 0.0)));
    }
    Skeleton::from_bones(bones, Mat4::IDENTITY).unwrap()
}

/// Chain of `count` foreign bones `{prefix}_0 .. {prefix}_{count-1}` with
/// consistent world matrices starting at y = 2.
pub(crate) fn foreign_chain(prefix: &str, count: usize) -> Vec<Bone> {
    let mut world = Mat4::from_translation(Vec3::new(0.0, 2.0, 0.0));
    (0..count)
        .map(|i| {
            let local = if i == 0 {
                Transform::from_xyz(0.0, 2.0, 0.0)
            } else {
                Transform::from_xyz(0.0, 0.1, 0.0)
            };
            if i > 0 {
                world *= Mat4::from_translation(local.translation);
            }
            Bone {
                name: format!("{prefix}_{i}"),
                parent: i.checked_sub(1),
                local,
                world,
            }
        })
        .collect()
}

/// Part skinned to the named base bones, vertices cycling through them.
pub(crate) fn rigged_part(
    name: &str,
    vertex_count: usize,
    base: &Skeleton,
    bone_names: &[&str],
) -> OutfitPart {
    let bones: Vec<Bone> = bone_names
        .iter()
        .map(|n| {
            let source = &base.bones()[base.index_of(n).unwrap()];
            let parent = source
                .parent
                .and_then(|p| bone_names.iter().position(|b| *b == base.bones()[p].name));
            Bone {
                parent,
                ..source.clone()
            }
        })
        .collect();
    let mut part = OutfitPart::new(name, strip(vertex_count)).with_bones(SkeletonId::BASE, bones);
    cycle_weights(&mut part);
    part
}

/// Part with its own `count`-bone rig attached at `attach`.
pub(crate) fn foreign_part(
    name: &str,
    vertex_count: usize,
    id: u64,
    count: usize,
    attach: &str,
) -> OutfitPart {
    let mut part = OutfitPart::new(name, strip(vertex_count))
        .with_bones(SkeletonId(id), foreign_chain(name, count))
        .with_attach_point(attach);
    cycle_weights(&mut part);
    part
}

fn cycle_weights(part: &mut OutfitPart) {
    let bone_count = part.bones.len().max(1);
    part.geometry.bone_weights = (0..part.vertex_count())
        .map(|v| BoneWeights::single((v % bone_count) as u16))
        .collect();
}

pub(crate) fn solid(width: u32, height: u32, color: [u8; 4]) -> Texture {
    Arc::new(RgbaImage::from_pixel(width, height, Rgba(color)))
}

pub(crate) fn tinted(color: Color) -> PartMaterial {
    PartMaterial::Tinted(TintedMaterial::new(color))
}
