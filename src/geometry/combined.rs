//! The merged vertex buffer and its conversion to Bevy meshes.

use std::collections::BTreeMap;
use std::ops::Range;

use bevy::asset::RenderAssetUsages;
use bevy::mesh::morph::{MorphAttributes, MorphBuildError, MorphTargetImage};
use bevy::mesh::{Indices, Mesh, PrimitiveTopology, VertexAttributeValues};
use bevy::prelude::*;
#[cfg(feature = "persist")]
use serde::{Deserialize, Serialize};

use crate::part::BlendShape;

/// One triangle list drawn with one material.
#[derive(Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "persist", derive(Serialize, Deserialize))]
pub struct Submesh {
    /// Contributing part, `None` for the shared atlas region.
    pub source: Option<String>,
    pub indices: Vec<u32>,
}

/// Single skinned mesh built from every merged part.
///
/// All per-vertex arrays have `vertex_count()` entries. Positions, normals
/// and tangents are in the character's root space; joint indices refer to
/// the master skeleton.
#[derive(Clone, Debug, Default)]
#[cfg_attr(feature = "persist", derive(Serialize, Deserialize))]
pub struct CombinedMesh {
    pub positions: Vec<[f32; 3]>,
    pub normals: Vec<[f32; 3]>,
    pub tangents: Vec<[f32; 4]>,
    pub uv0: Vec<[f32; 2]>,
    pub uv1: Vec<[f32; 2]>,
    pub colors: Vec<[f32; 4]>,
    pub joint_indices: Vec<[u16; 4]>,
    pub joint_weights: Vec<[f32; 4]>,
    /// One per master bone.
    pub inverse_bindposes: Vec<Mat4>,
    pub submeshes: Vec<Submesh>,
    /// Every frame spans the full vertex buffer.
    pub blend_shapes: Vec<BlendShape>,
    /// Vertex range each part occupies.
    pub part_ranges: BTreeMap<String, Range<u32>>,
}

impl CombinedMesh {
    pub fn vertex_count(&self) -> usize {
        self.positions.len()
    }

    pub fn triangle_count(&self) -> usize {
        self.submeshes.iter().map(|s| s.indices.len() / 3).sum()
    }

    /// Morph target names in target order.
    ///
    /// Each blend shape frame is its own target; multi-frame shapes append
    /// `#k` for every frame after the first.
    pub fn morph_target_names(&self) -> Vec<String> {
        self.blend_shapes
            .iter()
            .flat_map(|shape| {
                (0..shape.frames.len()).map(move |k| match k {
                    0 => shape.name.clone(),
                    k => format!("{}#{}", shape.name, k),
                })
            })
            .collect()
    }

    /// Build the morph target texture for Bevy's morph pipeline.
    ///
    /// Returns `None` when the mesh has no blend shapes.
    pub fn morph_targets(&self) -> Result<Option<MorphTargetImage>, MorphBuildError> {
        if self.blend_shapes.is_empty() {
            return Ok(None);
        }

        let frames: Vec<_> = self.blend_shapes.iter().flat_map(|s| &s.frames).collect();
        let targets = frames.iter().map(|frame| {
            (0..frame.delta_positions.len()).map(move |v| {
                MorphAttributes::new(
                    Vec3::from(frame.delta_positions[v]),
                    Vec3::from(frame.delta_normals[v]),
                    Vec3::from(frame.delta_tangents[v]),
                )
            })
        });

        MorphTargetImage::new(targets, self.vertex_count(), RenderAssetUsages::RENDER_WORLD)
            .map(Some)
    }

    /// One mesh drawing every submesh through a single index buffer.
    pub fn to_mesh(&self) -> Mesh {
        let indices = self
            .submeshes
            .iter()
            .flat_map(|s| s.indices.iter().copied())
            .collect();
        self.vertex_mesh().with_inserted_indices(Indices::U32(indices))
    }

    /// One mesh per submesh, each carrying the full vertex buffer.
    pub fn to_meshes(&self) -> Vec<Mesh> {
        self.submeshes
            .iter()
            .map(|s| {
                self.vertex_mesh()
                    .with_inserted_indices(Indices::U32(s.indices.clone()))
            })
            .collect()
    }

    fn vertex_mesh(&self) -> Mesh {
        Mesh::new(
            PrimitiveTopology::TriangleList,
            RenderAssetUsages::RENDER_WORLD | RenderAssetUsages::MAIN_WORLD,
        )
        .with_inserted_attribute(Mesh::ATTRIBUTE_POSITION, self.positions.clone())
        .with_inserted_attribute(Mesh::ATTRIBUTE_NORMAL, self.normals.clone())
        .with_inserted_attribute(Mesh::ATTRIBUTE_TANGENT, self.tangents.clone())
        .with_inserted_attribute(Mesh::ATTRIBUTE_UV_0, self.uv0.clone())
        .with_inserted_attribute(Mesh::ATTRIBUTE_UV_1, self.uv1.clone())
        .with_inserted_attribute(Mesh::ATTRIBUTE_COLOR, self.colors.clone())
        .with_inserted_attribute(
            Mesh::ATTRIBUTE_JOINT_INDEX,
            VertexAttributeValues::Uint16x4(self.joint_indices.clone()),
        )
        .with_inserted_attribute(Mesh::ATTRIBUTE_JOINT_WEIGHT, self.joint_weights.clone())
    }
}
