//! Outfit part description consumed by the merge pipeline.
//!
//! An [`OutfitPart`] is one independently rigged, independently textured mesh
//! segment (body, head, clothing, accessory). The outfit system attaches one
//! per child entity of a character; the merge consumes and despawns them.

use bevy::mesh::PrimitiveTopology;
use bevy::prelude::*;
#[cfg(feature = "persist")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod geometry;
mod material;
mod weights;

pub use geometry::PartGeometry;
pub use material::{
    CustomMap, CustomShaderMaterial, DecalLayer, NORMAL_CHANNEL, PartMaterial, PatternBlend,
    PatternLayer, Texture, TintedMaterial,
};
pub use weights::BoneWeights;

use crate::skeleton::{Bone, SkeletonId};

/// Errors describing malformed part data.
#[derive(Error, Debug, Clone)]
pub enum PartError {
    #[error("Mesh is missing required attribute '{0}'")]
    MissingAttribute(&'static str),

    #[error("Attribute '{attribute}' has {found} entries, expected {expected}")]
    AttributeLength {
        attribute: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("Submesh {slot} index count {len} is not a multiple of 3")]
    NotTriangles { slot: usize, len: usize },

    #[error("Index {index} out of range for {vertex_count} vertices")]
    IndexOutOfRange { index: u32, vertex_count: usize },

    #[error("Only triangle lists can be merged, got {0:?}")]
    UnsupportedTopology(PrimitiveTopology),

    #[error("Blend shape '{shape}' frame {frame} has {found} deltas, expected {expected}")]
    BlendShapeLength {
        shape: String,
        frame: usize,
        expected: usize,
        found: usize,
    },

    #[error("Custom map name '{0}' is reserved for the normal map channel")]
    ReservedChannel(String),
}

/// Whether a part carries its own skeleton.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PartKind {
    /// Skinned against its own bone list.
    #[default]
    Rigged,
    /// Unskinned; becomes skinned by binding every vertex to the attach point.
    Static,
}

/// One frame of a blend shape: per-vertex deltas at a given shape weight.
#[derive(Clone, Debug, Default)]
#[cfg_attr(feature = "persist", derive(Serialize, Deserialize))]
pub struct BlendShapeFrame {
    /// Shape weight at which these deltas apply fully (usually 1.0).
    pub weight: f32,
    pub delta_positions: Vec<[f32; 3]>,
    pub delta_normals: Vec<[f32; 3]>,
    pub delta_tangents: Vec<[f32; 3]>,
}

impl BlendShapeFrame {
    /// Frame with only position deltas.
    pub fn positions(weight: f32, delta_positions: Vec<[f32; 3]>) -> Self {
        let n = delta_positions.len();
        Self {
            weight,
            delta_positions,
            delta_normals: vec![[0.0; 3]; n],
            delta_tangents: vec![[0.0; 3]; n],
        }
    }
}

/// Named morph target (e.g. "Smile", "BodyFat").
#[derive(Clone, Debug, Default)]
#[cfg_attr(feature = "persist", derive(Serialize, Deserialize))]
pub struct BlendShape {
    pub name: String,
    pub frames: Vec<BlendShapeFrame>,
}

impl BlendShape {
    pub fn new(name: impl Into<String>, frames: Vec<BlendShapeFrame>) -> Self {
        Self {
            name: name.into(),
            frames,
        }
    }
}

/// A single mesh segment of a modular character.
#[derive(Component, Clone, Debug, Default)]
pub struct OutfitPart {
    /// Unique within the character; keys the atlas rectangle map.
    pub name: String,
    pub kind: PartKind,
    pub geometry: PartGeometry,
    pub blend_shapes: Vec<BlendShape>,
    /// Bones referenced by `geometry.bone_weights`, in part-local index order.
    pub bones: Vec<Bone>,
    /// Identity of the bone objects in `bones`.
    pub skeleton_id: SkeletonId,
    /// Bone to parent foreign roots or static geometry to.
    pub attach_point: Option<String>,
    /// Part local-to-world at bake time.
    pub transform: Mat4,
    pub material: PartMaterial,
}

impl OutfitPart {
    pub fn new(name: impl Into<String>, geometry: PartGeometry) -> Self {
        Self {
            name: name.into(),
            geometry,
            transform: Mat4::IDENTITY,
            ..default()
        }
    }

    /// Convert into a static part bound to `attach_point`.
    pub fn attached_static(mut self, attach_point: impl Into<String>) -> Self {
        self.kind = PartKind::Static;
        self.attach_point = Some(attach_point.into());
        self.bones.clear();
        self.geometry.bone_weights.clear();
        self
    }

    pub fn with_bones(mut self, skeleton_id: SkeletonId, bones: Vec<Bone>) -> Self {
        self.skeleton_id = skeleton_id;
        self.bones = bones;
        self
    }

    pub fn with_attach_point(mut self, bone: impl Into<String>) -> Self {
        self.attach_point = Some(bone.into());
        self
    }

    pub fn with_blend_shape(mut self, shape: BlendShape) -> Self {
        self.blend_shapes.push(shape);
        self
    }

    pub fn with_material(mut self, material: PartMaterial) -> Self {
        self.material = material;
        self
    }

    pub fn with_transform(mut self, transform: Mat4) -> Self {
        self.transform = transform;
        self
    }

    pub fn vertex_count(&self) -> usize {
        self.geometry.vertex_count()
    }

    /// True for parts without a skeleton of their own, including rigged
    /// parts whose bone list came through empty.
    pub fn is_static(&self) -> bool {
        self.kind == PartKind::Static || self.bones.is_empty()
    }

    /// Validate geometry and blend shape sizes against the vertex count.
    pub fn validate(&self) -> Result<(), PartError> {
        self.geometry.validate(!self.is_static())?;

        if let Some(name) = self
            .material
            .custom_map_names()
            .find(|name| *name == NORMAL_CHANNEL)
        {
            return Err(PartError::ReservedChannel(name.to_string()));
        }

        let expected = self.vertex_count();
        for shape in &self.blend_shapes {
            for (frame, data) in shape.frames.iter().enumerate() {
                for found in [
                    data.delta_positions.len(),
                    data.delta_normals.len(),
                    data.delta_tangents.len(),
                ] {
                    if found != expected {
                        return Err(PartError::BlendShapeLength {
                            shape: shape.name.clone(),
                            frame,
                            expected,
                            found,
                        });
                    }
                }
            }
        }
        Ok(())
    }
}
