//! Vertex and index data of a single outfit part.

use bevy::mesh::{Indices, Mesh, PrimitiveTopology, VertexAttributeValues};

use super::{BoneWeights, PartError};

/// Vertex buffers of one part in its own local space.
///
/// All per-vertex arrays have `vertex_count()` entries. Optional attributes
/// (`uv1`, `colors`) are filled with defaults by the geometry merger so every
/// part contributes uniform-length arrays.
#[derive(Clone, Debug, Default)]
pub struct PartGeometry {
    pub positions: Vec<[f32; 3]>,
    pub normals: Vec<[f32; 3]>,
    /// Tangents with handedness in `w`.
    pub tangents: Vec<[f32; 4]>,
    pub uv0: Vec<[f32; 2]>,
    pub uv1: Option<Vec<[f32; 2]>>,
    pub colors: Option<Vec<[f32; 4]>>,
    /// Empty for static parts.
    pub bone_weights: Vec<BoneWeights>,
    /// One triangle list per material slot.
    pub submeshes: Vec<Vec<u32>>,
}

impl PartGeometry {
    pub fn vertex_count(&self) -> usize {
        self.positions.len()
    }

    pub fn triangle_count(&self) -> usize {
        self.submeshes.iter().map(|s| s.len() / 3).sum()
    }

    /// Iterate all triangles across submeshes.
    pub fn triangles(&self) -> impl Iterator<Item = [u32; 3]> + '_ {
        self.submeshes
            .iter()
            .flat_map(|s| s.chunks_exact(3).map(|t| [t[0], t[1], t[2]]))
    }

    /// Check that every attribute matches the vertex count and every index is
    /// in range.
    ///
    /// `skinned` requires bone weights to be present.
    pub fn validate(&self, skinned: bool) -> Result<(), PartError> {
        let count = self.vertex_count();

        let check = |attribute: &'static str, len: usize| {
            if len == count {
                Ok(())
            } else {
                Err(PartError::AttributeLength {
                    attribute,
                    expected: count,
                    found: len,
                })
            }
        };

        check("normal", self.normals.len())?;
        check("tangent", self.tangents.len())?;
        check("uv0", self.uv0.len())?;
        if let Some(uv1) = &self.uv1 {
            check("uv1", uv1.len())?;
        }
        if let Some(colors) = &self.colors {
            check("color", colors.len())?;
        }
        if skinned {
            check("bone_weights", self.bone_weights.len())?;
        }

        for (slot, indices) in self.submeshes.iter().enumerate() {
            if indices.len() % 3 != 0 {
                return Err(PartError::NotTriangles {
                    slot,
                    len: indices.len(),
                });
            }
            if let Some(&bad) = indices.iter().find(|&&i| i as usize >= count) {
                return Err(PartError::IndexOutOfRange {
                    index: bad,
                    vertex_count: count,
                });
            }
        }

        Ok(())
    }

    /// Read geometry from a Bevy triangle-list mesh.
    ///
    /// Missing normals and tangents default to +Y and +X. All indices land in a
    /// single submesh since Bevy meshes carry one index buffer.
    pub fn from_mesh(mesh: &Mesh) -> Result<Self, PartError> {
        if mesh.primitive_topology() != PrimitiveTopology::TriangleList {
            return Err(PartError::UnsupportedTopology(mesh.primitive_topology()));
        }

        let positions = mesh
            .attribute(Mesh::ATTRIBUTE_POSITION)
            .and_then(|a| a.as_float3())
            .map(|p| p.to_vec())
            .ok_or(PartError::MissingAttribute("position"))?;
        let count = positions.len();

        let normals = mesh
            .attribute(Mesh::ATTRIBUTE_NORMAL)
            .and_then(|a| a.as_float3())
            .map(|n| n.to_vec())
            .unwrap_or_else(|| vec![[0.0, 1.0, 0.0]; count]);

        let tangents = match mesh.attribute(Mesh::ATTRIBUTE_TANGENT) {
            Some(VertexAttributeValues::Float32x4(t)) => t.clone(),
            _ => vec![[1.0, 0.0, 0.0, 1.0]; count],
        };

        let uv0 = match mesh.attribute(Mesh::ATTRIBUTE_UV_0) {
            Some(VertexAttributeValues::Float32x2(uv)) => uv.clone(),
            _ => return Err(PartError::MissingAttribute("uv0")),
        };

        let uv1 = match mesh.attribute(Mesh::ATTRIBUTE_UV_1) {
            Some(VertexAttributeValues::Float32x2(uv)) => Some(uv.clone()),
            _ => None,
        };

        let colors = match mesh.attribute(Mesh::ATTRIBUTE_COLOR) {
            Some(VertexAttributeValues::Float32x4(c)) => Some(c.clone()),
            _ => None,
        };

        let joint_indices = match mesh.attribute(Mesh::ATTRIBUTE_JOINT_INDEX) {
            Some(VertexAttributeValues::Uint16x4(j)) => Some(j.clone()),
            _ => None,
        };
        let joint_weights = match mesh.attribute(Mesh::ATTRIBUTE_JOINT_WEIGHT) {
            Some(VertexAttributeValues::Float32x4(w)) => Some(w.clone()),
            _ => None,
        };
        let bone_weights = match (joint_indices, joint_weights) {
            (Some(indices), Some(weights)) => indices
                .into_iter()
                .zip(weights)
                .map(|(indices, weights)| BoneWeights { indices, weights })
                .collect(),
            _ => Vec::new(),
        };

        let indices: Vec<u32> = match mesh.indices() {
            Some(Indices::U16(i)) => i.iter().map(|&i| i as u32).collect(),
            Some(Indices::U32(i)) => i.clone(),
            None => (0..count as u32).collect(),
        };

        let geometry = Self {
            positions,
            normals,
            tangents,
            uv0,
            uv1,
            colors,
            bone_weights,
            submeshes: vec![indices],
        };
        geometry.validate(false)?;
        Ok(geometry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::strip;
    use bevy::asset::RenderAssetUsages;

    #[test]
    fn test_strip_is_valid() {
        let g = strip(10);
        assert_eq!(g.vertex_count(), 10);
        assert_eq!(g.triangle_count(), 8);
        assert!(g.validate(false).is_ok());
    }

    #[test]
    fn test_validate_attribute_length() {
        let mut g = strip(8);
        g.normals.pop();
        assert!(matches!(
            g.validate(false),
            Err(PartError::AttributeLength {
                attribute: "normal",
                ..
            })
        ));
    }

    #[test]
    fn test_validate_index_range() {
        let mut g = strip(8);
        g.submeshes[0][0] = 99;
        assert!(matches!(
            g.validate(false),
            Err(PartError::IndexOutOfRange { index: 99, .. })
        ));
    }

    #[test]
    fn test_validate_requires_weights_when_skinned() {
        let g = strip(8);
        assert!(g.validate(true).is_err());
    }

    #[test]
    fn test_from_mesh() {
        let mut mesh = Mesh::new(
            PrimitiveTopology::TriangleList,
            RenderAssetUsages::default(),
        );
        mesh.insert_attribute(
            Mesh::ATTRIBUTE_POSITION,
            vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
        );
        mesh.insert_attribute(Mesh::ATTRIBUTE_UV_0, vec![[0.0, 0.0], [1.0, 0.0], [0.0, 1.0]]);
        mesh.insert_indices(Indices::U16(vec![0, 1, 2]));

        let g = PartGeometry::from_mesh(&mesh).unwrap();
        assert_eq!(g.vertex_count(), 3);
        assert_eq!(g.submeshes, vec![vec![0, 1, 2]]);
        assert_eq!(g.normals[0], [0.0, 1.0, 0.0]);
        assert!(g.bone_weights.is_empty());
    }

    #[test]
    fn test_from_mesh_requires_uv() {
        let mut mesh = Mesh::new(
            PrimitiveTopology::TriangleList,
            RenderAssetUsages::default(),
        );
        mesh.insert_attribute(Mesh::ATTRIBUTE_POSITION, vec![[0.0, 0.0, 0.0]; 3]);
        assert!(matches!(
            PartGeometry::from_mesh(&mesh),
            Err(PartError::MissingAttribute("uv0"))
        ));
    }
}
