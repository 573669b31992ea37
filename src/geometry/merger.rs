//! Appending parts to the combined mesh.

use std::ops::Range;

use bevy::prelude::*;

use super::{BlendShapeAccumulator, CombinedMesh, GeometryError, Submesh};
use crate::atlas::BakeRect;
use crate::merge::MergeContext;
use crate::part::{BlendShape, BlendShapeFrame, BoneWeights, OutfitPart};
use crate::skeleton::{BoneRemap, Skeleton};

/// Builds a [`CombinedMesh`] one part at a time.
///
/// # Example
/// ```ignore
/// let mut merger = GeometryMerger::new(&ctx);
/// for (part, remap) in parts.iter().zip(&remaps) {
///     merger.push_part(&mut ctx, part, remap)?;
/// }
/// let mesh = merger.finish(&ctx, unifier.master());
/// ```
pub struct GeometryMerger {
    mesh: CombinedMesh,
    shapes: BlendShapeAccumulator,
}

/// Part local space to character root space.
struct RootBake {
    point: Mat4,
    normal: Mat3,
    vector: Mat3,
}

impl RootBake {
    fn new(root_world: Mat4, part_world: Mat4) -> Self {
        let point = root_world.inverse() * part_world;
        let vector = Mat3::from_mat4(point);
        Self {
            point,
            normal: vector.inverse().transpose(),
            vector,
        }
    }

    fn frame(&self, frame: &BlendShapeFrame) -> BlendShapeFrame {
        let apply = |m: &Mat3, deltas: &[[f32; 3]]| -> Vec<[f32; 3]> {
            deltas
                .iter()
                .map(|d| (*m * Vec3::from(*d)).to_array())
                .collect()
        };
        BlendShapeFrame {
            weight: frame.weight,
            delta_positions: apply(&self.vector, &frame.delta_positions),
            delta_normals: apply(&self.normal, &frame.delta_normals),
            delta_tangents: apply(&self.vector, &frame.delta_tangents),
        }
    }
}

impl GeometryMerger {
    pub fn new(ctx: &MergeContext) -> Self {
        Self {
            mesh: CombinedMesh::default(),
            shapes: BlendShapeAccumulator::new(ctx.total_vertices),
        }
    }

    pub fn vertex_count(&self) -> usize {
        self.mesh.vertex_count()
    }

    /// Append one part, returning the vertex range it now occupies.
    ///
    /// Everything fallible is checked before the mesh is touched, so a
    /// rejected part leaves the merger unchanged.
    pub fn push_part(
        &mut self,
        ctx: &mut MergeContext,
        part: &OutfitPart,
        remap: &BoneRemap,
    ) -> Result<Range<u32>, GeometryError> {
        part.validate().map_err(|source| GeometryError::InvalidPart {
            part: part.name.clone(),
            source,
        })?;

        let rect: BakeRect = *ctx
            .rects
            .get(&part.name)
            .ok_or_else(|| GeometryError::MissingRect {
                part: part.name.clone(),
            })?;

        let count = part.vertex_count();
        let offset = ctx.vertex_offset;
        debug_assert_eq!(offset, self.mesh.vertex_count());
        if offset + count > u32::MAX as usize {
            return Err(GeometryError::VertexOverflow {
                part: part.name.clone(),
            });
        }

        let weights = Self::remap_weights(part, remap)?;
        let bake = RootBake::new(ctx.root_world, part.transform);
        let g = &part.geometry;
        let mesh = &mut self.mesh;

        for i in 0..count {
            let position = bake.point.transform_point3(Vec3::from(g.positions[i]));
            let normal = (bake.normal * Vec3::from(g.normals[i])).normalize_or_zero();
            let [tx, ty, tz, tw] = g.tangents[i];
            let tangent = (bake.vector * Vec3::new(tx, ty, tz)).normalize_or_zero();

            mesh.positions.push(position.to_array());
            mesh.normals.push(normal.to_array());
            mesh.tangents.push(tangent.extend(tw).to_array());
            mesh.uv0.push(rect.remap_uv(g.uv0[i]));
        }
        match &g.uv1 {
            Some(uv1) => mesh.uv1.extend_from_slice(uv1),
            None => mesh.uv1.resize(offset + count, [0.0; 2]),
        }
        match &g.colors {
            Some(colors) => mesh.colors.extend_from_slice(colors),
            None => mesh.colors.resize(offset + count, [1.0; 4]),
        }
        for w in &weights {
            mesh.joint_indices.push(w.indices);
            mesh.joint_weights.push(w.weights);
        }

        let base = offset as u32;
        if ctx.merge_atlas {
            if mesh.submeshes.is_empty() {
                mesh.submeshes.push(Submesh::default());
            }
            let region = &mut mesh.submeshes[0];
            for slot in &g.submeshes {
                region.indices.extend(slot.iter().map(|i| i + base));
            }
        } else {
            for slot in &g.submeshes {
                mesh.submeshes.push(Submesh {
                    source: Some(part.name.clone()),
                    indices: slot.iter().map(|i| i + base).collect(),
                });
            }
        }

        for shape in &part.blend_shapes {
            let baked = BlendShape::new(
                shape.name.clone(),
                shape.frames.iter().map(|f| bake.frame(f)).collect(),
            );
            self.shapes.write(&baked, offset);
        }

        let range = base..base + count as u32;
        mesh.part_ranges.insert(part.name.clone(), range.clone());
        ctx.vertex_offset = offset + count;

        debug!(
            "Part '{}': merged {} vertices at offset {}",
            part.name, count, offset
        );
        Ok(range)
    }

    /// Static parts bind fully to their attach bone; rigged parts are rewritten
    /// through the remap, which must resolve every influencing index.
    fn remap_weights(
        part: &OutfitPart,
        remap: &BoneRemap,
    ) -> Result<Vec<BoneWeights>, GeometryError> {
        if part.is_static() {
            let attach = remap.get(0).ok_or_else(|| GeometryError::EmptyRemap {
                part: part.name.clone(),
            })?;
            return Ok(vec![BoneWeights::single(attach); part.vertex_count()]);
        }

        part.geometry
            .bone_weights
            .iter()
            .enumerate()
            .map(|(vertex, w)| {
                w.remapped(|i| remap.get(i))
                    .map_err(|index| GeometryError::UnresolvedBoneIndex {
                        part: part.name.clone(),
                        vertex,
                        index,
                    })
            })
            .collect()
    }

    /// Close out blend shapes and compute one bind pose per master bone.
    pub fn finish(self, ctx: &MergeContext, skeleton: &Skeleton) -> CombinedMesh {
        let mut mesh = self.mesh;
        mesh.blend_shapes = self.shapes.finish(mesh.vertex_count());
        mesh.inverse_bindposes = skeleton
            .bones()
            .iter()
            .map(|bone| bone.world.inverse() * ctx.root_world)
            .collect();
        mesh
    }
}
