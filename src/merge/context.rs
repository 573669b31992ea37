use bevy::prelude::*;

use crate::atlas::RectMap;

/// Scratch state threaded through the geometry stage of one merge.
///
/// Owned by a single merge call and passed by reference to each stage.
#[derive(Clone, Debug)]
pub struct MergeContext {
    /// Character root local-to-world; vertices are baked into its space.
    pub root_world: Mat4,
    pub rects: RectMap,
    /// Collapse every part into one submesh.
    pub merge_atlas: bool,
    /// First vertex of the next part.
    pub vertex_offset: usize,
    /// Expected final vertex count, used to size blend shape buffers.
    pub total_vertices: usize,
}

impl MergeContext {
    pub fn new(root_world: Mat4, rects: RectMap, merge_atlas: bool) -> Self {
        Self {
            root_world,
            rects,
            merge_atlas,
            vertex_offset: 0,
            total_vertices: 0,
        }
    }

    pub fn with_total_vertices(mut self, total: usize) -> Self {
        self.total_vertices = total;
        self
    }
}
