//! Combining every part's vertex data into one skinned mesh.
//!
//! Parts are appended in processing order into a [`CombinedMesh`]. Each part
//! is baked into the character's root space, its UVs are remapped into its
//! atlas rectangle, its bone weights are rewritten through the part's
//! [`BoneRemap`](crate::skeleton::BoneRemap), and its blend shapes are written
//! into shape accumulators spanning the whole combined vertex buffer.

use thiserror::Error;

use crate::part::PartError;

mod blend_shapes;
mod combined;
mod merger;

pub use blend_shapes::BlendShapeAccumulator;
pub use combined::{CombinedMesh, Submesh};
pub use merger::GeometryMerger;

#[derive(Error, Debug, Clone)]
pub enum GeometryError {
    #[error("Part '{part}' has invalid geometry: {source}")]
    InvalidPart {
        part: String,
        #[source]
        source: PartError,
    },

    #[error("Part '{part}' has no atlas rectangle")]
    MissingRect { part: String },

    #[error("Part '{part}' vertex {vertex} references unmapped bone {index}")]
    UnresolvedBoneIndex {
        part: String,
        vertex: usize,
        index: u16,
    },

    #[error("Part '{part}' has an empty bone remap")]
    EmptyRemap { part: String },

    #[error("Part '{part}' would overflow the 32-bit index range")]
    VertexOverflow { part: String },
}
