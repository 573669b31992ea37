//! # bevy_outfit_merge
//!
//! Runtime consolidation of modular Bevy characters. A character assembled
//! from independently rigged and textured parts (body, head, clothing,
//! accessories) is merged into one skinned mesh, one skeleton, one texture
//! atlas per channel and one material, cutting draw calls and skinning cost.
//!
//! ## Pipeline
//!
//! 1. **Bake**: each part's material is rendered through its UV layout
//!    ([`bake`]), on the GPU or in software.
//! 2. **Pack**: bakes are shelf-packed into atlases and seams are dilated
//!    ([`atlas`]).
//! 3. **Merge**: bone lists are unified by name ([`skeleton`]) and geometry,
//!    weights and blend shapes are combined ([`geometry`]).
//! 4. **Swap**: the merged character replaces its parts in the scene and can
//!    be saved to disk ([`merge`]).
//!
//! ## Quick Start
//!
//! ```ignore
//! use bevy::prelude::*;
//! use bevy_outfit_merge::prelude::*;
//!
//! fn main() {
//!     App::new()
//!         .add_plugins(DefaultPlugins)
//!         .add_plugins(CharacterMergePlugin::default())
//!         .add_systems(Update, merge_on_space)
//!         .run();
//! }
//!
//! fn merge_on_space(
//!     keys: Res<ButtonInput<KeyCode>>,
//!     characters: Query<Entity, With<BaseSkeleton>>,
//!     mut requests: MessageWriter<MergeCharacter>,
//! ) {
//!     if keys.just_pressed(KeyCode::Space) {
//!         for character in &characters {
//!             requests.write(MergeCharacter { character, save_as: None });
//!         }
//!     }
//! }
//! ```

pub mod atlas;
pub mod bake;
pub mod geometry;
pub mod merge;
pub mod part;
mod plugin;
pub mod skeleton;

#[cfg(test)]
mod testing;

pub mod prelude {
    pub use crate::atlas::{AtlasPacker, AtlasSet, BakeRect, PackError, RectMap};
    pub use crate::bake::{BakeBackend, BakeError, GpuBaker, SoftwareBaker};
    pub use crate::geometry::{CombinedMesh, GeometryMerger};
    pub use crate::merge::{
        BaseSkeleton, CharacterMerger, MergeCharacter, MergeError, MergeInput, MergeOutcome,
        MergeReport, MergeSettings, MergedCharacter, MergedResult, SaveMergedCharacter,
        ShapeModifierState,
    };
    pub use crate::part::{
        BlendShape, BlendShapeFrame, BoneWeights, OutfitPart, PartGeometry, PartKind,
        PartMaterial, TintedMaterial,
    };
    pub use crate::plugin::{BakeBackendKind, CharacterMergePlugin};
    pub use crate::skeleton::{Bone, Skeleton, SkeletonId, SkeletonUnifier};

    #[cfg(feature = "persist")]
    pub use crate::merge::{PersistedCharacter, save_character};
}
