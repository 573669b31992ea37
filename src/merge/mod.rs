//! Merge orchestration.
//!
//! [`CharacterMerger`] runs the pure part of a merge (bake, pack, unify,
//! combine) as one future. The ECS systems in this module snapshot a live
//! character, drive that future on the async compute pool, swap the result
//! into the scene and optionally persist it.

mod context;
#[cfg(feature = "persist")]
mod persist;
mod pipeline;
mod settings;
mod systems;

pub use context::MergeContext;
#[cfg(feature = "persist")]
pub use persist::{PersistError, PersistedCharacter, PersistedPaths, save_character};
pub use pipeline::{
    CharacterMerger, MergeError, MergeInput, MergeReport, MergeStage, MergedCharacter,
    PartFailure,
};
pub use settings::{MergeSettings, SettingsError};
pub use systems::{
    BaseSkeleton, MergeBackend, MergeCharacter, MergeInFlight, MergeOutcome, MergeSystems,
    MergedResult, SaveMergedCharacter, ShapeModifierState, finish_merges, start_merges,
};
#[cfg(feature = "persist")]
pub use systems::{SaveInFlight, finish_saves, start_saves};
