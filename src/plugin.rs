//! Plugin wiring bake backends and merge systems into an app.
use std::sync::Arc;

use bevy::prelude::*;

use crate::bake::{
    GpuBakeSystems, GpuBaker, SoftwareBaker, UvBakeMaterial, advance_bakes, dispatch_bakes,
};
use crate::merge::{
    MergeBackend, MergeCharacter, MergeOutcome, MergeSettings, MergeSystems, SaveMergedCharacter,
    finish_merges, start_merges,
};

/// Where part bakes are rendered.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BakeBackendKind {
    /// Offscreen render plus texture readback. Needs a render device.
    #[default]
    Gpu,
    /// CPU rasterization on the async compute pool.
    Software,
}

/// Plugin that adds character merging to Bevy.
///
/// This plugin registers:
/// - [`MergeSettings`] (unless already inserted)
/// - the [`MergeCharacter`], [`SaveMergedCharacter`] and [`MergeOutcome`] messages
/// - the merge systems in [`MergeSystems`]
/// - for [`BakeBackendKind::Gpu`], [`UvBakeMaterial`] and the bake systems in
///   [`GpuBakeSystems`]
///
/// # Example
/// ```ignore
/// use bevy::prelude::*;
/// use bevy_outfit_merge::prelude::*;
///
/// App::new()
///     .add_plugins(DefaultPlugins)
///     .add_plugins(CharacterMergePlugin::default())
///     .run();
/// ```
#[derive(Default)]
pub struct CharacterMergePlugin {
    pub backend: BakeBackendKind,
}

impl CharacterMergePlugin {
    pub fn software() -> Self {
        Self {
            backend: BakeBackendKind::Software,
        }
    }
}

impl Plugin for CharacterMergePlugin {
    fn build(&self, app: &mut App) {
        app.init_resource::<MergeSettings>()
            .add_message::<MergeCharacter>()
            .add_message::<SaveMergedCharacter>()
            .add_message::<MergeOutcome>();

        match self.backend {
            BakeBackendKind::Gpu => {
                // Embed the bake shader into the binary
                crate::bake::register_embedded_assets(app);
                let baker = GpuBaker::default();
                app.add_plugins(MaterialPlugin::<UvBakeMaterial> {
                    prepass_enabled: false,
                    shadows_enabled: false,
                    ..default()
                })
                    .insert_resource(MergeBackend(Arc::new(baker.clone())))
                    .insert_resource(baker)
                    .add_systems(
                        Update,
                        (dispatch_bakes, advance_bakes)
                            .chain()
                            .in_set(GpuBakeSystems)
                            .after(MergeSystems),
                    );
            }
            BakeBackendKind::Software => {
                app.insert_resource(MergeBackend(Arc::new(SoftwareBaker)));
            }
        }

        app.add_systems(
            Update,
            (start_merges, finish_merges).chain().in_set(MergeSystems),
        );

        #[cfg(feature = "persist")]
        app.add_systems(
            Update,
            (crate::merge::start_saves, crate::merge::finish_saves)
                .chain()
                .in_set(MergeSystems)
                .after(finish_merges),
        );
    }
}
