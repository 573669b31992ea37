//! ECS side of character merging.
//!
//! A merge is requested with [`MergeCharacter`]. [`start_merges`] snapshots
//! the character (base skeleton, shape modifiers, attached parts), pauses its
//! animation and runs the [`CharacterMerger`] future on the async compute
//! pool. [`finish_merges`] swaps the result into the scene once the future
//! resolves. Saving goes through [`SaveMergedCharacter`] and the IO pool.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use bevy::asset::RenderAssetUsages;
use bevy::mesh::morph::{MeshMorphWeights, MorphWeights};
use bevy::mesh::skinning::{SkinnedMesh, SkinnedMeshInverseBindposes};
use bevy::prelude::*;
use bevy::render::render_resource::{Extent3d, TextureDimension, TextureFormat};
use bevy::tasks::{AsyncComputeTaskPool, Task, TaskPool};
use futures::FutureExt;
use image::RgbaImage;

use super::{CharacterMerger, MergeError, MergeInput, MergeReport, MergeSettings, MergedCharacter};
use crate::atlas::{AtlasSet, BakeRect, RectMap};
use crate::bake::BakeBackend;
use crate::geometry::CombinedMesh;
use crate::part::{NORMAL_CHANNEL, OutfitPart};
use crate::skeleton::Skeleton;

/// System set for merge orchestration.
#[derive(SystemSet, Debug, Clone, PartialEq, Eq, Hash)]
pub struct MergeSystems;

/// The character's own rig, kept clean of merged foreign bones.
#[derive(Component, Clone, Debug)]
pub struct BaseSkeleton(pub Skeleton);

/// Runtime customization replayed onto the merged character.
#[derive(Component, Clone, Debug, Default)]
pub struct ShapeModifierState {
    /// Blend shape name → weight.
    pub shape_weights: BTreeMap<String, f32>,
    /// Bone name → local scale.
    pub bone_scales: BTreeMap<String, Vec3>,
}

/// Bake backend used by merges started from the ECS.
#[derive(Resource, Clone)]
pub struct MergeBackend(pub Arc<dyn BakeBackend>);

/// Ask for a character to be merged.
#[derive(Message, Clone, Debug)]
pub struct MergeCharacter {
    pub character: Entity,
    /// Save under this name once merged.
    pub save_as: Option<String>,
}

/// Ask for an already merged character to be (re)saved.
#[derive(Message, Clone, Debug)]
pub struct SaveMergedCharacter {
    pub character: Entity,
    pub name: String,
}

#[derive(Message, Clone, Debug)]
pub enum MergeOutcome {
    Merged {
        character: Entity,
        report: MergeReport,
    },
    /// The request was not started.
    Rejected { character: Entity, reason: String },
    /// The merge ran and failed; the character keeps its parts.
    Failed { character: Entity, error: MergeError },
    Saved {
        character: Entity,
        paths: Vec<std::path::PathBuf>,
    },
    /// The in-memory merge stands; `retryable` saves can be requested again.
    SaveFailed {
        character: Entity,
        error: String,
        retryable: bool,
    },
}

/// A merge running for this character.
#[derive(Component)]
pub struct MergeInFlight {
    task: Task<Result<MergedCharacter, MergeError>>,
    parts: Vec<Entity>,
    paused_players: Vec<Entity>,
    modifiers: Option<ShapeModifierState>,
    save_as: Option<String>,
}

/// Assets and entities produced by the last merge of this character.
#[derive(Component, Clone, Debug)]
pub struct MergedResult {
    /// One per submesh.
    pub meshes: Vec<Handle<Mesh>>,
    pub material: Handle<StandardMaterial>,
    pub skin: Handle<SkinnedMeshInverseBindposes>,
    pub diffuse: Handle<Image>,
    pub channel_images: BTreeMap<String, Handle<Image>>,
    pub mesh_entities: Vec<Entity>,
    /// Joint entity per master bone, in bone order.
    pub joints: Vec<Entity>,
    pub rects: RectMap,
    pub custom_maps: BTreeMap<String, BakeRect>,
    pub morph_target_names: Vec<String>,
    pub merged: Arc<MergedCharacter>,
    /// Bumped every time a merge is swapped in. Saves started against an
    /// older generation are discarded.
    pub generation: u64,
}

/// Start a merge for every [`MergeCharacter`] request.
pub fn start_merges(
    mut commands: Commands,
    mut requests: MessageReader<MergeCharacter>,
    mut outcomes: MessageWriter<MergeOutcome>,
    settings: Res<MergeSettings>,
    backend: Res<MergeBackend>,
    characters: Query<(
        &BaseSkeleton,
        Option<&GlobalTransform>,
        Option<&Name>,
        Option<&ShapeModifierState>,
        Has<MergeInFlight>,
    )>,
    children: Query<&Children>,
    parts: Query<(&OutfitPart, Option<&GlobalTransform>)>,
    joints: Query<(&Name, &GlobalTransform), Without<OutfitPart>>,
    mut players: Query<&mut AnimationPlayer>,
) {
    let mut started = HashSet::new();
    for request in requests.read() {
        let character = request.character;
        let mut reject = |reason: String| {
            warn!("Merge of {} rejected: {}", character, reason);
            outcomes.write(MergeOutcome::Rejected { character, reason });
        };

        let Ok((base, global, name, modifiers, in_flight)) = characters.get(character) else {
            reject("entity has no BaseSkeleton".into());
            continue;
        };
        if in_flight || !started.insert(character) {
            reject("a merge is already in progress".into());
            continue;
        }

        // Current pose of the character's joints, by bone name.
        let posed: HashMap<&str, Mat4> = children
            .iter_descendants(character)
            .filter_map(|entity| joints.get(entity).ok())
            .map(|(name, global)| (name.as_str(), global.to_matrix()))
            .collect();

        let mut part_entities = Vec::new();
        let mut snapshot = Vec::new();
        for entity in children.iter_descendants(character) {
            if let Ok((part, global)) = parts.get(entity) {
                let mut part = part.clone();
                if let Some(global) = global {
                    part.transform = global.to_matrix();
                    if part.is_static() {
                        rebase_static_part(&mut part, &base.0, &posed);
                    }
                }
                part_entities.push(entity);
                snapshot.push(part);
            }
        }

        let mut paused_players = Vec::new();
        for entity in std::iter::once(character).chain(children.iter_descendants(character)) {
            if let Ok(mut player) = players.get_mut(entity) {
                player.pause_all();
                paused_players.push(entity);
            }
        }

        let label = name.map_or_else(|| character.to_string(), |n| n.as_str().to_string());
        info!(
            "Merging character '{}': {} parts, {} base bones",
            label,
            snapshot.len(),
            base.0.len()
        );

        let input = MergeInput {
            character: label,
            base: base.0.clone(),
            root_world: global.map_or(Mat4::IDENTITY, GlobalTransform::to_matrix),
            parts: snapshot,
        };
        let merger = CharacterMerger::new(backend.0.clone(), settings.clone());
        let task = AsyncComputeTaskPool::get_or_init(TaskPool::default)
            .spawn(async move { merger.merge(input).await });

        commands.entity(character).insert(MergeInFlight {
            task,
            parts: part_entities,
            paused_players,
            modifiers: modifiers.cloned(),
            save_as: request.save_as.clone(),
        });
    }
}

/// Move a static part from its attach bone's current pose to the bone's bind
/// pose, so props follow the bone they are bound to rather than the frame the
/// merge started on.
fn rebase_static_part(part: &mut OutfitPart, base: &Skeleton, posed: &HashMap<&str, Mat4>) {
    let Some(bone) = part.attach_point.as_deref() else {
        return;
    };
    let (Some(current), Some(index)) = (posed.get(bone), base.index_of(bone)) else {
        return;
    };
    let bind = base.bones()[index].world;
    part.transform = bind * current.inverse() * part.transform;
}

/// Swap finished merges into the scene.
///
/// A character despawned mid-merge takes its [`MergeInFlight`] with it, which
/// drops the task and discards the result.
#[allow(clippy::too_many_arguments)]
pub fn finish_merges(
    mut commands: Commands,
    mut in_flight: Query<(Entity, &mut MergeInFlight, Option<&MergedResult>)>,
    mut meshes: ResMut<Assets<Mesh>>,
    mut materials: ResMut<Assets<StandardMaterial>>,
    mut images: ResMut<Assets<Image>>,
    mut bindposes: ResMut<Assets<SkinnedMeshInverseBindposes>>,
    mut players: Query<&mut AnimationPlayer>,
    mut outcomes: MessageWriter<MergeOutcome>,
    mut saves: MessageWriter<SaveMergedCharacter>,
) {
    for (character, mut flight, previous) in &mut in_flight {
        let Some(result) = (&mut flight.task).now_or_never() else {
            continue;
        };
        commands.entity(character).remove::<MergeInFlight>();
        for &entity in &flight.paused_players {
            if let Ok(mut player) = players.get_mut(entity) {
                player.resume_all();
            }
        }

        let merged = match result {
            Ok(merged) => merged,
            Err(error) => {
                error!("Merge of {} failed: {}", character, error);
                outcomes.write(MergeOutcome::Failed { character, error });
                continue;
            }
        };

        for &part in &flight.parts {
            commands.entity(part).try_despawn();
        }
        if let Some(previous) = previous {
            for &entity in previous.mesh_entities.iter().chain(&previous.joints) {
                commands.entity(entity).try_despawn();
            }
        }

        let joints = spawn_joints(&mut commands, character, &merged.skeleton);
        let assets = add_assets(
            &merged.mesh,
            &merged.atlases,
            &mut meshes,
            &mut materials,
            &mut images,
        );
        let skin = bindposes.add(SkinnedMeshInverseBindposes::from(
            merged.mesh.inverse_bindposes.clone(),
        ));

        let weights = modifiers_to_weights(flight.modifiers.as_ref(), &assets.morph_target_names);
        let mut mesh_entities = Vec::with_capacity(assets.meshes.len());
        for (i, mesh) in assets.meshes.iter().enumerate() {
            let mut entity = commands.spawn((
                Name::new(format!("Merged Mesh {i}")),
                Mesh3d(mesh.clone()),
                MeshMaterial3d(assets.material.clone()),
                SkinnedMesh {
                    inverse_bindposes: skin.clone(),
                    joints: joints.clone(),
                },
                ChildOf(character),
            ));
            if !weights.is_empty() {
                match MeshMorphWeights::new(weights.clone()) {
                    Ok(morph) => {
                        entity.insert(morph);
                    }
                    Err(e) => warn!("Merge of {}: morph weights rejected: {}", character, e),
                }
            }
            mesh_entities.push(entity.id());
        }
        if !weights.is_empty() {
            match MorphWeights::new(weights, assets.meshes.first().cloned()) {
                Ok(morph) => {
                    commands.entity(character).insert(morph);
                }
                Err(e) => warn!("Merge of {}: morph weights rejected: {}", character, e),
            }
        }

        if let Some(modifiers) = &flight.modifiers {
            replay_bone_scales(&mut commands, &merged.skeleton, &joints, modifiers);
        }

        info!(
            "Merged {}: {} vertices, {} triangles, {} joints, {} mesh entities",
            character,
            merged.mesh.vertex_count(),
            merged.mesh.triangle_count(),
            joints.len(),
            mesh_entities.len()
        );

        outcomes.write(MergeOutcome::Merged {
            character,
            report: merged.report.clone(),
        });
        if let Some(name) = flight.save_as.take() {
            saves.write(SaveMergedCharacter { character, name });
        }

        commands.entity(character).insert(MergedResult {
            meshes: assets.meshes,
            material: assets.material,
            skin,
            diffuse: assets.diffuse,
            channel_images: assets.channels,
            mesh_entities,
            joints,
            rects: merged.rects.clone(),
            custom_maps: merged.custom_maps.clone(),
            morph_target_names: assets.morph_target_names,
            merged: Arc::new(merged),
            generation: previous.map_or(0, |p| p.generation + 1),
        });
    }
}

fn spawn_joints(commands: &mut Commands, character: Entity, skeleton: &Skeleton) -> Vec<Entity> {
    let joints: Vec<Entity> = skeleton
        .bones()
        .iter()
        .map(|bone| commands.spawn((Name::new(bone.name.clone()), bone.local)).id())
        .collect();
    // Appended bones may name a parent later in the list.
    for (bone, &joint) in skeleton.bones().iter().zip(&joints) {
        let parent = bone.parent.map_or(character, |p| joints[p]);
        commands.entity(joint).insert(ChildOf(parent));
    }
    joints
}

fn replay_bone_scales(
    commands: &mut Commands,
    skeleton: &Skeleton,
    joints: &[Entity],
    modifiers: &ShapeModifierState,
) {
    for (bone, scale) in &modifiers.bone_scales {
        match skeleton.index_of(bone) {
            Some(index) => {
                let mut local = skeleton.bones()[index].local;
                local.scale = *scale;
                commands.entity(joints[index]).insert(local);
            }
            None => debug!("Bone scale for '{}' has no merged bone", bone),
        }
    }
}

/// Morph weights in target order. Every frame of a shape takes the shape's
/// weight.
fn modifiers_to_weights(modifiers: Option<&ShapeModifierState>, names: &[String]) -> Vec<f32> {
    names
        .iter()
        .map(|name| {
            let Some(weights) = modifiers.map(|m| &m.shape_weights) else {
                return 0.0;
            };
            // Frames past the first are named `shape#k`.
            let shape = name
                .rsplit_once('#')
                .filter(|(_, k)| k.parse::<usize>().is_ok())
                .map(|(shape, _)| shape);
            weights
                .get(name.as_str())
                .or_else(|| shape.and_then(|shape| weights.get(shape)))
                .copied()
                .unwrap_or(0.0)
        })
        .collect()
}

struct MergedAssets {
    meshes: Vec<Handle<Mesh>>,
    material: Handle<StandardMaterial>,
    diffuse: Handle<Image>,
    channels: BTreeMap<String, Handle<Image>>,
    morph_target_names: Vec<String>,
}

fn add_assets(
    combined: &CombinedMesh,
    atlases: &AtlasSet,
    meshes: &mut Assets<Mesh>,
    materials: &mut Assets<StandardMaterial>,
    images: &mut Assets<Image>,
) -> MergedAssets {
    let diffuse = images.add(atlas_image(&atlases.diffuse, TextureFormat::Rgba8UnormSrgb));
    let channels: BTreeMap<String, Handle<Image>> = atlases
        .channels
        .iter()
        .map(|(name, atlas)| {
            let handle = images.add(atlas_image(atlas, TextureFormat::Rgba8Unorm));
            (name.clone(), handle)
        })
        .collect();

    let material = materials.add(StandardMaterial {
        base_color_texture: Some(diffuse.clone()),
        normal_map_texture: channels.get(NORMAL_CHANNEL).cloned(),
        ..default()
    });

    let morph_target_names = combined.morph_target_names();
    let morph_targets = match combined.morph_targets() {
        Ok(targets) => targets.map(|image| images.add(image.0)),
        Err(e) => {
            warn!("Dropping {} morph targets: {}", morph_target_names.len(), e);
            None
        }
    };
    let morph_target_names = match morph_targets {
        Some(_) => morph_target_names,
        None => Vec::new(),
    };

    let meshes = combined
        .to_meshes()
        .into_iter()
        .map(|mut mesh| {
            if let Some(targets) = &morph_targets {
                mesh.set_morph_targets(targets.clone());
                mesh.set_morph_target_names(morph_target_names.clone());
            }
            meshes.add(mesh)
        })
        .collect();

    MergedAssets {
        meshes,
        material,
        diffuse,
        channels,
        morph_target_names,
    }
}

fn atlas_image(atlas: &RgbaImage, format: TextureFormat) -> Image {
    Image::new(
        Extent3d {
            width: atlas.width(),
            height: atlas.height(),
            depth_or_array_layers: 1,
        },
        TextureDimension::D2,
        atlas.as_raw().clone(),
        format,
        RenderAssetUsages::RENDER_WORLD | RenderAssetUsages::MAIN_WORLD,
    )
}

#[cfg(feature = "persist")]
mod saving {
    use std::path::PathBuf;

    use bevy::tasks::IoTaskPool;

    use super::*;
    use crate::merge::{PersistError, PersistedCharacter, PersistedPaths, save_character};

    /// A save and reload running for this character.
    #[derive(Component)]
    pub struct SaveInFlight {
        task: Task<Result<(PersistedPaths, PersistedCharacter), PersistError>>,
        name: String,
        /// [`MergedResult::generation`] the save was taken from.
        generation: u64,
    }

    /// Start a save for every [`SaveMergedCharacter`] request.
    pub fn start_saves(
        mut commands: Commands,
        mut requests: MessageReader<SaveMergedCharacter>,
        mut outcomes: MessageWriter<MergeOutcome>,
        settings: Res<MergeSettings>,
        results: Query<(&MergedResult, Has<SaveInFlight>)>,
    ) {
        let mut started = HashSet::new();
        for request in requests.read() {
            let character = request.character;
            let mut fail = |error: String, retryable: bool| {
                warn!("Save of {} as '{}' not started: {}", character, request.name, error);
                outcomes.write(MergeOutcome::SaveFailed {
                    character,
                    error,
                    retryable,
                });
            };

            let Some(dir) = settings.save_directory.clone() else {
                fail("no save directory configured".into(), false);
                continue;
            };
            let Ok((result, saving)) = results.get(character) else {
                fail("character has no merged result".into(), false);
                continue;
            };
            if saving || !started.insert(character) {
                fail("a save is already in progress".into(), true);
                continue;
            }

            let merged = result.merged.clone();
            let name = request.name.clone();
            let task = IoTaskPool::get_or_init(TaskPool::default).spawn(async move {
                let paths = save_character(&merged, &dir, &name)?;
                let reloaded = PersistedCharacter::load(&dir, &name)?;
                Ok::<_, PersistError>((paths, reloaded))
            });
            commands.entity(character).insert(SaveInFlight {
                task,
                name: request.name.clone(),
                generation: result.generation,
            });
        }
    }

    /// Swap the merged character's assets for the ones reloaded from disk.
    #[allow(clippy::too_many_arguments)]
    pub fn finish_saves(
        mut commands: Commands,
        mut in_flight: Query<(
            Entity,
            &mut SaveInFlight,
            &mut MergedResult,
            Option<&mut MorphWeights>,
        )>,
        mut mesh_entities: Query<(&mut Mesh3d, &mut MeshMaterial3d<StandardMaterial>)>,
        mut meshes: ResMut<Assets<Mesh>>,
        mut materials: ResMut<Assets<StandardMaterial>>,
        mut images: ResMut<Assets<Image>>,
        mut outcomes: MessageWriter<MergeOutcome>,
    ) {
        for (character, mut flight, mut result, morph) in &mut in_flight {
            let Some(outcome) = (&mut flight.task).now_or_never() else {
                continue;
            };
            commands.entity(character).remove::<SaveInFlight>();

            if flight.generation != result.generation {
                warn!(
                    "Save of {} as '{}' finished after a newer merge, keeping the newer assets",
                    character, flight.name
                );
                outcomes.write(MergeOutcome::SaveFailed {
                    character,
                    error: "character was merged again while saving".into(),
                    retryable: true,
                });
                continue;
            }

            let (paths, reloaded) = match outcome {
                Ok(saved) => saved,
                Err(e) => {
                    error!("Save of {} as '{}' failed: {}", character, flight.name, e);
                    outcomes.write(MergeOutcome::SaveFailed {
                        character,
                        error: e.to_string(),
                        retryable: true,
                    });
                    continue;
                }
            };

            let assets = add_assets(
                &reloaded.mesh,
                &reloaded.atlases,
                &mut meshes,
                &mut materials,
                &mut images,
            );
            for (&entity, handle) in result.mesh_entities.iter().zip(&assets.meshes) {
                if let Ok((mut mesh, mut material)) = mesh_entities.get_mut(entity) {
                    mesh.0 = handle.clone();
                    material.0 = assets.material.clone();
                }
            }
            if let Some(mut morph) = morph {
                match MorphWeights::new(morph.weights().to_vec(), assets.meshes.first().cloned()) {
                    Ok(weights) => *morph = weights,
                    Err(e) => warn!("Save of {}: morph weights rejected: {}", character, e),
                }
            }
            result.meshes = assets.meshes;
            result.material = assets.material;
            result.diffuse = assets.diffuse;
            result.channel_images = assets.channels;
            result.rects = reloaded.rects;
            result.custom_maps = reloaded.custom_maps;

            info!("Character {} now uses assets saved as '{}'", character, flight.name);
            let paths: Vec<PathBuf> = paths.all();
            outcomes.write(MergeOutcome::Saved { character, paths });
        }
    }
}

#[cfg(feature = "persist")]
pub use saving::{SaveInFlight, finish_saves, start_saves};
