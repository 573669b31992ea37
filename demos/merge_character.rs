//! Builds a small modular character and merges it on demand.
//!
//! - Body: capsule skinned to the character's own rig
//! - Hat: static cube attached to the head bone
//! - Cape: plane carrying its own two-bone rig, attached at the spine
//!
//! Press Space to merge. The merged character is also saved to
//! `target/merged/` and reloaded from there.

use std::sync::Arc;

use bevy::prelude::*;
use bevy_outfit_merge::prelude::*;
use image::{Rgba, RgbaImage};

fn main() {
    App::new()
        .add_plugins(DefaultPlugins)
        .add_plugins(CharacterMergePlugin::default())
        .insert_resource(
            MergeSettings::default()
                .with_atlas_size(1024)
                .with_bake_resolution(256)
                .with_save_directory("target/merged"),
        )
        .add_systems(Startup, setup)
        .add_systems(Update, (merge_on_space, log_outcomes))
        .run();
}

/// Checkerboard used as pattern and as the cape's base texture.
fn checker(size: u32, cell: u32, a: [u8; 4], b: [u8; 4]) -> Arc<RgbaImage> {
    Arc::new(RgbaImage::from_fn(size, size, |x, y| {
        if (x / cell + y / cell) % 2 == 0 {
            Rgba(a)
        } else {
            Rgba(b)
        }
    }))
}

fn base_skeleton() -> Skeleton {
    let bones = vec![
        Bone::new("root", None, Transform::IDENTITY),
        Bone::new("hips", Some(0), Transform::from_xyz(0.0, 0.9, 0.0)),
        Bone::new("spine", Some(1), Transform::from_xyz(0.0, 0.4, 0.0)),
        Bone::new("head", Some(2), Transform::from_xyz(0.0, 0.5, 0.0)),
    ];
    Skeleton::from_bones(bones, Mat4::IDENTITY).expect("valid demo rig")
}

fn body_part(skeleton: &Skeleton) -> OutfitPart {
    let mesh = Mesh::from(Capsule3d::new(0.3, 1.2));
    let mut geometry = PartGeometry::from_mesh(&mesh).expect("capsule is a triangle list");
    // Local bone 0 = hips, 1 = spine; blend by height.
    geometry.bone_weights = geometry
        .positions
        .iter()
        .map(|p| BoneWeights::blend2(0, 1, ((p[1] + 0.9) / 1.8).clamp(0.0, 1.0)))
        .collect();

    let bones = ["hips", "spine"]
        .iter()
        .enumerate()
        .map(|(i, name)| {
            let index = skeleton.index_of(name).expect("base bone");
            Bone {
                parent: i.checked_sub(1),
                ..skeleton.bones()[index].clone()
            }
        })
        .collect();

    let count = geometry.vertex_count();
    OutfitPart::new("body", geometry)
        .with_bones(SkeletonId::BASE, bones)
        .with_transform(Mat4::from_translation(Vec3::new(0.0, 1.5, 0.0)))
        .with_material(PartMaterial::Tinted(
            TintedMaterial::new(Color::srgb(0.85, 0.65, 0.55)).with_pattern(
                bevy_outfit_merge::part::PatternLayer::new(checker(
                    32,
                    8,
                    [255, 255, 255, 255],
                    [220, 220, 220, 255],
                )),
            ),
        ))
        .with_blend_shape(BlendShape::new(
            "BodyFat",
            vec![BlendShapeFrame::positions(1.0, vec![[0.05, 0.0, 0.05]; count])],
        ))
}

fn hat_part() -> OutfitPart {
    let geometry =
        PartGeometry::from_mesh(&Mesh::from(Cuboid::new(0.4, 0.2, 0.4))).expect("cube mesh");
    OutfitPart::new("hat", geometry)
        .attached_static("head")
        .with_transform(Mat4::from_translation(Vec3::new(0.0, 2.1, 0.0)))
        .with_material(PartMaterial::Tinted(TintedMaterial::new(Color::srgb(
            0.2, 0.3, 0.8,
        ))))
}

fn cape_part() -> OutfitPart {
    let mesh = Mesh::from(Plane3d::new(Vec3::Z, Vec2::new(0.35, 0.5)).mesh().subdivisions(4));
    let mut geometry = PartGeometry::from_mesh(&mesh).expect("plane mesh");
    geometry.bone_weights = geometry
        .positions
        .iter()
        .map(|p| BoneWeights::blend2(0, 1, (0.5 - p[1]).clamp(0.0, 1.0)))
        .collect();

    let top = Mat4::from_translation(Vec3::new(0.0, 1.7, -0.35));
    let bottom = top * Mat4::from_translation(Vec3::new(0.0, -0.5, 0.0));
    let bones = vec![
        Bone {
            name: "cape_top".into(),
            parent: None,
            local: Transform::from_matrix(top),
            world: top,
        },
        Bone {
            name: "cape_bottom".into(),
            parent: Some(0),
            local: Transform::from_xyz(0.0, -0.5, 0.0),
            world: bottom,
        },
    ];

    OutfitPart::new("cape", geometry)
        .with_bones(SkeletonId(1), bones)
        .with_attach_point("spine")
        .with_transform(Mat4::from_translation(Vec3::new(0.0, 1.5, -0.35)))
        .with_material(PartMaterial::Tinted(
            TintedMaterial::new(Color::WHITE)
                .with_base(checker(64, 16, [160, 20, 30, 255], [110, 10, 20, 255]))
                .with_custom_map("emission", checker(8, 4, [0, 0, 0, 255], [40, 40, 40, 255])),
        ))
}

fn setup(
    mut commands: Commands,
    mut meshes: ResMut<Assets<Mesh>>,
    mut materials: ResMut<Assets<StandardMaterial>>,
) {
    commands.spawn((
        Camera3d::default(),
        Transform::from_xyz(0.0, 1.6, 4.0).looking_at(Vec3::new(0.0, 1.2, 0.0), Vec3::Y),
    ));
    commands.spawn((
        DirectionalLight {
            shadows_enabled: true,
            ..default()
        },
        Transform::from_xyz(3.0, 6.0, 4.0).looking_at(Vec3::ZERO, Vec3::Y),
    ));

    let skeleton = base_skeleton();
    let parts = [body_part(&skeleton), hat_part(), cape_part()];

    commands
        .spawn((
            Name::new("Hero"),
            Transform::default(),
            Visibility::default(),
            BaseSkeleton(skeleton),
            ShapeModifierState {
                shape_weights: [("BodyFat".to_string(), 0.5)].into(),
                ..default()
            },
        ))
        .with_children(|character| {
            for part in parts {
                // Unmerged preview: each part drawn on its own.
                let preview = part.geometry.clone();
                let mut mesh = Mesh::new(
                    bevy::mesh::PrimitiveTopology::TriangleList,
                    bevy::asset::RenderAssetUsages::default(),
                )
                .with_inserted_attribute(Mesh::ATTRIBUTE_POSITION, preview.positions)
                .with_inserted_attribute(Mesh::ATTRIBUTE_NORMAL, preview.normals)
                .with_inserted_attribute(Mesh::ATTRIBUTE_UV_0, preview.uv0);
                mesh.insert_indices(bevy::mesh::Indices::U32(preview.submeshes.concat()));

                let transform = Transform::from_matrix(part.transform);
                character.spawn((
                    Name::new(part.name.clone()),
                    Mesh3d(meshes.add(mesh)),
                    MeshMaterial3d(materials.add(StandardMaterial::default())),
                    transform,
                    part,
                ));
            }
        });

    info!("Press Space to merge the character");
}

fn merge_on_space(
    keys: Res<ButtonInput<KeyCode>>,
    characters: Query<Entity, With<BaseSkeleton>>,
    mut requests: MessageWriter<MergeCharacter>,
) {
    if !keys.just_pressed(KeyCode::Space) {
        return;
    }
    for character in &characters {
        requests.write(MergeCharacter {
            character,
            save_as: Some("hero".into()),
        });
    }
}

fn log_outcomes(mut outcomes: MessageReader<MergeOutcome>, results: Query<&MergedResult>) {
    for outcome in outcomes.read() {
        match outcome {
            MergeOutcome::Merged { character, report } => {
                if let Ok(result) = results.get(*character) {
                    info!(
                        "Merged: {} vertices, {} joints, atlas rects {:?}",
                        result.merged.mesh.vertex_count(),
                        result.joints.len(),
                        result.rects.keys().collect::<Vec<_>>()
                    );
                }
                if !report.dropped.is_empty() || !report.failed_bakes.is_empty() {
                    warn!("Merge report: {:?}", report);
                }
            }
            MergeOutcome::Saved { paths, .. } => info!("Saved {} files", paths.len()),
            other => warn!("{:?}", other),
        }
    }
}
