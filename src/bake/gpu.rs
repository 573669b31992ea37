//! GPU bake backend: offscreen UV-space render followed by a texture readback.
//!
//! Requests are queued from any thread through [`GpuBaker`] and turned into
//! entities on the main world by [`dispatch_bakes`]. Each bake owns a target
//! image, an offscreen camera and a UV-layout mesh on a private render layer.
//! After the settle delay a [`Readback`] is attached; its
//! [`ReadbackComplete`] observer resolves the ticket and tears the bake down.

use bevy::asset::RenderAssetUsages;
use bevy::camera::visibility::{NoFrustumCulling, RenderLayers};
use bevy::camera::{ClearColorConfig, RenderTarget};
use bevy::core_pipeline::tonemapping::Tonemapping;
use bevy::mesh::{Indices, PrimitiveTopology};
use bevy::prelude::*;
use bevy::render::gpu_readback::{Readback, ReadbackComplete};
use bevy::render::render_resource::{
    Extent3d, TextureDimension, TextureFormat, TextureUsages,
};
use crossbeam_channel::{Receiver, Sender, unbounded};
use image::RgbaImage;

use super::material::UvBakeMaterial;
use super::raster::resample_masked;
use super::{BakeBackend, BakeCompleter, BakeError, BakeRequest, BakeTicket, BakedPart};
use crate::merge::MergeSettings;
use crate::part::{PartGeometry, Texture};

/// First render layer used for bakes; each in-flight bake takes its own.
const BAKE_LAYER_BASE: usize = 16;
const BAKE_LAYER_COUNT: usize = 240;

/// Row alignment of texture-to-buffer copies.
const COPY_ROW_ALIGNMENT: usize = 256;

/// System set for GPU bake systems.
#[derive(SystemSet, Debug, Clone, PartialEq, Eq, Hash)]
pub struct GpuBakeSystems;

/// A bake waiting to be turned into render entities.
pub struct PendingBake {
    pub request: BakeRequest,
    completer: BakeCompleter,
}

/// Thread-safe submission queue for GPU bakes.
#[derive(Resource, Clone)]
pub struct GpuBaker {
    sender: Sender<PendingBake>,
    receiver: Receiver<PendingBake>,
}

impl Default for GpuBaker {
    fn default() -> Self {
        let (sender, receiver) = unbounded();
        Self { sender, receiver }
    }
}

impl GpuBaker {
    pub fn queued(&self) -> usize {
        self.receiver.len()
    }
}

impl BakeBackend for GpuBaker {
    fn submit(&self, request: BakeRequest) -> BakeTicket {
        let (completer, ticket) = BakeTicket::pair(&request.part);
        if let Err(err) = self.sender.send(PendingBake { request, completer }) {
            let pending = err.into_inner();
            let part = pending.request.part.clone();
            pending.completer.complete(Err(BakeError::Cancelled(part)));
        }
        ticket
    }
}

/// In-flight GPU bake.
#[derive(Component)]
pub struct BakeJob {
    part: String,
    resolution: u32,
    completer: Option<BakeCompleter>,
    aux: Vec<(String, Texture)>,
    target: Handle<Image>,
    camera: Entity,
    mesh: Entity,
    age: u32,
    reading_back: bool,
}

/// Turn queued requests into bake entities.
pub fn dispatch_bakes(
    mut commands: Commands,
    baker: Res<GpuBaker>,
    mut meshes: ResMut<Assets<Mesh>>,
    mut images: ResMut<Assets<Image>>,
    mut materials: ResMut<Assets<UvBakeMaterial>>,
    mut next_layer: Local<usize>,
) {
    for PendingBake { request, completer } in baker.receiver.try_iter() {
        let Some(mesh) = uv_layout_mesh(&request.geometry) else {
            warn!("Part '{}': nothing to bake", request.part);
            completer.complete(Err(BakeError::NoGeometry(request.part)));
            continue;
        };

        let layer = RenderLayers::layer(BAKE_LAYER_BASE + *next_layer % BAKE_LAYER_COUNT);
        *next_layer += 1;

        let target = images.add(bake_target(request.resolution));
        let material = UvBakeMaterial::from_part_material(&request.material, &mut images);

        let camera = commands
            .spawn((
                Name::new(format!("Bake Camera ({})", request.part)),
                Camera3d::default(),
                Camera {
                    target: RenderTarget::Image(target.clone().into()),
                    clear_color: ClearColorConfig::Custom(Color::NONE),
                    order: -1,
                    ..default()
                },
                Tonemapping::None,
                Msaa::Off,
                Transform::from_xyz(0.0, 0.0, 1.0).looking_at(Vec3::ZERO, Vec3::Y),
                layer.clone(),
            ))
            .id();

        let mesh = commands
            .spawn((
                Name::new(format!("Bake Mesh ({})", request.part)),
                Mesh3d(meshes.add(mesh)),
                MeshMaterial3d(materials.add(material)),
                Transform::default(),
                NoFrustumCulling,
                layer,
            ))
            .id();

        debug!(
            "Part '{}': GPU bake dispatched at {}px",
            request.part, request.resolution
        );

        let aux = request
            .material
            .aux_maps()
            .into_iter()
            .map(|(name, texture)| (name.to_string(), texture.clone()))
            .collect();

        commands.spawn((
            Name::new(format!("Bake ({})", request.part)),
            BakeJob {
                part: request.part,
                resolution: request.resolution,
                completer: Some(completer),
                aux,
                target,
                camera,
                mesh,
                age: 0,
                reading_back: false,
            },
        ));
    }
}

/// Request readbacks once bakes have settled; fail those that time out.
pub fn advance_bakes(
    mut commands: Commands,
    mut jobs: Query<(Entity, &mut BakeJob)>,
    settings: Res<MergeSettings>,
) {
    for (entity, mut job) in &mut jobs {
        job.age += 1;

        if !job.reading_back && job.age >= settings.settle_frames {
            job.reading_back = true;
            commands
                .entity(entity)
                .insert(Readback::texture(job.target.clone()))
                .observe(finish_readback);
        }

        if job.age > settings.readback_timeout_frames {
            if let Some(completer) = job.completer.take() {
                warn!(
                    "Part '{}': readback timed out after {} frames",
                    job.part, job.age
                );
                completer.complete(Err(BakeError::Readback {
                    part: job.part.clone(),
                    reason: format!("no data after {} frames", job.age),
                }));
            }
            teardown(&mut commands, entity, &job);
        }
    }
}

fn finish_readback(
    event: On<ReadbackComplete>,
    mut commands: Commands,
    mut jobs: Query<&mut BakeJob>,
) {
    let entity = event.entity;
    let Ok(mut job) = jobs.get_mut(entity) else {
        return;
    };
    let Some(completer) = job.completer.take() else {
        return;
    };

    let result = decode_readback(&job.part, job.resolution, &event.data).map(|diffuse| {
        let channels = job
            .aux
            .iter()
            .map(|(name, texture)| {
                (
                    name.clone(),
                    resample_masked(texture, job.resolution, &diffuse),
                )
            })
            .collect();
        BakedPart {
            part: job.part.clone(),
            diffuse,
            channels,
        }
    });

    match &result {
        Ok(_) => debug!("Part '{}': readback complete", job.part),
        Err(e) => warn!("{}", e),
    }
    if completer.is_canceled() {
        debug!("Part '{}': merge gone, discarding readback", job.part);
    }
    completer.complete(result);
    teardown(&mut commands, entity, &job);
}

fn teardown(commands: &mut Commands, entity: Entity, job: &BakeJob) {
    // Readback and timeout may both tear down in the same frame.
    commands.entity(job.camera).try_despawn();
    commands.entity(job.mesh).try_despawn();
    commands.entity(entity).try_despawn();
}

/// Render target the bake camera draws into and the readback copies from.
fn bake_target(resolution: u32) -> Image {
    let mut image = Image::new_fill(
        Extent3d {
            width: resolution,
            height: resolution,
            depth_or_array_layers: 1,
        },
        TextureDimension::D2,
        &[0, 0, 0, 0],
        TextureFormat::Rgba8Unorm,
        RenderAssetUsages::RENDER_WORLD,
    );
    image.texture_descriptor.usage |= TextureUsages::RENDER_ATTACHMENT | TextureUsages::COPY_SRC;
    image
}

/// Triangle list whose vertices carry the part's UVs; the bake shader places
/// them in clip space.
fn uv_layout_mesh(geometry: &PartGeometry) -> Option<Mesh> {
    if geometry.triangle_count() == 0 {
        return None;
    }
    let positions: Vec<[f32; 3]> = geometry.uv0.iter().map(|uv| [uv[0], uv[1], 0.0]).collect();
    let indices: Vec<u32> = geometry.triangles().flatten().collect();

    let mut mesh = Mesh::new(
        PrimitiveTopology::TriangleList,
        RenderAssetUsages::RENDER_WORLD,
    );
    mesh.insert_attribute(Mesh::ATTRIBUTE_POSITION, positions);
    mesh.insert_attribute(Mesh::ATTRIBUTE_UV_0, geometry.uv0.clone());
    mesh.insert_indices(Indices::U32(indices));
    Some(mesh)
}

/// Tightly packed RGBA8 image from readback bytes, with or without the
/// 256-byte row padding of buffer copies.
fn decode_readback(part: &str, resolution: u32, data: &[u8]) -> Result<RgbaImage, BakeError> {
    let row = resolution as usize * 4;
    let rows = resolution as usize;
    let padded = row.div_ceil(COPY_ROW_ALIGNMENT) * COPY_ROW_ALIGNMENT;

    let pixels = if data.len() == row * rows {
        data.to_vec()
    } else if rows > 0 && data.len() >= padded * (rows - 1) + row {
        data.chunks(padded)
            .take(rows)
            .flat_map(|r| &r[..row])
            .copied()
            .collect()
    } else {
        return Err(BakeError::Readback {
            part: part.to_string(),
            reason: format!(
                "{} bytes for a {resolution}x{resolution} target",
                data.len()
            ),
        });
    };

    RgbaImage::from_raw(resolution, resolution, pixels).ok_or_else(|| BakeError::Readback {
        part: part.to_string(),
        reason: "malformed pixel buffer".into(),
    })
}
