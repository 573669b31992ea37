//! Material that renders a part into its own UV space.

use bevy::asset::{RenderAssetUsages, embedded_asset};
use bevy::ecs::system::{SystemParamItem, lifetimeless::SRes};
use bevy::mesh::MeshVertexBufferLayoutRef;
use bevy::pbr::{MaterialPipeline, MaterialPipelineKey};
use bevy::prelude::*;
use bevy::render::{
    render_asset::RenderAssets,
    render_resource::{
        AsBindGroup, AsBindGroupError, BindGroupLayout, BindGroupLayoutEntries,
        BindGroupLayoutEntry, BindingResources, BufferInitDescriptor, BufferUsages, Extent3d,
        OwnedBindingResource, RenderPipelineDescriptor, SamplerBindingType, ShaderStages,
        ShaderType, SpecializedMeshPipelineError, TextureDimension, TextureFormat,
        TextureSampleType, TextureViewDimension, UnpreparedBindGroup,
        binding_types::{sampler, texture_2d, uniform_buffer},
    },
    renderer::RenderDevice,
    texture::{FallbackImage, GpuImage},
};
use bevy::shader::ShaderRef;
use bytemuck::{Pod, Zeroable};

use super::raster::encoded;
use crate::part::{PartMaterial, Texture};

/// Shader asset path (embedded).
const UV_BAKE_SHADER_PATH: &str = "embedded://bevy_outfit_merge/bake/shaders/uv_bake.wgsl";

pub(crate) fn register_embedded_assets(app: &mut App) {
    embedded_asset!(app, "shaders/uv_bake.wgsl");
}

/// GPU-side compositing parameters.
#[derive(Clone, Copy, Debug, Default, ShaderType, Pod, Zeroable)]
#[repr(C)]
pub struct UvBakeParams {
    pub base_color: Vec4,
    pub tint_0: Vec4,
    pub tint_1: Vec4,
    pub tint_2: Vec4,
    pub pattern_color: Vec4,
    /// Decal offset in `xy`, extent in `zw`.
    pub decal_rect: Vec4,
    pub pattern_scale: f32,
    pub pattern_strength: f32,
    pub decal_opacity: f32,
    /// Layer flags in the low byte, pattern blend mode in bits 8..16.
    pub flags: u32,
}

impl UvBakeParams {
    pub const FLAG_BASE: u32 = 1 << 0;
    pub const FLAG_TINT_MASK: u32 = 1 << 1;
    pub const FLAG_PATTERN: u32 = 1 << 2;
    pub const FLAG_DECAL: u32 = 1 << 3;
    pub const BLEND_SHIFT: u32 = 8;

    pub fn from_material(material: &PartMaterial) -> Self {
        let m = match material {
            PartMaterial::CustomShader(_) => {
                return Self {
                    base_color: Vec4::ONE,
                    tint_0: Vec4::ONE,
                    flags: Self::FLAG_BASE,
                    ..default()
                };
            }
            PartMaterial::Tinted(m) => m,
        };

        let mut flags = 0;
        if m.base.is_some() {
            flags |= Self::FLAG_BASE;
        }
        if m.tint_mask.is_some() {
            flags |= Self::FLAG_TINT_MASK;
        }

        let mut params = Self {
            base_color: encoded(m.base_color),
            tint_0: encoded(m.tint_colors[0]),
            tint_1: encoded(m.tint_colors[1]),
            tint_2: encoded(m.tint_colors[2]),
            ..default()
        };

        if let Some(pattern) = &m.pattern {
            flags |= Self::FLAG_PATTERN | pattern.blend.as_u32() << Self::BLEND_SHIFT;
            params.pattern_color = encoded(pattern.color);
            params.pattern_scale = pattern.scale;
            params.pattern_strength = pattern.strength;
        }

        if let Some(decal) = &m.decal {
            flags |= Self::FLAG_DECAL;
            params.decal_rect = decal.offset.extend(decal.scale.x).extend(decal.scale.y);
            params.decal_opacity = decal.opacity;
        }

        params.flags = flags;
        params
    }
}

/// Unlit material placing each vertex at its UV and compositing the part's
/// tint, pattern and decal layers.
#[derive(Asset, TypePath, Clone, Debug, Default)]
pub struct UvBakeMaterial {
    pub params: UvBakeParams,
    pub base: Option<Handle<Image>>,
    pub tint_mask: Option<Handle<Image>>,
    pub pattern: Option<Handle<Image>>,
    pub decal: Option<Handle<Image>>,
}

impl UvBakeMaterial {
    /// Upload the part's source textures and build the bake material.
    pub fn from_part_material(material: &PartMaterial, images: &mut Assets<Image>) -> Self {
        let mut upload = |texture: &Texture| images.add(texture_to_image(texture));
        let params = UvBakeParams::from_material(material);
        match material {
            PartMaterial::Tinted(m) => Self {
                params,
                base: m.base.as_ref().map(&mut upload),
                tint_mask: m.tint_mask.as_ref().map(&mut upload),
                pattern: m.pattern.as_ref().map(|p| upload(&p.texture)),
                decal: m.decal.as_ref().map(|d| upload(&d.texture)),
            },
            PartMaterial::CustomShader(m) => Self {
                params,
                base: Some(upload(&m.texture)),
                ..default()
            },
        }
    }
}

/// GPU image holding the texture's stored bytes, sampled without sRGB
/// decoding so shader math matches the CPU composite.
pub(crate) fn texture_to_image(texture: &Texture) -> Image {
    Image::new(
        Extent3d {
            width: texture.width(),
            height: texture.height(),
            depth_or_array_layers: 1,
        },
        TextureDimension::D2,
        texture.as_raw().clone(),
        TextureFormat::Rgba8Unorm,
        RenderAssetUsages::RENDER_WORLD,
    )
}

impl AsBindGroup for UvBakeMaterial {
    type Data = ();
    type Param = (SRes<RenderAssets<GpuImage>>, SRes<FallbackImage>);

    fn bind_group_data(&self) -> Self::Data {}

    fn unprepared_bind_group(
        &self,
        _layout: &BindGroupLayout,
        render_device: &RenderDevice,
        (gpu_images, fallback_image): &mut SystemParamItem<'_, '_, Self::Param>,
        _force_no_bindless: bool,
    ) -> Result<UnpreparedBindGroup, AsBindGroupError> {
        let fallback = &fallback_image.d2;

        let mut bindings = vec![(
            0,
            OwnedBindingResource::Buffer(render_device.create_buffer_with_data(
                &BufferInitDescriptor {
                    label: Some("uv_bake_params"),
                    contents: bytemuck::bytes_of(&self.params),
                    usage: BufferUsages::UNIFORM | BufferUsages::COPY_DST,
                },
            )),
        )];

        let textures = [&self.base, &self.tint_mask, &self.pattern, &self.decal];
        for (slot, handle) in textures.into_iter().enumerate() {
            let image = match handle {
                Some(handle) => gpu_images
                    .get(handle)
                    .ok_or(AsBindGroupError::RetryNextUpdate)?,
                None => fallback,
            };
            let binding = 1 + slot as u32 * 2;
            bindings.push((
                binding,
                OwnedBindingResource::TextureView(
                    TextureViewDimension::D2,
                    image.texture_view.clone(),
                ),
            ));
            bindings.push((
                binding + 1,
                OwnedBindingResource::Sampler(
                    SamplerBindingType::Filtering,
                    image.sampler.clone(),
                ),
            ));
        }

        Ok(UnpreparedBindGroup {
            bindings: BindingResources(bindings),
        })
    }

    fn bind_group_layout_entries(
        _render_device: &RenderDevice,
        _force_no_bindless: bool,
    ) -> Vec<BindGroupLayoutEntry>
    where
        Self: Sized,
    {
        let float = TextureSampleType::Float { filterable: true };
        BindGroupLayoutEntries::with_indices(
            ShaderStages::VERTEX_FRAGMENT,
            (
                (0, uniform_buffer::<UvBakeParams>(false)),
                (1, texture_2d(float)),
                (2, sampler(SamplerBindingType::Filtering)),
                (3, texture_2d(float)),
                (4, sampler(SamplerBindingType::Filtering)),
                (5, texture_2d(float)),
                (6, sampler(SamplerBindingType::Filtering)),
                (7, texture_2d(float)),
                (8, sampler(SamplerBindingType::Filtering)),
            ),
        )
        .to_vec()
    }

    fn label() -> Option<&'static str> {
        Some("uv_bake_material")
    }
}

impl Material for UvBakeMaterial {
    fn vertex_shader() -> ShaderRef {
        UV_BAKE_SHADER_PATH.into()
    }

    fn fragment_shader() -> ShaderRef {
        UV_BAKE_SHADER_PATH.into()
    }

    fn specialize(
        _pipeline: &MaterialPipeline,
        descriptor: &mut RenderPipelineDescriptor,
        layout: &MeshVertexBufferLayoutRef,
        _key: MaterialPipelineKey<Self>,
    ) -> Result<(), SpecializedMeshPipelineError> {
        let vertex_layout = layout.0.get_layout(&[
            Mesh::ATTRIBUTE_POSITION.at_shader_location(0),
            Mesh::ATTRIBUTE_UV_0.at_shader_location(1),
        ])?;
        descriptor.vertex.buffers = vec![vertex_layout];
        // UV islands may be mirrored.
        descriptor.primitive.cull_mode = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::part::{DecalLayer, PatternBlend, PatternLayer, TintedMaterial};
    use crate::testing::solid;

    #[test]
    fn test_params_flags() {
        let mut pattern = PatternLayer::new(solid(2, 2, [255; 4]));
        pattern.blend = PatternBlend::Overlay;
        let material = PartMaterial::Tinted(
            TintedMaterial::new(Color::WHITE)
                .with_pattern(pattern)
                .with_decal(DecalLayer::new(
                    solid(2, 2, [255; 4]),
                    Vec2::new(0.1, 0.2),
                    Vec2::new(0.3, 0.4),
                )),
        );
        let params = UvBakeParams::from_material(&material);
        assert_eq!(params.flags & 0xff, UvBakeParams::FLAG_PATTERN | UvBakeParams::FLAG_DECAL);
        assert_eq!(params.flags >> UvBakeParams::BLEND_SHIFT, 2);
        assert_eq!(params.decal_rect, Vec4::new(0.1, 0.2, 0.3, 0.4));
    }

    #[test]
    fn test_params_size_is_uniform_aligned() {
        assert_eq!(std::mem::size_of::<UvBakeParams>() % 16, 0);
    }

    #[test]
    fn test_custom_shader_uses_base_only() {
        let material = PartMaterial::CustomShader(crate::part::CustomShaderMaterial::new(
            solid(2, 2, [1, 2, 3, 255]),
        ));
        let params = UvBakeParams::from_material(&material);
        assert_eq!(params.flags, UvBakeParams::FLAG_BASE);

        let mut images = Assets::<Image>::default();
        let bake = UvBakeMaterial::from_part_material(&material, &mut images);
        assert!(bake.base.is_some());
        assert!(bake.tint_mask.is_none());
    }
}
