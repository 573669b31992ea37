//! Appearance description of an outfit part.

use std::sync::Arc;

use bevy::prelude::*;
use image::RgbaImage;

/// CPU-side texture shared between parts and bake jobs.
pub type Texture = Arc<RgbaImage>;

/// Name of the auxiliary channel fed by [`TintedMaterial::normal_map`].
pub const NORMAL_CHANNEL: &str = "normal";

/// How a part is shaded, and therefore how it is baked.
#[derive(Clone, Debug)]
pub enum PartMaterial {
    /// Flat tint colors with optional pattern and decal layers.
    Tinted(TintedMaterial),
    /// Opaque pre-rendered texture, baked as-is.
    CustomShader(CustomShaderMaterial),
}

impl Default for PartMaterial {
    fn default() -> Self {
        Self::Tinted(TintedMaterial::default())
    }
}

impl PartMaterial {
    /// Auxiliary channel textures in declaration order, `(channel, texture)`.
    ///
    /// The normal map (if any) comes first under [`NORMAL_CHANNEL`], followed
    /// by custom maps contributed by renderer extensions.
    pub fn aux_maps(&self) -> Vec<(&str, &Texture)> {
        let (normal, custom) = match self {
            PartMaterial::Tinted(m) => (m.normal_map.as_ref(), &m.custom_maps),
            PartMaterial::CustomShader(m) => (m.normal_map.as_ref(), &m.custom_maps),
        };
        normal
            .map(|t| (NORMAL_CHANNEL, t))
            .into_iter()
            .chain(custom.iter().map(|c| (c.name.as_str(), &c.texture)))
            .collect()
    }

    /// Names of renderer-extension custom maps (excludes the normal map).
    pub fn custom_map_names(&self) -> impl Iterator<Item = &str> {
        let custom = match self {
            PartMaterial::Tinted(m) => &m.custom_maps,
            PartMaterial::CustomShader(m) => &m.custom_maps,
        };
        custom.iter().map(|c| c.name.as_str())
    }
}

/// Tint-channel material.
///
/// The tint mask's R, G and B channels select how strongly each of the three
/// tint colors applies. Without a mask the first tint color multiplies the
/// whole part.
#[derive(Clone, Debug)]
pub struct TintedMaterial {
    pub base: Option<Texture>,
    pub base_color: Color,
    pub tint_mask: Option<Texture>,
    pub tint_colors: [Color; 3],
    pub pattern: Option<PatternLayer>,
    pub decal: Option<DecalLayer>,
    pub normal_map: Option<Texture>,
    pub custom_maps: Vec<CustomMap>,
}

impl Default for TintedMaterial {
    fn default() -> Self {
        Self {
            base: None,
            base_color: Color::WHITE,
            tint_mask: None,
            tint_colors: [Color::WHITE; 3],
            pattern: None,
            decal: None,
            normal_map: None,
            custom_maps: Vec::new(),
        }
    }
}

impl TintedMaterial {
    pub fn new(base_color: Color) -> Self {
        Self {
            base_color,
            ..default()
        }
    }

    pub fn with_base(mut self, base: Texture) -> Self {
        self.base = Some(base);
        self
    }

    pub fn with_tints(mut self, mask: Texture, colors: [Color; 3]) -> Self {
        self.tint_mask = Some(mask);
        self.tint_colors = colors;
        self
    }

    pub fn with_pattern(mut self, pattern: PatternLayer) -> Self {
        self.pattern = Some(pattern);
        self
    }

    pub fn with_decal(mut self, decal: DecalLayer) -> Self {
        self.decal = Some(decal);
        self
    }

    pub fn with_normal_map(mut self, normal: Texture) -> Self {
        self.normal_map = Some(normal);
        self
    }

    pub fn with_custom_map(mut self, name: impl Into<String>, texture: Texture) -> Self {
        self.custom_maps.push(CustomMap {
            name: name.into(),
            texture,
        });
        self
    }
}

/// Repeating pattern blended over the tinted base.
#[derive(Clone, Debug)]
pub struct PatternLayer {
    pub texture: Texture,
    pub color: Color,
    /// UV repeats per unit of part UV space.
    pub scale: f32,
    pub blend: PatternBlend,
    /// 0.0 disables the layer, 1.0 applies it fully.
    pub strength: f32,
}

impl PatternLayer {
    pub fn new(texture: Texture) -> Self {
        Self {
            texture,
            color: Color::WHITE,
            scale: 1.0,
            blend: PatternBlend::Multiply,
            strength: 1.0,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PatternBlend {
    #[default]
    Multiply,
    Mix,
    Overlay,
}

impl PatternBlend {
    /// Shader-side discriminant.
    pub const fn as_u32(self) -> u32 {
        match self {
            PatternBlend::Multiply => 0,
            PatternBlend::Mix => 1,
            PatternBlend::Overlay => 2,
        }
    }
}

/// Single non-repeating image placed in part UV space.
#[derive(Clone, Debug)]
pub struct DecalLayer {
    pub texture: Texture,
    /// Lower-left corner of the decal in part UV space.
    pub offset: Vec2,
    /// Extent of the decal in part UV space.
    pub scale: Vec2,
    pub opacity: f32,
}

impl DecalLayer {
    pub fn new(texture: Texture, offset: Vec2, scale: Vec2) -> Self {
        Self {
            texture,
            offset,
            scale,
            opacity: 1.0,
        }
    }

    /// Map a part UV into decal space, `None` outside the decal.
    pub fn local_uv(&self, uv: Vec2) -> Option<Vec2> {
        if self.scale.x <= 0.0 || self.scale.y <= 0.0 {
            return None;
        }
        let local = (uv - self.offset) / self.scale;
        (local.cmpge(Vec2::ZERO).all() && local.cmple(Vec2::ONE).all()).then_some(local)
    }
}

/// Material for parts rendered with their own shader.
#[derive(Clone, Debug)]
pub struct CustomShaderMaterial {
    pub texture: Texture,
    pub normal_map: Option<Texture>,
    pub custom_maps: Vec<CustomMap>,
}

impl CustomShaderMaterial {
    pub fn new(texture: Texture) -> Self {
        Self {
            texture,
            normal_map: None,
            custom_maps: Vec::new(),
        }
    }
}

/// Named texture contributed by a renderer extension (e.g. a body mask).
#[derive(Clone, Debug)]
pub struct CustomMap {
    pub name: String,
    pub texture: Texture,
}
