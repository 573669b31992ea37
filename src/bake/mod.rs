//! Per-part texture baking.
//!
//! A bake renders a part's material through its UV layout, producing one
//! flattened diffuse image plus one image per auxiliary channel. Bakes are
//! asynchronous: [`BakeBackend::submit`] returns a [`BakeTicket`] future that
//! resolves once the pixels are in host memory.
//!
//! Two backends are provided:
//! - [`SoftwareBaker`] rasterizes on the async compute pool. Deterministic.
//! - [`GpuBaker`] renders offscreen with [`UvBakeMaterial`] and reads the
//!   target back through Bevy's `Readback` component.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use bevy::prelude::*;
use futures::FutureExt;
use futures::channel::oneshot;
use futures::future::join_all;
use image::{Rgba, RgbaImage, imageops::FilterType};
use thiserror::Error;

use crate::part::{OutfitPart, PartGeometry, PartMaterial};

mod gpu;
mod material;
mod raster;
mod software;

pub use gpu::{GpuBakeSystems, GpuBaker, PendingBake, advance_bakes, dispatch_bakes};
pub(crate) use material::register_embedded_assets;
pub use material::{UvBakeMaterial, UvBakeParams};
pub use software::SoftwareBaker;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BakeError {
    #[error("Readback for part '{part}' failed: {reason}")]
    Readback { part: String, reason: String },

    #[error("Bake for part '{0}' was dropped before completing")]
    Cancelled(String),

    #[error("Part '{0}' has no triangles to bake")]
    NoGeometry(String),
}

/// Everything a backend needs to bake one part.
#[derive(Clone, Debug)]
pub struct BakeRequest {
    pub part: String,
    pub geometry: PartGeometry,
    pub material: PartMaterial,
    /// Square output size in texels.
    pub resolution: u32,
}

impl BakeRequest {
    pub fn from_part(part: &OutfitPart, resolution: u32) -> Self {
        Self {
            part: part.name.clone(),
            geometry: part.geometry.clone(),
            material: part.material.clone(),
            resolution,
        }
    }
}

/// Result of a successful bake.
#[derive(Clone, Debug)]
pub struct BakedPart {
    pub part: String,
    pub diffuse: RgbaImage,
    /// Auxiliary channel images, same size as `diffuse`.
    pub channels: BTreeMap<String, RgbaImage>,
}

impl BakedPart {
    /// Opaque placeholder used when a bake fails.
    ///
    /// Carries no auxiliary channels, so the packer fills those with each
    /// channel's neutral texel.
    pub fn neutral(part: impl Into<String>, resolution: u32, fill: Color) -> Self {
        let [r, g, b, _] = fill.to_srgba().to_u8_array();
        Self {
            part: part.into(),
            diffuse: RgbaImage::from_pixel(resolution, resolution, Rgba([r, g, b, 255])),
            channels: BTreeMap::new(),
        }
    }

    pub fn size(&self) -> UVec2 {
        UVec2::new(self.diffuse.width(), self.diffuse.height())
    }

    /// Copy downsampled to half size in each dimension (at least 1 texel).
    pub fn halved(&self) -> Self {
        let half = |image: &RgbaImage| {
            let w = (image.width() / 2).max(1);
            let h = (image.height() / 2).max(1);
            image::imageops::resize(image, w, h, FilterType::Triangle)
        };
        Self {
            part: self.part.clone(),
            diffuse: half(&self.diffuse),
            channels: self
                .channels
                .iter()
                .map(|(name, image)| (name.clone(), half(image)))
                .collect(),
        }
    }
}

/// Sending half of a bake; consumed by whoever finishes the work.
pub struct BakeCompleter {
    sender: oneshot::Sender<Result<BakedPart, BakeError>>,
}

impl BakeCompleter {
    /// Resolve the ticket. A ticket dropped by a discarded merge is ignored.
    pub fn complete(self, result: Result<BakedPart, BakeError>) {
        let _ = self.sender.send(result);
    }

    pub fn is_canceled(&self) -> bool {
        self.sender.is_canceled()
    }
}

/// Future resolving to one part's bake.
pub struct BakeTicket {
    part: String,
    receiver: oneshot::Receiver<Result<BakedPart, BakeError>>,
}

impl BakeTicket {
    pub fn pair(part: impl Into<String>) -> (BakeCompleter, BakeTicket) {
        let (sender, receiver) = oneshot::channel();
        (
            BakeCompleter { sender },
            BakeTicket {
                part: part.into(),
                receiver,
            },
        )
    }

    pub fn part(&self) -> &str {
        &self.part
    }
}

impl Future for BakeTicket {
    type Output = Result<BakedPart, BakeError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let part = self.part.clone();
        self.receiver
            .poll_unpin(cx)
            .map(|result| result.unwrap_or(Err(BakeError::Cancelled(part))))
    }
}

/// Something that can turn a [`BakeRequest`] into pixels.
pub trait BakeBackend: Send + Sync {
    fn submit(&self, request: BakeRequest) -> BakeTicket;
}

/// Submit every request, then wait for all of them.
///
/// Results come back in request order; one failure does not affect the rest.
pub async fn bake_all(
    backend: &dyn BakeBackend,
    requests: Vec<BakeRequest>,
) -> Vec<(String, Result<BakedPart, BakeError>)> {
    let tickets: Vec<BakeTicket> = requests
        .into_iter()
        .map(|request| backend.submit(request))
        .collect();
    let names: Vec<String> = tickets.iter().map(|t| t.part.clone()).collect();
    names.into_iter().zip(join_all(tickets).await).collect()
}
