//! Validate → Bake → Pack → Merge as a single future.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

use bevy::prelude::*;
use thiserror::Error;

use super::{MergeContext, MergeSettings, SettingsError};
use crate::atlas::{AtlasPacker, AtlasSet, BakeRect, PackError, RectMap, dilate_channels};
use crate::bake::{BakeBackend, BakeRequest, BakedPart, bake_all};
use crate::geometry::{CombinedMesh, GeometryMerger};
use crate::part::OutfitPart;
use crate::skeleton::{BoneRemap, Skeleton, SkeletonUnifier};

/// Failures that abort a whole merge.
///
/// Per-part problems never end up here; they are recorded in the
/// [`MergeReport`] and the part is left out.
#[derive(Error, Debug, Clone)]
pub enum MergeError {
    #[error("Invalid merge settings: {0}")]
    Settings(#[from] SettingsError),

    #[error("Atlas packing failed: {0}")]
    Pack(#[from] PackError),

    #[error("Character '{0}' has no mergeable parts")]
    NothingToMerge(String),
}

/// Pipeline stage a part failed in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MergeStage {
    Bake,
    Validate,
    Unify,
    Geometry,
}

impl fmt::Display for MergeStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MergeStage::Bake => "bake",
            MergeStage::Validate => "validate",
            MergeStage::Unify => "unify",
            MergeStage::Geometry => "geometry",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartFailure {
    pub part: String,
    pub stage: MergeStage,
    pub cause: String,
}

/// Non-fatal events of one merge.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Parts left out of the combined mesh.
    pub dropped: Vec<PartFailure>,
    /// Parts whose region was filled with the neutral color.
    pub failed_bakes: Vec<PartFailure>,
    /// Bakes were halved to fit the atlas.
    pub shrunk: bool,
}

/// Everything a merge needs, detached from the ECS world.
#[derive(Clone, Debug)]
pub struct MergeInput {
    /// Used in log messages.
    pub character: String,
    /// Clean copy of the character's own skeleton.
    pub base: Skeleton,
    pub root_world: Mat4,
    pub parts: Vec<OutfitPart>,
}

/// Output of a successful merge.
#[derive(Clone, Debug)]
pub struct MergedCharacter {
    pub mesh: CombinedMesh,
    pub skeleton: Skeleton,
    /// Dilated atlases.
    pub atlases: AtlasSet,
    /// Rectangles of the merged parts.
    pub rects: RectMap,
    /// Custom map name → rectangle of the first part that provided it.
    pub custom_maps: BTreeMap<String, BakeRect>,
    pub report: MergeReport,
}

/// Runs merges against one bake backend and one settings snapshot.
#[derive(Clone)]
pub struct CharacterMerger {
    backend: Arc<dyn BakeBackend>,
    settings: MergeSettings,
}

impl CharacterMerger {
    pub fn new(backend: Arc<dyn BakeBackend>, settings: MergeSettings) -> Self {
        Self { backend, settings }
    }

    pub fn settings(&self) -> &MergeSettings {
        &self.settings
    }

    pub async fn merge(&self, input: MergeInput) -> Result<MergedCharacter, MergeError> {
        let settings = &self.settings;
        settings.validate()?;
        let name = input.character.clone();
        let name = name.as_str();
        if input.parts.is_empty() {
            return Err(MergeError::NothingToMerge(input.character));
        }

        let mut report = MergeReport::default();

        // Validate. Only well-formed parts with unique names reach a baker.
        let mut names = HashSet::new();
        let mut valid: Vec<&OutfitPart> = Vec::with_capacity(input.parts.len());
        for part in &input.parts {
            let result = part.validate().map_err(|e| e.to_string()).and_then(|()| {
                if names.insert(part.name.as_str()) {
                    Ok(())
                } else {
                    Err(format!("another part is already named '{}'", part.name))
                }
            });
            match result {
                Ok(()) => valid.push(part),
                Err(cause) => drop_part(name, &mut report, part, MergeStage::Validate, cause),
            }
        }
        if valid.is_empty() {
            return Err(MergeError::NothingToMerge(input.character));
        }

        // Bake
        let requests = valid
            .iter()
            .map(|p| BakeRequest::from_part(p, settings.bake_resolution))
            .collect();
        let bakes: Vec<BakedPart> = bake_all(self.backend.as_ref(), requests)
            .await
            .into_iter()
            .map(|(part, result)| match result {
                Ok(baked) => baked,
                Err(e) => {
                    warn!(
                        "Character '{}': bake of part '{}' failed, using neutral fill: {}",
                        name, part, e
                    );
                    report.failed_bakes.push(PartFailure {
                        part: part.clone(),
                        stage: MergeStage::Bake,
                        cause: e.to_string(),
                    });
                    BakedPart::neutral(part, settings.bake_resolution, settings.neutral_fill)
                }
            })
            .collect();

        // Pack
        let packed = AtlasPacker::from_settings(settings).pack(&bakes)?;
        report.shrunk = packed.shrunk;
        let atlases = dilate_channels(packed.atlases, settings.dilation_iterations).await;

        // Merge
        let mut unifier = SkeletonUnifier::new(input.base);
        let mut accepted: Vec<(&OutfitPart, BoneRemap)> = Vec::new();
        for part in valid {
            match unifier.unify(part) {
                Ok(remap) => accepted.push((part, remap)),
                Err(e) => drop_part(name, &mut report, part, MergeStage::Unify, e.to_string()),
            }
        }

        let total = accepted.iter().map(|(p, _)| p.vertex_count()).sum();
        let mut ctx = MergeContext::new(input.root_world, packed.rects, settings.merge_atlas)
            .with_total_vertices(total);
        let mut merger = GeometryMerger::new(&ctx);
        let mut merged_parts = Vec::with_capacity(accepted.len());
        for (part, remap) in &accepted {
            match merger.push_part(&mut ctx, part, remap) {
                Ok(_) => merged_parts.push(*part),
                Err(e) => drop_part(name, &mut report, part, MergeStage::Geometry, e.to_string()),
            }
        }
        if merged_parts.is_empty() {
            return Err(MergeError::NothingToMerge(input.character));
        }

        let skeleton = unifier.into_skeleton();
        let mesh = merger.finish(&ctx, &skeleton);

        let rects: RectMap = ctx
            .rects
            .into_iter()
            .filter(|(part, _)| mesh.part_ranges.contains_key(part))
            .collect();
        let mut custom_maps = BTreeMap::new();
        for part in &merged_parts {
            for map in part.material.custom_map_names() {
                if let Some(rect) = rects.get(&part.name) {
                    custom_maps.entry(map.to_string()).or_insert(*rect);
                }
            }
        }

        info!(
            "Character '{}': merged {} of {} parts into {} vertices, {} bones",
            name,
            merged_parts.len(),
            input.parts.len(),
            mesh.vertex_count(),
            skeleton.len()
        );

        Ok(MergedCharacter {
            mesh,
            skeleton,
            atlases,
            rects,
            custom_maps,
            report,
        })
    }
}

fn drop_part(
    character: &str,
    report: &mut MergeReport,
    part: &OutfitPart,
    stage: MergeStage,
    cause: String,
) {
    warn!(
        "Character '{}': dropping part '{}' at {} stage: {}",
        character, part.name, stage, cause
    );
    report.dropped.push(PartFailure {
        part: part.name.clone(),
        stage,
        cause,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bake::{BakeError, BakeTicket, SoftwareBaker};
    use crate::part::{NORMAL_CHANNEL, PartMaterial, TintedMaterial};
    use crate::testing::{base_skeleton, foreign_part, rigged_part, solid, tinted};
    use bevy::tasks::block_on;

    /// Fails every bake for the named part, bakes the rest in software.
    struct FlakyBaker(&'static str);

    impl BakeBackend for FlakyBaker {
        fn submit(&self, request: BakeRequest) -> BakeTicket {
            if request.part == self.0 {
                let (completer, ticket) = BakeTicket::pair(&request.part);
                completer.complete(Err(BakeError::Readback {
                    part: request.part,
                    reason: "device lost".into(),
                }));
                ticket
            } else {
                SoftwareBaker.submit(request)
            }
        }
    }

    fn settings() -> MergeSettings {
        MergeSettings::default()
            .with_atlas_size(256)
            .with_bake_resolution(32)
            .with_padding(2)
            .with_dilation_iterations(2)
    }

    fn input(parts: Vec<OutfitPart>) -> MergeInput {
        MergeInput {
            character: "hero".into(),
            base: base_skeleton(50),
            root_world: Mat4::IDENTITY,
            parts,
        }
    }

    fn run(
        backend: impl BakeBackend + 'static,
        settings: MergeSettings,
        parts: Vec<OutfitPart>,
    ) -> Result<MergedCharacter, MergeError> {
        let merger = CharacterMerger::new(Arc::new(backend), settings);
        block_on(merger.merge(input(parts)))
    }

    fn outfit() -> Vec<OutfitPart> {
        let base = base_skeleton(50);
        vec![
            rigged_part("body", 1000, &base, &["root", "hips", "spine_1"])
                .with_material(tinted(Color::srgb(0.8, 0.6, 0.5))),
            rigged_part("shirt", 500, &base, &["spine_1", "spine_2"]).with_material(
                PartMaterial::Tinted(
                    TintedMaterial::new(Color::WHITE)
                        .with_normal_map(solid(8, 8, [120, 130, 250, 255]))
                        .with_custom_map("fabric_mask", solid(8, 8, [255, 0, 0, 255])),
                ),
            ),
            foreign_part("horns", 200, 7, 10, "head"),
        ]
    }

    #[test]
    fn test_merge_end_to_end() {
        let merged = run(SoftwareBaker, settings(), outfit()).unwrap();

        assert_eq!(merged.mesh.vertex_count(), 1700);
        assert_eq!(merged.skeleton.len(), 60);
        assert_eq!(merged.rects.len(), 3);
        assert_eq!(merged.custom_maps["fabric_mask"], merged.rects["shirt"]);
        assert!(merged.report.dropped.is_empty());
        assert!(!merged.report.shrunk);

        // Every channel spans the atlas, and the body's region carries its bake.
        let normal = merged.atlases.channel(NORMAL_CHANNEL).unwrap();
        assert_eq!(normal.dimensions(), (256, 256));
        let body = merged.rects["body"].pixels;
        assert_eq!(merged.atlases.diffuse.get_pixel(body.x + 4, body.y + 4).0[3], 255);
    }

    #[test]
    fn test_unmergeable_part_is_dropped() {
        let mut parts = outfit();
        let mut orphan = foreign_part("orphan", 20, 9, 2, "head");
        orphan.attach_point = None;
        parts.push(orphan);
        let merged = run(SoftwareBaker, settings(), parts).unwrap();

        assert_eq!(merged.mesh.vertex_count(), 1700);
        assert!(!merged.rects.contains_key("orphan"));
        assert_eq!(merged.report.dropped.len(), 1);
        assert_eq!(merged.report.dropped[0].part, "orphan");
        assert_eq!(merged.report.dropped[0].stage, MergeStage::Unify);
    }

    #[test]
    fn test_duplicate_part_name_is_dropped() {
        let base = base_skeleton(50);
        let mut parts = outfit();
        parts.push(rigged_part("hat", 8, &base, &["head"]));
        parts.push(rigged_part("hat", 12, &base, &["head"]));
        let merged = run(SoftwareBaker, settings(), parts).unwrap();

        assert_eq!(merged.mesh.vertex_count(), 1708);
        assert!(merged.rects.contains_key("hat"));
        assert_eq!(merged.report.dropped.len(), 1);
        assert_eq!(merged.report.dropped[0].part, "hat");
        assert_eq!(merged.report.dropped[0].stage, MergeStage::Validate);
    }

    #[test]
    fn test_malformed_part_never_reaches_baker() {
        let base = base_skeleton(50);
        let mut bad_index = rigged_part("gloves", 8, &base, &["hips"]);
        bad_index.geometry.submeshes[0].extend_from_slice(&[0, 1, 99]);
        let mut short_uvs = rigged_part("belt", 8, &base, &["hips"]);
        short_uvs.geometry.uv0.truncate(3);

        let mut parts = outfit();
        parts.push(bad_index);
        parts.push(short_uvs);
        let merged = run(SoftwareBaker, settings(), parts).unwrap();

        assert_eq!(merged.mesh.vertex_count(), 1700);
        assert!(merged.report.failed_bakes.is_empty());
        let dropped: Vec<_> = merged
            .report
            .dropped
            .iter()
            .map(|f| (f.part.as_str(), f.stage))
            .collect();
        assert_eq!(
            dropped,
            vec![("gloves", MergeStage::Validate), ("belt", MergeStage::Validate)]
        );
    }

    #[test]
    fn test_failed_bake_uses_neutral_fill() {
        let merged = run(FlakyBaker("shirt"), settings(), outfit()).unwrap();

        assert_eq!(merged.report.failed_bakes.len(), 1);
        assert_eq!(merged.mesh.vertex_count(), 1700);
        let shirt = merged.rects["shirt"].pixels;
        let neutral = BakedPart::neutral("shirt", 1, settings().neutral_fill);
        assert_eq!(
            merged.atlases.diffuse.get_pixel(shirt.x + 1, shirt.y + 1),
            neutral.diffuse.get_pixel(0, 0)
        );
    }

    #[test]
    fn test_overflow_after_retry_is_fatal() {
        let settings = settings()
            .with_atlas_size(64)
            .with_bake_resolution(64)
            .with_padding(20);
        let result = run(SoftwareBaker, settings, outfit());
        assert!(matches!(result, Err(MergeError::Pack(PackError::Overflow { .. }))));
    }

    #[test]
    fn test_shrink_retry_reported() {
        let settings = MergeSettings::default()
            .with_atlas_size(2048)
            .with_bake_resolution(512)
            .with_padding(200)
            .with_dilation_iterations(1);
        let base = base_skeleton(50);
        let parts = ["body", "boots", "hair", "hat", "shirt"]
            .iter()
            .map(|n| rigged_part(n, 8, &base, &["hips"]))
            .collect();
        let merged = run(SoftwareBaker, settings, parts).unwrap();

        assert!(merged.report.shrunk);
        assert!(merged.rects.values().all(|r| r.pixels.width == 256));
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let settings = settings().with_atlas_size(300);
        assert!(matches!(
            run(SoftwareBaker, settings, outfit()),
            Err(MergeError::Settings(_))
        ));
        assert!(matches!(
            run(SoftwareBaker, self::settings(), Vec::new()),
            Err(MergeError::NothingToMerge(_))
        ));
    }
}
