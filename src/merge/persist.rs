//! On-disk form of a merged character.
//!
//! A save named `hero` in `dir` writes:
//! - `hero_Mesh.json`: combined mesh plus the master bone list
//! - `hero_D.png`: diffuse atlas
//! - `hero_{channel}.png`: one per auxiliary atlas
//! - `hero_Mat.json`: image file names, rect map and custom maps

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use bevy::prelude::*;
use image::{ImageFormat, RgbaImage};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::MergedCharacter;
use crate::atlas::{AtlasSet, BakeRect, RectMap};
use crate::geometry::CombinedMesh;
use crate::skeleton::{Bone, Skeleton, SkeletonError};

#[derive(Error, Debug)]
pub enum PersistError {
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error in '{path}': {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Image error in '{path}': {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("Saved character '{name}' is inconsistent: {reason}")]
    Corrupt { name: String, reason: String },
}

/// Files written by one save.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PersistedPaths {
    pub mesh: PathBuf,
    pub material: PathBuf,
    /// Channel name (`D` for diffuse) → PNG path.
    pub images: BTreeMap<String, PathBuf>,
}

impl PersistedPaths {
    pub fn all(&self) -> Vec<PathBuf> {
        let mut paths = vec![self.mesh.clone(), self.material.clone()];
        paths.extend(self.images.values().cloned());
        paths
    }
}

#[derive(Serialize, Deserialize)]
struct MeshFile {
    mesh: CombinedMesh,
    bones: Vec<Bone>,
}

#[derive(Serialize, Deserialize)]
struct MaterialFile {
    atlas_size: u32,
    diffuse: String,
    channels: BTreeMap<String, String>,
    rects: RectMap,
    custom_maps: BTreeMap<String, BakeRect>,
}

const DIFFUSE_SUFFIX: &str = "D";

/// Write every asset of `merged` under `dir`, creating it if needed.
pub fn save_character(
    merged: &MergedCharacter,
    dir: &Path,
    name: &str,
) -> Result<PersistedPaths, PersistError> {
    fs::create_dir_all(dir).map_err(|source| PersistError::Io {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut paths = PersistedPaths {
        mesh: dir.join(format!("{name}_Mesh.json")),
        material: dir.join(format!("{name}_Mat.json")),
        images: BTreeMap::new(),
    };

    write_json(
        &paths.mesh,
        &MeshFile {
            mesh: merged.mesh.clone(),
            bones: merged.skeleton.bones().to_vec(),
        },
    )?;

    let diffuse = format!("{name}_{DIFFUSE_SUFFIX}.png");
    write_png(&dir.join(&diffuse), &merged.atlases.diffuse)?;
    paths.images.insert(DIFFUSE_SUFFIX.to_string(), dir.join(&diffuse));

    let mut channels = BTreeMap::new();
    for (channel, atlas) in &merged.atlases.channels {
        let file = format!("{name}_{channel}.png");
        write_png(&dir.join(&file), atlas)?;
        paths.images.insert(channel.clone(), dir.join(&file));
        channels.insert(channel.clone(), file);
    }

    write_json(
        &paths.material,
        &MaterialFile {
            atlas_size: merged.atlases.size(),
            diffuse,
            channels,
            rects: merged.rects.clone(),
            custom_maps: merged.custom_maps.clone(),
        },
    )?;

    info!(
        "Saved merged character '{}' to '{}' ({} files)",
        name,
        dir.display(),
        paths.all().len()
    );
    Ok(paths)
}

/// A merged character read back from disk.
#[derive(Clone, Debug)]
pub struct PersistedCharacter {
    pub mesh: CombinedMesh,
    pub skeleton: Skeleton,
    pub atlases: AtlasSet,
    pub rects: RectMap,
    pub custom_maps: BTreeMap<String, BakeRect>,
}

impl PersistedCharacter {
    pub fn load(dir: &Path, name: &str) -> Result<Self, PersistError> {
        let corrupt = |reason: String| PersistError::Corrupt {
            name: name.to_string(),
            reason,
        };

        let MeshFile { mesh, bones } = read_json(&dir.join(format!("{name}_Mesh.json")))?;
        let skeleton = Skeleton::from_bind_pose(bones)
            .map_err(|e: SkeletonError| corrupt(e.to_string()))?;
        if mesh.inverse_bindposes.len() != skeleton.len() {
            return Err(corrupt(format!(
                "{} bind poses for {} bones",
                mesh.inverse_bindposes.len(),
                skeleton.len()
            )));
        }

        let material: MaterialFile = read_json(&dir.join(format!("{name}_Mat.json")))?;
        let diffuse = read_png(&dir.join(&material.diffuse))?;
        let mut channels = BTreeMap::new();
        for (channel, file) in &material.channels {
            channels.insert(channel.clone(), read_png(&dir.join(file))?);
        }
        let atlases = AtlasSet { diffuse, channels };
        let size = material.atlas_size;
        if atlases.diffuse.dimensions() != (size, size)
            || atlases.channels.values().any(|c| c.dimensions() != (size, size))
        {
            return Err(corrupt(format!("atlas images are not {size}x{size}")));
        }

        Ok(Self {
            mesh,
            skeleton,
            atlases,
            rects: material.rects,
            custom_maps: material.custom_maps,
        })
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), PersistError> {
    let file = File::create(path).map_err(|source| PersistError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer(&mut writer, value).map_err(|source| PersistError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    writer.flush().map_err(|source| PersistError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, PersistError> {
    let file = File::open(path).map_err(|source| PersistError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_reader(BufReader::new(file)).map_err(|source| PersistError::Json {
        path: path.to_path_buf(),
        source,
    })
}

fn write_png(path: &Path, image: &RgbaImage) -> Result<(), PersistError> {
    image
        .save_with_format(path, ImageFormat::Png)
        .map_err(|source| PersistError::Image {
            path: path.to_path_buf(),
            source,
        })
}

fn read_png(path: &Path) -> Result<RgbaImage, PersistError> {
    image::open(path)
        .map(|image| image.into_rgba8())
        .map_err(|source| PersistError::Image {
            path: path.to_path_buf(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bevy::tasks::block_on;

    use super::*;
    use crate::bake::SoftwareBaker;
    use crate::merge::{CharacterMerger, MergeInput, MergeSettings};
    use crate::part::{BlendShape, BlendShapeFrame, PartMaterial, TintedMaterial};
    use crate::testing::{base_skeleton, foreign_part, rigged_part, solid};

    fn merged() -> MergedCharacter {
        let base = base_skeleton(12);
        let body = rigged_part("body", 40, &base, &["hips", "spine_1"]).with_blend_shape(
            BlendShape::new("Smile", vec![BlendShapeFrame::positions(1.0, vec![[0.0, 0.1, 0.0]; 40])]),
        );
        let cape = rigged_part("cape", 20, &base, &["spine_2"]).with_material(
            PartMaterial::Tinted(
                TintedMaterial::new(Color::WHITE)
                    .with_normal_map(solid(4, 4, [100, 140, 250, 255]))
                    .with_custom_map("emission", solid(4, 4, [10, 20, 30, 255])),
            ),
        );
        let tail = foreign_part("tail", 12, 3, 4, "hips");
        let merger = CharacterMerger::new(
            Arc::new(SoftwareBaker),
            MergeSettings::default()
                .with_atlas_size(128)
                .with_bake_resolution(32)
                .with_dilation_iterations(1),
        );
        block_on(merger.merge(MergeInput {
            character: "hero".into(),
            base,
            root_world: Mat4::from_translation(Vec3::new(1.0, 0.0, 0.0)),
            parts: vec![body, cape, tail],
        }))
        .unwrap()
    }

    #[test]
    fn test_save_writes_named_files() {
        let dir = tempfile::tempdir().unwrap();
        let paths = save_character(&merged(), dir.path(), "hero").unwrap();

        assert_eq!(paths.mesh, dir.path().join("hero_Mesh.json"));
        assert_eq!(paths.material, dir.path().join("hero_Mat.json"));
        assert_eq!(paths.images["D"], dir.path().join("hero_D.png"));
        assert_eq!(paths.images["normal"], dir.path().join("hero_normal.png"));
        assert_eq!(paths.images["emission"], dir.path().join("hero_emission.png"));
        assert!(paths.all().iter().all(|p| p.exists()));
    }

    #[test]
    fn test_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let merged = merged();
        save_character(&merged, dir.path(), "hero").unwrap();
        let loaded = PersistedCharacter::load(dir.path(), "hero").unwrap();

        assert_eq!(loaded.mesh.vertex_count(), merged.mesh.vertex_count());
        assert_eq!(loaded.mesh.joint_indices, merged.mesh.joint_indices);
        assert_eq!(loaded.mesh.submeshes, merged.mesh.submeshes);
        assert_eq!(loaded.mesh.part_ranges, merged.mesh.part_ranges);
        assert_eq!(loaded.mesh.morph_target_names(), vec!["Smile"]);
        assert_eq!(loaded.skeleton.len(), merged.skeleton.len());
        assert_eq!(loaded.skeleton.index_of("tail_0"), merged.skeleton.index_of("tail_0"));
        assert!(
            loaded.skeleton.bones()[0]
                .world
                .abs_diff_eq(merged.skeleton.bones()[0].world, 1e-6)
        );
        assert_eq!(loaded.rects, merged.rects);
        assert_eq!(loaded.custom_maps, merged.custom_maps);
        // PNG is lossless.
        assert_eq!(loaded.atlases.diffuse, merged.atlases.diffuse);
        assert_eq!(loaded.atlases.channels, merged.atlases.channels);
    }

    #[test]
    fn test_load_missing_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            PersistedCharacter::load(dir.path(), "ghost"),
            Err(PersistError::Io { .. })
        ));
    }

    #[test]
    fn test_mismatched_atlas_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let paths = save_character(&merged(), dir.path(), "hero").unwrap();
        RgbaImage::new(8, 8)
            .save_with_format(&paths.images["D"], ImageFormat::Png)
            .unwrap();
        assert!(matches!(
            PersistedCharacter::load(dir.path(), "hero"),
            Err(PersistError::Corrupt { .. })
        ));
    }
}
