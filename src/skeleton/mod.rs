//! Bone hierarchy shared by every part of a merged character.
//!
//! Bones are identified by name. The [`SkeletonUnifier`] relies on that to
//! fold every part's bone list into one master skeleton.

use std::collections::HashMap;

use bevy::prelude::*;
#[cfg(feature = "persist")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod unifier;

pub use unifier::{BoneRemap, SkeletonUnifier, UnifyError};

/// Identity of the bone objects a part was skinned against.
///
/// Parts skinned to the character's own rig share [`SkeletonId::BASE`]. Parts
/// that bring their own rig (a tail, a cape with extra bones) use a distinct
/// id; two foreign rigs with the same id are treated as the same bones.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SkeletonId(pub u64);

impl SkeletonId {
    pub const BASE: SkeletonId = SkeletonId(0);

    pub fn is_base(self) -> bool {
        self == Self::BASE
    }
}

/// A named rigid transform node.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "persist", derive(Serialize, Deserialize))]
pub struct Bone {
    pub name: String,
    pub parent: Option<usize>,
    /// Transform relative to the parent bone.
    pub local: Transform,
    /// Bind-time local-to-world matrix.
    pub world: Mat4,
}

impl Bone {
    pub fn new(name: impl Into<String>, parent: Option<usize>, local: Transform) -> Self {
        Self {
            name: name.into(),
            parent,
            local,
            world: Mat4::IDENTITY,
        }
    }

    pub fn local_matrix(&self) -> Mat4 {
        Mat4::from_scale_rotation_translation(
            self.local.scale,
            self.local.rotation,
            self.local.translation,
        )
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SkeletonError {
    #[error("Duplicate bone name '{0}'")]
    DuplicateName(String),

    #[error("Bone '{bone}' references parent {parent} which is out of range or itself")]
    InvalidParent { bone: String, parent: usize },

    #[error("Bone hierarchy contains a cycle through '{0}'")]
    Cycle(String),
}

/// Ordered bone list with a name lookup.
#[derive(Clone, Debug, Default)]
pub struct Skeleton {
    bones: Vec<Bone>,
    name_to_index: HashMap<String, usize>,
}

impl Skeleton {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from bones, validating names and parent links, and compute world
    /// matrices under `root`.
    pub fn from_bones(bones: Vec<Bone>, root: Mat4) -> Result<Self, SkeletonError> {
        let mut skeleton = Self::from_bind_pose(bones)?;
        skeleton.recompute_world(root);
        Ok(skeleton)
    }

    /// Build from bones whose world matrices are already set.
    pub fn from_bind_pose(bones: Vec<Bone>) -> Result<Self, SkeletonError> {
        let mut skeleton = Self::new();
        for bone in bones {
            if skeleton.name_to_index.contains_key(&bone.name) {
                return Err(SkeletonError::DuplicateName(bone.name));
            }
            skeleton.push(bone);
        }
        let count = skeleton.bones.len();
        for (i, bone) in skeleton.bones.iter().enumerate() {
            if let Some(parent) = bone.parent {
                if parent >= count || parent == i {
                    return Err(SkeletonError::InvalidParent {
                        bone: bone.name.clone(),
                        parent,
                    });
                }
            }
        }
        for i in 0..count {
            if skeleton.depth(i).is_none() {
                return Err(SkeletonError::Cycle(skeleton.bones[i].name.clone()));
            }
        }
        Ok(skeleton)
    }

    /// Append a bone and return its index.
    ///
    /// The caller is responsible for name uniqueness.
    pub fn push(&mut self, bone: Bone) -> usize {
        let index = self.bones.len();
        debug_assert!(
            !self.name_to_index.contains_key(&bone.name),
            "Bone name '{}' already present",
            bone.name
        );
        self.name_to_index.insert(bone.name.clone(), index);
        self.bones.push(bone);
        index
    }

    /// Replace a bone's parent-relative transform, leaving world matrices as
    /// they are.
    pub fn set_local(&mut self, index: usize, local: Transform) {
        if let Some(bone) = self.bones.get_mut(index) {
            bone.local = local;
        }
    }

    pub fn len(&self) -> usize {
        self.bones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bones.is_empty()
    }

    pub fn bones(&self) -> &[Bone] {
        &self.bones
    }

    pub fn get(&self, index: usize) -> Option<&Bone> {
        self.bones.get(index)
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.name_to_index.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.name_to_index.contains_key(name)
    }

    /// Local transform of the named bone.
    pub fn bone_transform(&self, name: &str) -> Option<Transform> {
        self.index_of(name).map(|i| self.bones[i].local)
    }

    /// Recompute every bone's world matrix from local transforms.
    pub fn recompute_world(&mut self, root: Mat4) {
        let mut order: Vec<usize> = (0..self.bones.len()).collect();
        order.sort_by_key(|&i| self.depth(i).unwrap_or(usize::MAX));
        for i in order {
            let parent_world = self.bones[i]
                .parent
                .map(|p| self.bones[p].world)
                .unwrap_or(root);
            self.bones[i].world = parent_world * self.bones[i].local_matrix();
        }
    }

    /// Number of ancestors, `None` if the parent chain loops.
    pub fn depth(&self, index: usize) -> Option<usize> {
        let mut depth = 0;
        let mut current = self.bones.get(index)?.parent;
        while let Some(p) = current {
            depth += 1;
            if depth > self.bones.len() {
                return None;
            }
            current = self.bones.get(p)?.parent;
        }
        Some(depth)
    }

    /// True if `ancestor` is a (transitive) parent of `bone`.
    pub fn is_ancestor(&self, ancestor: usize, bone: usize) -> bool {
        let mut current = self.bones.get(bone).and_then(|b| b.parent);
        let mut steps = 0;
        while let Some(p) = current {
            if p == ancestor {
                return true;
            }
            steps += 1;
            if steps > self.bones.len() {
                return false;
            }
            current = self.bones.get(p).and_then(|b| b.parent);
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(names: &[&str]) -> Vec<Bone> {
        names
            .iter()
            .enumerate()
            .map(|(i, n)| {
                Bone::new(
                    *n,
                    i.checked_sub(1),
                    Transform::from_xyz(0.0, 1.0, 0.0),
                )
            })
            .collect()
    }

    #[test]
    fn test_world_matrices_accumulate() {
        let skeleton = Skeleton::from_bones(chain(&["root", "spine", "head"]), Mat4::IDENTITY)
            .unwrap();
        let head = &skeleton.bones()[skeleton.index_of("head").unwrap()];
        let position = head.world.transform_point3(Vec3::ZERO);
        assert!((position - Vec3::new(0.0, 3.0, 0.0)).length() < 1e-5);
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let result = Skeleton::from_bones(chain(&["a", "a"]), Mat4::IDENTITY);
        assert_eq!(result.unwrap_err(), SkeletonError::DuplicateName("a".into()));
    }

    #[test]
    fn test_cycle_rejected() {
        let mut bones = chain(&["a", "b"]);
        bones[0].parent = Some(1);
        assert!(matches!(
            Skeleton::from_bones(bones, Mat4::IDENTITY),
            Err(SkeletonError::Cycle(_))
        ));
    }

    #[test]
    fn test_is_ancestor() {
        let skeleton =
            Skeleton::from_bones(chain(&["root", "spine", "head"]), Mat4::IDENTITY).unwrap();
        assert!(skeleton.is_ancestor(0, 2));
        assert!(!skeleton.is_ancestor(2, 0));
        assert_eq!(skeleton.depth(2), Some(2));
        assert_eq!(
            skeleton.bone_transform("spine"),
            Some(Transform::from_xyz(0.0, 1.0, 0.0))
        );
    }
}
