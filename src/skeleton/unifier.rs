//! Folding every part's bone list into one master skeleton.

use std::collections::{HashMap, HashSet};

use bevy::prelude::*;
use thiserror::Error;

use super::{Bone, Skeleton, SkeletonId};
use crate::part::OutfitPart;

/// Reasons a part cannot join the master skeleton.
///
/// All of these drop the affected part only; the rest of the merge continues.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UnifyError {
    #[error("Part '{part}' has no bones matching the skeleton and no attach point")]
    Unmergeable { part: String },

    #[error("Part '{part}' attach point '{bone}' does not exist in the skeleton")]
    AttachPointNotFound { part: String, bone: String },

    #[error("Part '{part}' vertex {vertex} references bone {index} but only has {bone_count} bones")]
    UnresolvedBoneIndex {
        part: String,
        vertex: usize,
        index: u16,
        bone_count: usize,
    },

    #[error("Part '{part}' bone '{bone}' has invalid parent {parent}")]
    InvalidParent {
        part: String,
        bone: String,
        parent: usize,
    },

    #[error("Part '{part}' bone '{bone}' is part of a parent cycle")]
    ParentCycle { part: String, bone: String },

    #[error("Master skeleton would exceed {max} bones")]
    TooManyBones { max: usize },
}

/// Part-local bone index → master bone index.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BoneRemap(pub Vec<u16>);

impl BoneRemap {
    #[inline]
    pub fn get(&self, local: u16) -> Option<u16> {
        self.0.get(local as usize).copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Builds one master bone list from the base skeleton and every part.
///
/// Name lookups follow these rules:
/// - a name owned by the base skeleton is always shared;
/// - a name owned by the same foreign skeleton (same [`SkeletonId`]) is shared;
/// - a name owned by an unrelated foreign skeleton is a collision, and the new
///   bone is appended under a counter-suffixed name (`name.1`, `name.2`, ...).
pub struct SkeletonUnifier {
    master: Skeleton,
    owners: Vec<SkeletonId>,
    foreign: HashMap<(SkeletonId, String), usize>,
}

enum Slot {
    Shared(usize),
    Appended { name: String },
}

impl SkeletonUnifier {
    pub fn new(base: Skeleton) -> Self {
        let owners = vec![SkeletonId::BASE; base.len()];
        Self {
            master: base,
            owners,
            foreign: HashMap::new(),
        }
    }

    pub fn master(&self) -> &Skeleton {
        &self.master
    }

    pub fn into_skeleton(self) -> Skeleton {
        self.master
    }

    /// Resolve one part against the master skeleton, appending foreign bones.
    ///
    /// On error the master skeleton is left untouched.
    pub fn unify(&mut self, part: &OutfitPart) -> Result<BoneRemap, UnifyError> {
        if part.is_static() {
            return self.unify_static(part);
        }

        Self::check_weights(part)?;

        let attach = match &part.attach_point {
            Some(bone) => Some(self.master.index_of(bone).ok_or_else(|| {
                UnifyError::AttachPointNotFound {
                    part: part.name.clone(),
                    bone: bone.clone(),
                }
            })?),
            None => None,
        };

        // Names picked for this part's appended bones, so two bones of one
        // part colliding with the same name get distinct suffixes.
        let mut reserved = HashSet::new();
        let mut slots = Vec::with_capacity(part.bones.len());
        for bone in &part.bones {
            let slot = self.resolve(part.skeleton_id, &bone.name, &reserved);
            if let Slot::Appended { name } = &slot {
                reserved.insert(name.clone());
            }
            slots.push(slot);
        }

        let matched = slots.iter().filter(|s| matches!(s, Slot::Shared(_))).count();
        if matched == 0 && attach.is_none() {
            return Err(UnifyError::Unmergeable {
                part: part.name.clone(),
            });
        }

        // Appended bones get their indices up front: a parent may come after
        // its child in the part's list.
        let mut next = self.master.len();
        let mut remap = Vec::with_capacity(slots.len());
        for slot in &slots {
            match slot {
                Slot::Shared(index) => remap.push(*index),
                Slot::Appended { .. } => {
                    remap.push(next);
                    next += 1;
                }
            }
        }
        if next > u16::MAX as usize {
            return Err(UnifyError::TooManyBones {
                max: u16::MAX as usize,
            });
        }

        let mut appended = Vec::new();
        for (local, (slot, bone)) in slots.iter().zip(&part.bones).enumerate() {
            let Slot::Appended { name } = slot else {
                continue;
            };
            let parent = match bone.parent {
                Some(p) if p < part.bones.len() && p != local => remap[p],
                Some(p) => {
                    return Err(UnifyError::InvalidParent {
                        part: part.name.clone(),
                        bone: bone.name.clone(),
                        parent: p,
                    });
                }
                None => match attach {
                    Some(a) => a,
                    None => {
                        warn!(
                            "Part '{}': foreign root bone '{}' has no attach point, parenting to '{}'",
                            part.name,
                            bone.name,
                            self.master.bones()[0].name
                        );
                        0
                    }
                },
            };
            if *name != bone.name {
                warn!(
                    "Part '{}': bone '{}' collides with an unrelated skeleton, renamed to '{}'",
                    part.name, bone.name, name
                );
            }
            appended.push((bone, name.clone(), parent));
        }
        Self::check_appended_cycles(part, &slots)?;

        // Push in list order so indices match the remap, then derive local
        // transforms once every parent exists.
        let first = self.master.len();
        let added = appended.len();
        for (bone, name, parent) in appended {
            let index = self.master.push(Bone {
                name,
                parent: Some(parent),
                local: Transform::IDENTITY,
                world: bone.world,
            });
            self.foreign.insert((part.skeleton_id, bone.name.clone()), index);
            self.owners.push(part.skeleton_id);
        }
        for index in first..first + added {
            self.rebase_local(index);
        }

        if added > 0 {
            debug!(
                "Part '{}': shared {} bones, appended {} foreign bones",
                part.name, matched, added
            );
        }

        Ok(BoneRemap(remap.into_iter().map(|i| i as u16).collect()))
    }

    fn unify_static(&self, part: &OutfitPart) -> Result<BoneRemap, UnifyError> {
        let Some(bone) = &part.attach_point else {
            return Err(UnifyError::Unmergeable {
                part: part.name.clone(),
            });
        };
        let index = self
            .master
            .index_of(bone)
            .ok_or_else(|| UnifyError::AttachPointNotFound {
                part: part.name.clone(),
                bone: bone.clone(),
            })?;
        Ok(BoneRemap(vec![index as u16]))
    }

    fn check_weights(part: &OutfitPart) -> Result<(), UnifyError> {
        let bone_count = part.bones.len();
        for (vertex, weights) in part.geometry.bone_weights.iter().enumerate() {
            if let Some((index, _)) = weights
                .influences()
                .find(|&(i, _)| i as usize >= bone_count)
            {
                return Err(UnifyError::UnresolvedBoneIndex {
                    part: part.name.clone(),
                    vertex,
                    index,
                    bone_count,
                });
            }
        }
        Ok(())
    }

    /// Reject parts whose appended bones loop through each other.
    fn check_appended_cycles(part: &OutfitPart, slots: &[Slot]) -> Result<(), UnifyError> {
        for (local, bone) in part.bones.iter().enumerate() {
            if !matches!(slots[local], Slot::Appended { .. }) {
                continue;
            }
            let mut current = bone.parent;
            let mut steps = 0;
            while let Some(p) = current {
                if matches!(slots[p], Slot::Shared(_)) {
                    break;
                }
                steps += 1;
                if steps > part.bones.len() {
                    return Err(UnifyError::ParentCycle {
                        part: part.name.clone(),
                        bone: bone.name.clone(),
                    });
                }
                current = part.bones[p].parent;
            }
        }
        Ok(())
    }

    fn resolve(&self, skeleton: SkeletonId, name: &str, reserved: &HashSet<String>) -> Slot {
        if let Some(&index) = self.foreign.get(&(skeleton, name.to_string())) {
            return Slot::Shared(index);
        }
        match self.master.index_of(name) {
            Some(index) if self.owners[index].is_base() || self.owners[index] == skeleton => {
                Slot::Shared(index)
            }
            Some(_) => Slot::Appended {
                name: self.disambiguate(name, reserved),
            },
            None if reserved.contains(name) => Slot::Appended {
                name: self.disambiguate(name, reserved),
            },
            None => Slot::Appended {
                name: name.to_string(),
            },
        }
    }

    fn disambiguate(&self, name: &str, reserved: &HashSet<String>) -> String {
        (1..)
            .map(|n| format!("{name}.{n}"))
            .find(|candidate| !self.master.contains(candidate) && !reserved.contains(candidate))
            .unwrap_or_else(|| name.to_string())
    }

    fn rebase_local(&mut self, index: usize) {
        let bone = &self.master.bones()[index];
        let parent_world = bone
            .parent
            .map_or(Mat4::IDENTITY, |p| self.master.bones()[p].world);
        let local = Transform::from_matrix(parent_world.inverse() * bone.world);
        self.master.set_local(index, local);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::part::BoneWeights;
    use crate::testing::{base_skeleton, foreign_chain, rigged_part, strip};

    #[test]
    fn test_shared_bones_are_not_duplicated() {
        let base = base_skeleton(50);
        let mut unifier = SkeletonUnifier::new(base.clone());
        let part = rigged_part("shirt", 100, &base, &["spine_1", "spine_2"]);

        let remap = unifier.unify(&part).unwrap();
        assert_eq!(unifier.master().len(), 50);
        assert_eq!(
            remap.0,
            vec![
                base.index_of("spine_1").unwrap() as u16,
                base.index_of("spine_2").unwrap() as u16
            ]
        );
    }

    #[test]
    fn test_foreign_skeleton_attached_under_attach_point() {
        let base = base_skeleton(50);
        let mut unifier = SkeletonUnifier::new(base.clone());
        let part = OutfitPart::new("horns", strip(20))
            .with_bones(SkeletonId(7), foreign_chain("horn", 10))
            .with_attach_point("head");

        let remap = unifier.unify(&part).unwrap();
        let master = unifier.master();
        let head = master.index_of("head").unwrap();

        assert_eq!(master.len(), 60);
        assert_eq!(remap.len(), 10);
        for &index in &remap.0 {
            assert!((index as usize) >= 50);
            assert!(master.is_ancestor(head, index as usize));
        }
    }

    #[test]
    fn test_same_foreign_skeleton_is_shared() {
        let base = base_skeleton(10);
        let mut unifier = SkeletonUnifier::new(base);
        let tail = OutfitPart::new("tail", strip(8))
            .with_bones(SkeletonId(3), foreign_chain("tail", 4))
            .with_attach_point("hips");
        let tail_tip = OutfitPart::new("tail_tip", strip(8))
            .with_bones(SkeletonId(3), foreign_chain("tail", 4))
            .with_attach_point("hips");

        let first = unifier.unify(&tail).unwrap();
        let second = unifier.unify(&tail_tip).unwrap();
        assert_eq!(first, second);
        assert_eq!(unifier.master().len(), 14);
    }

    #[test]
    fn test_unrelated_foreign_collision_gets_suffix() {
        let base = base_skeleton(10);
        let mut unifier = SkeletonUnifier::new(base);
        let cape = OutfitPart::new("cape", strip(8))
            .with_bones(SkeletonId(1), foreign_chain("cloth", 2))
            .with_attach_point("spine_1");
        let skirt = OutfitPart::new("skirt", strip(8))
            .with_bones(SkeletonId(2), foreign_chain("cloth", 2))
            .with_attach_point("hips");

        unifier.unify(&cape).unwrap();
        let remap = unifier.unify(&skirt).unwrap();
        let master = unifier.master();

        assert_eq!(master.len(), 14);
        assert!(master.contains("cloth_0.1"));
        assert!(master.contains("cloth_1.1"));
        assert_eq!(
            master.bones()[remap.0[0] as usize].name,
            "cloth_0.1".to_string()
        );
        // Collided chain keeps its own internal parent link.
        assert_eq!(
            master.bones()[remap.0[1] as usize].parent,
            Some(remap.0[0] as usize)
        );
    }

    #[test]
    fn test_no_match_and_no_attach_point_is_unmergeable() {
        let base = base_skeleton(10);
        let mut unifier = SkeletonUnifier::new(base);
        let part = OutfitPart::new("orphan", strip(8))
            .with_bones(SkeletonId(9), foreign_chain("x", 3));

        assert_eq!(
            unifier.unify(&part),
            Err(UnifyError::Unmergeable {
                part: "orphan".into()
            })
        );
        assert_eq!(unifier.master().len(), 10);
    }

    #[test]
    fn test_unresolved_weight_index_leaves_master_untouched() {
        let base = base_skeleton(10);
        let mut unifier = SkeletonUnifier::new(base);
        let mut part = OutfitPart::new("broken", strip(8))
            .with_bones(SkeletonId(4), foreign_chain("b", 2))
            .with_attach_point("head");
        part.geometry.bone_weights = vec![BoneWeights::single(1); 8];
        part.geometry.bone_weights[3] = BoneWeights::single(5);

        assert!(matches!(
            unifier.unify(&part),
            Err(UnifyError::UnresolvedBoneIndex {
                vertex: 3,
                index: 5,
                ..
            })
        ));
        assert_eq!(unifier.master().len(), 10);
    }

    #[test]
    fn test_static_part_maps_to_attach_point() {
        let base = base_skeleton(10);
        let head = base.index_of("head").unwrap() as u16;
        let mut unifier = SkeletonUnifier::new(base);
        let hat = OutfitPart::new("hat", strip(8)).attached_static("head");

        assert_eq!(unifier.unify(&hat).unwrap(), BoneRemap(vec![head]));

        let lost = OutfitPart::new("lost", strip(8)).attached_static("tail_9");
        assert!(matches!(
            unifier.unify(&lost),
            Err(UnifyError::AttachPointNotFound { .. })
        ));
    }

    #[test]
    fn test_appended_bone_keeps_world_pose() {
        let base = base_skeleton(10);
        let mut unifier = SkeletonUnifier::new(base);
        let bones = foreign_chain("ear", 2);
        let expected = bones[1].world;
        let part = OutfitPart::new("ears", strip(8))
            .with_bones(SkeletonId(5), bones)
            .with_attach_point("head");

        let remap = unifier.unify(&part).unwrap();
        let mut master = unifier.into_skeleton();
        master.recompute_world(Mat4::IDENTITY);
        let world = master.bones()[remap.0[1] as usize].world;
        assert!(world.abs_diff_eq(expected, 1e-4));
    }

    #[test]
    fn test_child_listed_before_parent() {
        let base = base_skeleton(10);
        let head = base.index_of("head").unwrap();
        let mut unifier = SkeletonUnifier::new(base);
        let mut bones = foreign_chain("tail", 2);
        bones.reverse();
        bones[0].parent = Some(1);
        bones[1].parent = None;
        let expected = bones[0].world;
        let mut part = OutfitPart::new("tail", strip(8))
            .with_bones(SkeletonId(9), bones)
            .with_attach_point("head");
        part.geometry.bone_weights = vec![BoneWeights::single(0); 8];

        let remap = unifier.unify(&part).unwrap();
        assert_eq!(remap.0, vec![10, 11]);

        let mut master = unifier.into_skeleton();
        assert_eq!(master.len(), 12);
        assert_eq!(master.bones()[10].name, "tail_1");
        assert_eq!(master.bones()[10].parent, Some(11));
        assert_eq!(master.bones()[11].parent, Some(head));

        master.recompute_world(Mat4::IDENTITY);
        assert!(master.bones()[10].world.abs_diff_eq(expected, 1e-4));
    }

    #[test]
    fn test_foreign_root_without_attach_point_goes_under_first_bone() {
        let base = base_skeleton(10);
        let hips = base.bones()[base.index_of("hips").unwrap()].clone();
        let mut unifier = SkeletonUnifier::new(base);
        let pouch = Bone {
            name: "pouch".into(),
            parent: None,
            local: Transform::from_xyz(0.2, 0.6, 0.0),
            world: Mat4::from_translation(Vec3::new(0.2, 0.6, 0.0)),
        };
        let part = OutfitPart::new("belt", strip(8)).with_bones(
            SkeletonId(9),
            vec![Bone { parent: None, ..hips }, pouch],
        );

        let remap = unifier.unify(&part).unwrap();
        let master = unifier.master();
        assert_eq!(remap.0[0] as usize, master.index_of("hips").unwrap());
        assert_eq!(master.bones()[remap.0[1] as usize].name, "pouch");
        assert_eq!(master.bones()[remap.0[1] as usize].parent, Some(0));
    }

    #[test]
    fn test_repeated_collisions_get_increasing_suffixes() {
        let base = base_skeleton(10);
        let mut unifier = SkeletonUnifier::new(base);
        for id in 1..=3 {
            let part = OutfitPart::new(format!("cloth_{id}"), strip(8))
                .with_bones(SkeletonId(id), foreign_chain("cloth", 1))
                .with_attach_point("hips");
            unifier.unify(&part).unwrap();
        }
        let master = unifier.master();
        assert!(master.contains("cloth_0"));
        assert!(master.contains("cloth_0.1"));
        assert!(master.contains("cloth_0.2"));
        assert_eq!(master.len(), 13);
    }

    #[test]
    fn test_same_collision_twice_in_one_part() {
        let base = base_skeleton(10);
        let mut unifier = SkeletonUnifier::new(base);
        let cape = OutfitPart::new("cape", strip(8))
            .with_bones(SkeletonId(1), foreign_chain("cloth", 1))
            .with_attach_point("spine_1");
        unifier.unify(&cape).unwrap();

        let mut bones = foreign_chain("cloth", 2);
        bones[1].name = "cloth_0".into();
        let skirt = OutfitPart::new("skirt", strip(8))
            .with_bones(SkeletonId(2), bones)
            .with_attach_point("hips");
        let remap = unifier.unify(&skirt).unwrap();
        let master = unifier.master();

        assert_eq!(master.bones()[remap.0[0] as usize].name, "cloth_0.1");
        assert_eq!(master.bones()[remap.0[1] as usize].name, "cloth_0.2");
        assert_eq!(master.len(), 13);
    }

    #[test]
    fn test_parent_cycle_leaves_master_untouched() {
        let base = base_skeleton(10);
        let mut unifier = SkeletonUnifier::new(base);
        let mut bones = foreign_chain("loop", 2);
        bones[0].parent = Some(1);
        let part = OutfitPart::new("loop", strip(8))
            .with_bones(SkeletonId(6), bones)
            .with_attach_point("head");

        assert!(matches!(
            unifier.unify(&part),
            Err(UnifyError::ParentCycle { .. })
        ));
        assert_eq!(unifier.master().len(), 10);
    }
}
