//! Per-vertex skinning influences.

#[cfg(feature = "persist")]
use serde::{Deserialize, Serialize};

/// Skinning data for a single vertex.
///
/// Up to 4 bone influences per vertex, matching Bevy's `Uint16x4` joint
/// indices and `Float32x4` joint weights. Indices are local to whatever bone
/// list the vertex currently refers to (a part's own bones before
/// unification, the master skeleton afterwards).
#[derive(Clone, Copy, Debug, Default, PartialEq)]
#[cfg_attr(feature = "persist", derive(Serialize, Deserialize))]
pub struct BoneWeights {
    /// Up to 4 bone indices.
    /// Unused slots should be 0 with a weight of 0.
    pub indices: [u16; 4],

    /// Influence of each bone. Should sum to 1.0.
    pub weights: [f32; 4],
}

impl BoneWeights {
    /// Full influence from a single bone.
    ///
    /// # Example
    /// ```
    /// use bevy_outfit_merge::part::BoneWeights;
    ///
    /// let w = BoneWeights::single(7);
    /// assert_eq!(w.indices, [7, 0, 0, 0]);
    /// assert_eq!(w.weights, [1.0, 0.0, 0.0, 0.0]);
    /// ```
    #[inline]
    pub const fn single(bone: u16) -> Self {
        Self {
            indices: [bone, 0, 0, 0],
            weights: [1.0, 0.0, 0.0, 0.0],
        }
    }

    /// Blend two bones with a ratio.
    ///
    /// * `ratio` - 0.0 is 100% `bone0`, 1.0 is 100% `bone1`
    #[inline]
    pub fn blend2(bone0: u16, bone1: u16, ratio: f32) -> Self {
        let ratio = ratio.clamp(0.0, 1.0);
        Self {
            indices: [bone0, bone1, 0, 0],
            weights: [1.0 - ratio, ratio, 0.0, 0.0],
        }
    }

    /// Create influences from relative weights, normalized to sum to 1.0.
    ///
    /// Falls back to full weight on `indices[0]` when all weights are ~0.
    pub fn normalized(indices: [u16; 4], weights: [f32; 4]) -> Self {
        let sum: f32 = weights.iter().map(|w| w.max(0.0)).sum();
        if sum < 0.0001 {
            return Self::single(indices[0]);
        }

        let mut result = [0.0f32; 4];
        let mut running = 0.0f32;
        for i in 0..3 {
            result[i] = weights[i].max(0.0) / sum;
            running += result[i];
        }
        // Last weight absorbs rounding error
        result[3] = if weights[3] > 0.0 {
            (1.0 - running).max(0.0)
        } else {
            0.0
        };

        Self {
            indices,
            weights: result,
        }
    }

    /// Iterate the `(index, weight)` pairs that actually influence the vertex.
    pub fn influences(&self) -> impl Iterator<Item = (u16, f32)> + '_ {
        self.indices
            .iter()
            .zip(self.weights.iter())
            .filter(|&(_, &w)| w > 0.0)
            .map(|(&i, &w)| (i, w))
    }

    /// True if every non-zero influence refers to `bone`.
    pub fn is_bound_to(&self, bone: u16) -> bool {
        self.influences().all(|(i, _)| i == bone)
    }

    /// Rewrite indices through a lookup, keeping weights.
    ///
    /// Zero-weight slots are reset to index 0 so they can never point past the
    /// end of the target bone list. Returns the first non-zero-weight index the
    /// lookup failed to resolve.
    pub fn remapped(&self, lookup: impl Fn(u16) -> Option<u16>) -> Result<Self, u16> {
        let mut out = *self;
        for slot in 0..4 {
            if self.weights[slot] > 0.0 {
                out.indices[slot] = lookup(self.indices[slot]).ok_or(self.indices[slot])?;
            } else {
                out.indices[slot] = 0;
                out.weights[slot] = 0.0;
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single() {
        let w = BoneWeights::single(5);
        assert_eq!(w.indices, [5, 0, 0, 0]);
        assert!(w.is_bound_to(5));
    }

    #[test]
    fn test_blend2() {
        let w = BoneWeights::blend2(0, 1, 0.25);
        assert_eq!(w.weights[0] + w.weights[1], 1.0);
        assert!(!w.is_bound_to(0));
    }

    #[test]
    fn test_normalized_sums_to_one() {
        let w = BoneWeights::normalized([0, 1, 2, 3], [1.0, 2.0, 3.0, 4.0]);
        let sum: f32 = w.weights.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_normalized_degenerate_falls_back() {
        let w = BoneWeights::normalized([9, 1, 2, 3], [0.0; 4]);
        assert_eq!(w, BoneWeights::single(9));
    }

    #[test]
    fn test_remapped_clears_unused_slots() {
        let w = BoneWeights {
            indices: [2, 40, 0, 0],
            weights: [1.0, 0.0, 0.0, 0.0],
        };
        let out = w.remapped(|i| if i == 2 { Some(11) } else { None }).unwrap();
        assert_eq!(out.indices, [11, 0, 0, 0]);
    }

    #[test]
    fn test_remapped_reports_unresolved() {
        let w = BoneWeights::blend2(0, 3, 0.5);
        let err = w.remapped(|i| if i == 0 { Some(0) } else { None }).unwrap_err();
        assert_eq!(err, 3);
    }
}
