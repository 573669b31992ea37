//! Per-name blend shape accumulation across parts.

use std::collections::HashMap;

use crate::part::{BlendShape, BlendShapeFrame};

/// Frame weights closer than this are treated as the same frame.
const FRAME_WEIGHT_EPSILON: f32 = 1e-4;

/// Collects same-named blend shapes from several parts into one shape per
/// name, each spanning the full combined vertex buffer.
///
/// Parts occupy disjoint vertex ranges, so writing a part's deltas is a
/// plain copy at its offset. Vertices no part wrote stay zero.
#[derive(Clone, Debug, Default)]
pub struct BlendShapeAccumulator {
    vertex_count: usize,
    /// In first-seen order.
    shapes: Vec<BlendShape>,
    by_name: HashMap<String, usize>,
}

impl BlendShapeAccumulator {
    pub fn new(vertex_count: usize) -> Self {
        Self {
            vertex_count,
            ..Default::default()
        }
    }

    pub fn len(&self) -> usize {
        self.shapes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shapes.is_empty()
    }

    /// Copy `shape`'s frames into the accumulator starting at vertex `offset`.
    ///
    /// Frames are matched by weight. A weight this shape has not seen yet
    /// adds a zero-filled frame, kept in ascending weight order.
    pub fn write(&mut self, shape: &BlendShape, offset: usize) {
        let len = shape
            .frames
            .iter()
            .map(|f| f.delta_positions.len())
            .max()
            .unwrap_or(0);
        self.vertex_count = self.vertex_count.max(offset + len);
        let vertex_count = self.vertex_count;

        let index = match self.by_name.get(&shape.name) {
            Some(&index) => index,
            None => {
                self.shapes.push(BlendShape::new(shape.name.clone(), Vec::new()));
                self.by_name.insert(shape.name.clone(), self.shapes.len() - 1);
                self.shapes.len() - 1
            }
        };
        let target = &mut self.shapes[index];

        for source in &shape.frames {
            let slot = match target
                .frames
                .iter()
                .position(|f| (f.weight - source.weight).abs() < FRAME_WEIGHT_EPSILON)
            {
                Some(slot) => slot,
                None => {
                    let slot = target
                        .frames
                        .iter()
                        .position(|f| f.weight > source.weight)
                        .unwrap_or(target.frames.len());
                    target
                        .frames
                        .insert(slot, zeroed(source.weight, vertex_count));
                    slot
                }
            };

            let frame = &mut target.frames[slot];
            resize(frame, vertex_count);
            copy_at(&mut frame.delta_positions, &source.delta_positions, offset);
            copy_at(&mut frame.delta_normals, &source.delta_normals, offset);
            copy_at(&mut frame.delta_tangents, &source.delta_tangents, offset);
        }
    }

    /// Every accumulated shape, each frame sized to exactly `vertex_count`.
    pub fn finish(mut self, vertex_count: usize) -> Vec<BlendShape> {
        for shape in &mut self.shapes {
            for frame in &mut shape.frames {
                resize(frame, vertex_count);
            }
        }
        self.shapes
    }
}

fn zeroed(weight: f32, vertex_count: usize) -> BlendShapeFrame {
    BlendShapeFrame {
        weight,
        delta_positions: vec![[0.0; 3]; vertex_count],
        delta_normals: vec![[0.0; 3]; vertex_count],
        delta_tangents: vec![[0.0; 3]; vertex_count],
    }
}

fn resize(frame: &mut BlendShapeFrame, vertex_count: usize) {
    frame.delta_positions.resize(vertex_count, [0.0; 3]);
    frame.delta_normals.resize(vertex_count, [0.0; 3]);
    frame.delta_tangents.resize(vertex_count, [0.0; 3]);
}

#[inline]
fn copy_at(target: &mut [[f32; 3]], source: &[[f32; 3]], offset: usize) {
    target[offset..offset + source.len()].copy_from_slice(source);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn smile(n: usize, weight: f32) -> BlendShape {
        BlendShape::new(
            "Smile",
            vec![BlendShapeFrame::positions(weight, vec![[1.0, 0.0, 0.0]; n])],
        )
    }

    #[test]
    fn test_same_name_merges_into_one_shape() {
        let mut acc = BlendShapeAccumulator::new(10);
        acc.write(&smile(3, 1.0), 0);
        acc.write(&smile(2, 1.0), 6);
        let shapes = acc.finish(10);

        assert_eq!(shapes.len(), 1);
        let deltas = &shapes[0].frames[0].delta_positions;
        assert_eq!(deltas.len(), 10);
        let nonzero: Vec<usize> = (0..10).filter(|&i| deltas[i][0] != 0.0).collect();
        assert_eq!(nonzero, vec![0, 1, 2, 6, 7]);
    }

    #[test]
    fn test_frames_matched_by_weight() {
        let mut acc = BlendShapeAccumulator::new(4);
        acc.write(&smile(2, 1.0), 0);
        acc.write(&smile(2, 0.5), 2);
        let shapes = acc.finish(4);

        let weights: Vec<f32> = shapes[0].frames.iter().map(|f| f.weight).collect();
        assert_eq!(weights, vec![0.5, 1.0]);
        // The half-weight frame has nothing from the first part.
        assert_eq!(shapes[0].frames[0].delta_positions[0], [0.0; 3]);
        assert_eq!(shapes[0].frames[0].delta_positions[2], [1.0, 0.0, 0.0]);
    }

    #[test]
    fn test_finish_pads_to_final_count() {
        let mut acc = BlendShapeAccumulator::new(0);
        acc.write(&smile(2, 1.0), 0);
        let shapes = acc.finish(5);
        assert_eq!(shapes[0].frames[0].delta_normals.len(), 5);
        assert!(BlendShapeAccumulator::new(3).finish(3).is_empty());
    }
}
