//! Shelf packing of per-part bakes into one square atlas per channel.

use std::collections::{BTreeSet, HashSet};

use bevy::prelude::*;
use image::imageops::{self, FilterType};
use image::RgbaImage;

use super::{AtlasSet, BakeRect, PackError, PixelRect, RectMap, neutral_texel};
use crate::bake::BakedPart;
use crate::merge::MergeSettings;

/// A packed atlas set and the rectangle assignment shared by all channels.
#[derive(Clone, Debug)]
pub struct PackedAtlas {
    pub atlases: AtlasSet,
    pub rects: RectMap,
    /// True if the bakes were halved to make them fit.
    pub shrunk: bool,
}

#[derive(Debug)]
struct Shelf {
    y: u32,
    /// Tallest padded entry on this shelf.
    height: u32,
    /// Next free x.
    cursor: u32,
}

/// Deterministic shelf packer for a fixed square atlas.
#[derive(Clone, Copy, Debug)]
pub struct AtlasPacker {
    pub atlas_size: u32,
    /// Gutter on every side of each rectangle.
    pub padding: u32,
}

impl AtlasPacker {
    pub fn new(atlas_size: u32, padding: u32) -> Self {
        Self {
            atlas_size,
            padding,
        }
    }

    pub fn from_settings(settings: &MergeSettings) -> Self {
        Self::new(settings.atlas_size, settings.padding)
    }

    /// Assign a rectangle to every bake, sized by its diffuse image.
    ///
    /// Entries are placed by height descending, then width descending, then
    /// name, each on the first shelf with room.
    pub fn layout(&self, bakes: &[BakedPart]) -> Result<RectMap, PackError> {
        let mut seen = HashSet::new();
        for bake in bakes {
            if !seen.insert(bake.part.as_str()) {
                return Err(PackError::DuplicatePart(bake.part.clone()));
            }
        }

        let mut order: Vec<&BakedPart> = bakes.iter().collect();
        order.sort_by(|a, b| {
            let (sa, sb) = (a.size(), b.size());
            sb.y.cmp(&sa.y)
                .then(sb.x.cmp(&sa.x))
                .then_with(|| a.part.cmp(&b.part))
        });

        let overflow = || PackError::Overflow {
            parts: bakes.len(),
            atlas_size: self.atlas_size,
        };

        let mut shelves: Vec<Shelf> = Vec::new();
        let mut rects = RectMap::new();
        for bake in order {
            let size = bake.size();
            let padded = size + UVec2::splat(self.padding * 2);
            if padded.x > self.atlas_size || padded.y > self.atlas_size {
                return Err(overflow());
            }

            let index = match shelves
                .iter()
                .position(|s| s.cursor + padded.x <= self.atlas_size && padded.y <= s.height)
            {
                Some(index) => index,
                None => {
                    let y = shelves.last().map_or(0, |s| s.y + s.height);
                    if y + padded.y > self.atlas_size {
                        return Err(overflow());
                    }
                    shelves.push(Shelf {
                        y,
                        height: padded.y,
                        cursor: 0,
                    });
                    shelves.len() - 1
                }
            };
            let shelf = &mut shelves[index];

            let pixels = PixelRect {
                x: shelf.cursor + self.padding,
                y: shelf.y + self.padding,
                width: size.x,
                height: size.y,
            };
            shelf.cursor += padded.x;
            rects.insert(bake.part.clone(), BakeRect::from_pixels(pixels, self.atlas_size));
        }

        Ok(rects)
    }

    /// Lay out and copy every bake into the atlas set.
    ///
    /// On overflow every bake is halved and packed once more; a second
    /// overflow is returned as an error.
    pub fn pack(&self, bakes: &[BakedPart]) -> Result<PackedAtlas, PackError> {
        match self.layout(bakes) {
            Ok(rects) => Ok(PackedAtlas {
                atlases: self.assemble(bakes, &rects),
                rects,
                shrunk: false,
            }),
            Err(PackError::Overflow { .. }) => {
                warn!(
                    "Pack: {} bakes overflow the {}px atlas, retrying at half resolution",
                    bakes.len(),
                    self.atlas_size
                );
                let halved: Vec<BakedPart> = bakes.iter().map(BakedPart::halved).collect();
                let rects = self.layout(&halved)?;
                Ok(PackedAtlas {
                    atlases: self.assemble(&halved, &rects),
                    rects,
                    shrunk: true,
                })
            }
            Err(e) => Err(e),
        }
    }

    fn assemble(&self, bakes: &[BakedPart], rects: &RectMap) -> AtlasSet {
        let names: BTreeSet<&str> = bakes
            .iter()
            .flat_map(|b| b.channels.keys().map(String::as_str))
            .collect();
        let mut atlases = AtlasSet::new(self.atlas_size, names);

        for bake in bakes {
            let Some(rect) = rects.get(&bake.part) else {
                continue;
            };
            let p = rect.pixels;
            imageops::replace(&mut atlases.diffuse, &bake.diffuse, p.x as i64, p.y as i64);

            for (name, atlas) in atlases.channels.iter_mut() {
                match bake.channels.get(name) {
                    Some(image) if image.dimensions() == (p.width, p.height) => {
                        imageops::replace(atlas, image, p.x as i64, p.y as i64);
                    }
                    Some(image) => {
                        let fitted = imageops::resize(image, p.width, p.height, FilterType::Triangle);
                        imageops::replace(atlas, &fitted, p.x as i64, p.y as i64);
                    }
                    None => {
                        let fill = RgbaImage::from_pixel(p.width, p.height, neutral_texel(name));
                        imageops::replace(atlas, &fill, p.x as i64, p.y as i64);
                    }
                }
            }
        }

        atlases
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::part::NORMAL_CHANNEL;
    use image::Rgba;

    fn bake(name: &str, size: u32) -> BakedPart {
        BakedPart {
            part: name.into(),
            diffuse: RgbaImage::from_pixel(size, size, Rgba([200, 10, 10, 255])),
            channels: BTreeMap::new(),
        }
    }

    fn five(size: u32) -> Vec<BakedPart> {
        ["body", "boots", "hair", "hat", "shirt"]
            .iter()
            .map(|n| bake(n, size))
            .collect()
    }

    fn assert_disjoint(rects: &RectMap) {
        let all: Vec<_> = rects.values().collect();
        for (i, a) in all.iter().enumerate() {
            for b in &all[i + 1..] {
                assert!(!a.pixels.overlaps(&b.pixels), "{a:?} overlaps {b:?}");
            }
        }
    }

    #[test]
    fn test_fits_without_retry() {
        let packed = AtlasPacker::new(2048, 2).pack(&five(512)).unwrap();
        assert!(!packed.shrunk);
        assert_eq!(packed.rects.len(), 5);
        assert_disjoint(&packed.rects);
        assert!(packed.rects.values().all(|r| r.pixels.width == 512));
    }

    #[test]
    fn test_overflow_retries_at_half_resolution() {
        // 512 + 2 * 200 gutter leaves room for four entries; 256 fits all five.
        let packed = AtlasPacker::new(2048, 200).pack(&five(512)).unwrap();
        assert!(packed.shrunk);
        assert_disjoint(&packed.rects);
        assert!(packed.rects.values().all(|r| r.pixels.width == 256));

        let packed = AtlasPacker::new(1024, 2).pack(&five(512)).unwrap();
        assert!(packed.shrunk);
        assert_disjoint(&packed.rects);
    }

    #[test]
    fn test_second_overflow_is_fatal() {
        assert_eq!(
            AtlasPacker::new(512, 2).pack(&five(512)).unwrap_err(),
            PackError::Overflow {
                parts: 5,
                atlas_size: 512
            }
        );
    }

    #[test]
    fn test_layout_is_deterministic() {
        let mut bakes = five(128);
        bakes.push(bake("cape", 256));
        let packer = AtlasPacker::new(1024, 1);
        let first = packer.layout(&bakes).unwrap();
        bakes.reverse();
        assert_eq!(packer.layout(&bakes).unwrap(), first);
        // Tallest first.
        assert_eq!(first["cape"].pixels.x, 1);
        assert_eq!(first["cape"].pixels.y, 1);
    }

    #[test]
    fn test_duplicate_part_rejected() {
        let bakes = vec![bake("hat", 16), bake("hat", 16)];
        assert_eq!(
            AtlasPacker::new(256, 0).layout(&bakes).unwrap_err(),
            PackError::DuplicatePart("hat".into())
        );
    }

    #[test]
    fn test_channels_share_rects_and_missing_get_neutral() {
        let mut shirt = bake("shirt", 32);
        shirt.channels.insert(
            NORMAL_CHANNEL.into(),
            RgbaImage::from_pixel(32, 32, Rgba([1, 2, 3, 255])),
        );
        let hat = bake("hat", 32);

        let packed = AtlasPacker::new(128, 2).pack(&[shirt, hat]).unwrap();
        let normal = packed.atlases.channel(NORMAL_CHANNEL).unwrap();
        let s = packed.rects["shirt"].pixels;
        let h = packed.rects["hat"].pixels;

        assert_eq!(*normal.get_pixel(s.x, s.y), Rgba([1, 2, 3, 255]));
        assert_eq!(*normal.get_pixel(h.x + 5, h.y + 5), neutral_texel(NORMAL_CHANNEL));
        assert_eq!(*packed.atlases.diffuse.get_pixel(h.x, h.y), Rgba([200, 10, 10, 255]));
        // Gutter stays empty until dilation.
        assert_eq!(packed.atlases.diffuse.get_pixel(0, 0).0[3], 0);
    }
}
