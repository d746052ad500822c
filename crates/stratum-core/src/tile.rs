//! Sparse tiled pixel storage.
//!
//! A [`TileSurface`] maps [`TileKey`]s to fixed-size premultiplied RGBA tiles.
//! Tiles are shared behind `Arc`, so cloning a surface is cheap and the first
//! write to a shared tile copies it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use image::{Rgba, RgbaImage};
use serde::{Deserialize, Serialize};

use crate::geometry::{IntPoint, IntRect};

/// Edge length of every tile, in pixels.
pub const TILE_SIZE: i32 = 64;

/// Fully transparent premultiplied pixel.
pub const TRANSPARENT: Rgba<u8> = Rgba([0, 0, 0, 0]);

/// Opaque mid-gray, used behind the document in the viewport.
pub const CANVAS_GRAY: Rgba<u8> = Rgba([128, 128, 128, 255]);

/// A set of tile keys, as used for damage tracking.
pub type TileKeySet = HashSet<TileKey>;

/// Integer coordinate of a tile on the infinite tile grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TileKey {
    pub x: i32,
    pub y: i32,
}

impl TileKey {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// The key of the tile containing pixel `(x, y)`.
    pub fn for_pixel(x: i32, y: i32) -> Self {
        Self::new(x.div_euclid(TILE_SIZE), y.div_euclid(TILE_SIZE))
    }

    /// The pixel rectangle covered by this tile.
    pub fn rect(&self) -> IntRect {
        IntRect::new(self.x * TILE_SIZE, self.y * TILE_SIZE, TILE_SIZE, TILE_SIZE)
    }

    /// Every key whose tile overlaps `rect`.
    pub fn keys_for_rect(rect: &IntRect) -> TileKeySet {
        let mut keys = TileKeySet::new();
        if rect.is_empty() {
            return keys;
        }
        let first = Self::for_pixel(rect.left(), rect.top());
        let last = Self::for_pixel(rect.right() - 1, rect.bottom() - 1);
        for y in first.y..=last.y {
            for x in first.x..=last.x {
                keys.insert(TileKey::new(x, y));
            }
        }
        keys
    }
}

/// Allocates one tile filled with `fill`.
pub fn new_tile(fill: Rgba<u8>) -> RgbaImage {
    RgbaImage::from_pixel(TILE_SIZE as u32, TILE_SIZE as u32, fill)
}

/// Whether every pixel of `image` has zero alpha.
pub fn is_transparent(image: &RgbaImage) -> bool {
    image.pixels().all(|p| p[3] == 0)
}

/// Copies a `size`-sized block from `src` at `src_origin` to `dst` at `dst_origin`.
///
/// The block must lie inside both images.
pub fn copy_region(
    src: &RgbaImage,
    src_origin: IntPoint,
    dst: &mut RgbaImage,
    dst_origin: IntPoint,
    width: i32,
    height: i32,
) {
    if width <= 0 || height <= 0 {
        return;
    }
    let src_stride = src.width() as usize * 4;
    let dst_stride = dst.width() as usize * 4;
    let row_len = width as usize * 4;
    let src_raw: &[u8] = src;
    let dst_raw: &mut [u8] = dst;
    for row in 0..height as usize {
        let s = (src_origin.y as usize + row) * src_stride + src_origin.x as usize * 4;
        let d = (dst_origin.y as usize + row) * dst_stride + dst_origin.x as usize * 4;
        dst_raw[d..d + row_len].copy_from_slice(&src_raw[s..s + row_len]);
    }
}

/// A sparse, copy-on-write grid of pixel tiles.
#[derive(Debug, Clone)]
pub struct TileSurface {
    tiles: HashMap<TileKey, Arc<RgbaImage>>,
    background: Rgba<u8>,
}

impl TileSurface {
    /// An empty surface whose unoccupied tiles read as transparent.
    pub fn new() -> Self {
        Self::with_background(TRANSPARENT)
    }

    /// An empty surface whose unoccupied tiles read as `background`.
    pub fn with_background(background: Rgba<u8>) -> Self {
        Self {
            tiles: HashMap::new(),
            background,
        }
    }

    pub fn background(&self) -> Rgba<u8> {
        self.background
    }

    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    pub fn contains(&self, key: TileKey) -> bool {
        self.tiles.contains_key(&key)
    }

    /// Keys of every occupied tile.
    pub fn keys(&self) -> TileKeySet {
        self.tiles.keys().copied().collect()
    }

    pub fn tile(&self, key: TileKey) -> Option<&RgbaImage> {
        self.tiles.get(&key).map(|t| t.as_ref())
    }

    /// The shared handle of a tile, for callers that keep old content around.
    pub fn shared_tile(&self, key: TileKey) -> Option<Arc<RgbaImage>> {
        self.tiles.get(&key).cloned()
    }

    /// Mutable access to a tile, allocating it with the background if absent.
    pub fn tile_mut(&mut self, key: TileKey) -> &mut RgbaImage {
        let background = self.background;
        let tile = self
            .tiles
            .entry(key)
            .or_insert_with(|| Arc::new(new_tile(background)));
        Arc::make_mut(tile)
    }

    /// Stores a tile, returning the previous one.
    ///
    /// Tiles must be `TILE_SIZE` square; anything else is rejected and returned.
    pub fn insert_tile(
        &mut self,
        key: TileKey,
        tile: RgbaImage,
    ) -> Result<Option<Arc<RgbaImage>>, RgbaImage> {
        if tile.width() != TILE_SIZE as u32 || tile.height() != TILE_SIZE as u32 {
            return Err(tile);
        }
        Ok(self.tiles.insert(key, Arc::new(tile)))
    }

    pub fn insert_shared(&mut self, key: TileKey, tile: Arc<RgbaImage>) -> Option<Arc<RgbaImage>> {
        debug_assert_eq!(tile.dimensions(), (TILE_SIZE as u32, TILE_SIZE as u32));
        self.tiles.insert(key, tile)
    }

    pub fn remove_tile(&mut self, key: TileKey) -> Option<Arc<RgbaImage>> {
        self.tiles.remove(&key)
    }

    pub fn clear(&mut self) {
        self.tiles.clear();
    }

    /// Union of all occupied tile rectangles.
    pub fn bounding_rect(&self) -> IntRect {
        self.tiles
            .keys()
            .fold(IntRect::default(), |acc, key| acc.united(&key.rect()))
    }

    pub fn pixel(&self, x: i32, y: i32) -> Rgba<u8> {
        let key = TileKey::for_pixel(x, y);
        match self.tiles.get(&key) {
            Some(tile) => *tile.get_pixel(
                x.rem_euclid(TILE_SIZE) as u32,
                y.rem_euclid(TILE_SIZE) as u32,
            ),
            None => self.background,
        }
    }

    pub fn set_pixel(&mut self, x: i32, y: i32, pixel: Rgba<u8>) {
        let key = TileKey::for_pixel(x, y);
        self.tile_mut(key).put_pixel(
            x.rem_euclid(TILE_SIZE) as u32,
            y.rem_euclid(TILE_SIZE) as u32,
            pixel,
        );
    }

    /// Fills `rect` with `pixel`, allocating tiles as needed.
    pub fn fill_rect(&mut self, rect: &IntRect, pixel: Rgba<u8>) {
        for key in TileKey::keys_for_rect(rect) {
            let tile_rect = key.rect();
            let local = rect.intersected(&tile_rect).translated(-tile_rect.x, -tile_rect.y);
            let tile = self.tile_mut(key);
            for y in local.top()..local.bottom() {
                for x in local.left()..local.right() {
                    tile.put_pixel(x as u32, y as u32, pixel);
                }
            }
        }
    }

    /// Copies `rect` out into a flat image; unoccupied areas read as the background.
    pub fn crop(&self, rect: &IntRect) -> RgbaImage {
        if rect.is_empty() {
            return RgbaImage::new(0, 0);
        }
        let mut image =
            RgbaImage::from_pixel(rect.width as u32, rect.height as u32, self.background);
        for key in TileKey::keys_for_rect(rect) {
            let Some(tile) = self.tiles.get(&key) else {
                continue;
            };
            let tile_rect = key.rect();
            let overlap = rect.intersected(&tile_rect);
            copy_region(
                tile,
                IntPoint::new(overlap.x - tile_rect.x, overlap.y - tile_rect.y),
                &mut image,
                IntPoint::new(overlap.x - rect.x, overlap.y - rect.y),
                overlap.width,
                overlap.height,
            );
        }
        image
    }

    /// Writes `image` into the surface with its top-left corner at `origin`.
    pub fn paste(&mut self, image: &RgbaImage, origin: IntPoint) {
        let rect = IntRect::new(origin.x, origin.y, image.width() as i32, image.height() as i32);
        for key in TileKey::keys_for_rect(&rect) {
            let tile_rect = key.rect();
            let overlap = rect.intersected(&tile_rect);
            let tile = self.tile_mut(key);
            copy_region(
                image,
                IntPoint::new(overlap.x - rect.x, overlap.y - rect.y),
                tile,
                IntPoint::new(overlap.x - tile_rect.x, overlap.y - tile_rect.y),
                overlap.width,
                overlap.height,
            );
        }
    }
}

impl Default for TileSurface {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RED: Rgba<u8> = Rgba([255, 0, 0, 255]);

    #[test]
    fn test_key_for_negative_pixels() {
        assert_eq!(TileKey::for_pixel(-1, -1), TileKey::new(-1, -1));
        assert_eq!(TileKey::for_pixel(63, 64), TileKey::new(0, 1));
    }

    #[test]
    fn test_keys_for_rect_spans_tiles() {
        let keys = TileKey::keys_for_rect(&IntRect::new(60, 0, 10, 10));
        assert_eq!(keys.len(), 2);
        assert!(keys.contains(&TileKey::new(0, 0)));
        assert!(keys.contains(&TileKey::new(1, 0)));
        assert!(TileKey::keys_for_rect(&IntRect::default()).is_empty());
    }

    #[test]
    fn test_crop_fills_unoccupied_with_background() {
        let mut surface = TileSurface::with_background(CANVAS_GRAY);
        surface.set_pixel(1, 1, RED);
        let image = surface.crop(&IntRect::new(0, 0, 200, 3));
        assert_eq!(image.dimensions(), (200, 3));
        assert_eq!(*image.get_pixel(1, 1), RED);
        assert_eq!(*image.get_pixel(0, 0), CANVAS_GRAY);
        // Far outside any occupied tile.
        assert_eq!(*image.get_pixel(150, 2), CANVAS_GRAY);
        assert_eq!(surface.keys().len(), 1);
    }

    #[test]
    fn test_clone_is_copy_on_write() {
        let mut original = TileSurface::new();
        original.fill_rect(&IntRect::new(0, 0, 8, 8), RED);
        let mut copy = original.clone();
        copy.set_pixel(0, 0, TRANSPARENT);
        assert_eq!(original.pixel(0, 0), RED);
        assert_eq!(copy.pixel(0, 0), TRANSPARENT);
    }

    #[test]
    fn test_paste_then_crop() {
        let mut surface = TileSurface::new();
        let image = RgbaImage::from_pixel(70, 5, RED);
        surface.paste(&image, IntPoint::new(-3, 10));
        // Columns -3..67 touch tile columns -1, 0 and 1.
        assert_eq!(surface.keys().len(), 3);
        assert_eq!(surface.pixel(-3, 10), RED);
        assert_eq!(surface.pixel(66, 14), RED);
        assert_eq!(surface.pixel(67, 14), TRANSPARENT);
        let cropped = surface.crop(&IntRect::new(-3, 10, 70, 5));
        assert!(cropped.pixels().all(|p| *p == RED));
    }

    #[test]
    fn test_insert_tile_rejects_wrong_size() {
        let mut surface = TileSurface::new();
        assert!(surface.insert_tile(TileKey::new(0, 0), RgbaImage::new(3, 3)).is_err());
        assert!(surface.insert_tile(TileKey::new(0, 0), new_tile(RED)).is_ok());
        assert_eq!(surface.bounding_rect(), IntRect::new(0, 0, 64, 64));
    }
}
