//! Reversible content edits applied to a single layer's payload.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use image::RgbaImage;

use crate::layer::LayerNode;
use crate::tile::{TileKey, TileKeySet, TILE_SIZE};

/// An opaque, reversible change to a layer's content.
///
/// The scene applies `redo` when the edit is pushed and on every redo, `undo`
/// on every undo. Both must leave `modified_keys` covering everything touched.
pub trait LayerEdit: fmt::Debug {
    fn redo(&mut self, node: &mut LayerNode);
    fn undo(&mut self, node: &mut LayerNode);
    fn modified_keys(&self) -> TileKeySet;
}

/// Replaces a set of raster tiles, keeping the displaced ones for the way back.
///
/// A `None` entry means "no tile": applying it removes the tile from the surface.
#[derive(Default)]
pub struct TilePatchEdit {
    tiles: HashMap<TileKey, Option<Arc<RgbaImage>>>,
}

impl TilePatchEdit {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `tile` for `key`. Wrongly sized tiles are ignored.
    pub fn set_tile(&mut self, key: TileKey, tile: RgbaImage) -> &mut Self {
        if tile.dimensions() == (TILE_SIZE as u32, TILE_SIZE as u32) {
            self.tiles.insert(key, Some(Arc::new(tile)));
        } else {
            log::warn!("TilePatchEdit: ignoring {:?} tile for {:?}", tile.dimensions(), key);
        }
        self
    }

    /// Queues removal of the tile at `key`.
    pub fn clear_tile(&mut self, key: TileKey) -> &mut Self {
        self.tiles.insert(key, None);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    fn swap(&mut self, node: &mut LayerNode) {
        let Some(surface) = node.surface_mut() else {
            log::warn!("TilePatchEdit applied to a non-raster layer {:?}", node.name);
            return;
        };
        for (key, patch) in self.tiles.iter_mut() {
            let displaced = match patch.take() {
                Some(tile) => surface.insert_shared(*key, tile),
                None => surface.remove_tile(*key),
            };
            *patch = displaced;
        }
    }
}

impl fmt::Debug for TilePatchEdit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TilePatchEdit")
            .field("tiles", &self.tiles.len())
            .finish()
    }
}

impl LayerEdit for TilePatchEdit {
    fn redo(&mut self, node: &mut LayerNode) {
        self.swap(node);
    }

    fn undo(&mut self, node: &mut LayerNode) {
        self.swap(node);
    }

    fn modified_keys(&self) -> TileKeySet {
        self.tiles.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use image::Rgba;

    use super::*;
    use crate::tile::new_tile;

    #[test]
    fn test_patch_swaps_back_and_forth() {
        let mut node = LayerNode::raster("paint");
        node.surface_mut().unwrap().set_pixel(0, 0, Rgba([1, 1, 1, 255]));

        let mut edit = TilePatchEdit::new();
        edit.set_tile(TileKey::new(0, 0), new_tile(Rgba([9, 9, 9, 255])))
            .set_tile(TileKey::new(1, 0), new_tile(Rgba([7, 7, 7, 255])));
        assert_eq!(edit.modified_keys().len(), 2);

        edit.redo(&mut node);
        let surface = node.surface().unwrap();
        assert_eq!(surface.pixel(0, 0), Rgba([9, 9, 9, 255]));
        assert_eq!(surface.pixel(64, 0), Rgba([7, 7, 7, 255]));

        edit.undo(&mut node);
        let surface = node.surface().unwrap();
        assert_eq!(surface.pixel(0, 0), Rgba([1, 1, 1, 255]));
        assert!(!surface.contains(TileKey::new(1, 0)));

        edit.redo(&mut node);
        assert_eq!(node.surface().unwrap().pixel(64, 0), Rgba([7, 7, 7, 255]));
    }

    #[test]
    fn test_clear_tile_removes_content() {
        let mut node = LayerNode::raster("paint");
        node.surface_mut().unwrap().set_pixel(3, 3, Rgba([1, 1, 1, 255]));
        let mut edit = TilePatchEdit::new();
        edit.clear_tile(TileKey::new(0, 0));
        edit.redo(&mut node);
        assert!(node.surface().unwrap().is_empty());
        edit.undo(&mut node);
        assert_eq!(node.surface().unwrap().pixel(3, 3), Rgba([1, 1, 1, 255]));
    }

    #[test]
    fn test_wrong_size_tile_is_ignored() {
        let mut edit = TilePatchEdit::new();
        edit.set_tile(TileKey::new(0, 0), RgbaImage::new(2, 2));
        assert!(edit.is_empty());
    }
}
