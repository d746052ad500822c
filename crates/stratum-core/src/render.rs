//! Compositing of layer lists into tile surfaces.
//!
//! Layers are drawn from the last list element to the first, so index 0 ends
//! up on top. A group is flattened into a scratch tile first and then blended
//! once with its own opacity and blend mode.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use image::RgbaImage;

use crate::blend::{blend_region, Blender, DefaultBlender};
use crate::geometry::IntRect;
use crate::layer::{LayerKind, LayerNode};
use crate::tile::{
    is_transparent, new_tile, TileKey, TileKeySet, TileSurface, TILE_SIZE, TRANSPARENT,
};
use crate::tree::{LayerId, LayerTree};

/// Takes over drawing of selected layers, e.g. while a tool shows a live preview.
pub trait DrawDelegate: fmt::Debug {
    /// Whether this delegate draws `layer` instead of the layer itself.
    fn handles(&self, layer: LayerId) -> bool;

    /// Draws `layer`'s content for tile `key` into the transparent tile `out`.
    ///
    /// Opacity and blend mode are applied by the renderer afterwards.
    fn draw_layer(
        &self,
        tree: &LayerTree,
        layer: LayerId,
        key: TileKey,
        out: &mut RgbaImage,
    ) -> bool;
}

/// Composites layers tile by tile through a pluggable [`Blender`].
#[derive(Debug)]
pub struct LayerRenderer {
    blender: Box<dyn Blender>,
    delegate: Option<Box<dyn DrawDelegate>>,
}

impl LayerRenderer {
    pub fn new() -> Self {
        Self::with_blender(Box::new(DefaultBlender))
    }

    pub fn with_blender(blender: Box<dyn Blender>) -> Self {
        Self {
            blender,
            delegate: None,
        }
    }

    pub fn blender(&self) -> &dyn Blender {
        self.blender.as_ref()
    }

    pub fn set_delegate(&mut self, delegate: Option<Box<dyn DrawDelegate>>) {
        self.delegate = delegate;
    }

    pub fn delegate(&self) -> Option<&dyn DrawDelegate> {
        self.delegate.as_deref()
    }

    /// Composites `layers` into a new surface.
    ///
    /// `key_clip` selects whole tiles; `rect_clip` selects a sub-rectangle (in
    /// tile-local pixels) of a tile and takes precedence for keys in both.
    /// With both empty, every tile touched by a visible layer is rendered.
    pub fn render_to_surface(
        &self,
        tree: &LayerTree,
        layers: &[LayerId],
        key_clip: &TileKeySet,
        rect_clip: &HashMap<TileKey, IntRect>,
    ) -> TileSurface {
        let full = IntRect::new(0, 0, TILE_SIZE, TILE_SIZE);
        let mut work: HashMap<TileKey, IntRect> = HashMap::new();
        if key_clip.is_empty() && rect_clip.is_empty() {
            for &layer in layers {
                if tree.node(layer).is_some_and(|n| n.visible) {
                    work.extend(tree.tile_keys_recursive(layer).into_iter().map(|k| (k, full)));
                }
            }
        } else {
            work.extend(key_clip.iter().map(|&k| (k, full)));
            work.extend(rect_clip.iter().map(|(&k, r)| (k, r.intersected(&full))));
        }

        let mut surface = TileSurface::new();
        for (key, region) in work {
            if region.is_empty() {
                continue;
            }
            let mut tile = new_tile(TRANSPARENT);
            self.render_layers(tree, layers, key, &region, &mut tile);
            if !is_transparent(&tile) {
                surface.insert_shared(key, Arc::new(tile));
            }
        }
        surface
    }

    /// Renders whole tiles; an empty `keys` renders everything.
    pub fn render(&self, tree: &LayerTree, layers: &[LayerId], keys: &TileKeySet) -> TileSurface {
        self.render_to_surface(tree, layers, keys, &HashMap::new())
    }

    /// A layer's own content flattened, ignoring its visibility, opacity and mode.
    ///
    /// Used for thumbnails and merging. `keys` limits the rendered tiles.
    pub fn render_content(
        &self,
        tree: &LayerTree,
        layer: LayerId,
        keys: &TileKeySet,
    ) -> TileSurface {
        let Some(node) = tree.node(layer) else {
            return TileSurface::new();
        };
        if keys.is_empty() {
            return TileSurface::new();
        }
        let full = IntRect::new(0, 0, TILE_SIZE, TILE_SIZE);
        let mut surface = TileSurface::new();
        for &key in keys {
            let mut tile = new_tile(TRANSPARENT);
            if self.draw_layer(tree, layer, node, key, &full, &mut tile) && !is_transparent(&tile) {
                surface.insert_shared(key, Arc::new(tile));
            }
        }
        surface
    }

    fn render_layers(
        &self,
        tree: &LayerTree,
        layers: &[LayerId],
        key: TileKey,
        region: &IntRect,
        out: &mut RgbaImage,
    ) {
        for &layer in layers.iter().rev() {
            self.render_layer(tree, layer, key, region, out);
        }
    }

    fn render_layer(
        &self,
        tree: &LayerTree,
        layer: LayerId,
        key: TileKey,
        region: &IntRect,
        out: &mut RgbaImage,
    ) {
        let Some(node) = tree.node(layer) else {
            return;
        };
        if !node.visible {
            return;
        }
        let mut content = new_tile(TRANSPARENT);
        if self.draw_layer(tree, layer, node, key, region, &mut content) {
            blend_region(
                self.blender.as_ref(),
                node.blend_mode,
                out,
                &content,
                region,
                node.opacity as f32,
            );
        }
    }

    fn draw_layer(
        &self,
        tree: &LayerTree,
        layer: LayerId,
        node: &LayerNode,
        key: TileKey,
        region: &IntRect,
        out: &mut RgbaImage,
    ) -> bool {
        if let Some(delegate) = &self.delegate {
            if delegate.handles(layer) {
                return delegate.draw_layer(tree, layer, key, out);
            }
        }
        match node.kind {
            LayerKind::Group => {
                self.render_layers(tree, tree.children(layer), key, region, out);
                true
            }
            _ => node.kind.draw_tile(key, out),
        }
    }
}

impl Default for LayerRenderer {
    fn default() -> Self {
        Self::new()
    }
}
