//! Layer thumbnails: the layer's content inside the document, scaled to fit
//! a [`THUMBNAIL_SIZE`] square.

use image::{imageops, RgbaImage};

use crate::geometry::{IntRect, IntSize};
use crate::layer::THUMBNAIL_SIZE;
use crate::render::LayerRenderer;
use crate::tile::TileKey;
use crate::tree::{LayerId, LayerTree};

/// Thumbnail dimensions for a document, preserving its aspect ratio.
pub fn thumbnail_dimensions(document_size: IntSize) -> (u32, u32) {
    if document_size.is_empty() {
        return (0, 0);
    }
    let (w, h) = (document_size.width as u32, document_size.height as u32);
    if w >= h {
        (THUMBNAIL_SIZE, (h * THUMBNAIL_SIZE / w).max(1))
    } else {
        ((w * THUMBNAIL_SIZE / h).max(1), THUMBNAIL_SIZE)
    }
}

/// Renders the thumbnail of `layer` without storing it.
pub fn render_thumbnail(
    tree: &LayerTree,
    renderer: &LayerRenderer,
    layer: LayerId,
    document_size: IntSize,
) -> RgbaImage {
    let (tw, th) = thumbnail_dimensions(document_size);
    if tw == 0 || th == 0 {
        return RgbaImage::new(0, 0);
    }
    let document = IntRect::from_size(document_size);
    let keys = tree
        .tile_keys_recursive(layer)
        .intersection(&TileKey::keys_for_rect(&document))
        .copied()
        .collect();
    let content = renderer.render_content(tree, layer, &keys);
    let image = content.crop(&document);
    imageops::thumbnail(&image, tw, th)
}

/// Regenerates and stores the thumbnail of `layer`, clearing its dirty flag.
pub fn update_thumbnail(
    tree: &mut LayerTree,
    renderer: &LayerRenderer,
    layer: LayerId,
    document_size: IntSize,
) {
    let thumbnail = render_thumbnail(tree, renderer, layer, document_size);
    if let Some(node) = tree.node_mut(layer) {
        node.set_thumbnail(thumbnail);
    }
}

/// Regenerates the thumbnails of `layer` and all its descendants.
pub fn update_thumbnail_recursive(
    tree: &mut LayerTree,
    renderer: &LayerRenderer,
    layer: LayerId,
    document_size: IntSize,
) {
    for child in tree.children(layer).to_vec() {
        update_thumbnail_recursive(tree, renderer, child, document_size);
    }
    update_thumbnail(tree, renderer, layer, document_size);
}

/// Regenerates only the dirty thumbnails below `layer`, returning how many changed.
pub fn update_dirty_thumbnails(
    tree: &mut LayerTree,
    renderer: &LayerRenderer,
    layer: LayerId,
    document_size: IntSize,
) -> usize {
    let mut updated = 0;
    for child in tree.children(layer).to_vec() {
        updated += update_dirty_thumbnails(tree, renderer, child, document_size);
        if tree.node(child).is_some_and(|n| n.is_thumbnail_dirty()) {
            update_thumbnail(tree, renderer, child, document_size);
            updated += 1;
        }
    }
    updated
}

#[cfg(test)]
mod tests {
    use image::Rgba;

    use super::*;
    use crate::layer::LayerNode;

    #[test]
    fn test_dimensions_keep_aspect() {
        assert_eq!(thumbnail_dimensions(IntSize::new(200, 100)), (48, 24));
        assert_eq!(thumbnail_dimensions(IntSize::new(100, 400)), (12, 48));
        assert_eq!(thumbnail_dimensions(IntSize::new(1000, 1)), (48, 1));
        assert_eq!(thumbnail_dimensions(IntSize::new(0, 10)), (0, 0));
    }

    #[test]
    fn test_thumbnail_of_hidden_group_shows_children() {
        let mut tree = LayerTree::new();
        let root = tree.root();
        let group = tree.create(LayerNode::group("g").with_visible(false));
        let rect = IntRect::new(0, 0, 96, 96);
        let fill = tree.create(LayerNode::solid("fill", Rgba([0, 255, 0, 255]), rect));
        tree.insert(root, 0, group).unwrap();
        tree.insert(group, 0, fill).unwrap();

        let renderer = LayerRenderer::new();
        update_thumbnail(&mut tree, &renderer, group, IntSize::new(96, 96));
        let thumb = tree.node(group).and_then(|n| n.thumbnail()).unwrap();
        assert_eq!(thumb.dimensions(), (48, 48));
        assert_eq!(*thumb.get_pixel(10, 10), Rgba([0, 255, 0, 255]));
    }

    #[test]
    fn test_dirty_sweep_only_touches_flagged_nodes() {
        let mut tree = LayerTree::new();
        let root = tree.root();
        let a = tree.create(LayerNode::raster("a"));
        let b = tree.create(LayerNode::raster("b"));
        tree.insert(root, 0, a).unwrap();
        tree.insert(root, 1, b).unwrap();
        tree.node_mut(b).unwrap().set_thumbnail_dirty(true);

        let renderer = LayerRenderer::new();
        let updated = update_dirty_thumbnails(&mut tree, &renderer, root, IntSize::new(10, 10));
        assert_eq!(updated, 1);
        assert!(tree.node(a).unwrap().thumbnail().is_none());
        assert!(tree.node(b).unwrap().thumbnail().is_some());
        assert!(!tree.node(b).unwrap().is_thumbnail_dirty());
    }
}
