use std::sync::Arc;

use image::{Rgba, RgbaImage};
use kurbo::Affine;

use stratum_core::blend::blend_region;
use stratum_core::tile::{new_tile, CANVAS_GRAY};
use stratum_core::{
    BlendMode, IntPoint, IntRect, IntSize, LayerRenderer, LayerTree, TileKey, TileKeySet,
    TileSurface,
};

/// Paper colour of the document area.
pub const PAGE_WHITE: Rgba<u8> = Rgba([255, 255, 255, 255]);

/// Everything the viewport needs to repaint a window region.
#[derive(Debug, Clone)]
pub struct ViewportState {
    document_size: IntSize,
    surface: TileSurface,
    to_scene: Affine,
    to_view: Affine,
    translation_only: bool,
    translation_to_scene: IntPoint,
    retina_mode: bool,
    cache: Option<(IntRect, RgbaImage)>,
}

impl ViewportState {
    pub fn new(document_size: IntSize) -> Self {
        Self {
            document_size,
            surface: TileSurface::with_background(CANVAS_GRAY),
            to_scene: Affine::IDENTITY,
            to_view: Affine::IDENTITY,
            translation_only: true,
            translation_to_scene: IntPoint::new(0, 0),
            retina_mode: false,
            cache: None,
        }
    }

    pub fn document_size(&self) -> IntSize {
        self.document_size
    }

    pub fn document_rect(&self) -> IntRect {
        IntRect::from_size(self.document_size)
    }

    /// Resizes the document, dropping every composited tile.
    pub fn set_document_size(&mut self, size: IntSize) {
        self.document_size = size;
        self.surface.clear();
        self.cache = None;
    }

    /// The composited backing surface.
    pub fn surface(&self) -> &TileSurface {
        &self.surface
    }

    pub fn to_scene(&self) -> Affine {
        self.to_scene
    }

    pub fn to_view(&self) -> Affine {
        self.to_view
    }

    pub fn is_translation_only(&self) -> bool {
        self.translation_only
    }

    pub fn translation_to_scene(&self) -> IntPoint {
        self.translation_to_scene
    }

    pub fn retina_mode(&self) -> bool {
        self.retina_mode
    }

    /// In retina mode window coordinates are half the device coordinates.
    pub fn set_retina_mode(&mut self, retina: bool) {
        self.retina_mode = retina;
    }

    /// Sets the scene-to-view transform. Singular transforms are ignored.
    pub fn set_transform(&mut self, to_view: Affine) -> bool {
        if to_view.determinant().abs() < f64::EPSILON {
            log::warn!("ignoring singular view transform {:?}", to_view.as_coeffs());
            return false;
        }
        self.to_view = to_view;
        self.to_scene = to_view.inverse();

        let [a, b, c, d, e, f] = to_view.as_coeffs();
        let integral = |v: f64| (v - v.round()).abs() < 1e-9;
        self.translation_only =
            a == 1.0 && b == 0.0 && c == 0.0 && d == 1.0 && integral(e) && integral(f);
        self.translation_to_scene = if self.translation_only {
            IntPoint::new(-e.round() as i32, -f.round() as i32)
        } else {
            IntPoint::new(0, 0)
        };
        true
    }

    pub fn cache_rect(&self) -> Option<IntRect> {
        self.cache.as_ref().map(|(rect, _)| *rect)
    }

    pub fn invalidate_cache(&mut self) {
        self.cache = None;
    }

    /// Crops the backing surface, reusing the cached crop when `rect` matches it.
    pub(crate) fn crop(&mut self, rect: &IntRect) -> RgbaImage {
        if let Some((cached, image)) = &self.cache {
            if cached == rect {
                return image.clone();
            }
        }
        let image = self.surface.crop(rect);
        self.cache = Some((*rect, image.clone()));
        image
    }

    /// Re-composites `keys` of the document from `tree`'s top-level layers.
    ///
    /// Document pixels are composited over white; tiles outside the document
    /// read as the gray background.
    pub fn update_tiles(&mut self, tree: &LayerTree, renderer: &LayerRenderer, keys: &TileKeySet) {
        if keys.is_empty() {
            return;
        }
        let document = self.document_rect();
        let rendered = renderer.render(tree, tree.children(tree.root()), keys);

        for &key in keys {
            let tile_rect = key.rect();
            let page = document.intersected(&tile_rect).translated(-tile_rect.x, -tile_rect.y);
            if page.is_empty() {
                self.surface.remove_tile(key);
                continue;
            }
            let mut tile = new_tile(CANVAS_GRAY);
            for y in page.top()..page.bottom() {
                for x in page.left()..page.right() {
                    tile.put_pixel(x as u32, y as u32, PAGE_WHITE);
                }
            }
            if let Some(content) = rendered.tile(key) {
                blend_region(renderer.blender(), BlendMode::Normal, &mut tile, content, &page, 1.0);
            }
            self.surface.insert_shared(key, Arc::new(tile));
        }

        if let Some(cached) = self.cache_rect() {
            if keys.iter().any(|key| key.rect().intersects(&cached)) {
                log::debug!("viewport cache invalidated by damage");
                self.cache = None;
            }
        }
    }

    /// Re-composites every tile of the document.
    pub fn update_all(&mut self, tree: &LayerTree, renderer: &LayerRenderer) {
        let keys = TileKey::keys_for_rect(&self.document_rect());
        self.update_tiles(tree, renderer, &keys);
    }
}
