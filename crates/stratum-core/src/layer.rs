use image::{Rgba, RgbaImage};
use serde::{Deserialize, Serialize};

use crate::blend::BlendMode;
use crate::geometry::{IntPoint, IntRect};
use crate::tile::{TileKey, TileKeySet, TileSurface};

/// Longest edge of a layer thumbnail, in pixels.
pub const THUMBNAIL_SIZE: u32 = 48;

/// Discriminant of [`LayerKind`], stable across streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LayerKindTag {
    Raster,
    Group,
    Solid,
}

impl LayerKindTag {
    pub fn name(&self) -> &'static str {
        match self {
            LayerKindTag::Raster => "raster",
            LayerKindTag::Group => "group",
            LayerKindTag::Solid => "solid",
        }
    }

    pub fn to_u16(&self) -> u16 {
        match self {
            LayerKindTag::Raster => 1,
            LayerKindTag::Group => 2,
            LayerKindTag::Solid => 3,
        }
    }

    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            1 => Some(LayerKindTag::Raster),
            2 => Some(LayerKindTag::Group),
            3 => Some(LayerKindTag::Solid),
            _ => None,
        }
    }
}

/// Kind-specific payload of a layer.
#[derive(Debug, Clone)]
pub enum LayerKind {
    /// Pixel content.
    Raster(TileSurface),
    /// Owns child layers and composites them as one unit.
    Group,
    /// One premultiplied colour painted into a rectangle.
    Solid { color: Rgba<u8>, rect: IntRect },
}

impl LayerKind {
    pub fn tag(&self) -> LayerKindTag {
        match self {
            LayerKind::Raster(_) => LayerKindTag::Raster,
            LayerKind::Group => LayerKindTag::Group,
            LayerKind::Solid { .. } => LayerKindTag::Solid,
        }
    }

    pub fn can_have_children(&self) -> bool {
        matches!(self, LayerKind::Group)
    }

    /// Tiles this layer paints into, not counting children.
    pub fn tile_keys(&self) -> TileKeySet {
        match self {
            LayerKind::Raster(surface) => surface.keys(),
            LayerKind::Group => TileKeySet::new(),
            LayerKind::Solid { rect, .. } => TileKey::keys_for_rect(rect),
        }
    }

    /// Whether the content is non-transparent within `margin` of `pos`.
    pub fn includes(&self, pos: IntPoint, margin: i32) -> bool {
        match self {
            LayerKind::Raster(surface) => {
                for y in pos.y - margin..=pos.y + margin {
                    for x in pos.x - margin..=pos.x + margin {
                        if surface.pixel(x, y)[3] != 0 {
                            return true;
                        }
                    }
                }
                false
            }
            LayerKind::Group => false,
            LayerKind::Solid { color, rect } => {
                color[3] != 0 && rect.adjusted(margin).contains_point(pos)
            }
        }
    }

    /// Draws this layer's own content for tile `key` into `out`.
    ///
    /// `out` is a transparent tile. Returns false when nothing was drawn.
    pub fn draw_tile(&self, key: TileKey, out: &mut RgbaImage) -> bool {
        match self {
            LayerKind::Raster(surface) => match surface.tile(key) {
                Some(tile) => {
                    let dst: &mut [u8] = out;
                    dst.copy_from_slice(tile);
                    true
                }
                None => false,
            },
            LayerKind::Group => false,
            LayerKind::Solid { color, rect } => {
                let tile_rect = key.rect();
                let local = rect.intersected(&tile_rect).translated(-tile_rect.x, -tile_rect.y);
                if local.is_empty() {
                    return false;
                }
                for y in local.top()..local.bottom() {
                    for x in local.left()..local.right() {
                        out.put_pixel(x as u32, y as u32, *color);
                    }
                }
                true
            }
        }
    }
}

/// A settable layer attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PropertyRole {
    Name,
    Visible,
    Locked,
    Opacity,
    BlendMode,
}

impl PropertyRole {
    /// Whether changing this role alters the composited pixels.
    pub fn affects_pixels(&self) -> bool {
        !matches!(self, PropertyRole::Name | PropertyRole::Locked)
    }
}

/// A property role together with its value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LayerProperty {
    Name(String),
    Visible(bool),
    Locked(bool),
    Opacity(f64),
    BlendMode(BlendMode),
}

impl LayerProperty {
    pub fn role(&self) -> PropertyRole {
        match self {
            LayerProperty::Name(_) => PropertyRole::Name,
            LayerProperty::Visible(_) => PropertyRole::Visible,
            LayerProperty::Locked(_) => PropertyRole::Locked,
            LayerProperty::Opacity(_) => PropertyRole::Opacity,
            LayerProperty::BlendMode(_) => PropertyRole::BlendMode,
        }
    }
}

/// Display properties and payload of one node in the layer tree.
///
/// Topology (parent and children) lives in the [`LayerTree`](crate::tree::LayerTree).
#[derive(Debug, Clone)]
pub struct LayerNode {
    pub name: String,
    pub visible: bool,
    pub locked: bool,
    pub opacity: f64,
    pub blend_mode: BlendMode,
    pub kind: LayerKind,
    thumbnail: Option<RgbaImage>,
    thumbnail_dirty: bool,
}

impl LayerNode {
    pub fn new(name: &str, kind: LayerKind) -> Self {
        Self {
            name: name.to_string(),
            visible: true,
            locked: false,
            opacity: 1.0,
            blend_mode: BlendMode::Normal,
            kind,
            thumbnail: None,
            thumbnail_dirty: false,
        }
    }

    pub fn raster(name: &str) -> Self {
        Self::new(name, LayerKind::Raster(TileSurface::new()))
    }

    pub fn raster_with_surface(name: &str, surface: TileSurface) -> Self {
        Self::new(name, LayerKind::Raster(surface))
    }

    pub fn group(name: &str) -> Self {
        Self::new(name, LayerKind::Group)
    }

    pub fn solid(name: &str, color: Rgba<u8>, rect: IntRect) -> Self {
        Self::new(name, LayerKind::Solid { color, rect })
    }

    /// Non-finite values leave the opacity unchanged.
    pub fn with_opacity(mut self, opacity: f64) -> Self {
        self.apply_opacity(opacity);
        self
    }

    fn apply_opacity(&mut self, opacity: f64) {
        if opacity.is_finite() {
            self.opacity = opacity.clamp(0.0, 1.0);
        }
    }

    pub fn with_blend_mode(mut self, mode: BlendMode) -> Self {
        self.blend_mode = mode;
        self
    }

    pub fn with_visible(mut self, visible: bool) -> Self {
        self.visible = visible;
        self
    }

    pub fn with_locked(mut self, locked: bool) -> Self {
        self.locked = locked;
        self
    }

    pub fn property(&self, role: PropertyRole) -> LayerProperty {
        match role {
            PropertyRole::Name => LayerProperty::Name(self.name.clone()),
            PropertyRole::Visible => LayerProperty::Visible(self.visible),
            PropertyRole::Locked => LayerProperty::Locked(self.locked),
            PropertyRole::Opacity => LayerProperty::Opacity(self.opacity),
            PropertyRole::BlendMode => LayerProperty::BlendMode(self.blend_mode),
        }
    }

    /// Applies `value` and returns the previous value of the same role.
    pub fn set_property(&mut self, value: LayerProperty) -> LayerProperty {
        let old = self.property(value.role());
        match value {
            LayerProperty::Name(name) => self.name = name,
            LayerProperty::Visible(visible) => self.visible = visible,
            LayerProperty::Locked(locked) => self.locked = locked,
            LayerProperty::Opacity(opacity) => self.apply_opacity(opacity),
            LayerProperty::BlendMode(mode) => self.blend_mode = mode,
        }
        old
    }

    pub fn surface(&self) -> Option<&TileSurface> {
        match &self.kind {
            LayerKind::Raster(surface) => Some(surface),
            _ => None,
        }
    }

    pub fn surface_mut(&mut self) -> Option<&mut TileSurface> {
        match &mut self.kind {
            LayerKind::Raster(surface) => Some(surface),
            _ => None,
        }
    }

    pub fn can_have_children(&self) -> bool {
        self.kind.can_have_children()
    }

    pub fn thumbnail(&self) -> Option<&RgbaImage> {
        self.thumbnail.as_ref()
    }

    pub fn set_thumbnail(&mut self, thumbnail: RgbaImage) {
        self.thumbnail = Some(thumbnail);
        self.thumbnail_dirty = false;
    }

    pub fn is_thumbnail_dirty(&self) -> bool {
        self.thumbnail_dirty
    }

    pub fn set_thumbnail_dirty(&mut self, dirty: bool) {
        self.thumbnail_dirty = dirty;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_property_returns_previous() {
        let mut node = LayerNode::raster("paint");
        let old = node.set_property(LayerProperty::Opacity(0.25));
        assert_eq!(old, LayerProperty::Opacity(1.0));
        assert_eq!(node.property(PropertyRole::Opacity), LayerProperty::Opacity(0.25));
        let old = node.set_property(LayerProperty::Name("ink".into()));
        assert_eq!(old, LayerProperty::Name("paint".into()));
    }

    #[test]
    fn test_opacity_is_clamped() {
        let mut node = LayerNode::group("g").with_opacity(3.0);
        assert_eq!(node.opacity, 1.0);
        node.set_property(LayerProperty::Opacity(-1.0));
        assert_eq!(node.opacity, 0.0);
    }

    #[test]
    fn test_non_finite_opacity_is_ignored() {
        let mut node = LayerNode::group("g").with_opacity(f64::NAN);
        assert_eq!(node.opacity, 1.0);
        node.set_property(LayerProperty::Opacity(0.5));
        node.set_property(LayerProperty::Opacity(f64::INFINITY));
        assert_eq!(node.opacity, 0.5);
    }

    #[test]
    fn test_solid_tile_keys_and_hit_test() {
        let kind = LayerKind::Solid {
            color: Rgba([0, 0, 255, 255]),
            rect: IntRect::new(60, 0, 10, 10),
        };
        assert_eq!(kind.tile_keys().len(), 2);
        assert!(kind.includes(IntPoint::new(65, 5), 0));
        assert!(kind.includes(IntPoint::new(58, 5), 2));
        assert!(!kind.includes(IntPoint::new(58, 5), 0));
    }

    #[test]
    fn test_raster_hit_test_uses_alpha() {
        let mut surface = TileSurface::new();
        surface.set_pixel(10, 10, Rgba([9, 9, 9, 255]));
        let kind = LayerKind::Raster(surface);
        assert!(kind.includes(IntPoint::new(10, 10), 0));
        assert!(kind.includes(IntPoint::new(12, 12), 2));
        assert!(!kind.includes(IntPoint::new(12, 12), 1));
    }

    #[test]
    fn test_only_groups_have_children() {
        assert!(LayerNode::group("g").can_have_children());
        assert!(!LayerNode::raster("r").can_have_children());
        assert_eq!(LayerKindTag::from_u16(LayerKindTag::Solid.to_u16()), Some(LayerKindTag::Solid));
    }
}
