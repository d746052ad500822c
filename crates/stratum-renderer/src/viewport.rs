use kurbo::{Affine, Point, Vec2};
use serde::{Deserialize, Serialize};

use stratum_core::IntSize;

/// Pan, zoom, rotation and mirroring of the canvas view.
///
/// Produces the scene-to-view [`Affine`] handed to
/// [`ViewportState::set_transform`](crate::ViewportState::set_transform).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ViewTransform {
    /// View-space position of the scene origin.
    pub pan_x: f64,
    pub pan_y: f64,
    /// View pixels per scene pixel.
    pub scale: f64,
    /// Rotation in radians, clockwise on screen.
    pub rotation: f64,
    /// Mirror the scene horizontally before rotating.
    pub mirrored: bool,
}

impl Default for ViewTransform {
    fn default() -> Self {
        Self {
            pan_x: 0.0,
            pan_y: 0.0,
            scale: 1.0,
            rotation: 0.0,
            mirrored: false,
        }
    }
}

impl ViewTransform {
    pub const MIN_SCALE: f64 = 1.0 / 64.0;
    pub const MAX_SCALE: f64 = 64.0;

    pub fn new() -> Self {
        Self::default()
    }

    /// Scene to view transform.
    pub fn to_view(&self) -> Affine {
        let mut affine = Affine::translate((self.pan_x, self.pan_y))
            * Affine::rotate(self.rotation)
            * Affine::scale(self.scale);
        if self.mirrored {
            affine = affine * Affine::FLIP_X;
        }
        affine
    }

    /// View to scene transform.
    pub fn to_scene(&self) -> Affine {
        self.to_view().inverse()
    }

    pub fn scene_to_view(&self, p: Point) -> Point {
        self.to_view() * p
    }

    pub fn view_to_scene(&self, p: Point) -> Point {
        self.to_scene() * p
    }

    /// Pan by a delta in view pixels.
    pub fn pan(&mut self, dx: f64, dy: f64) {
        self.pan_x += dx;
        self.pan_y += dy;
    }

    /// Zoom by `factor`, keeping the scene point under `view_point` fixed.
    pub fn zoom_at(&mut self, view_point: Point, factor: f64) {
        let anchor = self.view_to_scene(view_point);
        self.scale = (self.scale * factor).clamp(Self::MIN_SCALE, Self::MAX_SCALE);
        let moved = self.scene_to_view(anchor);
        let Vec2 { x, y } = view_point - moved;
        self.pan(x, y);
    }

    /// Rotate around `view_point` to an absolute angle.
    pub fn rotate_at(&mut self, view_point: Point, rotation: f64) {
        let anchor = self.view_to_scene(view_point);
        self.rotation = rotation;
        let Vec2 { x, y } = view_point - self.scene_to_view(anchor);
        self.pan(x, y);
    }

    pub fn set_mirrored(&mut self, view_point: Point, mirrored: bool) {
        let anchor = self.view_to_scene(view_point);
        self.mirrored = mirrored;
        let Vec2 { x, y } = view_point - self.scene_to_view(anchor);
        self.pan(x, y);
    }

    /// Unrotated, unmirrored view showing the whole document centred with a margin.
    pub fn fit(document_size: IntSize, view_width: f64, view_height: f64) -> Self {
        if document_size.is_empty() || view_width <= 0.0 || view_height <= 0.0 {
            return Self::default();
        }
        let (w, h) = (f64::from(document_size.width), f64::from(document_size.height));
        let scale = (view_width / w * 0.9)
            .min(view_height / h * 0.9)
            .clamp(Self::MIN_SCALE, Self::MAX_SCALE);
        Self {
            pan_x: ((view_width - w * scale) / 2.0).round(),
            pan_y: ((view_height - h * scale) / 2.0).round(),
            scale,
            rotation: 0.0,
            mirrored: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: Point, b: Point) -> bool {
        (a - b).hypot() < 1e-9
    }

    #[test]
    fn test_identity_by_default() {
        assert_eq!(ViewTransform::new().to_view(), Affine::IDENTITY);
    }

    #[test]
    fn test_zoom_at_keeps_anchor_fixed() {
        let mut view = ViewTransform::new();
        view.pan(30.0, -12.0);
        let cursor = Point::new(100.0, 80.0);
        let before = view.view_to_scene(cursor);
        view.zoom_at(cursor, 2.5);
        assert!((view.scale - 2.5).abs() < 1e-12);
        assert!(close(view.view_to_scene(cursor), before));
    }

    #[test]
    fn test_zoom_is_clamped() {
        let mut view = ViewTransform::new();
        view.zoom_at(Point::ORIGIN, 1e9);
        assert_eq!(view.scale, ViewTransform::MAX_SCALE);
    }

    #[test]
    fn test_rotate_and_mirror_keep_anchor() {
        let mut view = ViewTransform::new();
        let center = Point::new(50.0, 50.0);
        let before = view.view_to_scene(center);
        view.rotate_at(center, std::f64::consts::FRAC_PI_2);
        assert!(close(view.view_to_scene(center), before));
        view.set_mirrored(center, true);
        assert!(close(view.view_to_scene(center), before));
    }

    #[test]
    fn test_fit_centres_document() {
        let view = ViewTransform::fit(IntSize::new(100, 50), 200.0, 200.0);
        assert!((view.scale - 1.8).abs() < 1e-12);
        assert_eq!(view.pan_x, 10.0);
        assert_eq!(view.pan_y, 55.0);
    }
}
