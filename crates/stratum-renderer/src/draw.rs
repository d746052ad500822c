//! Window repaint: divide the damaged rectangle, map each piece into the
//! scene, and hand pixels (or a background request) to a painter.

use image::{Rgba, RgbaImage};
use kurbo::{Point, Rect};

use stratum_core::IntRect;

use crate::state::ViewportState;

/// Edge of the largest square drawn in one piece.
pub const DIVIDE_UNIT: i32 = 128;

/// Receives the output of [`draw_viewport`]. Rectangles are in window coordinates.
pub trait ViewportPainter {
    /// Draws `image` (premultiplied, device-sized) into `rect`.
    fn draw_image(&mut self, rect: IntRect, image: &RgbaImage);
    /// Fills `rect` with the canvas background; nothing of the document is visible there.
    fn draw_background(&mut self, rect: IntRect);
}

/// Splits `rect` into a grid of at most `unit`-sized pieces, column by column.
///
/// A rectangle whose area fits in one `unit` square is returned whole.
pub fn divide_rect(rect: &IntRect, unit: i32) -> Vec<IntRect> {
    if rect.is_empty() {
        return Vec::new();
    }
    if rect.area() <= i64::from(unit) * i64::from(unit) {
        return vec![*rect];
    }
    let x_count = (rect.width + unit - 1) / unit;
    let y_count = (rect.height + unit - 1) / unit;
    let mut pieces = Vec::with_capacity((x_count * y_count) as usize);
    for x in 0..x_count {
        for y in 0..y_count {
            let cell = IntRect::new(rect.x + x * unit, rect.y + y * unit, unit, unit);
            pieces.push(rect.intersected(&cell));
        }
    }
    pieces
}

fn from_window(rect: &IntRect, retina: bool) -> IntRect {
    if retina {
        IntRect::new(rect.x * 2, rect.y * 2, rect.width * 2, rect.height * 2)
    } else {
        *rect
    }
}

fn to_window(rect: &IntRect, retina: bool) -> IntRect {
    if retina {
        IntRect::new(rect.x / 2, rect.y / 2, rect.width / 2, rect.height / 2)
    } else {
        *rect
    }
}

/// Repaints `window_rect` from the viewport's backing surface.
pub fn draw_viewport(
    window_rect: &IntRect,
    state: &mut ViewportState,
    painter: &mut impl ViewportPainter,
) {
    let retina = state.retina_mode();
    let repaint = from_window(window_rect, retina);
    let document = state.document_rect();

    for view_rect in divide_rect(&repaint, DIVIDE_UNIT) {
        let window = to_window(&view_rect, retina);
        if state.is_translation_only() {
            let offset = state.translation_to_scene();
            let scene_rect = view_rect.translated(offset.x, offset.y);
            if !scene_rect.intersects(&document) {
                painter.draw_background(window);
                continue;
            }
            let image = state.crop(&scene_rect);
            painter.draw_image(window, &image);
        } else {
            let scene_rect = map_to_scene(state, &view_rect);
            if !scene_rect.intersects(&document) {
                painter.draw_background(window);
                continue;
            }
            let cropped = state.crop(&scene_rect);
            let image = resample(state, &view_rect, &scene_rect, &cropped);
            painter.draw_image(window, &image);
        }
    }
}

/// Outward-rounded scene bounding box of a view rectangle.
fn map_to_scene(state: &ViewportState, view_rect: &IntRect) -> IntRect {
    let rect = Rect::new(
        f64::from(view_rect.left()),
        f64::from(view_rect.top()),
        f64::from(view_rect.right()),
        f64::from(view_rect.bottom()),
    );
    let bbox = state.to_scene().transform_rect_bbox(rect).expand();
    IntRect::from_edges(bbox.x0 as i32, bbox.y0 as i32, bbox.x1 as i32, bbox.y1 as i32)
}

/// Samples `cropped` (covering `scene_rect`) at every pixel centre of `view_rect`.
fn resample(
    state: &ViewportState,
    view_rect: &IntRect,
    scene_rect: &IntRect,
    cropped: &RgbaImage,
) -> RgbaImage {
    let to_scene = state.to_scene();
    let mut out = RgbaImage::new(view_rect.width as u32, view_rect.height as u32);
    for (x, y, pixel) in out.enumerate_pixels_mut() {
        let view = Point::new(
            f64::from(view_rect.x) + f64::from(x) + 0.5,
            f64::from(view_rect.y) + f64::from(y) + 0.5,
        );
        let scene = to_scene * view;
        *pixel = sample_bilinear(
            cropped,
            scene.x - 0.5 - f64::from(scene_rect.x),
            scene.y - 0.5 - f64::from(scene_rect.y),
        );
    }
    out
}

/// Bilinear sample with clamped edges; `(fx, fy)` are in pixel-centre coordinates.
fn sample_bilinear(image: &RgbaImage, fx: f64, fy: f64) -> Rgba<u8> {
    let (w, h) = (image.width() as i64, image.height() as i64);
    if w == 0 || h == 0 {
        return Rgba([0, 0, 0, 0]);
    }
    let x0 = fx.floor();
    let y0 = fy.floor();
    let tx = (fx - x0) as f32;
    let ty = (fy - y0) as f32;
    let clamp_x = |v: i64| v.clamp(0, w - 1) as u32;
    let clamp_y = |v: i64| v.clamp(0, h - 1) as u32;
    let (x0, y0) = (x0 as i64, y0 as i64);

    let p00 = image.get_pixel(clamp_x(x0), clamp_y(y0));
    let p10 = image.get_pixel(clamp_x(x0 + 1), clamp_y(y0));
    let p01 = image.get_pixel(clamp_x(x0), clamp_y(y0 + 1));
    let p11 = image.get_pixel(clamp_x(x0 + 1), clamp_y(y0 + 1));

    let mut out = [0u8; 4];
    for (i, channel) in out.iter_mut().enumerate() {
        let top = f32::from(p00[i]) * (1.0 - tx) + f32::from(p10[i]) * tx;
        let bottom = f32::from(p01[i]) * (1.0 - tx) + f32::from(p11[i]) * tx;
        *channel = (top * (1.0 - ty) + bottom * ty).round().clamp(0.0, 255.0) as u8;
    }
    Rgba(out)
}
