use image::RgbaImage;
use serde::{Deserialize, Serialize};

use crate::geometry::IntRect;

/// Compositing mode of a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum BlendMode {
    #[default]
    Normal,
    Multiply,
    Screen,
    Overlay,
    Darken,
    Lighten,
    Difference,
    Plus,
}

impl BlendMode {
    pub fn all() -> &'static [BlendMode] {
        &[
            BlendMode::Normal,
            BlendMode::Multiply,
            BlendMode::Screen,
            BlendMode::Overlay,
            BlendMode::Darken,
            BlendMode::Lighten,
            BlendMode::Difference,
            BlendMode::Plus,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            BlendMode::Normal => "Normal",
            BlendMode::Multiply => "Multiply",
            BlendMode::Screen => "Screen",
            BlendMode::Overlay => "Overlay",
            BlendMode::Darken => "Darken",
            BlendMode::Lighten => "Lighten",
            BlendMode::Difference => "Difference",
            BlendMode::Plus => "Plus",
        }
    }

    /// Stable code for binary streams.
    pub fn to_u8(&self) -> u8 {
        match self {
            BlendMode::Normal => 0,
            BlendMode::Multiply => 1,
            BlendMode::Screen => 2,
            BlendMode::Overlay => 3,
            BlendMode::Darken => 4,
            BlendMode::Lighten => 5,
            BlendMode::Difference => 6,
            BlendMode::Plus => 7,
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        Self::all().get(usize::from(v)).copied()
    }
}

/// Pixel blending operation, pluggable so hosts can supply their own math.
///
/// Buffers are premultiplied RGBA8 of equal length. `opacity` scales the
/// source before blending.
pub trait Blender: std::fmt::Debug {
    fn blend(&self, mode: BlendMode, dst: &mut [u8], src: &[u8], opacity: f32);
}

/// Separable blend modes on premultiplied pixels.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultBlender;

impl Blender for DefaultBlender {
    fn blend(&self, mode: BlendMode, dst: &mut [u8], src: &[u8], opacity: f32) {
        let opacity = opacity.clamp(0.0, 1.0);
        if opacity <= 0.0 {
            return;
        }
        for (d, s) in dst.chunks_exact_mut(4).zip(src.chunks_exact(4)) {
            if s[3] == 0 && mode != BlendMode::Plus {
                continue;
            }
            let dst_px = [d[0], d[1], d[2], d[3]];
            let src_px = [s[0], s[1], s[2], s[3]];
            let out = match mode {
                BlendMode::Normal => over(dst_px, src_px, opacity),
                _ => blend_separable(mode, dst_px, src_px, opacity),
            };
            d.copy_from_slice(&out);
        }
    }
}

/// Blends `src` onto `dst` inside `region`; both images share the same size.
pub fn blend_region(
    blender: &dyn Blender,
    mode: BlendMode,
    dst: &mut RgbaImage,
    src: &RgbaImage,
    region: &IntRect,
    opacity: f32,
) {
    debug_assert_eq!(dst.dimensions(), src.dimensions());
    let bounds = IntRect::new(0, 0, dst.width() as i32, dst.height() as i32);
    let region = region.intersected(&bounds);
    if region.is_empty() {
        return;
    }
    let stride = dst.width() as usize * 4;
    let start = region.x as usize * 4;
    let end = region.right() as usize * 4;
    let src_raw: &[u8] = src;
    let dst_raw: &mut [u8] = dst;
    for y in region.top()..region.bottom() {
        let row = y as usize * stride;
        blender.blend(
            mode,
            &mut dst_raw[row + start..row + end],
            &src_raw[row + start..row + end],
            opacity,
        );
    }
}

/// Source-over on premultiplied RGBA8.
pub fn over(dst: [u8; 4], src: [u8; 4], opacity: f32) -> [u8; 4] {
    let op = ((opacity * 255.0).round() as i32).clamp(0, 255) as u16;
    let sa = mul_div255(u16::from(src[3]), op);
    if sa == 0 {
        return dst;
    }
    let inv = 255u16 - u16::from(sa);

    let mut out = [0u8; 4];
    out[3] = sa.saturating_add(mul_div255(u16::from(dst[3]), inv));
    for i in 0..3 {
        let sc = mul_div255(u16::from(src[i]), op);
        let dc = mul_div255(u16::from(dst[i]), inv);
        out[i] = sc.saturating_add(dc);
    }
    out
}

fn blend_separable(mode: BlendMode, dst: [u8; 4], src: [u8; 4], opacity: f32) -> [u8; 4] {
    let sa = f32::from(src[3]) / 255.0 * opacity;
    let da = f32::from(dst[3]) / 255.0;

    let mut out = [0u8; 4];
    for i in 0..3 {
        let sc = f32::from(src[i]) / 255.0 * opacity;
        let dc = f32::from(dst[i]) / 255.0;
        let mixed = match mode {
            BlendMode::Normal => sc,
            BlendMode::Multiply => sc * dc,
            BlendMode::Screen => sc * da + dc * sa - sc * dc,
            BlendMode::Overlay => {
                if 2.0 * dc <= da {
                    2.0 * sc * dc
                } else {
                    sa * da - 2.0 * (da - dc) * (sa - sc)
                }
            }
            BlendMode::Darken => (sc * da).min(dc * sa),
            BlendMode::Lighten => (sc * da).max(dc * sa),
            BlendMode::Difference => sc * da + dc * sa - 2.0 * (sc * da).min(dc * sa),
            BlendMode::Plus => {
                out[i] = to_u8(sc + dc);
                continue;
            }
        };
        // Porter-Duff source-atop-style combination with the mixed term.
        out[i] = to_u8(sc * (1.0 - da) + dc * (1.0 - sa) + mixed);
    }
    out[3] = match mode {
        BlendMode::Plus => to_u8(sa + da),
        _ => to_u8(sa + da - sa * da),
    };
    out
}

fn to_u8(v: f32) -> u8 {
    (v.clamp(0.0, 1.0) * 255.0).round() as u8
}

fn mul_div255(x: u16, y: u16) -> u8 {
    let t = u32::from(x) * u32::from(y) + 128;
    (((t >> 8) + t) >> 8) as u8
}
