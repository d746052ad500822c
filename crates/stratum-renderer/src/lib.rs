//! # Stratum Renderer
//!
//! Turns the composited document into window pixels for an arbitrarily
//! transformed canvas view. Damaged tiles are re-composited into a gray-backed
//! surface; repaints are divided into bounded pieces that are either cropped
//! directly (pure integer translation) or resampled through the view transform,
//! with a single cached crop to skip repeated work.

pub mod viewport;
pub mod state;
pub mod draw;

pub use draw::{divide_rect, draw_viewport, ViewportPainter, DIVIDE_UNIT};
pub use state::{ViewportState, PAGE_WHITE};
pub use viewport::ViewTransform;
