use serde::{Deserialize, Serialize};

/// A 2D point in integer pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct IntPoint {
    pub x: i32,
    pub y: i32,
}

impl IntPoint {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    pub fn translate(&self, dx: i32, dy: i32) -> Self {
        Self {
            x: self.x + dx,
            y: self.y + dy,
        }
    }
}

/// A pixel size. Negative extents are never produced by this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct IntSize {
    pub width: i32,
    pub height: i32,
}

impl IntSize {
    pub fn new(width: i32, height: i32) -> Self {
        Self { width, height }
    }

    pub fn is_empty(&self) -> bool {
        self.width <= 0 || self.height <= 0
    }
}

/// An axis-aligned pixel rectangle. `right()` and `bottom()` are exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct IntRect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl IntRect {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// The rectangle spanning `[0, size)` on both axes.
    pub fn from_size(size: IntSize) -> Self {
        Self::new(0, 0, size.width, size.height)
    }

    /// Builds a rectangle from inclusive top-left and exclusive bottom-right corners.
    pub fn from_edges(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self::new(left, top, right - left, bottom - top)
    }

    pub fn left(&self) -> i32 {
        self.x
    }

    pub fn top(&self) -> i32 {
        self.y
    }

    pub fn right(&self) -> i32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> i32 {
        self.y + self.height
    }

    pub fn top_left(&self) -> IntPoint {
        IntPoint::new(self.x, self.y)
    }

    pub fn size(&self) -> IntSize {
        IntSize::new(self.width, self.height)
    }

    pub fn area(&self) -> i64 {
        if self.is_empty() {
            0
        } else {
            i64::from(self.width) * i64::from(self.height)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width <= 0 || self.height <= 0
    }

    pub fn contains_point(&self, p: IntPoint) -> bool {
        p.x >= self.x && p.x < self.right() && p.y >= self.y && p.y < self.bottom()
    }

    pub fn intersects(&self, other: &IntRect) -> bool {
        !self.intersected(other).is_empty()
    }

    /// The overlapping region; empty (zero-sized) when the rectangles are disjoint.
    pub fn intersected(&self, other: &IntRect) -> IntRect {
        let left = self.x.max(other.x);
        let top = self.y.max(other.y);
        let right = self.right().min(other.right());
        let bottom = self.bottom().min(other.bottom());
        if right <= left || bottom <= top {
            IntRect::default()
        } else {
            IntRect::from_edges(left, top, right, bottom)
        }
    }

    /// The bounding rectangle of both; an empty operand is ignored.
    pub fn united(&self, other: &IntRect) -> IntRect {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        IntRect::from_edges(
            self.x.min(other.x),
            self.y.min(other.y),
            self.right().max(other.right()),
            self.bottom().max(other.bottom()),
        )
    }

    pub fn translated(&self, dx: i32, dy: i32) -> IntRect {
        IntRect::new(self.x + dx, self.y + dy, self.width, self.height)
    }

    /// Grows the rectangle by `margin` on every side.
    pub fn adjusted(&self, margin: i32) -> IntRect {
        IntRect::new(
            self.x - margin,
            self.y - margin,
            self.width + margin * 2,
            self.height + margin * 2,
        )
    }
}
