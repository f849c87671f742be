use kurbo::{Affine, Point, Rect, Vec2};
use serde::{Deserialize, Serialize};

// ============================================================================
// INTEGER PIXEL RECTANGLE
// ============================================================================

/// Half-open pixel rectangle in canvas (or layer-local) space.
/// `x0..x1` × `y0..y1`; a rect with `x1 <= x0` or `y1 <= y0` is empty.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct IRect {
    pub x0: i32,
    pub y0: i32,
    pub x1: i32,
    pub y1: i32,
}

impl IRect {
    pub const EMPTY: IRect = IRect { x0: 0, y0: 0, x1: 0, y1: 0 };

    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x0: x,
            y0: y,
            x1: x.saturating_add(width.min(i32::MAX as u32) as i32),
            y1: y.saturating_add(height.min(i32::MAX as u32) as i32),
        }
    }

    pub fn from_min_max(x0: i32, y0: i32, x1: i32, y1: i32) -> Self {
        Self { x0, y0, x1, y1 }
    }

    /// Rect covering a `width × height` buffer anchored at the origin.
    pub fn from_size(width: u32, height: u32) -> Self {
        Self::new(0, 0, width, height)
    }

    pub fn width(&self) -> u32 {
        if self.x1 > self.x0 { (self.x1 as i64 - self.x0 as i64) as u32 } else { 0 }
    }

    pub fn height(&self) -> u32 {
        if self.y1 > self.y0 { (self.y1 as i64 - self.y0 as i64) as u32 } else { 0 }
    }

    pub fn area(&self) -> u64 {
        self.width() as u64 * self.height() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.x1 <= self.x0 || self.y1 <= self.y0
    }

    pub fn contains(&self, x: i32, y: i32) -> bool {
        x >= self.x0 && x < self.x1 && y >= self.y0 && y < self.y1
    }

    /// True when `other` lies entirely inside `self`. Empty rects are contained everywhere.
    pub fn contains_rect(&self, other: &IRect) -> bool {
        other.is_empty()
            || (other.x0 >= self.x0 && other.y0 >= self.y0 && other.x1 <= self.x1 && other.y1 <= self.y1)
    }

    pub fn intersect(&self, other: &IRect) -> IRect {
        let r = IRect {
            x0: self.x0.max(other.x0),
            y0: self.y0.max(other.y0),
            x1: self.x1.min(other.x1),
            y1: self.y1.min(other.y1),
        };
        if r.is_empty() { IRect::EMPTY } else { r }
    }

    pub fn intersects(&self, other: &IRect) -> bool {
        !self.intersect(other).is_empty()
    }

    /// Smallest rect containing both. Empty operands are ignored.
    pub fn union(&self, other: &IRect) -> IRect {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        IRect {
            x0: self.x0.min(other.x0),
            y0: self.y0.min(other.y0),
            x1: self.x1.max(other.x1),
            y1: self.y1.max(other.y1),
        }
    }

    pub fn translate(&self, dx: i32, dy: i32) -> IRect {
        IRect {
            x0: self.x0.saturating_add(dx),
            y0: self.y0.saturating_add(dy),
            x1: self.x1.saturating_add(dx),
            y1: self.y1.saturating_add(dy),
        }
    }

    pub(crate) fn to_kurbo(self) -> Rect {
        Rect::new(self.x0 as f64, self.y0 as f64, self.x1 as f64, self.y1 as f64)
    }

    /// Snap a floating-point rect outward to whole pixels.
    /// Returns `None` when the result does not fit in 32-bit signed coordinates.
    pub(crate) fn from_kurbo_outer(r: Rect) -> Option<IRect> {
        let fits = |v: f64| v.is_finite() && v >= i32::MIN as f64 && v <= i32::MAX as f64;
        // Trig round-off must not grow the box by a whole pixel.
        let snap = |v: f64| if (v - v.round()).abs() < 1e-6 { v.round() } else { v };
        let (x0, y0) = (snap(r.x0).floor(), snap(r.y0).floor());
        let (x1, y1) = (snap(r.x1).ceil(), snap(r.y1).ceil());
        if !(fits(x0) && fits(y0) && fits(x1) && fits(y1)) {
            return None;
        }
        Some(IRect::from_min_max(x0 as i32, y0 as i32, x1 as i32, y1 as i32))
    }
}

// ============================================================================
// LAYER TRANSFORM
// ============================================================================

/// Affine placement of a layer buffer on the canvas.
///
/// Rotation (radians, clockwise in screen space) and scale pivot around the
/// centre of the layer buffer; translation is applied last, on top of the
/// layer's integer origin.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct LayerTransform {
    pub translate_x: f64,
    pub translate_y: f64,
    pub rotation: f64,
    pub scale_x: f64,
    pub scale_y: f64,
}

impl Default for LayerTransform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl LayerTransform {
    pub const IDENTITY: LayerTransform = LayerTransform {
        translate_x: 0.0,
        translate_y: 0.0,
        rotation: 0.0,
        scale_x: 1.0,
        scale_y: 1.0,
    };

    pub fn translation(dx: f64, dy: f64) -> Self {
        Self { translate_x: dx, translate_y: dy, ..Self::IDENTITY }
    }

    pub fn is_finite(&self) -> bool {
        [self.translate_x, self.translate_y, self.rotation, self.scale_x, self.scale_y]
            .iter()
            .all(|v| v.is_finite())
    }

    /// Non-degenerate: both scale factors non-zero and every component finite.
    pub fn is_invertible(&self) -> bool {
        self.is_finite() && self.scale_x != 0.0 && self.scale_y != 0.0
    }

    /// Whole-pixel offset when the transform is a pure integral translation.
    pub fn integer_offset(&self) -> Option<(i32, i32)> {
        if self.rotation != 0.0 || self.scale_x != 1.0 || self.scale_y != 1.0 {
            return None;
        }
        if self.translate_x.fract() != 0.0 || self.translate_y.fract() != 0.0 {
            return None;
        }
        let fits = |v: f64| v >= i32::MIN as f64 && v <= i32::MAX as f64;
        if !fits(self.translate_x) || !fits(self.translate_y) {
            return None;
        }
        Some((self.translate_x as i32, self.translate_y as i32))
    }

    /// Layer-local → canvas affine for a buffer of `width × height` at `origin`.
    pub fn to_affine(&self, origin: (i32, i32), width: u32, height: u32) -> Affine {
        let center = Vec2::new(width as f64 / 2.0, height as f64 / 2.0);
        Affine::translate(Vec2::new(
            origin.0 as f64 + self.translate_x,
            origin.1 as f64 + self.translate_y,
        )) * Affine::translate(center)
            * Affine::rotate(self.rotation)
            * Affine::scale_non_uniform(self.scale_x, self.scale_y)
            * Affine::translate(-center)
    }

    /// Canvas-space bounding box of a `width × height` buffer placed at `origin`.
    pub fn bounds(&self, origin: (i32, i32), width: u32, height: u32) -> Option<IRect> {
        if let Some((dx, dy)) = self.integer_offset() {
            let x = origin.0.checked_add(dx)?;
            let y = origin.1.checked_add(dy)?;
            x.checked_add(i32::try_from(width).ok()?)?;
            y.checked_add(i32::try_from(height).ok()?)?;
            return Some(IRect::new(x, y, width, height));
        }
        let local = IRect::from_size(width, height).to_kurbo();
        IRect::from_kurbo_outer(self.to_affine(origin, width, height).transform_rect_bbox(local))
    }
}

/// Map the centre of canvas pixel `(x, y)` through `inverse` and return the
/// layer-local pixel it lands in (nearest-neighbour).
#[inline]
pub(crate) fn sample_local(inverse: &Affine, x: i32, y: i32) -> (i64, i64) {
    let p = *inverse * Point::new(x as f64 + 0.5, y as f64 + 0.5);
    (p.x.floor() as i64, p.y.floor() as i64)
}
