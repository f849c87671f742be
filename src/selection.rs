use image::{GrayImage, Luma};

use crate::error::{EditError, EditResult};
use crate::geometry::IRect;
use crate::pixels::Anchor;

// ============================================================================
// SELECTION SYSTEM
// ============================================================================

/// How a new selection region interacts with the existing mask.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum SelectionMode {
    /// Discard the existing mask and take the new region as-is.
    #[default]
    Replace,
    /// Union – `max(existing, new)`.
    Add,
    /// Difference – `max(existing - new, 0)`.
    Subtract,
    /// Product – `existing · new`.
    Intersect,
}

impl SelectionMode {
    pub fn all() -> &'static [SelectionMode] {
        &[SelectionMode::Replace, SelectionMode::Add, SelectionMode::Subtract, SelectionMode::Intersect]
    }

    #[inline]
    fn combine(self, existing: u8, new: u8) -> u8 {
        match self {
            SelectionMode::Replace => new,
            SelectionMode::Add => existing.max(new),
            SelectionMode::Subtract => existing.saturating_sub(new),
            SelectionMode::Intersect => ((existing as u32 * new as u32 + 127) / 255) as u8,
        }
    }
}

/// Geometric selection shapes in canvas coordinates.
#[derive(Clone, Debug, PartialEq)]
pub enum SelectionShape {
    /// Half-open pixel rectangle.
    Rectangle(IRect),
    Ellipse { cx: f32, cy: f32, rx: f32, ry: f32 },
}

impl SelectionShape {
    /// Returns 255 if the pixel centre (x, y) is inside the shape, 0 otherwise.
    pub fn contains(&self, x: i32, y: i32) -> u8 {
        match self {
            SelectionShape::Rectangle(r) => {
                if r.contains(x, y) { 255 } else { 0 }
            }
            SelectionShape::Ellipse { cx, cy, rx, ry } => {
                if *rx <= 0.0 || *ry <= 0.0 {
                    return 0;
                }
                let dx = (x as f32 + 0.5 - cx) / rx;
                let dy = (y as f32 + 0.5 - cy) / ry;
                if dx * dx + dy * dy <= 1.0 { 255 } else { 0 }
            }
        }
    }

    /// Pixel bounding box (unclipped).
    pub fn bounds(&self) -> IRect {
        match self {
            SelectionShape::Rectangle(r) => *r,
            SelectionShape::Ellipse { cx, cy, rx, ry } => IRect::from_min_max(
                (cx - rx).floor() as i32,
                (cy - ry).floor() as i32,
                (cx + rx).ceil() as i32,
                (cy + ry).ceil() as i32,
            ),
        }
    }
}

/// Region fed into [`SelectionMask::set_region`].
#[derive(Clone, Debug)]
pub enum SelectionSource {
    Shape(SelectionShape),
    /// Soft coverage buffer whose top-left sits at `(x, y)` on the canvas.
    Coverage { x: i32, y: i32, mask: GrayImage },
}

/// Canvas-aligned coverage map. 0 = unselected, 255 = fully selected.
///
/// An all-zero mask is an *empty* selection, which edits treat as "whole
/// canvas editable". No storage is held while the selection is empty.
#[derive(Clone, Debug, PartialEq)]
pub struct SelectionMask {
    width: u32,
    height: u32,
    mask: Option<GrayImage>,
}

impl SelectionMask {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height, mask: None }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn canvas_rect(&self) -> IRect {
        IRect::from_size(self.width, self.height)
    }

    /// True when no pixel has non-zero coverage.
    pub fn is_empty(&self) -> bool {
        match &self.mask {
            None => true,
            Some(m) => m.as_raw().iter().all(|v| *v == 0),
        }
    }

    /// Raw coverage at a canvas pixel (0 outside the canvas or when empty).
    #[inline]
    pub fn coverage(&self, x: i32, y: i32) -> u8 {
        match &self.mask {
            Some(m) if x >= 0 && y >= 0 && (x as u32) < self.width && (y as u32) < self.height => {
                m.get_pixel(x as u32, y as u32).0[0]
            }
            _ => 0,
        }
    }

    /// Combine a new region into the mask. Parts of the region outside the
    /// canvas are ignored, keeping the selection within canvas bounds.
    pub fn set_region(&mut self, source: &SelectionSource, mode: SelectionMode) {
        let (w, h) = (self.width, self.height);
        let canvas = self.canvas_rect();
        let region = match source {
            SelectionSource::Shape(shape) => shape.bounds(),
            SelectionSource::Coverage { x, y, mask } => IRect::new(*x, *y, mask.width(), mask.height()),
        };
        let sample = |px: i32, py: i32| -> u8 {
            match source {
                SelectionSource::Shape(shape) => shape.contains(px, py),
                SelectionSource::Coverage { x, y, mask } => {
                    let (lx, ly) = (px - x, py - y);
                    if lx < 0 || ly < 0 || lx as u32 >= mask.width() || ly as u32 >= mask.height() {
                        0
                    } else {
                        mask.get_pixel(lx as u32, ly as u32).0[0]
                    }
                }
            }
        };

        let mask = self.mask.get_or_insert_with(|| GrayImage::new(w, h));
        match mode {
            // Outside the region `new` is 0: replace/intersect zero it, add/subtract leave it.
            SelectionMode::Replace | SelectionMode::Intersect => {
                let old = std::mem::replace(mask, GrayImage::new(w, h));
                let clip = region.intersect(&canvas);
                for y in clip.y0..clip.y1 {
                    for x in clip.x0..clip.x1 {
                        let existing = old.get_pixel(x as u32, y as u32).0[0];
                        let v = mode.combine(existing, sample(x, y));
                        if v > 0 {
                            mask.put_pixel(x as u32, y as u32, Luma([v]));
                        }
                    }
                }
            }
            SelectionMode::Add | SelectionMode::Subtract => {
                let clip = region.intersect(&canvas);
                for y in clip.y0..clip.y1 {
                    for x in clip.x0..clip.x1 {
                        let p = mask.get_pixel_mut(x as u32, y as u32);
                        p.0[0] = mode.combine(p.0[0], sample(x, y));
                    }
                }
            }
        }
        if self.is_empty() {
            self.mask = None;
        }
    }

    pub fn select_all(&mut self) {
        self.mask = Some(GrayImage::from_pixel(self.width, self.height, Luma([255])));
    }

    pub fn clear(&mut self) {
        self.mask = None;
    }

    /// `255 - coverage` everywhere. Inverting an empty selection selects everything.
    pub fn invert(&mut self) {
        let Some(m) = self.mask.as_mut() else {
            self.select_all();
            return;
        };
        for p in m.pixels_mut() {
            p.0[0] = 255 - p.0[0];
        }
        if self.is_empty() {
            self.mask = None;
        }
    }

    /// Shift the mask by (dx, dy); pixels moved off-canvas are clipped,
    /// newly exposed areas are unselected.
    pub fn translate(&mut self, dx: i32, dy: i32) {
        let Some(old) = self.mask.as_ref() else { return };
        if dx == 0 && dy == 0 {
            return;
        }
        let (w, h) = (self.width, self.height);
        let mut next = GrayImage::new(w, h);
        for y in 0..h as i32 {
            for x in 0..w as i32 {
                let (sx, sy) = (x - dx, y - dy);
                if sx >= 0 && sy >= 0 && (sx as u32) < w && (sy as u32) < h {
                    let v = old.get_pixel(sx as u32, sy as u32).0[0];
                    if v > 0 {
                        next.put_pixel(x as u32, y as u32, Luma([v]));
                    }
                }
            }
        }
        self.mask = Some(next);
        if self.is_empty() {
            self.mask = None;
        }
    }

    /// Reallocate for a resized canvas, keeping coverage pinned to `anchor`.
    pub fn resize(&mut self, new_w: u32, new_h: u32, anchor: Anchor) -> EditResult<()> {
        if new_w == 0 || new_h == 0 {
            return Err(EditError::InvalidDimensions { width: new_w, height: new_h });
        }
        let (ox, oy) = anchor.offset(self.width, self.height, new_w, new_h);
        let old = self.mask.take();
        self.width = new_w;
        self.height = new_h;
        if let Some(old) = old {
            let source = SelectionSource::Coverage { x: ox, y: oy, mask: old };
            self.set_region(&source, SelectionMode::Replace);
        }
        Ok(())
    }

    /// Minimal rect containing every non-zero coverage value, or empty.
    pub fn bounding_box(&self) -> IRect {
        let Some(m) = &self.mask else { return IRect::EMPTY };
        let (w, h) = (self.width as usize, self.height as usize);
        let raw = m.as_raw();
        let mut bb: Option<(usize, usize, usize, usize)> = None;
        for y in 0..h {
            let row = &raw[y * w..(y + 1) * w];
            let Some(first) = row.iter().position(|v| *v != 0) else { continue };
            let last = row.iter().rposition(|v| *v != 0).unwrap_or(first);
            bb = Some(match bb {
                None => (first, y, last, y),
                Some((x0, y0, x1, _)) => (x0.min(first), y0, x1.max(last), y),
            });
        }
        match bb {
            Some((x0, y0, x1, y1)) => IRect::from_min_max(x0 as i32, y0 as i32, x1 as i32 + 1, y1 as i32 + 1),
            None => IRect::EMPTY,
        }
    }

    /// Coverage inside `rect` as its own buffer (outside-canvas reads as 0).
    pub fn crop(&self, rect: IRect) -> GrayImage {
        let mut out = GrayImage::new(rect.width(), rect.height());
        if self.mask.is_none() {
            return out;
        }
        for y in rect.y0..rect.y1 {
            for x in rect.x0..rect.x1 {
                let v = self.coverage(x, y);
                if v > 0 {
                    out.put_pixel((x - rect.x0) as u32, (y - rect.y0) as u32, Luma([v]));
                }
            }
        }
        out
    }

    /// Raw coverage bytes, or `None` when the selection is empty.
    pub fn to_raw(&self) -> Option<Vec<u8>> {
        if self.is_empty() {
            return None;
        }
        self.mask.as_ref().map(|m| m.as_raw().clone())
    }

    /// Rebuild from raw coverage bytes (`width * height` of them).
    pub fn from_raw(width: u32, height: u32, raw: Option<Vec<u8>>) -> EditResult<Self> {
        let mut sel = Self::new(width, height);
        if let Some(raw) = raw {
            let expected = width as usize * height as usize;
            if raw.len() != expected {
                return Err(EditError::FormatMismatch { expected, actual: raw.len() });
            }
            sel.mask = GrayImage::from_raw(width, height, raw);
            if sel.is_empty() {
                sel.mask = None;
            }
        }
        Ok(sel)
    }

    pub fn memory_bytes(&self) -> usize {
        self.mask.as_ref().map_or(0, |m| m.as_raw().len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rect(x: i32, y: i32, w: u32, h: u32) -> SelectionSource {
        SelectionSource::Shape(SelectionShape::Rectangle(IRect::new(x, y, w, h)))
    }

    #[test]
    fn fresh_mask_is_empty() {
        let sel = SelectionMask::new(10, 10);
        assert!(sel.is_empty());
        assert!(sel.bounding_box().is_empty());
    }

    #[test]
    fn replace_then_bounding_box() {
        let mut sel = SelectionMask::new(50, 50);
        sel.set_region(&rect(10, 20, 5, 3), SelectionMode::Replace);
        assert_eq!(sel.bounding_box(), IRect::new(10, 20, 5, 3));
        sel.set_region(&rect(0, 0, 2, 2), SelectionMode::Replace);
        assert_eq!(sel.bounding_box(), IRect::new(0, 0, 2, 2));
    }

    #[test]
    fn combination_math() {
        let mut sel = SelectionMask::new(4, 1);
        let soft = |v: u8| SelectionSource::Coverage { x: 0, y: 0, mask: GrayImage::from_pixel(4, 1, Luma([v])) };
        sel.set_region(&soft(200), SelectionMode::Replace);
        sel.set_region(&soft(100), SelectionMode::Add);
        assert_eq!(sel.coverage(0, 0), 200);
        sel.set_region(&soft(50), SelectionMode::Subtract);
        assert_eq!(sel.coverage(0, 0), 150);
        sel.set_region(&soft(128), SelectionMode::Intersect);
        assert_eq!(sel.coverage(0, 0), 75);
        sel.set_region(&soft(255), SelectionMode::Subtract);
        assert!(sel.is_empty());
    }

    #[test]
    fn intersect_zeroes_outside_new_region() {
        let mut sel = SelectionMask::new(10, 10);
        sel.set_region(&rect(0, 0, 10, 10), SelectionMode::Replace);
        sel.set_region(&rect(2, 2, 3, 3), SelectionMode::Intersect);
        assert_eq!(sel.bounding_box(), IRect::new(2, 2, 3, 3));
    }

    #[test]
    fn regions_are_clipped_to_canvas() {
        let mut sel = SelectionMask::new(10, 10);
        sel.set_region(&rect(-5, 8, 20, 20), SelectionMode::Replace);
        assert_eq!(sel.bounding_box(), IRect::from_min_max(0, 8, 10, 10));
    }

    #[test]
    fn invert_and_translate() {
        let mut sel = SelectionMask::new(4, 4);
        sel.set_region(&rect(0, 0, 2, 4), SelectionMode::Replace);
        sel.invert();
        assert_eq!(sel.bounding_box(), IRect::new(2, 0, 2, 4));
        sel.translate(-2, 0);
        assert_eq!(sel.bounding_box(), IRect::new(0, 0, 2, 4));
        sel.translate(10, 0);
        assert!(sel.is_empty());
    }

    #[test]
    fn crop_extracts_coverage() {
        let mut sel = SelectionMask::new(8, 8);
        sel.set_region(&rect(2, 2, 2, 2), SelectionMode::Replace);
        let crop = sel.crop(IRect::new(1, 1, 4, 4));
        assert_eq!(crop.get_pixel(0, 0).0[0], 0);
        assert_eq!(crop.get_pixel(1, 1).0[0], 255);
    }
}
