use std::sync::Arc;

use image::RgbaImage;

use crate::blend::{BlendMode, blend_pixel};
use crate::error::{EditError, EditResult};
use crate::geometry::IRect;

// ============================================================================
// PIXEL BUFFER – contiguous row-major RGBA8 storage
// ============================================================================

/// Bytes per RGBA8 pixel.
pub const CHANNELS: usize = 4;

/// Largest buffer we will allocate (same ceiling the tiled layer store used).
const MAX_PIXELS: u64 = 256_000_000;

/// Fully transparent pixel.
pub const TRANSPARENT: [u8; 4] = [0, 0, 0, 0];

/// Where existing content stays pinned when a buffer is resized.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Anchor {
    #[default]
    TopLeft,
    Top,
    TopRight,
    Left,
    Center,
    Right,
    BottomLeft,
    Bottom,
    BottomRight,
}

impl Anchor {
    /// Offset of the old content inside a `new_w × new_h` area.
    pub fn offset(self, old_w: u32, old_h: u32, new_w: u32, new_h: u32) -> (i32, i32) {
        let dw = new_w as i64 - old_w as i64;
        let dh = new_h as i64 - old_h as i64;
        let (fx, fy) = match self {
            Anchor::TopLeft => (0, 0),
            Anchor::Top => (1, 0),
            Anchor::TopRight => (2, 0),
            Anchor::Left => (0, 1),
            Anchor::Center => (1, 1),
            Anchor::Right => (2, 1),
            Anchor::BottomLeft => (0, 2),
            Anchor::Bottom => (1, 2),
            Anchor::BottomRight => (2, 2),
        };
        // Integer halving rounds toward negative infinity so shrink and grow stay symmetric.
        let ox = (dw * fx).div_euclid(2);
        let oy = (dh * fy).div_euclid(2);
        (ox as i32, oy as i32)
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "top-left" => Anchor::TopLeft,
            "top" => Anchor::Top,
            "top-right" => Anchor::TopRight,
            "left" => Anchor::Left,
            "center" => Anchor::Center,
            "right" => Anchor::Right,
            "bottom-left" => Anchor::BottomLeft,
            "bottom" => Anchor::Bottom,
            "bottom-right" => Anchor::BottomRight,
            _ => return None,
        })
    }
}

/// Owned RGBA8 raster.
///
/// The pixel store sits behind an `Arc` for copy-on-write semantics: `clone()`
/// only bumps a reference count, and the first mutation through
/// [`PixelBuffer::data_mut`] copies the bytes if they are shared (e.g. with a
/// history snapshot). Two live buffers never observe each other's writes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PixelBuffer {
    width: u32,
    height: u32,
    channels: usize,
    data: Arc<Vec<u8>>,
}

impl PixelBuffer {
    /// Allocate a transparent buffer. Resulting size: `width * height * 4` bytes.
    pub fn new(width: u32, height: u32) -> EditResult<Self> {
        Self::filled(width, height, TRANSPARENT)
    }

    /// Allocate a buffer with every pixel set to `color`.
    pub fn filled(width: u32, height: u32, color: [u8; 4]) -> EditResult<Self> {
        Self::check_dimensions(width, height)?;
        let len = width as usize * height as usize * CHANNELS;
        let data = if color == TRANSPARENT {
            vec![0u8; len]
        } else {
            color.iter().copied().cycle().take(len).collect()
        };
        Ok(Self { width, height, channels: CHANNELS, data: Arc::new(data) })
    }

    /// Wrap raw row-major RGBA bytes. `data.len()` must equal `width * height * 4`.
    pub fn from_raw(width: u32, height: u32, data: Vec<u8>) -> EditResult<Self> {
        Self::check_dimensions(width, height)?;
        let expected = width as usize * height as usize * CHANNELS;
        if data.len() != expected {
            return Err(EditError::FormatMismatch { expected, actual: data.len() });
        }
        Ok(Self { width, height, channels: CHANNELS, data: Arc::new(data) })
    }

    pub fn from_rgba_image(img: &RgbaImage) -> EditResult<Self> {
        Self::from_raw(img.width(), img.height(), img.as_raw().clone())
    }

    pub fn to_rgba_image(&self) -> RgbaImage {
        // Length invariant is upheld by every constructor.
        RgbaImage::from_raw(self.width, self.height, self.data.as_ref().clone())
            .unwrap_or_else(|| RgbaImage::new(self.width, self.height))
    }

    pub(crate) fn check_dimensions(width: u32, height: u32) -> EditResult<()> {
        if width == 0 || height == 0 || (width as u64) * (height as u64) > MAX_PIXELS {
            return Err(EditError::InvalidDimensions { width, height });
        }
        Ok(())
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Bytes per row.
    pub fn stride(&self) -> usize {
        self.width as usize * self.channels
    }

    pub fn rect(&self) -> IRect {
        IRect::from_size(self.width, self.height)
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Mutable bytes; copies the store first if a snapshot still shares it.
    pub fn data_mut(&mut self) -> &mut [u8] {
        Arc::make_mut(&mut self.data).as_mut_slice()
    }

    /// True when `other` refers to the very same storage (no copy yet).
    pub fn shares_storage_with(&self, other: &PixelBuffer) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }

    /// Heap bytes this buffer keeps alive, counted in full even when the
    /// storage is shared, so history totals are an upper bound.
    pub fn memory_bytes(&self) -> usize {
        self.data.len()
    }

    /// Identity of the underlying storage; equal for buffers that share it.
    pub(crate) fn storage_key(&self) -> usize {
        Arc::as_ptr(&self.data) as usize
    }

    /// Zero-sized stand-in for a buffer held elsewhere. Never composited.
    pub(crate) fn detached() -> Self {
        Self { width: 0, height: 0, channels: CHANNELS, data: Arc::new(Vec::new()) }
    }

    #[cfg(test)]
    pub(crate) fn downgrade(&self) -> std::sync::Weak<Vec<u8>> {
        Arc::downgrade(&self.data)
    }

    #[inline]
    fn offset(&self, x: u32, y: u32) -> usize {
        y as usize * self.stride() + x as usize * self.channels
    }

    // ---- pixel access -------------------------------------------------------

    /// Read one pixel; out-of-range coordinates read as transparent.
    #[inline]
    pub fn get_pixel(&self, x: i64, y: i64) -> [u8; 4] {
        if x < 0 || y < 0 || x >= self.width as i64 || y >= self.height as i64 {
            return TRANSPARENT;
        }
        let o = self.offset(x as u32, y as u32);
        [self.data[o], self.data[o + 1], self.data[o + 2], self.data[o + 3]]
    }

    /// Write one pixel; out-of-range coordinates are ignored. Size unchanged.
    #[inline]
    pub fn put_pixel(&mut self, x: i64, y: i64, px: [u8; 4]) {
        if x < 0 || y < 0 || x >= self.width as i64 || y >= self.height as i64 {
            return;
        }
        let o = self.offset(x as u32, y as u32);
        self.data_mut()[o..o + 4].copy_from_slice(&px);
    }

    /// Copy `rect` out into a new buffer of exactly `rect`'s size.
    /// Parts of `rect` outside this buffer read as transparent.
    pub fn read_region(&self, rect: IRect) -> EditResult<PixelBuffer> {
        let mut out = PixelBuffer::new(rect.width(), rect.height())?;
        let inside = rect.intersect(&self.rect());
        if inside.is_empty() {
            return Ok(out);
        }
        let row_bytes = inside.width() as usize * CHANNELS;
        let out_stride = out.stride();
        let dst = out.data_mut();
        for y in inside.y0..inside.y1 {
            let src_off = self.offset(inside.x0 as u32, y as u32);
            let dst_off = (y - rect.y0) as usize * out_stride + (inside.x0 - rect.x0) as usize * CHANNELS;
            dst[dst_off..dst_off + row_bytes].copy_from_slice(&self.data[src_off..src_off + row_bytes]);
        }
        Ok(out)
    }

    /// Overwrite the area at `(x, y)` with `src`, clipping to this buffer.
    /// Returns the rect actually written. Size unchanged.
    pub fn write_region(&mut self, x: i32, y: i32, src: &PixelBuffer) -> EditResult<IRect> {
        if src.channels != self.channels {
            return Err(EditError::FormatMismatch { expected: self.channels, actual: src.channels });
        }
        let target = IRect::new(x, y, src.width, src.height).intersect(&self.rect());
        if target.is_empty() {
            return Ok(IRect::EMPTY);
        }
        let row_bytes = target.width() as usize * CHANNELS;
        let src_stride = src.stride();
        let dst_stride = self.stride();
        let dst = self.data_mut();
        for ty in target.y0..target.y1 {
            let src_off = (ty - y) as usize * src_stride + (target.x0 - x) as usize * CHANNELS;
            let dst_off = ty as usize * dst_stride + target.x0 as usize * CHANNELS;
            dst[dst_off..dst_off + row_bytes].copy_from_slice(&src.data[src_off..src_off + row_bytes]);
        }
        Ok(target)
    }

    /// Composite `src` into `self` over `dest` using `mode` at `opacity`.
    ///
    /// `src` is sampled 1:1 starting at its top-left; `dest` is clipped to both
    /// this buffer and `src`'s extent. Returns the rect touched. Size unchanged.
    pub fn blit(&mut self, src: &PixelBuffer, dest: IRect, mode: BlendMode, opacity: f32) -> EditResult<IRect> {
        if src.channels != self.channels {
            return Err(EditError::FormatMismatch { expected: self.channels, actual: src.channels });
        }
        let src_extent = IRect::new(dest.x0, dest.y0, src.width, src.height);
        let target = dest.intersect(&src_extent).intersect(&self.rect());
        if target.is_empty() {
            return Ok(IRect::EMPTY);
        }
        let stride = self.stride();
        let dst = self.data_mut();
        for ty in target.y0..target.y1 {
            let sy = (ty - dest.y0) as i64;
            for tx in target.x0..target.x1 {
                let sx = (tx - dest.x0) as i64;
                let top = src.get_pixel(sx, sy);
                let o = ty as usize * stride + tx as usize * CHANNELS;
                let base = [dst[o], dst[o + 1], dst[o + 2], dst[o + 3]];
                dst[o..o + 4].copy_from_slice(&blend_pixel(base, top, mode, opacity));
            }
        }
        Ok(target)
    }

    /// Fill `rect` (clipped) with `color`. Size unchanged.
    pub fn fill_rect(&mut self, rect: IRect, color: [u8; 4]) -> IRect {
        let target = rect.intersect(&self.rect());
        let stride = self.stride();
        let dst = self.data_mut();
        for y in target.y0..target.y1 {
            for x in target.x0..target.x1 {
                let o = y as usize * stride + x as usize * CHANNELS;
                dst[o..o + 4].copy_from_slice(&color);
            }
        }
        target
    }

    /// Reallocate to `new_w × new_h`, keeping content pinned to `anchor`.
    /// New area is transparent. Resulting size: `new_w * new_h * 4` bytes.
    /// Returns the offset applied to the old content.
    pub fn resize(&mut self, new_w: u32, new_h: u32, anchor: Anchor) -> EditResult<(i32, i32)> {
        Self::check_dimensions(new_w, new_h)?;
        let (ox, oy) = anchor.offset(self.width, self.height, new_w, new_h);
        let mut next = PixelBuffer::new(new_w, new_h)?;
        next.write_region(ox, oy, self)?;
        *self = next;
        Ok((ox, oy))
    }

    /// True when every pixel has zero alpha.
    pub fn is_fully_transparent(&self) -> bool {
        self.data.chunks_exact(CHANNELS).all(|px| px[3] == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_rejects_zero_dimensions() {
        assert!(matches!(PixelBuffer::new(0, 5), Err(EditError::InvalidDimensions { .. })));
        let buf = PixelBuffer::new(3, 2).unwrap();
        assert_eq!(buf.data().len(), 3 * 2 * 4);
        assert_eq!(buf.stride(), 12);
    }

    #[test]
    fn from_raw_checks_length() {
        let err = PixelBuffer::from_raw(2, 2, vec![0; 15]).unwrap_err();
        assert_eq!(err, EditError::FormatMismatch { expected: 16, actual: 15 });
    }

    #[test]
    fn region_round_trip_clips() {
        let mut buf = PixelBuffer::new(4, 4).unwrap();
        let patch = PixelBuffer::filled(3, 3, [9, 8, 7, 255]).unwrap();
        let written = buf.write_region(2, 2, &patch).unwrap();
        assert_eq!(written, IRect::new(2, 2, 2, 2));
        assert_eq!(buf.get_pixel(3, 3), [9, 8, 7, 255]);
        assert_eq!(buf.get_pixel(1, 1), TRANSPARENT);

        let back = buf.read_region(IRect::new(2, 2, 3, 3)).unwrap();
        assert_eq!(back.get_pixel(0, 0), [9, 8, 7, 255]);
        assert_eq!(back.get_pixel(2, 2), TRANSPARENT);
    }

    #[test]
    fn clone_is_copy_on_write() {
        let mut a = PixelBuffer::filled(2, 2, [1, 1, 1, 255]).unwrap();
        let b = a.clone();
        assert!(a.shares_storage_with(&b));
        a.put_pixel(0, 0, [2, 2, 2, 255]);
        assert!(!a.shares_storage_with(&b));
        assert_eq!(b.get_pixel(0, 0), [1, 1, 1, 255]);
    }

    #[test]
    fn resize_center_keeps_content_centred() {
        let mut buf = PixelBuffer::filled(2, 2, [255, 0, 0, 255]).unwrap();
        let off = buf.resize(4, 4, Anchor::Center).unwrap();
        assert_eq!(off, (1, 1));
        assert_eq!(buf.get_pixel(0, 0), TRANSPARENT);
        assert_eq!(buf.get_pixel(1, 1), [255, 0, 0, 255]);
        assert_eq!(buf.get_pixel(2, 2), [255, 0, 0, 255]);
        assert_eq!(buf.get_pixel(3, 3), TRANSPARENT);
        assert!(matches!(buf.resize(0, 4, Anchor::Center), Err(EditError::InvalidDimensions { .. })));
    }

    #[test]
    fn blit_normal_over_transparent_copies() {
        let mut dst = PixelBuffer::new(4, 4).unwrap();
        let src = PixelBuffer::filled(2, 2, [10, 20, 30, 255]).unwrap();
        let touched = dst.blit(&src, IRect::new(3, 3, 2, 2), BlendMode::Normal, 1.0).unwrap();
        assert_eq!(touched, IRect::new(3, 3, 1, 1));
        assert_eq!(dst.get_pixel(3, 3), [10, 20, 30, 255]);
    }
}
