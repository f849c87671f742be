// ============================================================================
// COMPOSITING ENGINE – walks the layer tree and flattens a canvas region
// ============================================================================
//
// Read-only over the tree: layer buffers are never written here. Rows of the
// output are independent, so each leaf is blended row-parallel with rayon;
// the per-pixel math has no data-dependent ordering, so the result is
// byte-identical between runs and between the serial and parallel paths.

use rayon::prelude::*;

use crate::blend::{BlendMode, blend_pixel};
use crate::error::{EditError, EditResult};
use crate::geometry::{IRect, sample_local};
use crate::layer::{Layer, LayerId, LayerNode, LayerTree};
use crate::pixels::{CHANNELS, PixelBuffer};

#[derive(Clone, Copy, Debug)]
pub struct CompositingEngine {
    /// Blend rows on the rayon pool. Off gives the same bytes, single-threaded.
    pub parallel: bool,
}

impl Default for CompositingEngine {
    fn default() -> Self {
        Self { parallel: true }
    }
}

impl CompositingEngine {
    pub fn new(parallel: bool) -> Self {
        Self { parallel }
    }

    /// Flatten `region` of a `canvas`-sized document.
    ///
    /// The output is sized to `region ∩ canvas`; its pixel (0, 0) is canvas
    /// pixel `(region.x0, region.y0)` after clipping. Only nodes whose bounds
    /// intersect the region are visited.
    pub fn composite(&self, tree: &LayerTree, canvas: IRect, region: IRect) -> EditResult<PixelBuffer> {
        let region = region.intersect(&canvas);
        if region.is_empty() {
            return Err(EditError::OutOfBounds);
        }
        let mut acc = PixelBuffer::new(region.width(), region.height())?;
        self.composite_children(tree, tree.root(), region, &mut acc)?;
        Ok(acc)
    }

    fn composite_children(
        &self,
        tree: &LayerTree,
        children: &[LayerId],
        region: IRect,
        acc: &mut PixelBuffer,
    ) -> EditResult<()> {
        // Back-to-front: index 0 is painted first.
        for id in children {
            let Some(node) = tree.get(*id) else { continue };
            let props = node.props();
            if !props.visible || props.opacity <= 0.0 {
                continue;
            }
            let bounds = tree.bounds(*id).intersect(&region);
            if bounds.is_empty() {
                continue;
            }
            match node {
                LayerNode::Leaf(layer) => {
                    self.blend_leaf_into(layer, acc, (region.x0, region.y0), props.blend_mode, props.opacity);
                }
                LayerNode::Group(group) => {
                    // Two-pass: children flatten into a group-local accumulator,
                    // which then blends as a single unit with the group's own mode/opacity.
                    let mut group_acc = PixelBuffer::new(bounds.width(), bounds.height())?;
                    self.composite_children(tree, &group.children, bounds, &mut group_acc)?;
                    let dest = bounds.translate(-region.x0, -region.y0);
                    acc.blit(&group_acc, dest, props.blend_mode, props.opacity)?;
                }
            }
        }
        Ok(())
    }

    /// Blend one pixel layer into `dest`, whose pixel (0, 0) sits at canvas
    /// position `dest_origin`. Used for compositing and for merge-down.
    pub fn blend_leaf_into(
        &self,
        layer: &Layer,
        dest: &mut PixelBuffer,
        dest_origin: (i32, i32),
        mode: BlendMode,
        opacity: f32,
    ) {
        let dest_rect = dest.rect().translate(dest_origin.0, dest_origin.1);
        let Some(bounds) = layer.canvas_bounds() else { return };
        let area = bounds.intersect(&dest_rect);
        if area.is_empty() {
            return;
        }

        let src = &layer.pixels;
        let offset = layer.integer_offset();
        let inverse = layer.affine().inverse();
        let stride = dest.stride();
        let (ox, oy) = dest_origin;

        let blend_row = |(row, bytes): (usize, &mut [u8])| {
            let cy = row as i32 + oy;
            if cy < area.y0 || cy >= area.y1 {
                return;
            }
            for cx in area.x0..area.x1 {
                let top = match offset {
                    Some((lx, ly)) => src.get_pixel((cx - lx) as i64, (cy - ly) as i64),
                    None => {
                        let (sx, sy) = sample_local(&inverse, cx, cy);
                        src.get_pixel(sx, sy)
                    }
                };
                let o = (cx - ox) as usize * CHANNELS;
                let base = [bytes[o], bytes[o + 1], bytes[o + 2], bytes[o + 3]];
                bytes[o..o + CHANNELS].copy_from_slice(&blend_pixel(base, top, mode, opacity));
            }
        };

        let data = dest.data_mut();
        if self.parallel {
            data.par_chunks_mut(stride).enumerate().for_each(blend_row);
        } else {
            data.chunks_mut(stride).enumerate().for_each(blend_row);
        }
    }
}
