use image::GrayImage;
use uuid::Uuid;

use crate::blend::{BlendMode, lerp_pixel};
use crate::components::history::HistoryManager;
use crate::compositor::CompositingEngine;
use crate::error::{EditError, EditResult};
use crate::geometry::{IRect, LayerTransform, sample_local};
use crate::layer::{Layer, LayerGroup, LayerId, LayerNode, LayerTree};
use crate::pixels::{Anchor, CHANNELS, PixelBuffer, TRANSPARENT};
use crate::selection::{SelectionMask, SelectionMode, SelectionSource};
use crate::settings::EngineSettings;

// ============================================================================
// NEW LAYER DESCRIPTION
// ============================================================================

/// Parameters for [`Document::add_layer`].
///
/// Without an explicit parent or index the layer lands directly above the
/// active layer, or on top of the root stack when nothing is active.
#[derive(Clone, Debug)]
pub struct NewLayer {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub fill: [u8; 4],
    /// Use these pixels instead of allocating `width × height` of `fill`.
    pub pixels: Option<PixelBuffer>,
    pub origin: (i32, i32),
    pub parent: Option<LayerId>,
    pub index: Option<usize>,
}

impl NewLayer {
    pub fn new(name: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            name: name.into(),
            width,
            height,
            fill: TRANSPARENT,
            pixels: None,
            origin: (0, 0),
            parent: None,
            index: None,
        }
    }

    pub fn from_pixels(name: impl Into<String>, pixels: PixelBuffer) -> Self {
        let mut layer = Self::new(name, pixels.width(), pixels.height());
        layer.pixels = Some(pixels);
        layer
    }

    pub fn filled(mut self, color: [u8; 4]) -> Self {
        self.fill = color;
        self
    }

    pub fn at(mut self, x: i32, y: i32) -> Self {
        self.origin = (x, y);
        self
    }

    pub fn inside(mut self, group: LayerId) -> Self {
        self.parent = Some(group);
        self
    }

    pub fn at_index(mut self, index: usize) -> Self {
        self.index = Some(index);
        self
    }
}

/// Coverage used by a masked edit.
#[derive(Clone, Copy, Debug)]
pub enum EditMask<'a> {
    /// The document's live selection (empty = whole canvas).
    Selection,
    /// A coverage snapshot whose top-left sits at `rect`'s origin on the canvas.
    Coverage { rect: IRect, mask: &'a GrayImage },
}

/// Everything structural undo needs to put a document back exactly.
#[derive(Clone, Debug)]
pub struct DocumentSnapshot {
    pub(crate) width: u32,
    pub(crate) height: u32,
    pub(crate) tree: LayerTree,
    pub(crate) active: Option<LayerId>,
    pub(crate) selection: SelectionMask,
}

// ============================================================================
// DOCUMENT
// ============================================================================

/// One open image: the layer tree, active layer, selection and canvas size.
///
/// All mutation goes through the methods below. Each takes the document's
/// [`HistoryManager`] and records into its open scope; when no scope is open
/// the call opens and commits its own, so it becomes one undo step.
#[derive(Clone, Debug)]
pub struct Document {
    pub id: Uuid,
    pub(crate) width: u32,
    pub(crate) height: u32,
    pub(crate) tree: LayerTree,
    pub(crate) active: Option<LayerId>,
    pub(crate) selection: SelectionMask,
    dirty: IRect,
    revision: u64,
    engine: CompositingEngine,
}

impl Document {
    /// Empty canvas with no layers.
    pub fn new(width: u32, height: u32) -> EditResult<Self> {
        PixelBuffer::check_dimensions(width, height)?;
        Ok(Self {
            id: Uuid::new_v4(),
            width,
            height,
            tree: LayerTree::new(),
            active: None,
            selection: SelectionMask::new(width, height),
            dirty: IRect::from_size(width, height),
            revision: 0,
            engine: CompositingEngine::default(),
        })
    }

    /// Canvas with a single canvas-sized "Background" layer filled with `color`.
    pub fn with_background(width: u32, height: u32, color: [u8; 4]) -> EditResult<Self> {
        let mut doc = Self::new(width, height)?;
        let id = doc.tree.allocate_id();
        let layer = Layer::new(id, "Background", PixelBuffer::filled(width, height, color)?);
        doc.tree.insert(LayerNode::Leaf(layer), None, 0)?;
        doc.active = Some(id);
        Ok(doc)
    }

    pub fn from_settings(settings: &EngineSettings) -> EditResult<Self> {
        let mut doc = Self::with_background(
            settings.default_canvas_width,
            settings.default_canvas_height,
            [255, 255, 255, 255],
        )?;
        doc.engine = CompositingEngine::new(settings.parallel_compositing);
        Ok(doc)
    }

    /// Reassemble a loaded document. The tree must already be consistent.
    pub(crate) fn from_parts(
        width: u32,
        height: u32,
        tree: LayerTree,
        active: Option<LayerId>,
        selection: SelectionMask,
    ) -> EditResult<Self> {
        let mut doc = Self::new(width, height)?;
        doc.tree = tree;
        doc.active = active.filter(|id| doc.tree.contains(*id));
        doc.selection = selection;
        Ok(doc)
    }

    pub fn set_parallel_compositing(&mut self, parallel: bool) {
        self.engine.parallel = parallel;
    }

    // ---- accessors ------------------------------------------------------------

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn canvas_rect(&self) -> IRect {
        IRect::from_size(self.width, self.height)
    }

    pub fn tree(&self) -> &LayerTree {
        &self.tree
    }

    pub fn node(&self, id: LayerId) -> EditResult<&LayerNode> {
        self.tree.node(id)
    }

    pub fn layer(&self, id: LayerId) -> EditResult<&Layer> {
        self.tree.leaf(id)
    }

    pub fn active_layer(&self) -> Option<LayerId> {
        self.active
    }

    pub fn selection(&self) -> &SelectionMask {
        &self.selection
    }

    /// Bumped on every structural change, including structural undo/redo.
    pub fn structure_revision(&self) -> u64 {
        self.revision
    }

    /// Canvas area changed since the last call, then reset.
    pub fn take_dirty(&mut self) -> IRect {
        std::mem::replace(&mut self.dirty, IRect::EMPTY)
    }

    pub fn dirty(&self) -> IRect {
        self.dirty
    }

    pub(crate) fn mark_dirty(&mut self, rect: IRect) {
        self.dirty = self.dirty.union(&rect.intersect(&self.canvas_rect()));
    }

    // ---- snapshots (history hooks) ----------------------------------------------

    pub(crate) fn snapshot(&self) -> DocumentSnapshot {
        DocumentSnapshot {
            width: self.width,
            height: self.height,
            tree: self.tree.clone(),
            active: self.active,
            selection: self.selection.clone(),
        }
    }

    pub(crate) fn restore_snapshot(&mut self, snap: &DocumentSnapshot) {
        self.width = snap.width;
        self.height = snap.height;
        self.tree = snap.tree.clone();
        self.active = snap.active;
        self.selection = snap.selection.clone();
        self.revision += 1;
        self.dirty = self.canvas_rect();
    }

    pub(crate) fn restore_selection(&mut self, selection: SelectionMask) {
        self.selection = selection;
    }

    // ---- composition -----------------------------------------------------------

    pub fn composite(&self, region: IRect) -> EditResult<PixelBuffer> {
        self.engine.composite(&self.tree, self.canvas_rect(), region)
    }

    pub fn composite_full(&self) -> EditResult<PixelBuffer> {
        self.composite(self.canvas_rect())
    }

    // ---- internals ------------------------------------------------------------

    /// Run `op` inside the caller's scope, or inside a fresh one committed on
    /// success and cancelled on failure.
    fn scoped<T>(
        &mut self,
        history: &mut HistoryManager,
        description: &str,
        op: impl FnOnce(&mut Self, &mut HistoryManager) -> EditResult<T>,
    ) -> EditResult<T> {
        let implicit = !history.is_recording();
        if implicit {
            history.begin(description)?;
        }
        match op(self, history) {
            Ok(value) => {
                if implicit {
                    history.commit(self)?;
                }
                Ok(value)
            }
            Err(e) => {
                if implicit {
                    history.cancel(self)?;
                }
                Err(e)
            }
        }
    }

    fn ensure_unlocked(&self, id: LayerId) -> EditResult<()> {
        self.tree.node(id)?;
        if self.tree.effectively_locked(id) {
            return Err(EditError::LayerLocked(id));
        }
        Ok(())
    }

    fn structural_change(&mut self, history: &mut HistoryManager, targets: &[LayerId]) {
        history.record_structure(self, targets);
        self.revision += 1;
    }

    /// Where a new node goes when the caller gave `parent`/`index` (or neither).
    fn placement(&self, parent: Option<LayerId>, index: Option<usize>) -> EditResult<(Option<LayerId>, usize)> {
        if parent.is_some() || index.is_some() {
            let len = self.tree.children(parent)?.len();
            return Ok((parent, index.unwrap_or(len).min(len)));
        }
        match self.active.and_then(|a| self.tree.position(a).ok()) {
            Some((p, i)) => Ok((p, i + 1)),
            None => Ok((None, self.tree.root().len())),
        }
    }

    // ---- layer structure ----------------------------------------------------------

    pub fn add_layer(&mut self, history: &mut HistoryManager, new_layer: NewLayer) -> EditResult<LayerId> {
        let NewLayer { name, width, height, fill, pixels, origin, parent, index } = new_layer;
        let pixels = match pixels {
            Some(p) => p,
            None => PixelBuffer::filled(width, height, fill)?,
        };
        let (parent, index) = self.placement(parent, index)?;
        let mut layer = Layer::new(LayerId(0), name, pixels);
        layer.origin = origin;
        let bounds = layer.canvas_bounds().ok_or(EditError::OutOfBounds)?;

        self.scoped(history, "Add Layer", |doc, history| {
            layer.id = doc.tree.allocate_id();
            let id = layer.id;
            doc.structural_change(history, &[id]);
            doc.tree.insert(LayerNode::Leaf(layer), parent, index)?;
            doc.active = Some(id);
            doc.mark_dirty(bounds);
            Ok(id)
        })
    }

    pub fn add_group(
        &mut self,
        history: &mut HistoryManager,
        name: &str,
        parent: Option<LayerId>,
        index: Option<usize>,
    ) -> EditResult<LayerId> {
        let (parent, index) = self.placement(parent, index)?;
        self.scoped(history, "Add Group", |doc, history| {
            let id = doc.tree.allocate_id();
            doc.structural_change(history, &[id]);
            doc.tree.insert(LayerNode::Group(LayerGroup::new(id, name)), parent, index)?;
            doc.active = Some(id);
            Ok(id)
        })
    }

    /// Remove a layer or a whole group. The last pixel layer cannot be removed,
    /// and neither can a group holding a locked layer.
    pub fn remove_layer(&mut self, history: &mut HistoryManager, id: LayerId) -> EditResult<()> {
        self.ensure_unlocked(id)?;
        if let Some(locked) = self.tree.locked_within(id) {
            return Err(EditError::LayerLocked(locked));
        }
        let removed_leaves = self.tree.leaf_count(id);
        if removed_leaves > 0 && removed_leaves == self.tree.leaves().len() {
            return Err(EditError::LastLayer);
        }
        let (parent, index) = self.tree.position(id)?;
        let bounds = self.tree.bounds(id);

        self.scoped(history, "Delete Layer", |doc, history| {
            doc.structural_change(history, &[id]);
            doc.tree.remove_subtree(id)?;
            if doc.active.is_some_and(|a| !doc.tree.contains(a)) {
                let siblings = doc.tree.children(parent).unwrap_or(&[]);
                doc.active = index
                    .checked_sub(1)
                    .and_then(|i| siblings.get(i))
                    .or_else(|| siblings.first())
                    .copied()
                    .or(parent)
                    .or_else(|| doc.tree.root().last().copied());
            }
            doc.mark_dirty(bounds);
            Ok(())
        })
    }

    /// Copy a layer (or a group with everything in it) directly above the original.
    pub fn duplicate_layer(&mut self, history: &mut HistoryManager, id: LayerId) -> EditResult<LayerId> {
        let (parent, index) = self.tree.position(id)?;
        let bounds = self.tree.bounds(id);
        self.scoped(history, "Duplicate Layer", |doc, history| {
            doc.structural_change(history, &[id]);
            let copy = doc.copy_subtree(id, parent, index + 1)?;
            if let Ok(node) = doc.tree.node_mut(copy) {
                let props = node.props_mut();
                props.name = format!("{} copy", props.name);
            }
            doc.active = Some(copy);
            doc.mark_dirty(bounds);
            Ok(copy)
        })
    }

    fn copy_subtree(&mut self, src: LayerId, parent: Option<LayerId>, index: usize) -> EditResult<LayerId> {
        let node = self.tree.node(src)?.clone();
        let new_id = self.tree.allocate_id();
        match node {
            LayerNode::Leaf(mut layer) => {
                layer.id = new_id;
                self.tree.insert(LayerNode::Leaf(layer), parent, index)?;
            }
            LayerNode::Group(group) => {
                let mut copy = LayerGroup::new(new_id, "");
                copy.props = group.props;
                self.tree.insert(LayerNode::Group(copy), parent, index)?;
                for (i, child) in group.children.iter().enumerate() {
                    self.copy_subtree(*child, Some(new_id), i)?;
                }
            }
        }
        Ok(new_id)
    }

    pub fn rename_layer(&mut self, history: &mut HistoryManager, id: LayerId, name: &str) -> EditResult<()> {
        self.ensure_unlocked(id)?;
        if self.tree.node(id)?.props().name == name {
            return Ok(());
        }
        self.scoped(history, "Rename Layer", |doc, history| {
            doc.structural_change(history, &[id]);
            doc.tree.node_mut(id)?.props_mut().name = name.to_string();
            Ok(())
        })
    }

    /// Reorder within the current parent. `new_index` is clamped to the sibling list.
    pub fn move_layer(&mut self, history: &mut HistoryManager, id: LayerId, new_index: usize) -> EditResult<()> {
        let (parent, index) = self.tree.position(id)?;
        let last = self.tree.children(parent)?.len() - 1;
        if new_index.min(last) == index {
            return Ok(());
        }
        let bounds = self.tree.bounds(id);
        self.scoped(history, "Reorder Layer", |doc, history| {
            doc.structural_change(history, &[id]);
            doc.tree.move_node(id, parent, new_index)?;
            doc.mark_dirty(bounds);
            Ok(())
        })
    }

    /// Change group membership. `group = None` moves to the root stack;
    /// `index = None` places the node on top of its new siblings.
    pub fn move_into_group(
        &mut self,
        history: &mut HistoryManager,
        id: LayerId,
        group: Option<LayerId>,
        index: Option<usize>,
    ) -> EditResult<()> {
        self.tree.node(id)?;
        let siblings = self.tree.children(group)?.len();
        if let Some(gid) = group
            && self.tree.is_within(gid, id)
        {
            return Err(EditError::CyclicGroupError { node: id, group: gid });
        }
        let bounds = self.tree.bounds(id);
        self.scoped(history, "Move Layer", |doc, history| {
            doc.structural_change(history, &[id]);
            doc.tree.move_node(id, group, index.unwrap_or(siblings))?;
            doc.mark_dirty(bounds);
            Ok(())
        })
    }

    /// Not recorded in history: the active layer is navigation state.
    pub fn set_active_layer(&mut self, id: LayerId) -> EditResult<()> {
        self.tree.node(id)?;
        self.active = Some(id);
        Ok(())
    }

    // ---- layer properties -----------------------------------------------------------

    pub fn set_layer_transform(
        &mut self,
        history: &mut HistoryManager,
        id: LayerId,
        transform: LayerTransform,
    ) -> EditResult<()> {
        self.ensure_unlocked(id)?;
        let layer = self.tree.leaf(id)?;
        if layer.transform == transform {
            return Ok(());
        }
        if !transform.is_invertible() {
            return Err(EditError::OutOfBounds);
        }
        let old = layer.canvas_bounds().unwrap_or(IRect::EMPTY);
        let new = transform
            .bounds(layer.origin, layer.pixels.width(), layer.pixels.height())
            .ok_or(EditError::OutOfBounds)?;
        self.scoped(history, "Transform Layer", |doc, history| {
            doc.structural_change(history, &[id]);
            doc.tree.leaf_mut(id)?.transform = transform;
            doc.mark_dirty(old.union(&new));
            Ok(())
        })
    }

    pub fn set_layer_opacity(&mut self, history: &mut HistoryManager, id: LayerId, opacity: f32) -> EditResult<()> {
        self.ensure_unlocked(id)?;
        let opacity = if opacity.is_nan() { 0.0 } else { opacity.clamp(0.0, 1.0) };
        if self.tree.node(id)?.props().opacity == opacity {
            return Ok(());
        }
        self.scoped(history, "Layer Opacity", |doc, history| {
            doc.structural_change(history, &[id]);
            doc.tree.node_mut(id)?.props_mut().opacity = opacity;
            doc.mark_dirty(doc.tree.bounds(id));
            Ok(())
        })
    }

    pub fn set_layer_blend_mode(&mut self, history: &mut HistoryManager, id: LayerId, mode: BlendMode) -> EditResult<()> {
        self.ensure_unlocked(id)?;
        if self.tree.node(id)?.props().blend_mode == mode {
            return Ok(());
        }
        self.scoped(history, "Layer Blend Mode", |doc, history| {
            doc.structural_change(history, &[id]);
            doc.tree.node_mut(id)?.props_mut().blend_mode = mode;
            doc.mark_dirty(doc.tree.bounds(id));
            Ok(())
        })
    }

    pub fn set_layer_visible(&mut self, history: &mut HistoryManager, id: LayerId, visible: bool) -> EditResult<()> {
        if self.tree.node(id)?.props().visible == visible {
            return Ok(());
        }
        self.scoped(history, if visible { "Show Layer" } else { "Hide Layer" }, |doc, history| {
            doc.structural_change(history, &[id]);
            doc.tree.node_mut(id)?.props_mut().visible = visible;
            doc.mark_dirty(doc.tree.bounds(id));
            Ok(())
        })
    }

    pub fn set_layer_locked(&mut self, history: &mut HistoryManager, id: LayerId, locked: bool) -> EditResult<()> {
        if self.tree.node(id)?.props().locked == locked {
            return Ok(());
        }
        self.scoped(history, if locked { "Lock Layer" } else { "Unlock Layer" }, |doc, history| {
            doc.structural_change(history, &[id]);
            doc.tree.node_mut(id)?.props_mut().locked = locked;
            Ok(())
        })
    }

    // ---- merging ---------------------------------------------------------------

    /// Composite `id` onto the pixel layer directly beneath it with `id`'s own
    /// blend mode and opacity, then remove `id`. Returns the surviving layer.
    ///
    /// The merged layer covers both layers' bounds with an identity transform
    /// and keeps its own name, opacity and blend mode.
    pub fn merge_down(&mut self, history: &mut HistoryManager, id: LayerId) -> EditResult<LayerId> {
        let below = self.tree.below(id)?.ok_or(EditError::NoLayerBelow(id))?;
        let top = self.tree.leaf(id)?;
        let target = self.tree.leaf(below)?;
        self.ensure_unlocked(id)?;
        self.ensure_unlocked(below)?;

        let top_bounds = top.canvas_bounds().unwrap_or(IRect::EMPTY);
        let merged = if top.props.visible && top.props.opacity > 0.0 {
            let area = self.tree.bounds(below).union(&top_bounds);
            let mut buf = PixelBuffer::new(area.width(), area.height())?;
            let at = (area.x0, area.y0);
            self.engine.blend_leaf_into(target, &mut buf, at, BlendMode::Normal, 1.0);
            self.engine.blend_leaf_into(top, &mut buf, at, top.props.blend_mode, top.props.opacity);
            Some((area, buf))
        } else {
            None
        };

        self.scoped(history, "Merge Down", |doc, history| {
            doc.structural_change(history, &[id, below]);
            if let Some((area, buf)) = merged {
                let target = doc.tree.leaf_mut(below)?;
                target.pixels = buf;
                target.origin = (area.x0, area.y0);
                target.transform = LayerTransform::IDENTITY;
            }
            doc.tree.remove_subtree(id)?;
            doc.active = Some(below);
            doc.mark_dirty(top_bounds);
            Ok(below)
        })
    }

    /// Replace every node with one canvas-sized layer holding the composite.
    pub fn flatten(&mut self, history: &mut HistoryManager) -> EditResult<LayerId> {
        if let Some(locked) = self.tree.leaves().into_iter().find(|l| self.tree.effectively_locked(*l)) {
            return Err(EditError::LayerLocked(locked));
        }
        let pixels = self.composite_full()?;
        self.scoped(history, "Flatten Image", |doc, history| {
            let id = doc.tree.allocate_id();
            doc.structural_change(history, &[id]);
            for root in doc.tree.root().to_vec() {
                doc.tree.remove_subtree(root)?;
            }
            doc.tree.insert(LayerNode::Leaf(Layer::new(id, "Background", pixels)), None, 0)?;
            doc.active = Some(id);
            doc.mark_dirty(doc.canvas_rect());
            Ok(id)
        })
    }

    // ---- canvas ------------------------------------------------------------------

    /// Change the canvas size. Layers keep their pixels; their origins shift
    /// so content stays pinned to `anchor`. The selection is reallocated.
    pub fn resize_canvas(
        &mut self,
        history: &mut HistoryManager,
        width: u32,
        height: u32,
        anchor: Anchor,
    ) -> EditResult<()> {
        PixelBuffer::check_dimensions(width, height)?;
        if (width, height) == (self.width, self.height) {
            return Ok(());
        }
        let (dx, dy) = anchor.offset(self.width, self.height, width, height);
        let mut shifted = Vec::new();
        for id in self.tree.leaves() {
            let layer = self.tree.leaf(id)?;
            let origin = (
                layer.origin.0.checked_add(dx).ok_or(EditError::OutOfBounds)?,
                layer.origin.1.checked_add(dy).ok_or(EditError::OutOfBounds)?,
            );
            layer
                .transform
                .bounds(origin, layer.pixels.width(), layer.pixels.height())
                .ok_or(EditError::OutOfBounds)?;
            shifted.push((id, origin));
        }
        let mut selection = self.selection.clone();
        selection.resize(width, height, anchor)?;

        self.scoped(history, "Resize Canvas", |doc, history| {
            doc.structural_change(history, &[]);
            for (id, origin) in shifted {
                doc.tree.leaf_mut(id)?.origin = origin;
            }
            doc.width = width;
            doc.height = height;
            doc.selection = selection;
            doc.dirty = IRect::EMPTY;
            doc.mark_dirty(doc.canvas_rect());
            Ok(())
        })
    }

    // ---- pixel edits --------------------------------------------------------------

    /// Write `pixels` (sized exactly `rect`, canvas coordinates) into a layer,
    /// scoped by the current selection. See [`Document::apply_masked_edit_with`].
    pub fn apply_masked_edit(
        &mut self,
        history: &mut HistoryManager,
        layer_id: LayerId,
        rect: IRect,
        pixels: &PixelBuffer,
    ) -> EditResult<IRect> {
        self.apply_masked_edit_with(history, layer_id, rect, pixels, EditMask::Selection)
    }

    /// The core pixel mutation.
    ///
    /// Only pixels inside `rect ∩ layer bounds ∩ canvas ∩ mask` change. Each
    /// written pixel moves from its old value toward the new one by the mask
    /// coverage there, so hard masks replace and soft edges blend. Returns the
    /// canvas rect considered; fails with `OutOfBounds` if nothing is editable.
    pub fn apply_masked_edit_with(
        &mut self,
        history: &mut HistoryManager,
        layer_id: LayerId,
        rect: IRect,
        pixels: &PixelBuffer,
        mask: EditMask<'_>,
    ) -> EditResult<IRect> {
        let layer = self.tree.leaf(layer_id)?;
        self.ensure_unlocked(layer_id)?;
        if pixels.width() != rect.width() || pixels.height() != rect.height() {
            return Err(EditError::FormatMismatch {
                expected: (rect.area() as usize).saturating_mul(CHANNELS),
                actual: pixels.data().len(),
            });
        }

        let bounds = layer.canvas_bounds().unwrap_or(IRect::EMPTY);
        let mut clip = rect.intersect(&bounds).intersect(&self.canvas_rect());
        let unrestricted = match mask {
            EditMask::Selection if self.selection.is_empty() => true,
            EditMask::Selection => {
                clip = clip.intersect(&self.selection.bounding_box());
                false
            }
            EditMask::Coverage { rect: mask_rect, mask } => {
                let extent = IRect::new(mask_rect.x0, mask_rect.y0, mask.width(), mask.height());
                clip = clip.intersect(&extent);
                false
            }
        };
        if clip.is_empty() {
            return Err(EditError::OutOfBounds);
        }

        let coverage_at = |x: i32, y: i32| -> u8 {
            if unrestricted {
                return 255;
            }
            match mask {
                EditMask::Selection => self.selection.coverage(x, y),
                EditMask::Coverage { rect: mask_rect, mask } => {
                    mask.get_pixel((x - mask_rect.x0) as u32, (y - mask_rect.y0) as u32).0[0]
                }
            }
        };

        let offset = layer.integer_offset();
        let inverse = layer.affine().inverse();
        let (lw, lh) = (layer.pixels.width() as i64, layer.pixels.height() as i64);
        let mut writes = Vec::new();
        let (mut min_x, mut min_y, mut max_x, mut max_y) = (i64::MAX, i64::MAX, i64::MIN, i64::MIN);
        for cy in clip.y0..clip.y1 {
            for cx in clip.x0..clip.x1 {
                let cov = coverage_at(cx, cy);
                if cov == 0 {
                    continue;
                }
                let (lx, ly) = match offset {
                    Some((ox, oy)) => ((cx - ox) as i64, (cy - oy) as i64),
                    None => sample_local(&inverse, cx, cy),
                };
                if lx < 0 || ly < 0 || lx >= lw || ly >= lh {
                    continue;
                }
                let src = pixels.get_pixel((cx - rect.x0) as i64, (cy - rect.y0) as i64);
                writes.push((lx, ly, src, cov));
                min_x = min_x.min(lx);
                min_y = min_y.min(ly);
                max_x = max_x.max(lx);
                max_y = max_y.max(ly);
            }
        }
        if writes.is_empty() {
            return Err(EditError::OutOfBounds);
        }
        let local_dirty = IRect::from_min_max(min_x as i32, min_y as i32, max_x as i32 + 1, max_y as i32 + 1);

        self.scoped(history, "Edit Pixels", |doc, history| {
            history.record_pixels(doc.tree.leaf(layer_id)?, local_dirty);
            let target = &mut doc.tree.leaf_mut(layer_id)?.pixels;
            for (lx, ly, src, cov) in writes {
                let existing = target.get_pixel(lx, ly);
                target.put_pixel(lx, ly, lerp_pixel(existing, src, cov));
            }
            doc.mark_dirty(clip);
            Ok(clip)
        })
    }

    /// Fill the selected area of a layer (the whole canvas when nothing is selected).
    pub fn fill_selection(&mut self, history: &mut HistoryManager, layer_id: LayerId, color: [u8; 4]) -> EditResult<IRect> {
        let region = if self.selection.is_empty() {
            self.canvas_rect()
        } else {
            self.selection.bounding_box()
        };
        let region = region.intersect(&self.tree.bounds(layer_id));
        if region.is_empty() {
            return Err(EditError::OutOfBounds);
        }
        let fill = PixelBuffer::filled(region.width(), region.height(), color)?;
        self.apply_masked_edit(history, layer_id, region, &fill)
    }

    pub fn clear_selected_pixels(&mut self, history: &mut HistoryManager, layer_id: LayerId) -> EditResult<IRect> {
        self.fill_selection(history, layer_id, TRANSPARENT)
    }

    // ---- selection ------------------------------------------------------------------

    fn change_selection(
        &mut self,
        history: &mut HistoryManager,
        description: &str,
        change: impl FnOnce(&mut SelectionMask),
    ) -> EditResult<()> {
        let mut next = self.selection.clone();
        change(&mut next);
        if next == self.selection {
            return Ok(());
        }
        self.scoped(history, description, |doc, history| {
            history.record_selection(&doc.selection);
            doc.selection = next;
            Ok(())
        })
    }

    pub fn set_selection(
        &mut self,
        history: &mut HistoryManager,
        source: &SelectionSource,
        mode: SelectionMode,
    ) -> EditResult<()> {
        self.change_selection(history, "Select", |sel| sel.set_region(source, mode))
    }

    pub fn select_all(&mut self, history: &mut HistoryManager) -> EditResult<()> {
        self.change_selection(history, "Select All", SelectionMask::select_all)
    }

    pub fn clear_selection(&mut self, history: &mut HistoryManager) -> EditResult<()> {
        self.change_selection(history, "Deselect", SelectionMask::clear)
    }

    pub fn invert_selection(&mut self, history: &mut HistoryManager) -> EditResult<()> {
        self.change_selection(history, "Invert Selection", SelectionMask::invert)
    }

    pub fn translate_selection(&mut self, history: &mut HistoryManager, dx: i32, dy: i32) -> EditResult<()> {
        self.change_selection(history, "Move Selection", |sel| sel.translate(dx, dy))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selection::SelectionShape;

    const RED: [u8; 4] = [255, 0, 0, 255];
    const BLUE: [u8; 4] = [0, 0, 255, 255];

    fn doc_with_layer(w: u32, h: u32) -> (Document, HistoryManager, LayerId) {
        let mut doc = Document::new(w, h).unwrap();
        let mut history = HistoryManager::default();
        let id = doc.add_layer(&mut history, NewLayer::new("base", w, h)).unwrap();
        history.clear();
        (doc, history, id)
    }

    #[test]
    fn add_layer_goes_above_active() {
        let mut doc = Document::new(10, 10).unwrap();
        let mut history = HistoryManager::default();
        let a = doc.add_layer(&mut history, NewLayer::new("a", 10, 10)).unwrap();
        let b = doc.add_layer(&mut history, NewLayer::new("b", 10, 10)).unwrap();
        doc.set_active_layer(a).unwrap();
        let c = doc.add_layer(&mut history, NewLayer::new("c", 10, 10)).unwrap();
        assert_eq!(doc.tree().root(), &[a, c, b]);
        assert_eq!(doc.active_layer(), Some(c));
        assert_eq!(history.undo_count(), 3);
    }

    #[test]
    fn masked_edit_respects_hard_selection() {
        let (mut doc, mut history, id) = doc_with_layer(10, 10);
        let sel = SelectionSource::Shape(SelectionShape::Rectangle(IRect::new(2, 2, 3, 3)));
        doc.set_selection(&mut history, &sel, SelectionMode::Replace).unwrap();
        let paint = PixelBuffer::filled(10, 10, RED).unwrap();
        let clip = doc.apply_masked_edit(&mut history, id, IRect::from_size(10, 10), &paint).unwrap();
        assert_eq!(clip, IRect::new(2, 2, 3, 3));
        let layer = doc.layer(id).unwrap();
        assert_eq!(layer.pixels.get_pixel(2, 2), RED);
        assert_eq!(layer.pixels.get_pixel(1, 2), TRANSPARENT);
        assert_eq!(layer.pixels.get_pixel(5, 5), TRANSPARENT);
    }

    #[test]
    fn masked_edit_outside_selection_is_out_of_bounds() {
        let (mut doc, mut history, id) = doc_with_layer(10, 10);
        let sel = SelectionSource::Shape(SelectionShape::Rectangle(IRect::new(0, 0, 2, 2)));
        doc.set_selection(&mut history, &sel, SelectionMode::Replace).unwrap();
        let before = history.undo_count();
        let paint = PixelBuffer::filled(3, 3, RED).unwrap();
        let err = doc.apply_masked_edit(&mut history, id, IRect::new(5, 5, 3, 3), &paint).unwrap_err();
        assert_eq!(err, EditError::OutOfBounds);
        assert_eq!(history.undo_count(), before);
    }

    #[test]
    fn soft_selection_blends_against_existing() {
        let (mut doc, mut history, id) = doc_with_layer(2, 1);
        doc.fill_selection(&mut history, id, BLUE).unwrap();
        let soft = SelectionSource::Coverage { x: 0, y: 0, mask: GrayImage::from_pixel(2, 1, image::Luma([128])) };
        doc.set_selection(&mut history, &soft, SelectionMode::Replace).unwrap();
        doc.fill_selection(&mut history, id, RED).unwrap();
        assert_eq!(doc.layer(id).unwrap().pixels.get_pixel(0, 0), [128, 0, 127, 255]);
    }

    #[test]
    fn locked_layer_rejects_edits_but_not_unlock() {
        let (mut doc, mut history, id) = doc_with_layer(4, 4);
        doc.set_layer_locked(&mut history, id, true).unwrap();
        let paint = PixelBuffer::filled(1, 1, RED).unwrap();
        assert_eq!(
            doc.apply_masked_edit(&mut history, id, IRect::new(0, 0, 1, 1), &paint).unwrap_err(),
            EditError::LayerLocked(id)
        );
        assert_eq!(doc.set_layer_opacity(&mut history, id, 0.5).unwrap_err(), EditError::LayerLocked(id));
        doc.set_layer_locked(&mut history, id, false).unwrap();
        doc.set_layer_opacity(&mut history, id, 0.5).unwrap();
    }

    #[test]
    fn removing_last_layer_is_refused() {
        let (mut doc, mut history, id) = doc_with_layer(4, 4);
        assert_eq!(doc.remove_layer(&mut history, id).unwrap_err(), EditError::LastLayer);
        assert!(doc.tree().contains(id));
    }

    #[test]
    fn removing_group_with_locked_child_is_refused() {
        let (mut doc, mut history, base) = doc_with_layer(4, 4);
        let group = doc.add_group(&mut history, "g", None, None).unwrap();
        let child = doc.add_layer(&mut history, NewLayer::new("c", 4, 4).inside(group)).unwrap();
        doc.set_layer_locked(&mut history, child, true).unwrap();
        let entries = history.undo_count();

        assert_eq!(doc.remove_layer(&mut history, group).unwrap_err(), EditError::LayerLocked(child));
        assert!(doc.tree().contains(child));
        assert_eq!(history.undo_count(), entries);

        doc.set_layer_locked(&mut history, child, false).unwrap();
        doc.remove_layer(&mut history, group).unwrap();
        assert!(!doc.tree().contains(child));
        assert!(doc.tree().contains(base));
    }

    #[test]
    fn masked_edit_on_transformed_layer_only_writes_selected_samples() {
        let mut doc = Document::new(32, 32).unwrap();
        let mut history = HistoryManager::default();
        let id = doc.add_layer(&mut history, NewLayer::new("tilted", 12, 10).filled(RED).at(10, 11)).unwrap();
        let transform = LayerTransform { rotation: 0.5, scale_x: 1.5, scale_y: 0.75, ..LayerTransform::IDENTITY };
        doc.set_layer_transform(&mut history, id, transform).unwrap();
        let ellipse = SelectionShape::Ellipse { cx: 16.0, cy: 16.0, rx: 6.0, ry: 4.0 };
        doc.set_selection(&mut history, &SelectionSource::Shape(ellipse), SelectionMode::Replace).unwrap();
        let before = doc.layer(id).unwrap().pixels.clone();

        let rect = IRect::new(8, 8, 14, 14);
        let paint = PixelBuffer::filled(14, 14, BLUE).unwrap();
        doc.apply_masked_edit(&mut history, id, rect, &paint).unwrap();

        let layer = doc.layer(id).unwrap();
        let inverse = layer.affine().inverse();
        let mut reachable = std::collections::HashSet::new();
        for cy in rect.y0..rect.y1 {
            for cx in rect.x0..rect.x1 {
                if doc.selection().coverage(cx, cy) > 0 {
                    reachable.insert(crate::geometry::sample_local(&inverse, cx, cy));
                }
            }
        }
        let mut changed = 0;
        for y in 0..10i64 {
            for x in 0..12i64 {
                if layer.pixels.get_pixel(x, y) != before.get_pixel(x, y) {
                    assert!(reachable.contains(&(x, y)), "layer pixel ({x},{y}) is not under the selection");
                    changed += 1;
                }
            }
        }
        assert!(changed > 0);
    }

    #[test]
    fn transformed_layer_edit_undoes_and_marks_dirty() {
        let mut doc = Document::with_background(32, 32, [255, 255, 255, 255]).unwrap();
        let mut history = HistoryManager::default();
        let id = doc.add_layer(&mut history, NewLayer::new("tilted", 12, 10).filled(RED).at(10, 11)).unwrap();
        let transform = LayerTransform { rotation: 0.9, scale_x: 1.25, scale_y: 1.25, ..LayerTransform::IDENTITY };
        doc.set_layer_transform(&mut history, id, transform).unwrap();
        let before_pixels = doc.layer(id).unwrap().pixels.clone();
        let before = doc.composite_full().unwrap();

        let paint = PixelBuffer::filled(6, 6, BLUE).unwrap();
        doc.apply_masked_edit(&mut history, id, IRect::new(13, 13, 6, 6), &paint).unwrap();
        let after = doc.composite_full().unwrap();
        assert_ne!(after, before);

        doc.take_dirty();
        history.undo(&mut doc).unwrap();
        let dirty = doc.take_dirty();
        assert_eq!(doc.layer(id).unwrap().pixels, before_pixels);
        assert_eq!(doc.composite_full().unwrap(), before);
        for y in 0..32i64 {
            for x in 0..32i64 {
                if after.get_pixel(x, y) != before.get_pixel(x, y) {
                    assert!(dirty.contains(x as i32, y as i32), "({x},{y}) changed but was not marked dirty");
                }
            }
        }

        history.redo(&mut doc).unwrap();
        assert_eq!(doc.composite_full().unwrap(), after);
    }

    #[test]
    fn huge_rect_reports_size_mismatch() {
        let (mut doc, mut history, id) = doc_with_layer(4, 4);
        let rect = IRect::from_min_max(i32::MIN, i32::MIN, i32::MAX, i32::MAX);
        let paint = PixelBuffer::filled(1, 1, RED).unwrap();
        let err = doc.apply_masked_edit(&mut history, id, rect, &paint).unwrap_err();
        assert_eq!(err, EditError::FormatMismatch { expected: usize::MAX, actual: 4 });
        assert_eq!(history.undo_count(), 0);
    }

    #[test]
    fn remove_picks_layer_below_as_active() {
        let (mut doc, mut history, base) = doc_with_layer(4, 4);
        let top = doc.add_layer(&mut history, NewLayer::new("top", 4, 4)).unwrap();
        doc.remove_layer(&mut history, top).unwrap();
        assert_eq!(doc.active_layer(), Some(base));
        history.undo(&mut doc).unwrap();
        assert_eq!(doc.active_layer(), Some(top));
    }

    #[test]
    fn merge_down_bakes_top_layer() {
        let mut doc = Document::with_background(4, 4, RED).unwrap();
        let mut history = HistoryManager::default();
        let base = doc.active_layer().unwrap();
        let top = doc.add_layer(&mut history, NewLayer::new("top", 2, 2).filled(BLUE).at(1, 1)).unwrap();
        let before = doc.composite_full().unwrap();
        let merged = doc.merge_down(&mut history, top).unwrap();
        assert_eq!(merged, base);
        assert!(!doc.tree().contains(top));
        assert_eq!(doc.composite_full().unwrap(), before);
        history.undo(&mut doc).unwrap();
        assert!(doc.tree().contains(top));
        assert_eq!(doc.layer(base).unwrap().pixels.get_pixel(1, 1), RED);
    }

    #[test]
    fn merge_down_without_layer_below_fails() {
        let (mut doc, mut history, id) = doc_with_layer(4, 4);
        assert_eq!(doc.merge_down(&mut history, id).unwrap_err(), EditError::NoLayerBelow(id));
    }

    #[test]
    fn flatten_keeps_composite() {
        let mut doc = Document::with_background(3, 3, RED).unwrap();
        let mut history = HistoryManager::default();
        let top = doc.add_layer(&mut history, NewLayer::new("top", 1, 1).filled(BLUE).at(1, 1)).unwrap();
        doc.set_layer_blend_mode(&mut history, top, BlendMode::Screen).unwrap();
        let before = doc.composite_full().unwrap();
        doc.flatten(&mut history).unwrap();
        assert_eq!(doc.tree().leaves().len(), 1);
        assert_eq!(doc.composite_full().unwrap(), before);
    }

    #[test]
    fn resize_canvas_shifts_layers_and_undoes() {
        let mut doc = Document::with_background(4, 4, RED).unwrap();
        let mut history = HistoryManager::default();
        let id = doc.active_layer().unwrap();
        doc.resize_canvas(&mut history, 8, 8, Anchor::Center).unwrap();
        assert_eq!((doc.width(), doc.height()), (8, 8));
        assert_eq!(doc.layer(id).unwrap().origin, (2, 2));
        history.undo(&mut doc).unwrap();
        assert_eq!((doc.width(), doc.height()), (4, 4));
        assert_eq!(doc.layer(id).unwrap().origin, (0, 0));
    }

    #[test]
    fn duplicate_group_copies_children() {
        let (mut doc, mut history, base) = doc_with_layer(4, 4);
        let group = doc.add_group(&mut history, "g", None, None).unwrap();
        doc.move_into_group(&mut history, base, Some(group), None).unwrap();
        let copy = doc.duplicate_layer(&mut history, group).unwrap();
        assert_eq!(doc.tree().leaves().len(), 2);
        assert_eq!(doc.node(copy).unwrap().props().name, "g copy");
    }

    #[test]
    fn dirty_region_accumulates_and_resets() {
        let (mut doc, mut history, id) = doc_with_layer(10, 10);
        doc.take_dirty();
        let paint = PixelBuffer::filled(2, 2, RED).unwrap();
        doc.apply_masked_edit(&mut history, id, IRect::new(1, 1, 2, 2), &paint).unwrap();
        doc.apply_masked_edit(&mut history, id, IRect::new(6, 6, 2, 2), &paint).unwrap();
        assert_eq!(doc.take_dirty(), IRect::from_min_max(1, 1, 8, 8));
        assert!(doc.take_dirty().is_empty());
    }
}
