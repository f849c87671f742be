use std::collections::{BTreeMap, HashSet, VecDeque};

use crate::document::{Document, DocumentSnapshot};
use crate::error::{EditError, EditResult};
use crate::geometry::IRect;
use crate::layer::{Layer, LayerId, LayerNode};
use crate::pixels::PixelBuffer;
use crate::selection::SelectionMask;
use crate::settings::EngineSettings;
use crate::{log_info, log_warn};

// ============================================================================
// COMMAND TRAIT
// ============================================================================

/// Trait for undoable/redoable commands.
pub trait Command: Send + Sync {
    fn undo(&self, doc: &mut Document);
    fn redo(&self, doc: &mut Document);
    fn description(&self) -> String;
    fn memory_size(&self) -> usize;
}

// ============================================================================
// PIXEL COMMAND - Dirty-rect patches for pixel edits
// ============================================================================

/// A rectangular patch of one layer's pixels, in layer-local coordinates.
#[derive(Clone, Debug)]
pub struct PixelPatch {
    pub layer_id: LayerId,
    pub rect: IRect,
    pub pixels: PixelBuffer,
}

impl PixelPatch {
    pub fn capture(layer_id: LayerId, source: &PixelBuffer, rect: IRect) -> EditResult<Self> {
        let rect = rect.intersect(&source.rect());
        let pixels = source.read_region(rect)?;
        Ok(Self { layer_id, rect, pixels })
    }

    pub fn apply(&self, doc: &mut Document) {
        match doc.tree.leaf_mut(self.layer_id) {
            Ok(layer) => {
                if let Err(e) = layer.pixels.write_region(self.rect.x0, self.rect.y0, &self.pixels) {
                    log_warn!("PixelPatch: restore into {} failed: {}", self.layer_id, e);
                    return;
                }
                if let Some(rect) = local_to_canvas(layer, self.rect) {
                    doc.mark_dirty(rect);
                }
            }
            Err(e) => log_warn!("PixelPatch: {}", e),
        }
    }

    pub fn memory_size(&self) -> usize {
        self.pixels.memory_bytes()
    }
}

/// Canvas-space bounding box of a layer-local rect.
fn local_to_canvas(layer: &Layer, rect: IRect) -> Option<IRect> {
    match layer.integer_offset() {
        Some((ox, oy)) => Some(rect.translate(ox, oy)),
        None => IRect::from_kurbo_outer(layer.affine().transform_rect_bbox(rect.to_kurbo())),
    }
}

/// Before/after patches for every layer touched in one recording scope.
pub struct PixelCommand {
    description: String,
    patches: Vec<(PixelPatch, PixelPatch)>,
}

impl Command for PixelCommand {
    fn undo(&self, doc: &mut Document) {
        for (before, _) in self.patches.iter().rev() {
            before.apply(doc);
        }
    }

    fn redo(&self, doc: &mut Document) {
        for (_, after) in &self.patches {
            after.apply(doc);
        }
    }

    fn description(&self) -> String {
        self.description.clone()
    }

    fn memory_size(&self) -> usize {
        self.patches.iter().map(|(b, a)| b.memory_size() + a.memory_size()).sum()
    }
}

// ============================================================================
// SELECTION COMMAND
// ============================================================================

pub struct SelectionCommand {
    description: String,
    before: SelectionMask,
    after: SelectionMask,
}

impl Command for SelectionCommand {
    fn undo(&self, doc: &mut Document) {
        doc.restore_selection(self.before.clone());
    }

    fn redo(&self, doc: &mut Document) {
        doc.restore_selection(self.after.clone());
    }

    fn description(&self) -> String {
        self.description.clone()
    }

    fn memory_size(&self) -> usize {
        self.before.memory_bytes() + self.after.memory_bytes()
    }
}

// ============================================================================
// STRUCTURE COMMAND — document snapshots for add/remove/reorder/group/props
// ============================================================================

/// One side of a structural entry. Pixel buffers and the selection it has in
/// common with the other side are left out and read back from the live
/// document on restore: history is linear, so whenever this side is restored
/// the live document holds exactly that content.
struct StructureSide {
    snapshot: DocumentSnapshot,
    /// Leaves whose buffer was left out, with the buffer's dimensions.
    borrowed: Vec<(LayerId, u32, u32)>,
    borrowed_selection: bool,
}

impl StructureSide {
    fn restore(&self, doc: &mut Document) {
        let mut snap = self.snapshot.clone();
        for &(id, width, height) in &self.borrowed {
            let live = doc
                .tree
                .leaf(id)
                .ok()
                .map(|l| l.pixels.clone())
                .filter(|p| (p.width(), p.height()) == (width, height));
            let pixels = match live {
                Some(pixels) => pixels,
                None => {
                    log_warn!("StructureCommand: no live pixels for {}; restoring it transparent", id);
                    match PixelBuffer::new(width, height) {
                        Ok(pixels) => pixels,
                        Err(_) => continue,
                    }
                }
            };
            if let Ok(layer) = snap.tree.leaf_mut(id) {
                layer.pixels = pixels;
            }
        }
        if self.borrowed_selection {
            snap.selection = doc.selection.clone();
        }
        doc.restore_snapshot(&snap);
    }
}

/// Split a before/after pair so that storage common to both is held by neither.
fn split_sides(mut before: DocumentSnapshot, mut after: DocumentSnapshot) -> (StructureSide, StructureSide) {
    let mut borrowed = Vec::new();
    for id in before.tree.leaves() {
        let (Ok(b), Ok(a)) = (before.tree.leaf_mut(id), after.tree.leaf_mut(id)) else {
            continue;
        };
        if b.pixels.shares_storage_with(&a.pixels) {
            borrowed.push((id, b.pixels.width(), b.pixels.height()));
            b.pixels = PixelBuffer::detached();
            a.pixels = PixelBuffer::detached();
        }
    }
    let borrowed_selection = before.selection == after.selection;
    if borrowed_selection {
        before.selection = SelectionMask::new(before.width, before.height);
        after.selection = SelectionMask::new(after.width, after.height);
    }
    (
        StructureSide { snapshot: before, borrowed: borrowed.clone(), borrowed_selection },
        StructureSide { snapshot: after, borrowed, borrowed_selection },
    )
}

pub struct StructureCommand {
    description: String,
    before: StructureSide,
    after: StructureSide,
}

impl StructureCommand {
    fn new(description: String, before: DocumentSnapshot, after: DocumentSnapshot) -> Self {
        let (before, after) = split_sides(before, after);
        Self { description, before, after }
    }
}

impl Command for StructureCommand {
    fn undo(&self, doc: &mut Document) {
        self.before.restore(doc);
    }

    fn redo(&self, doc: &mut Document) {
        self.after.restore(doc);
    }

    fn description(&self) -> String {
        self.description.clone()
    }

    /// Every distinct buffer kept by either side, in full.
    fn memory_size(&self) -> usize {
        let mut seen = HashSet::new();
        let mut total = 0;
        for side in [&self.before, &self.after] {
            let tree = &side.snapshot.tree;
            total += side.snapshot.selection.memory_bytes();
            for id in tree.walk() {
                let Some(node) = tree.get(id) else { continue };
                total += std::mem::size_of::<LayerNode>() + node.props().name.len();
                if let Some(layer) = node.as_leaf()
                    && seen.insert(layer.pixels.storage_key())
                {
                    total += layer.pixels.memory_bytes();
                }
            }
        }
        total
    }
}

/// Several commands committed as one unit. Undo runs in reverse order.
pub struct BatchCommand {
    description: String,
    commands: Vec<Box<dyn Command>>,
}

impl Command for BatchCommand {
    fn undo(&self, doc: &mut Document) {
        for cmd in self.commands.iter().rev() {
            cmd.undo(doc);
        }
    }

    fn redo(&self, doc: &mut Document) {
        for cmd in &self.commands {
            cmd.redo(doc);
        }
    }

    fn description(&self) -> String {
        self.description.clone()
    }

    fn memory_size(&self) -> usize {
        self.commands.iter().map(|c| c.memory_size()).sum()
    }
}

// ============================================================================
// HISTORY ENTRY
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryKind {
    Pixels,
    Selection,
    /// Pixels and selection changed in the same scope.
    Mixed,
    Structure,
}

/// One undoable unit: what kind of change, which layers, and how to reverse it.
pub struct HistoryEntry {
    pub kind: EntryKind,
    pub targets: Vec<LayerId>,
    command: Box<dyn Command>,
    memory: usize,
}

impl HistoryEntry {
    fn new(kind: EntryKind, targets: Vec<LayerId>, command: Box<dyn Command>) -> Self {
        let memory = command.memory_size();
        Self { kind, targets, command, memory }
    }

    pub fn description(&self) -> String {
        self.command.description()
    }

    pub fn memory_size(&self) -> usize {
        self.memory
    }
}

// ============================================================================
// RECORDING SCOPE
// ============================================================================

/// Pre-scope pixels of one layer plus the union of everything written since.
struct PixelOrigin {
    before: PixelBuffer,
    dirty: IRect,
}

struct RecordingScope {
    description: String,
    pixels: BTreeMap<LayerId, PixelOrigin>,
    /// Document exactly as it was when the scope opened (set on first structural change).
    structure_before: Option<DocumentSnapshot>,
    selection_before: Option<SelectionMask>,
    targets: Vec<LayerId>,
}

impl RecordingScope {
    fn new(description: String) -> Self {
        Self {
            description,
            pixels: BTreeMap::new(),
            structure_before: None,
            selection_before: None,
            targets: Vec::new(),
        }
    }

    fn add_target(&mut self, id: LayerId) {
        if !self.targets.contains(&id) {
            self.targets.push(id);
        }
    }

    /// The document as it stood at `begin()`: the current snapshot with every
    /// layer pixel and selection change made so far in this scope rolled back.
    fn pre_scope_snapshot(&self, doc: &Document) -> DocumentSnapshot {
        let mut snap = doc.snapshot();
        for (id, origin) in &self.pixels {
            if let Ok(layer) = snap.tree.leaf_mut(*id) {
                layer.pixels = origin.before.clone();
            }
        }
        if let Some(sel) = &self.selection_before {
            snap.selection = sel.clone();
        }
        snap
    }
}

// ============================================================================
// HISTORY MANAGER - Manages undo/redo stacks with memory limits
// ============================================================================

/// Undo/redo history for one document.
///
/// State machine: `Idle → Recording → Idle` per logical edit. While a scope
/// is open every pixel write, selection change and structural change made
/// through [`Document`] is folded into a single entry on `commit()`.
pub struct HistoryManager {
    undo_stack: VecDeque<HistoryEntry>,
    redo_stack: VecDeque<HistoryEntry>,
    scope: Option<RecordingScope>,
    max_history_size: usize,
    /// Optional memory cap in bytes.
    max_memory_bytes: Option<usize>,
    /// Running memory total across both stacks.
    total_memory: usize,
}

impl Default for HistoryManager {
    fn default() -> Self {
        Self::new(50)
    }
}

impl HistoryManager {
    pub fn new(max_history_size: usize) -> Self {
        Self {
            undo_stack: VecDeque::new(),
            redo_stack: VecDeque::new(),
            scope: None,
            max_history_size: max_history_size.max(1),
            max_memory_bytes: Some(100 * 1024 * 1024), // 100 MB default limit
            total_memory: 0,
        }
    }

    pub fn from_settings(settings: &EngineSettings) -> Self {
        let mut history = Self::new(settings.max_undo_steps);
        history.set_memory_limit(match settings.max_history_memory_mb {
            0 => None,
            mb => Some(mb * 1024 * 1024),
        });
        history
    }

    pub fn set_memory_limit(&mut self, max_bytes: Option<usize>) {
        self.max_memory_bytes = max_bytes;
        self.prune();
    }

    // ---- recording scope ----------------------------------------------------

    pub fn is_recording(&self) -> bool {
        self.scope.is_some()
    }

    /// Open a recording scope. Scopes do not nest.
    pub fn begin(&mut self, description: impl Into<String>) -> EditResult<()> {
        if self.scope.is_some() {
            return Err(EditError::AlreadyRecording);
        }
        self.scope = Some(RecordingScope::new(description.into()));
        Ok(())
    }

    /// Close the scope and push one entry covering everything it recorded.
    /// Returns `false` when the scope recorded no change (nothing is pushed).
    pub fn commit(&mut self, doc: &Document) -> EditResult<bool> {
        let scope = self.scope.take().ok_or(EditError::NotRecording)?;
        let Some(entry) = Self::finish(scope, doc)? else {
            return Ok(false);
        };
        log_info!("History: commit '{}' ({} bytes)", entry.description(), entry.memory_size());
        self.push(entry);
        Ok(true)
    }

    /// Discard the scope, rolling the document back to its pre-scope state.
    pub fn cancel(&mut self, doc: &mut Document) -> EditResult<()> {
        let scope = self.scope.take().ok_or(EditError::NotRecording)?;
        if scope.structure_before.is_some() || !scope.pixels.is_empty() || scope.selection_before.is_some() {
            let snap = match scope.structure_before {
                Some(ref snap) => snap.clone(),
                None => scope.pre_scope_snapshot(doc),
            };
            doc.restore_snapshot(&snap);
        }
        Ok(())
    }

    fn finish(scope: RecordingScope, doc: &Document) -> EditResult<Option<HistoryEntry>> {
        let RecordingScope { description, pixels, structure_before, selection_before, targets } = scope;

        if let Some(before) = structure_before {
            let cmd = StructureCommand::new(description, before, doc.snapshot());
            return Ok(Some(HistoryEntry::new(EntryKind::Structure, targets, Box::new(cmd))));
        }

        let mut commands: Vec<Box<dyn Command>> = Vec::new();
        let mut pixel_targets = Vec::new();

        let mut patches = Vec::new();
        for (id, origin) in pixels {
            if origin.dirty.is_empty() {
                continue;
            }
            let layer = doc.tree.leaf(id)?;
            let before = PixelPatch::capture(id, &origin.before, origin.dirty)?;
            let after = PixelPatch::capture(id, &layer.pixels, origin.dirty)?;
            patches.push((before, after));
            pixel_targets.push(id);
        }
        let has_pixels = !patches.is_empty();
        if has_pixels {
            commands.push(Box::new(PixelCommand { description: description.clone(), patches }));
        }

        let selection_changed = selection_before.as_ref().is_some_and(|b| b != doc.selection());
        if let Some(before) = selection_before.filter(|_| selection_changed) {
            commands.push(Box::new(SelectionCommand {
                description: description.clone(),
                before,
                after: doc.selection().clone(),
            }));
        }

        let kind = match (has_pixels, selection_changed) {
            (false, false) => return Ok(None),
            (true, false) => EntryKind::Pixels,
            (false, true) => EntryKind::Selection,
            (true, true) => EntryKind::Mixed,
        };
        let command: Box<dyn Command> = if commands.len() == 1 {
            commands.remove(0)
        } else {
            Box::new(BatchCommand { description, commands })
        };
        let targets = if pixel_targets.is_empty() { targets } else { pixel_targets };
        Ok(Some(HistoryEntry::new(kind, targets, command)))
    }

    /// Called by [`Document`] right before it writes `rect` (layer-local) of `layer`.
    pub(crate) fn record_pixels(&mut self, layer: &Layer, rect: IRect) {
        let Some(scope) = self.scope.as_mut() else { return };
        scope.add_target(layer.id);
        let origin = scope
            .pixels
            .entry(layer.id)
            .or_insert_with(|| PixelOrigin { before: layer.pixels.clone(), dirty: IRect::EMPTY });
        origin.dirty = origin.dirty.union(&rect);
    }

    /// Called by [`Document`] right before any structural or property change.
    pub(crate) fn record_structure(&mut self, doc: &Document, targets: &[LayerId]) {
        let Some(scope) = self.scope.as_mut() else { return };
        for id in targets {
            scope.add_target(*id);
        }
        if scope.structure_before.is_none() {
            scope.structure_before = Some(scope.pre_scope_snapshot(doc));
        }
    }

    /// Called by [`Document`] right before the selection changes.
    pub(crate) fn record_selection(&mut self, selection: &SelectionMask) {
        let Some(scope) = self.scope.as_mut() else { return };
        if scope.selection_before.is_none() && scope.structure_before.is_none() {
            scope.selection_before = Some(selection.clone());
        }
    }

    // ---- undo / redo ----------------------------------------------------------

    fn push(&mut self, entry: HistoryEntry) {
        // Clear redo stack when a new action is performed
        for e in self.redo_stack.drain(..) {
            self.total_memory = self.total_memory.saturating_sub(e.memory_size());
        }
        self.total_memory += entry.memory_size();
        self.undo_stack.push_back(entry);
        self.prune();
    }

    /// Revert the most recent entry. Returns its description.
    pub fn undo(&mut self, doc: &mut Document) -> EditResult<String> {
        if self.scope.is_some() {
            return Err(EditError::AlreadyRecording);
        }
        let entry = self.undo_stack.pop_back().ok_or(EditError::NothingToUndo)?;
        let description = entry.description();
        entry.command.undo(doc);
        log_info!("History: undo '{}'", description);
        self.redo_stack.push_back(entry);
        Ok(description)
    }

    /// Re-apply the most recently undone entry. Returns its description.
    pub fn redo(&mut self, doc: &mut Document) -> EditResult<String> {
        if self.scope.is_some() {
            return Err(EditError::AlreadyRecording);
        }
        let entry = self.redo_stack.pop_back().ok_or(EditError::NothingToRedo)?;
        let description = entry.description();
        entry.command.redo(doc);
        log_info!("History: redo '{}'", description);
        self.undo_stack.push_back(entry);
        Ok(description)
    }

    /// Undo `count` entries (stops early at the bottom of the stack).
    /// Returns how many were undone.
    pub fn undo_to(&mut self, count: usize, doc: &mut Document) -> usize {
        let mut done = 0;
        while done < count && self.undo(doc).is_ok() {
            done += 1;
        }
        done
    }

    pub fn can_undo(&self) -> bool {
        self.scope.is_none() && !self.undo_stack.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        self.scope.is_none() && !self.redo_stack.is_empty()
    }

    pub fn undo_description(&self) -> Option<String> {
        self.undo_stack.back().map(|e| e.description())
    }

    pub fn redo_description(&self) -> Option<String> {
        self.redo_stack.back().map(|e| e.description())
    }

    /// All undo descriptions, most recent first.
    pub fn undo_history(&self) -> Vec<String> {
        self.undo_stack.iter().rev().map(|e| e.description()).collect()
    }

    /// Most recent committed entry.
    pub fn last_entry(&self) -> Option<&HistoryEntry> {
        self.undo_stack.back()
    }

    pub fn undo_count(&self) -> usize {
        self.undo_stack.len()
    }

    pub fn redo_count(&self) -> usize {
        self.redo_stack.len()
    }

    /// Current memory usage of both stacks (O(1) via cached total).
    pub fn memory_usage(&self) -> usize {
        self.total_memory
    }

    /// Drop oldest entries until both the count and memory limits hold.
    fn prune(&mut self) {
        while self.undo_stack.len() > self.max_history_size {
            if let Some(removed) = self.undo_stack.pop_front() {
                self.total_memory = self.total_memory.saturating_sub(removed.memory_size());
                log_info!("History: pruned '{}' (count limit)", removed.description());
            }
        }
        if let Some(max_bytes) = self.max_memory_bytes {
            while self.total_memory > max_bytes && self.undo_stack.len() > 1 {
                if let Some(removed) = self.undo_stack.pop_front() {
                    self.total_memory = self.total_memory.saturating_sub(removed.memory_size());
                    log_info!("History: pruned '{}' (memory limit)", removed.description());
                }
            }
        }
    }

    /// Forget everything, including an open scope (used on document close).
    pub fn clear(&mut self) {
        self.undo_stack.clear();
        self.redo_stack.clear();
        self.scope = None;
        self.total_memory = 0;
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Weak;

    use super::*;
    use crate::document::NewLayer;

    const FILL: [u8; 4] = [10, 20, 30, 255];

    /// Bytes of every buffer in `versions` still alive, except the live one.
    fn pinned_bytes(versions: &[Weak<Vec<u8>>], live: &PixelBuffer) -> usize {
        let mut seen = HashSet::new();
        versions
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|data| std::sync::Arc::as_ptr(data) as usize != live.storage_key())
            .filter(|data| seen.insert(std::sync::Arc::as_ptr(data) as usize))
            .map(|data| data.len())
            .sum()
    }

    #[test]
    fn memory_cap_holds_when_property_and_pixel_edits_interleave() {
        let mut doc = Document::new(256, 256).unwrap();
        let mut history = HistoryManager::new(500);
        let id = doc.add_layer(&mut history, NewLayer::new("paint", 256, 256).filled(FILL)).unwrap();
        let cap = 1024 * 1024;
        history.set_memory_limit(Some(cap));

        let dot = PixelBuffer::filled(1, 1, [200, 0, 0, 255]).unwrap();
        let mut versions = vec![doc.layer(id).unwrap().pixels.downgrade()];
        for i in 0..40 {
            doc.set_layer_opacity(&mut history, id, 0.5 + i as f32 / 100.0).unwrap();
            doc.apply_masked_edit(&mut history, id, IRect::new(i, i, 1, 1), &dot).unwrap();
            versions.push(doc.layer(id).unwrap().pixels.downgrade());
        }

        assert_eq!(history.undo_count(), 81);
        assert!(history.memory_usage() <= cap);
        let pinned = pinned_bytes(&versions, &doc.layer(id).unwrap().pixels);
        assert!(pinned <= history.memory_usage(), "history pins {pinned} bytes but reports {}", history.memory_usage());

        let final_pixels = doc.layer(id).unwrap().pixels.clone();
        assert_eq!(history.undo_to(80, &mut doc), 80);
        let layer = doc.layer(id).unwrap();
        assert_eq!(layer.props.opacity, 1.0);
        assert_eq!(layer.pixels, PixelBuffer::filled(256, 256, FILL).unwrap());
        while history.redo(&mut doc).is_ok() {}
        let layer = doc.layer(id).unwrap();
        assert!((layer.props.opacity - 0.89).abs() < 1e-6);
        assert_eq!(layer.pixels, final_pixels);
    }

    #[test]
    fn removed_layer_pixels_are_charged_to_history() {
        let mut doc = Document::with_background(64, 64, FILL).unwrap();
        let mut history = HistoryManager::default();
        let top = doc.add_layer(&mut history, NewLayer::new("top", 64, 64)).unwrap();
        history.clear();

        doc.set_layer_visible(&mut history, top, false).unwrap();
        let property_entry = history.memory_usage();
        assert!(property_entry < 64 * 64 * 4, "property change charged {property_entry} bytes");

        doc.remove_layer(&mut history, top).unwrap();
        assert!(history.memory_usage() - property_entry >= 64 * 64 * 4);
        history.undo(&mut doc).unwrap();
        assert_eq!(doc.layer(top).unwrap().pixels, PixelBuffer::new(64, 64).unwrap());
    }

    #[test]
    fn property_undo_keeps_later_pixel_content() {
        let mut doc = Document::with_background(8, 8, FILL).unwrap();
        let mut history = HistoryManager::default();
        let id = doc.active_layer().unwrap();
        doc.set_layer_blend_mode(&mut history, id, crate::blend::BlendMode::Screen).unwrap();
        let paint = PixelBuffer::filled(2, 2, [1, 2, 3, 255]).unwrap();
        doc.apply_masked_edit(&mut history, id, IRect::new(0, 0, 2, 2), &paint).unwrap();
        let edited = doc.layer(id).unwrap().pixels.clone();

        history.undo(&mut doc).unwrap();
        history.undo(&mut doc).unwrap();
        assert_eq!(doc.layer(id).unwrap().props.blend_mode, crate::blend::BlendMode::Normal);
        assert_eq!(doc.layer(id).unwrap().pixels, PixelBuffer::filled(8, 8, FILL).unwrap());
        history.redo(&mut doc).unwrap();
        history.redo(&mut doc).unwrap();
        assert_eq!(doc.layer(id).unwrap().props.blend_mode, crate::blend::BlendMode::Screen);
        assert_eq!(doc.layer(id).unwrap().pixels, edited);
    }
}
