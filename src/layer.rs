use std::collections::HashMap;

use kurbo::Affine;

use crate::blend::BlendMode;
use crate::error::{EditError, EditResult};
use crate::geometry::{IRect, LayerTransform};
use crate::pixels::PixelBuffer;

// ============================================================================
// LAYER IDS
// ============================================================================

/// Stable handle for a layer or group. Ids are never reused within a
/// document, so a stale id simply fails lookup instead of aliasing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LayerId(pub u64);

impl std::fmt::Display for LayerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// ============================================================================
// NODES
// ============================================================================

/// Properties shared by pixel layers and groups.
#[derive(Clone, Debug, PartialEq)]
pub struct LayerProps {
    pub name: String,
    pub visible: bool,
    pub locked: bool,
    /// Clamped to `[0, 1]` on every setter.
    pub opacity: f32,
    pub blend_mode: BlendMode,
}

impl LayerProps {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            visible: true,
            locked: false,
            opacity: 1.0,
            blend_mode: BlendMode::Normal,
        }
    }
}

/// A pixel layer: an exclusively owned buffer placed on the canvas.
#[derive(Clone, Debug)]
pub struct Layer {
    pub id: LayerId,
    pub props: LayerProps,
    /// Integer placement of the buffer's top-left corner in canvas space.
    pub origin: (i32, i32),
    pub transform: LayerTransform,
    pub pixels: PixelBuffer,
    /// Back-reference by id only; the tree owns every node.
    pub parent: Option<LayerId>,
}

impl Layer {
    pub fn new(id: LayerId, name: impl Into<String>, pixels: PixelBuffer) -> Self {
        Self {
            id,
            props: LayerProps::named(name),
            origin: (0, 0),
            transform: LayerTransform::IDENTITY,
            pixels,
            parent: None,
        }
    }

    /// Layer-local → canvas mapping.
    pub fn affine(&self) -> Affine {
        self.transform.to_affine(self.origin, self.pixels.width(), self.pixels.height())
    }

    /// Canvas-space bounds of the transformed buffer.
    pub fn canvas_bounds(&self) -> Option<IRect> {
        self.transform.bounds(self.origin, self.pixels.width(), self.pixels.height())
    }

    /// Canvas → layer-local integer offset when no resampling is involved.
    pub fn integer_offset(&self) -> Option<(i32, i32)> {
        let (dx, dy) = self.transform.integer_offset()?;
        Some((self.origin.0.checked_add(dx)?, self.origin.1.checked_add(dy)?))
    }
}

/// An ordered set of children composited as one unit.
#[derive(Clone, Debug)]
pub struct LayerGroup {
    pub id: LayerId,
    pub props: LayerProps,
    /// Back-to-front: index 0 is the bottom-most child.
    pub children: Vec<LayerId>,
    pub parent: Option<LayerId>,
}

impl LayerGroup {
    pub fn new(id: LayerId, name: impl Into<String>) -> Self {
        Self { id, props: LayerProps::named(name), children: Vec::new(), parent: None }
    }
}

/// Anything that can sit in the layer tree.
#[derive(Clone, Debug)]
pub enum LayerNode {
    Leaf(Layer),
    Group(LayerGroup),
}

impl LayerNode {
    pub fn id(&self) -> LayerId {
        match self {
            LayerNode::Leaf(l) => l.id,
            LayerNode::Group(g) => g.id,
        }
    }

    pub fn props(&self) -> &LayerProps {
        match self {
            LayerNode::Leaf(l) => &l.props,
            LayerNode::Group(g) => &g.props,
        }
    }

    pub fn props_mut(&mut self) -> &mut LayerProps {
        match self {
            LayerNode::Leaf(l) => &mut l.props,
            LayerNode::Group(g) => &mut g.props,
        }
    }

    pub fn parent(&self) -> Option<LayerId> {
        match self {
            LayerNode::Leaf(l) => l.parent,
            LayerNode::Group(g) => g.parent,
        }
    }

    fn set_parent(&mut self, parent: Option<LayerId>) {
        match self {
            LayerNode::Leaf(l) => l.parent = parent,
            LayerNode::Group(g) => g.parent = parent,
        }
    }

    pub fn as_leaf(&self) -> Option<&Layer> {
        match self {
            LayerNode::Leaf(l) => Some(l),
            LayerNode::Group(_) => None,
        }
    }

    pub fn as_leaf_mut(&mut self) -> Option<&mut Layer> {
        match self {
            LayerNode::Leaf(l) => Some(l),
            LayerNode::Group(_) => None,
        }
    }

    pub fn as_group(&self) -> Option<&LayerGroup> {
        match self {
            LayerNode::Group(g) => Some(g),
            LayerNode::Leaf(_) => None,
        }
    }

    pub fn is_group(&self) -> bool {
        matches!(self, LayerNode::Group(_))
    }
}

// ============================================================================
// LAYER TREE – id arena with ordered sibling lists
// ============================================================================

/// Arena of nodes plus the ordered root sibling list.
///
/// Cloning is cheap: pixel buffers are copy-on-write, so a clone is what the
/// history engine stores for structural undo.
#[derive(Clone, Debug)]
pub struct LayerTree {
    nodes: HashMap<LayerId, LayerNode>,
    root: Vec<LayerId>,
    next_id: u64,
}

impl Default for LayerTree {
    fn default() -> Self {
        Self::new()
    }
}

impl LayerTree {
    pub fn new() -> Self {
        Self { nodes: HashMap::new(), root: Vec::new(), next_id: 1 }
    }

    /// Rebuild from persisted parts. Callers must insert nodes top-down.
    pub(crate) fn with_next_id(next_id: u64) -> Self {
        Self { nodes: HashMap::new(), root: Vec::new(), next_id: next_id.max(1) }
    }

    pub fn next_id(&self) -> u64 {
        self.next_id
    }

    /// Reserve a fresh id.
    pub fn allocate_id(&mut self) -> LayerId {
        let id = LayerId(self.next_id);
        self.next_id += 1;
        id
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: LayerId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn get(&self, id: LayerId) -> Option<&LayerNode> {
        self.nodes.get(&id)
    }

    pub fn get_mut(&mut self, id: LayerId) -> Option<&mut LayerNode> {
        self.nodes.get_mut(&id)
    }

    pub fn node(&self, id: LayerId) -> EditResult<&LayerNode> {
        self.nodes.get(&id).ok_or(EditError::UnknownLayer(id))
    }

    pub fn node_mut(&mut self, id: LayerId) -> EditResult<&mut LayerNode> {
        self.nodes.get_mut(&id).ok_or(EditError::UnknownLayer(id))
    }

    pub fn leaf(&self, id: LayerId) -> EditResult<&Layer> {
        self.node(id)?.as_leaf().ok_or(EditError::NotALeaf(id))
    }

    pub fn leaf_mut(&mut self, id: LayerId) -> EditResult<&mut Layer> {
        self.node_mut(id)?.as_leaf_mut().ok_or(EditError::NotALeaf(id))
    }

    /// Top-level children, back-to-front.
    pub fn root(&self) -> &[LayerId] {
        &self.root
    }

    /// Children of `parent` (`None` = root), back-to-front.
    pub fn children(&self, parent: Option<LayerId>) -> EditResult<&[LayerId]> {
        match parent {
            None => Ok(&self.root),
            Some(pid) => match self.node(pid)? {
                LayerNode::Group(g) => Ok(&g.children),
                LayerNode::Leaf(_) => Err(EditError::NotAGroup(pid)),
            },
        }
    }

    fn children_mut(&mut self, parent: Option<LayerId>) -> EditResult<&mut Vec<LayerId>> {
        match parent {
            None => Ok(&mut self.root),
            Some(pid) => match self.nodes.get_mut(&pid) {
                Some(LayerNode::Group(g)) => Ok(&mut g.children),
                Some(LayerNode::Leaf(_)) => Err(EditError::NotAGroup(pid)),
                None => Err(EditError::UnknownLayer(pid)),
            },
        }
    }

    /// `(parent, index)` of a node within its sibling list.
    pub fn position(&self, id: LayerId) -> EditResult<(Option<LayerId>, usize)> {
        let parent = self.node(id)?.parent();
        let index = self
            .children(parent)?
            .iter()
            .position(|c| *c == id)
            .ok_or(EditError::UnknownLayer(id))?;
        Ok((parent, index))
    }

    /// True if `node` is `ancestor` or lies anywhere beneath it.
    pub fn is_within(&self, node: LayerId, ancestor: LayerId) -> bool {
        let mut cursor = Some(node);
        while let Some(id) = cursor {
            if id == ancestor {
                return true;
            }
            cursor = self.nodes.get(&id).and_then(|n| n.parent());
        }
        false
    }

    /// Insert a detached node under `parent` at `index` (clamped to the sibling count).
    /// A group being inserted must not be, or contain, `parent`.
    pub fn insert(&mut self, mut node: LayerNode, parent: Option<LayerId>, index: usize) -> EditResult<()> {
        let id = node.id();
        if let Some(pid) = parent {
            if pid == id {
                return Err(EditError::CyclicGroupError { node: id, group: pid });
            }
            self.children(Some(pid))?;
            if self.contains(id) && self.is_within(pid, id) {
                return Err(EditError::CyclicGroupError { node: id, group: pid });
            }
        }
        node.set_parent(parent);
        let siblings = self.children_mut(parent)?;
        let at = index.min(siblings.len());
        siblings.insert(at, id);
        self.next_id = self.next_id.max(id.0 + 1);
        self.nodes.insert(id, node);
        Ok(())
    }

    /// Move an existing node under `parent` at `index`, enforcing acyclicity.
    /// The tree is unchanged on error.
    pub fn move_node(&mut self, id: LayerId, parent: Option<LayerId>, index: usize) -> EditResult<()> {
        let (old_parent, old_index) = self.position(id)?;
        if let Some(pid) = parent {
            self.children(Some(pid))?;
            if self.is_within(pid, id) {
                return Err(EditError::CyclicGroupError { node: id, group: pid });
            }
        }
        self.children_mut(old_parent)?.remove(old_index);
        let siblings = self.children_mut(parent)?;
        let at = index.min(siblings.len());
        siblings.insert(at, id);
        if let Some(node) = self.nodes.get_mut(&id) {
            node.set_parent(parent);
        }
        Ok(())
    }

    /// Remove a node and everything beneath it. Returns the removed nodes, top first.
    pub fn remove_subtree(&mut self, id: LayerId) -> EditResult<Vec<LayerNode>> {
        let (parent, index) = self.position(id)?;
        self.children_mut(parent)?.remove(index);
        let mut removed = Vec::new();
        let mut stack = vec![id];
        while let Some(cur) = stack.pop() {
            if let Some(node) = self.nodes.remove(&cur) {
                if let LayerNode::Group(g) = &node {
                    stack.extend(g.children.iter().copied());
                }
                removed.push(node);
            }
        }
        Ok(removed)
    }

    /// Every node in document order: depth-first, back-to-front, groups before their children.
    pub fn walk(&self) -> Vec<LayerId> {
        let mut out = Vec::with_capacity(self.nodes.len());
        self.walk_into(&self.root, &mut out);
        out
    }

    fn walk_into(&self, ids: &[LayerId], out: &mut Vec<LayerId>) {
        for id in ids {
            out.push(*id);
            if let Some(LayerNode::Group(g)) = self.nodes.get(id) {
                self.walk_into(&g.children, out);
            }
        }
    }

    /// Pixel layers in document order.
    pub fn leaves(&self) -> Vec<LayerId> {
        self.walk()
            .into_iter()
            .filter(|id| matches!(self.nodes.get(id), Some(LayerNode::Leaf(_))))
            .collect()
    }

    /// The sibling directly beneath `id`, if any.
    pub fn below(&self, id: LayerId) -> EditResult<Option<LayerId>> {
        let (parent, index) = self.position(id)?;
        if index == 0 {
            return Ok(None);
        }
        Ok(self.children(parent)?.get(index - 1).copied())
    }

    /// Visible unless it or any ancestor is hidden.
    pub fn effectively_visible(&self, id: LayerId) -> bool {
        let mut cursor = Some(id);
        while let Some(cur) = cursor {
            match self.nodes.get(&cur) {
                Some(n) if n.props().visible => cursor = n.parent(),
                _ => return false,
            }
        }
        true
    }

    /// Locked if it or any ancestor group is locked.
    pub fn effectively_locked(&self, id: LayerId) -> bool {
        let mut cursor = Some(id);
        while let Some(cur) = cursor {
            match self.nodes.get(&cur) {
                Some(n) if n.props().locked => return true,
                Some(n) => cursor = n.parent(),
                None => return false,
            }
        }
        false
    }

    /// First locked node in the subtree rooted at `id`, `id` included.
    pub fn locked_within(&self, id: LayerId) -> Option<LayerId> {
        let mut ids = Vec::new();
        self.walk_into(&[id], &mut ids);
        ids.into_iter().find(|n| self.nodes.get(n).is_some_and(|node| node.props().locked))
    }

    /// Number of pixel layers in the subtree rooted at `id` (including itself).
    pub fn leaf_count(&self, id: LayerId) -> usize {
        match self.nodes.get(&id) {
            Some(LayerNode::Leaf(_)) => 1,
            Some(LayerNode::Group(g)) => g.children.iter().map(|c| self.leaf_count(*c)).sum(),
            None => 0,
        }
    }

    /// Canvas-space bounds: a leaf's transformed rect, or the union over a group's children.
    pub fn bounds(&self, id: LayerId) -> IRect {
        match self.nodes.get(&id) {
            Some(LayerNode::Leaf(l)) => l.canvas_bounds().unwrap_or(IRect::EMPTY),
            Some(LayerNode::Group(g)) => g
                .children
                .iter()
                .fold(IRect::EMPTY, |acc, c| acc.union(&self.bounds(*c))),
            None => IRect::EMPTY,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(tree: &mut LayerTree, name: &str) -> LayerNode {
        let id = tree.allocate_id();
        LayerNode::Leaf(Layer::new(id, name, PixelBuffer::new(4, 4).unwrap()))
    }

    fn group(tree: &mut LayerTree, name: &str) -> LayerNode {
        let id = tree.allocate_id();
        LayerNode::Group(LayerGroup::new(id, name))
    }

    #[test]
    fn walk_is_back_to_front_depth_first() {
        let mut tree = LayerTree::new();
        let a = leaf(&mut tree, "a");
        let g = group(&mut tree, "g");
        let b = leaf(&mut tree, "b");
        let (a_id, g_id, b_id) = (a.id(), g.id(), b.id());
        tree.insert(a, None, 0).unwrap();
        tree.insert(g, None, 1).unwrap();
        tree.insert(b, Some(g_id), 0).unwrap();
        assert_eq!(tree.walk(), vec![a_id, g_id, b_id]);
        assert_eq!(tree.leaves(), vec![a_id, b_id]);
        assert_eq!(tree.below(g_id).unwrap(), Some(a_id));
    }

    #[test]
    fn nesting_a_group_in_its_descendant_fails_unchanged() {
        let mut tree = LayerTree::new();
        let outer = group(&mut tree, "outer");
        let inner = group(&mut tree, "inner");
        let (outer_id, inner_id) = (outer.id(), inner.id());
        tree.insert(outer, None, 0).unwrap();
        tree.insert(inner, Some(outer_id), 0).unwrap();
        let before = tree.walk();

        let err = tree.move_node(outer_id, Some(inner_id), 0).unwrap_err();
        assert_eq!(err, EditError::CyclicGroupError { node: outer_id, group: inner_id });
        let err = tree.move_node(outer_id, Some(outer_id), 0).unwrap_err();
        assert!(matches!(err, EditError::CyclicGroupError { .. }));
        assert_eq!(tree.walk(), before);
        assert_eq!(tree.get(inner_id).unwrap().parent(), Some(outer_id));
    }

    #[test]
    fn remove_subtree_drops_descendants() {
        let mut tree = LayerTree::new();
        let g = group(&mut tree, "g");
        let g_id = g.id();
        tree.insert(g, None, 0).unwrap();
        let a = leaf(&mut tree, "a");
        let a_id = a.id();
        tree.insert(a, Some(g_id), 0).unwrap();
        let removed = tree.remove_subtree(g_id).unwrap();
        assert_eq!(removed.len(), 2);
        assert!(!tree.contains(a_id));
        assert!(tree.root().is_empty());
    }

    #[test]
    fn hidden_group_hides_children() {
        let mut tree = LayerTree::new();
        let g = group(&mut tree, "g");
        let g_id = g.id();
        tree.insert(g, None, 0).unwrap();
        let a = leaf(&mut tree, "a");
        let a_id = a.id();
        tree.insert(a, Some(g_id), 0).unwrap();
        assert!(tree.effectively_visible(a_id));
        tree.get_mut(g_id).unwrap().props_mut().visible = false;
        assert!(!tree.effectively_visible(a_id));
    }
}
