//! Arena storage for the layer hierarchy.
//!
//! Every node lives in a slot of a [`LayerTree`] and is addressed by a
//! [`LayerId`]. A handle carries its slot generation and the owning tree's id,
//! so handles to destroyed nodes or to nodes of another tree are detected
//! instead of aliasing whatever occupies the slot now.
//!
//! Nodes that are not reachable from the root (freshly created, or taken out by
//! an undo command) stay alive as *detached* subtrees until they are inserted
//! again or destroyed with [`LayerTree::destroy_recursive`].

use std::fmt;

use uuid::Uuid;

use crate::error::{SceneError, SceneResult};
use crate::geometry::IntPoint;
use crate::layer::LayerNode;
use crate::naming::unduplicated_name;
use crate::tile::TileKeySet;

/// A handle to a node in a [`LayerTree`].
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct LayerId {
    tree: Uuid,
    idx: u32,
    generation: u32,
}

impl LayerId {
    /// Raw slot index (diagnostics only).
    pub fn index(self) -> u32 {
        self.idx
    }

    pub fn generation(self) -> u32 {
        self.generation
    }

    /// Id of the tree that issued this handle.
    pub fn tree_id(self) -> Uuid {
        self.tree
    }
}

impl fmt::Debug for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LayerId({}@gen{})", self.idx, self.generation)
    }
}

/// An owned copy of a subtree, detached from any arena.
#[derive(Debug, Clone)]
pub struct LayerSnapshot {
    pub node: LayerNode,
    pub children: Vec<LayerSnapshot>,
}

impl LayerSnapshot {
    pub fn leaf(node: LayerNode) -> Self {
        Self {
            node,
            children: Vec::new(),
        }
    }
}

#[derive(Debug)]
struct LayerEntry {
    node: LayerNode,
    parent: Option<LayerId>,
    children: Vec<LayerId>,
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    entry: Option<LayerEntry>,
}

/// The layer hierarchy: one root group plus any detached subtrees.
///
/// Children are ordered top to bottom: index 0 is the topmost layer.
#[derive(Debug)]
pub struct LayerTree {
    id: Uuid,
    slots: Vec<Slot>,
    free_list: Vec<u32>,
    root: LayerId,
}

impl LayerTree {
    /// Creates a tree holding only its root group.
    pub fn new() -> Self {
        let id = Uuid::new_v4();
        let mut tree = Self {
            id,
            slots: Vec::new(),
            free_list: Vec::new(),
            root: LayerId {
                tree: id,
                idx: 0,
                generation: 0,
            },
        };
        tree.root = tree.create(LayerNode::group(""));
        tree
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn root(&self) -> LayerId {
        self.root
    }

    /// Number of live nodes, detached ones included.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.entry.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ── Allocation ───────────────────────────────────────────────────

    /// Adds `node` as a detached subtree root.
    pub fn create(&mut self, node: LayerNode) -> LayerId {
        let entry = LayerEntry {
            node,
            parent: None,
            children: Vec::new(),
        };
        let idx = match self.free_list.pop() {
            Some(idx) => {
                self.slots[idx as usize].entry = Some(entry);
                idx
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    entry: Some(entry),
                });
                (self.slots.len() - 1) as u32
            }
        };
        LayerId {
            tree: self.id,
            idx,
            generation: self.slots[idx as usize].generation,
        }
    }

    /// Frees a detached subtree. Its handles become stale.
    pub fn destroy_recursive(&mut self, id: LayerId) -> SceneResult<()> {
        let entry = self.entry(id).ok_or(SceneError::InvalidLayer(id))?;
        if id == self.root {
            return Err(SceneError::RootLayer);
        }
        if entry.parent.is_some() {
            return Err(SceneError::NotDetached(id));
        }
        let mut doomed = vec![id];
        doomed.extend(self.descendants(id));
        for layer in doomed {
            let slot = &mut self.slots[layer.idx as usize];
            slot.entry = None;
            slot.generation = slot.generation.wrapping_add(1);
            self.free_list.push(layer.idx);
        }
        Ok(())
    }

    pub fn is_alive(&self, id: LayerId) -> bool {
        self.entry(id).is_some()
    }

    // ── Queries ──────────────────────────────────────────────────────

    pub fn node(&self, id: LayerId) -> Option<&LayerNode> {
        self.entry(id).map(|e| &e.node)
    }

    pub(crate) fn node_mut(&mut self, id: LayerId) -> Option<&mut LayerNode> {
        self.entry_mut(id).map(|e| &mut e.node)
    }

    pub fn parent(&self, id: LayerId) -> Option<LayerId> {
        self.entry(id).and_then(|e| e.parent)
    }

    /// Children top to bottom; empty for stale handles and leaf kinds.
    pub fn children(&self, id: LayerId) -> &[LayerId] {
        self.entry(id).map(|e| e.children.as_slice()).unwrap_or(&[])
    }

    pub fn child(&self, id: LayerId, index: usize) -> Option<LayerId> {
        self.children(id).get(index).copied()
    }

    pub fn child_count(&self, id: LayerId) -> usize {
        self.children(id).len()
    }

    /// Position of `id` within its parent's children.
    pub fn index_of(&self, id: LayerId) -> Option<usize> {
        let parent = self.parent(id)?;
        self.children(parent).iter().position(|&c| c == id)
    }

    /// The topmost ancestor of `id` (itself when detached).
    pub fn root_of(&self, id: LayerId) -> Option<LayerId> {
        let mut current = id;
        self.entry(current)?;
        while let Some(parent) = self.parent(current) {
            current = parent;
        }
        Some(current)
    }

    /// Whether `id` is attached under the tree's root (or is the root).
    pub fn is_in_scene(&self, id: LayerId) -> bool {
        self.root_of(id) == Some(self.root)
    }

    /// Whether `ancestor` is a strict ancestor of `id`.
    pub fn is_ancestor_of(&self, ancestor: LayerId, id: LayerId) -> bool {
        let mut current = self.parent(id);
        while let Some(layer) = current {
            if layer == ancestor {
                return true;
            }
            current = self.parent(layer);
        }
        false
    }

    /// All descendants of `id` in depth-first pre-order, excluding `id`.
    pub fn descendants(&self, id: LayerId) -> Vec<LayerId> {
        let mut out = Vec::new();
        let mut stack: Vec<LayerId> = self.children(id).iter().rev().copied().collect();
        while let Some(layer) = stack.pop() {
            out.push(layer);
            stack.extend(self.children(layer).iter().rev().copied());
        }
        out
    }

    pub fn child_names(&self, id: LayerId) -> Vec<String> {
        self.children(id)
            .iter()
            .filter_map(|&c| self.node(c))
            .map(|n| n.name.clone())
            .collect()
    }

    /// A name not used by any child of `parent`, derived from `name`.
    pub fn unduplicated_child_name(&self, parent: LayerId, name: &str) -> String {
        unduplicated_name(&self.child_names(parent), name)
    }

    /// Tile keys painted by `id` and all of its descendants.
    pub fn tile_keys_recursive(&self, id: LayerId) -> TileKeySet {
        let mut keys = self.node(id).map(|n| n.kind.tile_keys()).unwrap_or_default();
        for layer in self.descendants(id) {
            if let Some(node) = self.node(layer) {
                keys.extend(node.kind.tile_keys());
            }
        }
        keys
    }

    /// The topmost visible descendant with content within `margin` of `pos`.
    pub fn descendant_at(&self, id: LayerId, pos: IntPoint, margin: i32) -> Option<LayerId> {
        for &child in self.children(id) {
            let Some(node) = self.node(child) else {
                continue;
            };
            if !node.visible {
                continue;
            }
            if node.can_have_children() {
                if let Some(found) = self.descendant_at(child, pos, margin) {
                    return Some(found);
                }
            } else if node.kind.includes(pos, margin) {
                return Some(child);
            }
        }
        None
    }

    /// Index path from the node's root down to `id`.
    ///
    /// For attached nodes this is relative to the tree root.
    pub fn path_for_layer(&self, id: LayerId) -> Option<Vec<usize>> {
        self.entry(id)?;
        let mut path = Vec::new();
        let mut current = id;
        while let Some(parent) = self.parent(current) {
            path.push(self.children(parent).iter().position(|&c| c == current)?);
            current = parent;
        }
        path.reverse();
        Some(path)
    }

    /// Resolves a root-relative index path.
    pub fn layer_for_path(&self, path: &[usize]) -> Option<LayerId> {
        path.iter()
            .try_fold(self.root, |layer, &index| self.child(layer, index))
    }

    // ── Structure ────────────────────────────────────────────────────

    /// Splices `child` into `parent` at `index`, detaching it from its old parent first.
    pub fn insert(&mut self, parent: LayerId, index: usize, child: LayerId) -> SceneResult<()> {
        let parent_entry = self.entry(parent).ok_or(SceneError::InvalidParent(parent))?;
        if !parent_entry.node.can_have_children() {
            return Err(SceneError::NotAGroup(parent));
        }
        let old_parent = self.entry(child).ok_or(SceneError::InvalidLayer(child))?.parent;
        if child == self.root {
            return Err(SceneError::RootLayer);
        }
        if child == parent || self.is_ancestor_of(child, parent) {
            return Err(SceneError::Cycle(child));
        }
        let mut count = parent_entry.children.len();
        if old_parent == Some(parent) {
            count -= 1;
        }
        if index > count {
            return Err(SceneError::IndexOutOfRange { index, count });
        }

        if let Some(old) = old_parent {
            if let Some(entry) = self.entry_mut(old) {
                entry.children.retain(|&c| c != child);
            }
        }
        if let Some(entry) = self.entry_mut(parent) {
            entry.children.insert(index, child);
        }
        if let Some(entry) = self.entry_mut(child) {
            entry.parent = Some(parent);
        }
        Ok(())
    }

    /// Removes the child at `index`, leaving it as a detached subtree.
    pub fn take(&mut self, parent: LayerId, index: usize) -> SceneResult<LayerId> {
        let entry = self.entry_mut(parent).ok_or(SceneError::InvalidParent(parent))?;
        let count = entry.children.len();
        if index >= count {
            return Err(SceneError::IndexOutOfRange { index, count });
        }
        let child = entry.children.remove(index);
        if let Some(entry) = self.entry_mut(child) {
            entry.parent = None;
        }
        Ok(child)
    }

    pub fn take_all(&mut self, parent: LayerId) -> Vec<LayerId> {
        let children = match self.entry_mut(parent) {
            Some(entry) => std::mem::take(&mut entry.children),
            None => return Vec::new(),
        };
        for &child in &children {
            if let Some(entry) = self.entry_mut(child) {
                entry.parent = None;
            }
        }
        children
    }

    /// Copies the node's properties and payload into a new detached node.
    pub fn clone_layer(&mut self, id: LayerId) -> Option<LayerId> {
        let node = self.node(id)?.clone();
        Some(self.create(node))
    }

    /// Copies the whole subtree into new detached nodes.
    pub fn clone_recursive(&mut self, id: LayerId) -> Option<LayerId> {
        let snapshot = self.snapshot(id)?;
        Some(self.instantiate(snapshot))
    }

    /// Owned copy of the subtree rooted at `id`.
    pub fn snapshot(&self, id: LayerId) -> Option<LayerSnapshot> {
        let node = self.node(id)?.clone();
        let children = self
            .children(id)
            .iter()
            .filter_map(|&c| self.snapshot(c))
            .collect();
        Some(LayerSnapshot { node, children })
    }

    /// Materializes a snapshot as a detached subtree.
    pub fn instantiate(&mut self, snapshot: LayerSnapshot) -> LayerId {
        let LayerSnapshot { node, children } = snapshot;
        let id = self.create(node);
        for child in children {
            let child_id = self.instantiate(child);
            let index = self.child_count(id);
            if self.insert(id, index, child_id).is_err() {
                // Only groups own children; anything else is dropped.
                let _ = self.destroy_recursive(child_id);
            }
        }
        id
    }

    // ── Internals ────────────────────────────────────────────────────

    fn entry(&self, id: LayerId) -> Option<&LayerEntry> {
        if id.tree != self.id {
            return None;
        }
        let slot = self.slots.get(id.idx as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.entry.as_ref()
    }

    fn entry_mut(&mut self, id: LayerId) -> Option<&mut LayerEntry> {
        if id.tree != self.id {
            return None;
        }
        let slot = self.slots.get_mut(id.idx as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.entry.as_mut()
    }
}

impl Default for LayerTree {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use image::Rgba;

    use super::*;
    use crate::geometry::IntRect;

    fn tree_with(names: &[&str]) -> (LayerTree, Vec<LayerId>) {
        let mut tree = LayerTree::new();
        let root = tree.root();
        let ids: Vec<_> = names
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let id = tree.create(LayerNode::raster(name));
                tree.insert(root, i, id).unwrap();
                id
            })
            .collect();
        (tree, ids)
    }

    #[test]
    fn test_insert_then_take_restores_structure() {
        let (mut tree, ids) = tree_with(&["a", "b"]);
        let root = tree.root();
        let c = tree.create(LayerNode::raster("c"));
        tree.insert(root, 1, c).unwrap();
        assert_eq!(tree.children(root), &[ids[0], c, ids[1]]);
        assert_eq!(tree.parent(c), Some(root));
        assert_eq!(tree.index_of(c), Some(1));

        let taken = tree.take(root, 1).unwrap();
        assert_eq!(taken, c);
        assert_eq!(tree.children(root), &[ids[0], ids[1]]);
        assert_eq!(tree.parent(c), None);
        assert!(tree.is_alive(c));
        assert!(!tree.is_in_scene(c));
    }

    #[test]
    fn test_insert_rejects_out_of_range() {
        let (mut tree, _) = tree_with(&["a"]);
        let root = tree.root();
        let c = tree.create(LayerNode::raster("c"));
        assert_eq!(
            tree.insert(root, 5, c),
            Err(SceneError::IndexOutOfRange { index: 5, count: 1 })
        );
        assert_eq!(tree.child_count(root), 1);
        assert_eq!(tree.parent(c), None);
        assert!(tree.take(root, 1).is_err());
    }

    #[test]
    fn test_insert_detaches_from_old_parent() {
        let (mut tree, ids) = tree_with(&["a", "b"]);
        let root = tree.root();
        let group = tree.create(LayerNode::group("g"));
        tree.insert(root, 0, group).unwrap();
        tree.insert(group, 0, ids[1]).unwrap();
        assert_eq!(tree.children(root), &[group, ids[0]]);
        assert_eq!(tree.children(group), &[ids[1]]);
        assert_eq!(tree.parent(ids[1]), Some(group));
    }

    #[test]
    fn test_insert_rejects_cycles_and_leaf_parents() {
        let mut tree = LayerTree::new();
        let root = tree.root();
        let outer = tree.create(LayerNode::group("outer"));
        let inner = tree.create(LayerNode::group("inner"));
        tree.insert(root, 0, outer).unwrap();
        tree.insert(outer, 0, inner).unwrap();
        assert_eq!(tree.insert(inner, 0, outer), Err(SceneError::Cycle(outer)));
        assert_eq!(tree.insert(outer, 0, outer), Err(SceneError::Cycle(outer)));

        let leaf = tree.create(LayerNode::raster("leaf"));
        let other = tree.create(LayerNode::raster("other"));
        assert_eq!(tree.insert(leaf, 0, other), Err(SceneError::NotAGroup(leaf)));
        assert_eq!(tree.insert(outer, 0, root), Err(SceneError::RootLayer));
    }

    #[test]
    fn test_destroy_makes_handles_stale() {
        let mut tree = LayerTree::new();
        let group = tree.create(LayerNode::group("g"));
        let child = tree.create(LayerNode::raster("c"));
        tree.insert(group, 0, child).unwrap();
        assert_eq!(tree.destroy_recursive(child), Err(SceneError::NotDetached(child)));
        tree.destroy_recursive(group).unwrap();
        assert!(!tree.is_alive(group));
        assert!(!tree.is_alive(child));

        // The slot is reused under a new generation.
        let reused = tree.create(LayerNode::raster("new"));
        assert_eq!(reused.index(), child.index());
        assert_ne!(reused, child);
        assert!(tree.node(child).is_none());
    }

    #[test]
    fn test_foreign_handles_are_rejected() {
        let (tree_a, ids) = tree_with(&["a"]);
        let (tree_b, _) = tree_with(&["b"]);
        assert!(tree_a.is_alive(ids[0]));
        assert!(!tree_b.is_alive(ids[0]));
        assert!(tree_b.node(ids[0]).is_none());
    }

    #[test]
    fn test_clone_recursive_is_independent() {
        let mut tree = LayerTree::new();
        let group = tree.create(LayerNode::group("g"));
        let mut surface = crate::tile::TileSurface::new();
        surface.set_pixel(0, 0, Rgba([1, 2, 3, 255]));
        let child = tree.create(LayerNode::raster_with_surface("paint", surface));
        tree.insert(group, 0, child).unwrap();

        let copy = tree.clone_recursive(group).unwrap();
        assert_ne!(copy, group);
        let copied_child = tree.child(copy, 0).unwrap();
        assert_ne!(copied_child, child);
        tree.node_mut(copied_child)
            .and_then(|n| n.surface_mut())
            .unwrap()
            .set_pixel(0, 0, Rgba([0, 0, 0, 0]));
        let original = tree.node(child).and_then(|n| n.surface()).unwrap();
        assert_eq!(original.pixel(0, 0), Rgba([1, 2, 3, 255]));

        let shallow = tree.clone_layer(group).unwrap();
        assert_eq!(tree.child_count(shallow), 0);
    }

    #[test]
    fn test_paths_round_trip() {
        let mut tree = LayerTree::new();
        let root = tree.root();
        let group = tree.create(LayerNode::group("g"));
        let a = tree.create(LayerNode::raster("a"));
        let b = tree.create(LayerNode::raster("b"));
        tree.insert(root, 0, group).unwrap();
        tree.insert(group, 0, a).unwrap();
        tree.insert(group, 1, b).unwrap();
        assert_eq!(tree.path_for_layer(b), Some(vec![0, 1]));
        assert_eq!(tree.layer_for_path(&[0, 1]), Some(b));
        assert_eq!(tree.layer_for_path(&[]), Some(root));
        assert_eq!(tree.layer_for_path(&[3]), None);
    }

    #[test]
    fn test_descendant_at_prefers_topmost() {
        let mut tree = LayerTree::new();
        let root = tree.root();
        let rect = IntRect::new(0, 0, 10, 10);
        let top = tree.create(LayerNode::solid("top", Rgba([255, 0, 0, 255]), rect));
        let bottom = tree.create(LayerNode::solid("bottom", Rgba([0, 255, 0, 255]), rect));
        let hidden = tree.create(
            LayerNode::solid("hidden", Rgba([0, 0, 255, 255]), rect).with_visible(false),
        );
        tree.insert(root, 0, hidden).unwrap();
        tree.insert(root, 1, top).unwrap();
        tree.insert(root, 2, bottom).unwrap();
        assert_eq!(tree.descendant_at(root, IntPoint::new(5, 5), 0), Some(top));
        assert_eq!(tree.descendant_at(root, IntPoint::new(50, 50), 0), None);
    }

    #[test]
    fn test_tile_keys_recursive_unions_descendants() {
        let mut tree = LayerTree::new();
        let group = tree.create(LayerNode::group("g"));
        let a = tree.create(LayerNode::solid("a", Rgba([1, 1, 1, 255]), IntRect::new(0, 0, 1, 1)));
        let far = IntRect::new(130, 0, 1, 1);
        let b = tree.create(LayerNode::solid("b", Rgba([1, 1, 1, 255]), far));
        tree.insert(group, 0, a).unwrap();
        tree.insert(group, 1, b).unwrap();
        assert_eq!(tree.tile_keys_recursive(group).len(), 2);
    }
}
