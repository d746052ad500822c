//! The transactional owner of a layer tree.
//!
//! Every mutation goes through [`LayerScene`], which validates the request,
//! builds undoable commands, tracks damaged tiles and notifies observers.
//! Direct tree mutation bypassing the scene breaks undo.

use std::collections::HashSet;
use std::fmt;

use serde::Serialize;

use crate::blend::BlendMode;
use crate::commands::{
    AddLayerCommand, Command, CommandGroup, CopyLayerCommand, EditLayerCommand, MergeLayersCommand,
    MoveLayerCommand, RemoveLayerCommand, SetPropertyCommand, UndoStack,
};
use crate::edit::LayerEdit;
use crate::error::{SceneError, SceneResult};
use crate::geometry::IntSize;
use crate::layer::{LayerKindTag, LayerNode, LayerProperty, PropertyRole};
use crate::naming::{unduplicated_name, NameResolver, ResolveMode};
use crate::render::LayerRenderer;
use crate::thumbnail;
use crate::tile::TileKeySet;
use crate::tree::{LayerId, LayerSnapshot, LayerTree};

/// A structural change recorded while commands run.
#[derive(Debug, Clone, PartialEq)]
pub enum SceneEvent {
    LayerInserted { parent: LayerId, index: usize },
    LayerRemoved { parent: LayerId, index: usize },
    LayerPropertyChanged { layer: LayerId, role: PropertyRole },
}

/// Receives scene notifications. Every method defaults to doing nothing.
pub trait SceneObserver {
    fn tiles_updated(&mut self, _keys: &TileKeySet) {}
    fn thumbnails_updated(&mut self) {}
    fn layer_inserted(&mut self, _parent: LayerId, _index: usize) {}
    fn layer_removed(&mut self, _parent: LayerId, _index: usize) {}
    fn layer_property_changed(&mut self, _layer: LayerId, _role: PropertyRole) {}
    fn current_changed(&mut self, _now: Option<LayerId>, _old: Option<LayerId>) {}
    fn selection_changed(&mut self, _selected: &[LayerId], _deselected: &[LayerId]) {}
    fn current_layer_property_changed(&mut self) {}
}

/// Everything commands operate on.
#[derive(Debug)]
pub struct SceneState {
    pub(crate) tree: LayerTree,
    pub(crate) renderer: LayerRenderer,
    pub(crate) document_size: IntSize,
    pending: TileKeySet,
    current: Option<LayerId>,
    selection: Vec<LayerId>,
    events: Vec<SceneEvent>,
}

impl SceneState {
    pub fn new(document_size: IntSize) -> Self {
        Self::with_tree(LayerTree::new(), document_size)
    }

    pub fn with_tree(tree: LayerTree, document_size: IntSize) -> Self {
        Self {
            tree,
            renderer: LayerRenderer::new(),
            document_size,
            pending: TileKeySet::new(),
            current: None,
            selection: Vec::new(),
            events: Vec::new(),
        }
    }

    pub fn tree(&self) -> &LayerTree {
        &self.tree
    }

    pub fn renderer(&self) -> &LayerRenderer {
        &self.renderer
    }

    pub fn document_size(&self) -> IntSize {
        self.document_size
    }

    /// Damage accumulated since the last flush.
    pub fn pending_keys(&self) -> &TileKeySet {
        &self.pending
    }

    /// Events not yet dispatched to observers.
    pub fn events(&self) -> &[SceneEvent] {
        &self.events
    }

    pub fn layer_for_path(&self, path: &[usize]) -> Option<LayerId> {
        self.tree.layer_for_path(path)
    }

    /// Root-relative path of an attached layer.
    pub fn path_for_layer(&self, layer: LayerId) -> Option<Vec<usize>> {
        if !self.tree.is_in_scene(layer) {
            return None;
        }
        self.tree.path_for_layer(layer)
    }

    pub(crate) fn insert_layer(&mut self, parent: LayerId, index: usize, layer: LayerId) -> bool {
        match self.tree.insert(parent, index, layer) {
            Ok(()) => {
                self.emit(SceneEvent::LayerInserted { parent, index });
                let keys = self.tree.tile_keys_recursive(layer);
                self.enqueue_tile_update(keys);
                true
            }
            Err(err) => {
                log::error!("insert of {layer:?} at {index} failed: {err}");
                false
            }
        }
    }

    pub(crate) fn take_layer(&mut self, parent: LayerId, index: usize) -> Option<LayerId> {
        match self.tree.take(parent, index) {
            Ok(layer) => {
                self.emit(SceneEvent::LayerRemoved { parent, index });
                let keys = self.tree.tile_keys_recursive(layer);
                self.enqueue_tile_update(keys);
                Some(layer)
            }
            Err(err) => {
                log::error!("take at {index} failed: {err}");
                None
            }
        }
    }

    /// Renames `layer`, returning the previous name.
    pub(crate) fn set_layer_name(&mut self, layer: LayerId, name: String) -> String {
        let Some(node) = self.tree.node_mut(layer) else {
            return name;
        };
        let old = std::mem::replace(&mut node.name, name);
        if old != node.name {
            self.emit(SceneEvent::LayerPropertyChanged {
                layer,
                role: PropertyRole::Name,
            });
        }
        old
    }

    pub(crate) fn enqueue_tile_update(&mut self, keys: TileKeySet) {
        self.pending.extend(keys);
    }

    pub(crate) fn emit(&mut self, event: SceneEvent) {
        self.events.push(event);
    }

    /// Frees `layer` if it is a detached subtree root.
    pub(crate) fn release_detached(&mut self, layer: LayerId) {
        if self.tree.is_alive(layer)
            && self.tree.parent(layer).is_none()
            && layer != self.tree.root()
        {
            log::debug!("releasing detached {layer:?}");
            let _ = self.tree.destroy_recursive(layer);
        }
    }
}

/// One row of the layer panel projection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LayerRow {
    pub path: Vec<usize>,
    pub depth: usize,
    pub name: String,
    pub kind: LayerKindTag,
    pub visible: bool,
    pub locked: bool,
    pub opacity: f64,
    pub blend_mode: BlendMode,
    pub current: bool,
    pub selected: bool,
}

/// The layer document: tree, undo history, damage and observers.
pub struct LayerScene {
    state: SceneState,
    undo_stack: UndoStack,
    observers: Vec<Box<dyn SceneObserver>>,
    thumbnail_sweep_armed: bool,
}

impl fmt::Debug for LayerScene {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LayerScene")
            .field("state", &self.state)
            .field("undo_stack", &self.undo_stack)
            .field("observers", &self.observers.len())
            .finish()
    }
}

impl LayerScene {
    pub fn new(document_size: IntSize) -> Self {
        Self::from_tree(LayerTree::new(), document_size)
    }

    /// Wraps an existing tree, refreshing every thumbnail and making the
    /// topmost layer current.
    pub fn from_tree(tree: LayerTree, document_size: IntSize) -> Self {
        let mut state = SceneState::with_tree(tree, document_size);
        let root = state.tree.root();
        for child in state.tree.children(root).to_vec() {
            thumbnail::update_thumbnail_recursive(
                &mut state.tree,
                &state.renderer,
                child,
                document_size,
            );
        }
        state.current = state.tree.child(root, 0);
        Self {
            state,
            undo_stack: UndoStack::new(),
            observers: Vec::new(),
            thumbnail_sweep_armed: false,
        }
    }

    pub fn add_observer(&mut self, observer: Box<dyn SceneObserver>) {
        self.observers.push(observer);
    }

    pub fn state(&self) -> &SceneState {
        &self.state
    }

    pub fn tree(&self) -> &LayerTree {
        &self.state.tree
    }

    /// Creates a detached layer that can later be passed to [`add_layers`](Self::add_layers).
    pub fn create_layer(&mut self, node: LayerNode) -> LayerId {
        self.state.tree.create(node)
    }

    /// Frees a detached layer that was never added.
    pub fn destroy_layer(&mut self, layer: LayerId) -> SceneResult<()> {
        self.state.tree.destroy_recursive(layer)
    }

    /// Materializes a subtree copy as detached layers owned by this scene.
    pub fn instantiate_layer(&mut self, snapshot: LayerSnapshot) -> LayerId {
        self.state.tree.instantiate(snapshot)
    }

    /// Owned copy of the subtree rooted at `layer`.
    pub fn snapshot_layer(&self, layer: LayerId) -> Option<LayerSnapshot> {
        self.state.tree.snapshot(layer)
    }

    pub fn root(&self) -> LayerId {
        self.state.tree.root()
    }

    pub fn renderer(&self) -> &LayerRenderer {
        &self.state.renderer
    }

    pub fn renderer_mut(&mut self) -> &mut LayerRenderer {
        &mut self.state.renderer
    }

    pub fn document_size(&self) -> IntSize {
        self.state.document_size
    }

    pub fn undo_stack(&self) -> &UndoStack {
        &self.undo_stack
    }

    // ── Validation ───────────────────────────────────────────────────

    /// Whether `layer` is alive, belongs to this scene and is reachable from the root.
    pub fn check_layer(&self, layer: LayerId) -> bool {
        self.state.tree.is_in_scene(layer)
    }

    fn check_target(&self, layer: LayerId) -> SceneResult<()> {
        if !self.check_layer(layer) {
            return Err(SceneError::InvalidLayer(layer));
        }
        if layer == self.root() {
            return Err(SceneError::RootLayer);
        }
        Ok(())
    }

    fn check_targets(&self, layers: &[LayerId]) -> SceneResult<()> {
        let mut seen = HashSet::new();
        for &layer in layers {
            self.check_target(layer)?;
            if !seen.insert(layer) {
                return Err(SceneError::Duplicate(layer));
            }
        }
        Ok(())
    }

    fn check_parent(&self, parent: LayerId, index: Option<usize>) -> SceneResult<()> {
        if !self.check_layer(parent) {
            return Err(SceneError::InvalidParent(parent));
        }
        if !self.state.tree.node(parent).is_some_and(|n| n.can_have_children()) {
            return Err(SceneError::NotAGroup(parent));
        }
        if let Some(index) = index {
            let count = self.state.tree.child_count(parent);
            if index > count {
                return Err(SceneError::IndexOutOfRange { index, count });
            }
        }
        Ok(())
    }

    fn rejected<T>(operation: &str, err: SceneError) -> SceneResult<T> {
        log::warn!("{operation}: {err}");
        Err(err)
    }

    // ── Structural operations ────────────────────────────────────────

    /// Inserts detached layers under `parent` starting at `index`, as one undo step.
    pub fn add_layers(
        &mut self,
        layers: &[LayerId],
        parent: LayerId,
        index: usize,
        description: &str,
    ) -> SceneResult<()> {
        if let Err(err) = self.check_parent(parent, Some(index)) {
            return Self::rejected("add_layers", err);
        }
        let mut seen = HashSet::new();
        for &layer in layers {
            let err = if !self.state.tree.is_alive(layer) {
                Some(SceneError::InvalidLayer(layer))
            } else if layer == self.root() {
                Some(SceneError::RootLayer)
            } else if self.state.tree.parent(layer).is_some() {
                Some(SceneError::NotDetached(layer))
            } else if !seen.insert(layer) {
                Some(SceneError::Duplicate(layer))
            } else {
                None
            };
            if let Some(err) = err {
                return Self::rejected("add_layers", err);
            }
        }
        if layers.is_empty() {
            return Ok(());
        }

        let parent_path = self.state.path_for_layer(parent).unwrap_or_default();
        let mut resolver = NameResolver::new(&self.state.tree, parent, ResolveMode::Add);
        let mut group = CommandGroup::new(description);
        for (i, &layer) in layers.iter().enumerate() {
            let state = &mut self.state;
            thumbnail::update_thumbnail_recursive(
                &mut state.tree,
                &state.renderer,
                layer,
                state.document_size,
            );
            let name = resolver.resolve(&state.tree, layer);
            if let Some(node) = state.tree.node_mut(layer) {
                node.name = name;
            }
            group.push(Box::new(AddLayerCommand::new(layer, parent_path.clone(), index + i)));
        }
        self.push_command(Box::new(group));
        Ok(())
    }

    /// Removes layers (and their subtrees) as one undo step.
    ///
    /// Layers whose ancestor is also listed are removed with that ancestor.
    pub fn remove_layers(&mut self, layers: &[LayerId], description: &str) -> SceneResult<()> {
        if let Err(err) = self.check_targets(layers) {
            return Self::rejected("remove_layers", err);
        }
        let tree = &self.state.tree;
        let roots: Vec<LayerId> = layers
            .iter()
            .copied()
            .filter(|&layer| !layers.iter().any(|&other| tree.is_ancestor_of(other, layer)))
            .collect();
        if roots.is_empty() {
            return Ok(());
        }

        let text = if description.is_empty() { "Remove Layers" } else { description };
        let mut group = CommandGroup::new(text);
        for layer in roots {
            group.push(Box::new(RemoveLayerCommand::new(layer)));
        }
        self.push_command(Box::new(group));
        Ok(())
    }

    /// Moves layers under `parent` at `index`, as one undo step.
    ///
    /// `index` is an insertion point in the parent as it is before the move.
    pub fn move_layers(
        &mut self,
        layers: &[LayerId],
        parent: LayerId,
        index: usize,
    ) -> SceneResult<()> {
        let checked = self
            .check_targets(layers)
            .and_then(|()| self.check_parent(parent, Some(index)));
        if let Err(err) = checked {
            return Self::rejected("move_layers", err);
        }
        for &layer in layers {
            if layer == parent || self.state.tree.is_ancestor_of(layer, parent) {
                return Self::rejected("move_layers", SceneError::Cycle(layer));
            }
        }
        if layers.is_empty() {
            return Ok(());
        }

        let tree = &self.state.tree;
        let mut resolver = NameResolver::new(tree, parent, ResolveMode::Move);
        let mut group = CommandGroup::new("Move Layers");
        let mut new_index = index;
        for &layer in layers {
            let name = resolver.resolve(tree, layer);
            group.push(Box::new(MoveLayerCommand::new(layer, parent, new_index, name)));
            let same_parent = tree.parent(layer) == Some(parent);
            if same_parent && tree.index_of(layer).is_some_and(|i| i < index) {
                new_index -= 1;
            }
            new_index += 1;
        }
        self.push_command(Box::new(group));
        Ok(())
    }

    /// Inserts recursive copies of layers under `parent` at `index`, as one undo step.
    pub fn copy_layers(
        &mut self,
        layers: &[LayerId],
        parent: LayerId,
        index: usize,
    ) -> SceneResult<()> {
        let checked = self
            .check_targets(layers)
            .and_then(|()| self.check_parent(parent, Some(index)));
        if let Err(err) = checked {
            return Self::rejected("copy_layers", err);
        }
        if layers.is_empty() {
            return Ok(());
        }

        let tree = &self.state.tree;
        let mut resolver = NameResolver::new(tree, parent, ResolveMode::Add);
        let mut group = CommandGroup::new("Copy Layers");
        for (i, &layer) in layers.iter().enumerate() {
            let name = resolver.resolve(tree, layer);
            group.push(Box::new(CopyLayerCommand::new(layer, parent, index + i, name)));
        }
        self.push_command(Box::new(group));
        Ok(())
    }

    /// Flattens `count` siblings starting at `index` into one raster layer.
    ///
    /// Fewer than two layers is not an error; nothing happens.
    pub fn merge_layers(&mut self, parent: LayerId, index: usize, count: usize) -> SceneResult<()> {
        if let Err(err) = self.check_parent(parent, None) {
            return Self::rejected("merge_layers", err);
        }
        if count < 2 {
            return Ok(());
        }
        let child_count = self.state.tree.child_count(parent);
        let Some(end) = index.checked_add(count).filter(|&end| end <= child_count) else {
            return Self::rejected(
                "merge_layers",
                SceneError::IndexOutOfRange {
                    index: index.max(child_count),
                    count: child_count,
                },
            );
        };

        let mut siblings = self.state.tree.child_names(parent);
        let merged: Vec<String> = siblings.drain(index..end).collect();
        let name = unduplicated_name(&siblings, &merged.join(" + "));
        let parent_path = self.state.path_for_layer(parent).unwrap_or_default();
        self.push_command(Box::new(MergeLayersCommand::new(parent_path, index, count, name)));
        Ok(())
    }

    /// Applies a content edit to `layer` as one undo step.
    pub fn edit_layer(
        &mut self,
        layer: LayerId,
        edit: Box<dyn LayerEdit>,
        description: &str,
    ) -> SceneResult<()> {
        if let Err(err) = self.check_target(layer) {
            return Self::rejected("edit_layer", err);
        }
        if self.state.tree.node(layer).is_some_and(|n| n.locked) {
            log::debug!("edit_layer: {layer:?} is locked");
            return Err(SceneError::Locked { layer, role: None });
        }
        let path = self.state.path_for_layer(layer).unwrap_or_default();
        self.push_command(Box::new(EditLayerCommand::new(path, edit, description.to_string())));
        Ok(())
    }

    /// Changes one property of `layer` as one undo step.
    ///
    /// Locked layers only accept changes to the lock itself. Setting the
    /// current value records nothing.
    pub fn set_layer_property(
        &mut self,
        layer: LayerId,
        value: LayerProperty,
        description: &str,
    ) -> SceneResult<()> {
        if let Err(err) = self.check_target(layer) {
            return Self::rejected("set_layer_property", err);
        }
        let role = value.role();
        let tree = &self.state.tree;
        let Some(node) = tree.node(layer) else {
            return Self::rejected("set_layer_property", SceneError::InvalidLayer(layer));
        };
        if node.locked && role != PropertyRole::Locked {
            log::debug!("set_layer_property: {layer:?} is locked");
            return Err(SceneError::Locked { layer, role: Some(role) });
        }

        let value = match value {
            LayerProperty::Opacity(opacity) if !opacity.is_finite() => {
                return Self::rejected("set_layer_property", SceneError::InvalidOpacity(opacity));
            }
            LayerProperty::Opacity(opacity) => LayerProperty::Opacity(opacity.clamp(0.0, 1.0)),
            LayerProperty::Name(name) if name != node.name => {
                let siblings: Vec<String> = tree
                    .parent(layer)
                    .map(|p| tree.children(p))
                    .unwrap_or_default()
                    .iter()
                    .filter(|&&c| c != layer)
                    .filter_map(|&c| tree.node(c))
                    .map(|n| n.name.clone())
                    .collect();
                LayerProperty::Name(unduplicated_name(&siblings, &name))
            }
            other => other,
        };
        if node.property(role) == value {
            return Ok(());
        }

        let text = if description.is_empty() {
            match role {
                PropertyRole::Name => "Rename Layer",
                PropertyRole::Visible => "Change Visibility",
                PropertyRole::Locked => "Change Lock",
                PropertyRole::Opacity => "Change Opacity",
                PropertyRole::BlendMode => "Change Blend Mode",
            }
        } else {
            description
        };
        let path = self.state.path_for_layer(layer).unwrap_or_default();
        self.push_command(Box::new(SetPropertyCommand::new(path, value, text.to_string())));
        Ok(())
    }

    // ── Undo / redo ──────────────────────────────────────────────────

    pub fn undo(&mut self) -> bool {
        let done = self.undo_stack.undo(&mut self.state);
        self.finish();
        done
    }

    pub fn redo(&mut self) -> bool {
        let done = self.undo_stack.redo(&mut self.state);
        self.finish();
        done
    }

    pub fn can_undo(&self) -> bool {
        self.undo_stack.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.undo_stack.can_redo()
    }

    pub fn undo_text(&self) -> Option<&str> {
        self.undo_stack.undo_text()
    }

    pub fn redo_text(&self) -> Option<&str> {
        self.undo_stack.redo_text()
    }

    pub fn set_clean(&mut self) {
        self.undo_stack.set_clean();
    }

    pub fn is_clean(&self) -> bool {
        self.undo_stack.is_clean()
    }

    /// Drops the undo history, freeing layers only the history referenced.
    pub fn clear_history(&mut self) {
        self.undo_stack.clear(&mut self.state);
    }

    // ── Damage and thumbnails ────────────────────────────────────────

    /// Damage accumulated since the last flush.
    pub fn pending_keys(&self) -> &TileKeySet {
        self.state.pending_keys()
    }

    /// Publishes and clears the pending damage, and arms the thumbnail sweep.
    pub fn flush(&mut self) -> TileKeySet {
        let keys = std::mem::take(&mut self.state.pending);
        for observer in &mut self.observers {
            observer.tiles_updated(&keys);
        }
        self.thumbnail_sweep_armed = true;
        keys
    }

    /// Runs the armed thumbnail sweep. Returns false when nothing was armed.
    pub fn flush_thumbnails(&mut self) -> bool {
        if !self.thumbnail_sweep_armed {
            return false;
        }
        self.update_dirty_thumbnails();
        true
    }

    /// Regenerates every dirty thumbnail now.
    pub fn update_dirty_thumbnails(&mut self) {
        self.thumbnail_sweep_armed = false;
        let state = &mut self.state;
        let root = state.tree.root();
        let updated = thumbnail::update_dirty_thumbnails(
            &mut state.tree,
            &state.renderer,
            root,
            state.document_size,
        );
        log::debug!("updated {updated} thumbnails");
        for observer in &mut self.observers {
            observer.thumbnails_updated();
        }
    }

    pub fn abort_thumbnail_update(&mut self) {
        self.thumbnail_sweep_armed = false;
    }

    pub fn is_thumbnail_update_armed(&self) -> bool {
        self.thumbnail_sweep_armed
    }

    // ── Current layer and selection ──────────────────────────────────

    pub fn current(&self) -> Option<LayerId> {
        self.state.current.filter(|&c| self.check_target(c).is_ok())
    }

    pub fn selection(&self) -> Vec<LayerId> {
        self.state
            .selection
            .iter()
            .copied()
            .filter(|&l| self.check_target(l).is_ok())
            .collect()
    }

    pub fn set_current(&mut self, layer: Option<LayerId>) -> SceneResult<()> {
        if let Some(layer) = layer {
            if let Err(err) = self.check_target(layer) {
                return Self::rejected("set_current", err);
            }
        }
        let old = self.current();
        self.state.current = layer;
        if old != layer {
            for observer in &mut self.observers {
                observer.current_changed(layer, old);
            }
        }
        Ok(())
    }

    pub fn set_selection(&mut self, layers: &[LayerId]) -> SceneResult<()> {
        if let Err(err) = self.check_targets(layers) {
            return Self::rejected("set_selection", err);
        }
        let old = self.selection();
        self.state.selection = layers.to_vec();
        self.notify_selection(&old);
        Ok(())
    }

    fn notify_selection(&mut self, old: &[LayerId]) {
        let now = self.selection();
        let selected: Vec<_> = now.iter().copied().filter(|l| !old.contains(l)).collect();
        let deselected: Vec<_> = old.iter().copied().filter(|l| !now.contains(l)).collect();
        if selected.is_empty() && deselected.is_empty() {
            return;
        }
        for observer in &mut self.observers {
            observer.selection_changed(&selected, &deselected);
        }
    }

    /// Maps view-model paths back to layers, skipping paths that no longer resolve.
    pub fn layers_for_paths(&self, paths: &[Vec<usize>]) -> Vec<LayerId> {
        paths
            .iter()
            .filter(|p| !p.is_empty())
            .filter_map(|p| self.state.layer_for_path(p))
            .collect()
    }

    // ── Layer panel conveniences ─────────────────────────────────────

    /// `(parent, start, count)` when `layers` are contiguous siblings.
    pub fn layer_range(&self, layers: &[LayerId]) -> Option<(LayerId, usize, usize)> {
        let tree = &self.state.tree;
        let parent = tree.parent(*layers.first()?)?;
        let mut indices = Vec::with_capacity(layers.len());
        for &layer in layers {
            if tree.parent(layer) != Some(parent) {
                return None;
            }
            indices.push(tree.index_of(layer)?);
        }
        indices.sort_unstable();
        indices.dedup();
        let (min, max) = (indices[0], indices[indices.len() - 1]);
        let count = max - min + 1;
        (indices.len() == count).then_some((parent, min, count))
    }

    /// Adds layers above the current layer (or at the bottom of the root
    /// without one) and makes the first of them current.
    pub fn add_layers_at_current(
        &mut self,
        layers: &[LayerId],
        description: &str,
    ) -> SceneResult<()> {
        let root = self.root();
        let (parent, index) = match self.current() {
            Some(current) => (
                self.state.tree.parent(current).unwrap_or(root),
                self.state.tree.index_of(current).unwrap_or(0),
            ),
            None => (root, self.state.tree.child_count(root)),
        };
        self.add_layers(layers, parent, index, description)?;
        if layers.is_empty() {
            return Ok(());
        }
        let first = self.state.tree.child(parent, index);
        self.set_current(first)
    }

    fn add_new_layer(&mut self, node: LayerNode, description: &str) -> SceneResult<LayerId> {
        let layer = self.create_layer(node);
        if let Err(err) = self.add_layers_at_current(&[layer], description) {
            let _ = self.state.tree.destroy_recursive(layer);
            return Err(err);
        }
        Ok(layer)
    }

    pub fn new_raster_layer(&mut self) -> SceneResult<LayerId> {
        self.add_new_layer(LayerNode::raster("New Layer"), "Add Layer")
    }

    pub fn new_group_layer(&mut self) -> SceneResult<LayerId> {
        self.add_new_layer(LayerNode::group("New Group"), "Add Group")
    }

    pub fn remove_selection(&mut self) -> SceneResult<()> {
        let selection = self.selection();
        self.remove_layers(&selection, "")
    }

    /// Merges the selection when it is a contiguous run of two or more siblings.
    pub fn merge_selection(&mut self) -> SceneResult<()> {
        let Some((parent, start, count)) = self.layer_range(&self.selection()) else {
            return Ok(());
        };
        if count < 2 {
            return Ok(());
        }
        self.merge_layers(parent, start, count)?;
        let merged = self.state.tree.child(parent, start);
        self.set_current(merged)?;
        self.set_selection(&merged.into_iter().collect::<Vec<_>>())
    }

    /// Depth-first projection of the tree for a layer panel.
    pub fn rows(&self) -> Vec<LayerRow> {
        let current = self.current();
        let selection = self.selection();
        let mut rows = Vec::new();
        self.collect_rows(self.root(), &mut Vec::new(), current, &selection, &mut rows);
        rows
    }

    fn collect_rows(
        &self,
        parent: LayerId,
        path: &mut Vec<usize>,
        current: Option<LayerId>,
        selection: &[LayerId],
        rows: &mut Vec<LayerRow>,
    ) {
        for (i, &child) in self.state.tree.children(parent).iter().enumerate() {
            let Some(node) = self.state.tree.node(child) else {
                continue;
            };
            path.push(i);
            rows.push(LayerRow {
                path: path.clone(),
                depth: path.len() - 1,
                name: node.name.clone(),
                kind: node.kind.tag(),
                visible: node.visible,
                locked: node.locked,
                opacity: node.opacity,
                blend_mode: node.blend_mode,
                current: current == Some(child),
                selected: selection.contains(&child),
            });
            self.collect_rows(child, path, current, selection, rows);
            path.pop();
        }
    }

    pub fn rows_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.rows())
    }

    // ── Internals ────────────────────────────────────────────────────

    fn push_command(&mut self, command: Box<dyn Command>) {
        self.undo_stack.push(command, &mut self.state);
        self.finish();
    }

    /// Dispatches queued events and drops current/selection entries that left the scene.
    fn finish(&mut self) {
        let events = std::mem::take(&mut self.state.events);
        let current = self.current();
        for event in &events {
            for observer in &mut self.observers {
                match *event {
                    SceneEvent::LayerInserted { parent, index } => {
                        observer.layer_inserted(parent, index)
                    }
                    SceneEvent::LayerRemoved { parent, index } => {
                        observer.layer_removed(parent, index)
                    }
                    SceneEvent::LayerPropertyChanged { layer, role } => {
                        observer.layer_property_changed(layer, role);
                        if Some(layer) == current {
                            observer.current_layer_property_changed();
                        }
                    }
                }
            }
        }

        if self.state.current.is_some() && current.is_none() {
            let old = self.state.current.take();
            for observer in &mut self.observers {
                observer.current_changed(None, old);
            }
        }
        let stored = self.state.selection.clone();
        let kept = self.selection();
        if kept.len() != stored.len() {
            self.state.selection = kept;
            let deselected: Vec<_> = stored
                .into_iter()
                .filter(|l| !self.state.selection.contains(l))
                .collect();
            for observer in &mut self.observers {
                observer.selection_changed(&[], &deselected);
            }
        }
    }
}
