use crate::edit::LayerEdit;
use crate::layer::{LayerNode, LayerProperty};
use crate::scene::{SceneEvent, SceneState};
use crate::thumbnail::update_thumbnail;
use crate::tile::TileKeySet;
use crate::tree::LayerId;

/// A reversible command for the undo/redo system.
///
/// Commands locate their targets through root-relative index paths resolved at
/// execution time. Once pushed a command cannot fail; a path that no longer
/// resolves is logged and the step is skipped.
pub trait Command: std::fmt::Debug {
    /// Apply the change (first execution and every redo).
    fn execute(&mut self, state: &mut SceneState);
    /// Reverse the change.
    fn undo(&mut self, state: &mut SceneState);
    /// Human-readable description for the undo/redo history.
    fn description(&self) -> &str;
    /// Called once when the command is dropped from the history, so it can free
    /// any detached layers it still owns.
    fn release(&mut self, _state: &mut SceneState) {}
}

// ══════════════════════════════════════════════════════════════════════
// Concrete Commands
// ══════════════════════════════════════════════════════════════════════

fn resolve(state: &SceneState, path: &[usize], what: &str) -> Option<LayerId> {
    let layer = state.layer_for_path(path);
    if layer.is_none() {
        log::error!("{what}: path {path:?} no longer resolves");
    }
    layer
}

fn split_path(mut path: Vec<usize>) -> Option<(Vec<usize>, usize)> {
    let index = path.pop()?;
    Some((path, index))
}

/// Insert a detached layer under a parent.
#[derive(Debug)]
pub struct AddLayerCommand {
    layer: LayerId,
    parent_path: Vec<usize>,
    index: usize,
}

impl AddLayerCommand {
    pub fn new(layer: LayerId, parent_path: Vec<usize>, index: usize) -> Self {
        Self {
            layer,
            parent_path,
            index,
        }
    }
}

impl Command for AddLayerCommand {
    fn execute(&mut self, state: &mut SceneState) {
        if let Some(parent) = resolve(state, &self.parent_path, "add") {
            state.insert_layer(parent, self.index, self.layer);
        }
    }

    fn undo(&mut self, state: &mut SceneState) {
        if let Some(parent) = resolve(state, &self.parent_path, "add") {
            if let Some(layer) = state.take_layer(parent, self.index) {
                self.layer = layer;
            }
        }
    }

    fn description(&self) -> &str {
        "Add Layer"
    }

    fn release(&mut self, state: &mut SceneState) {
        state.release_detached(self.layer);
    }
}

/// Remove a layer, remembering where it lived.
#[derive(Debug)]
pub struct RemoveLayerCommand {
    target: LayerId,
    location: Option<(Vec<usize>, usize)>,
    removed: Option<LayerId>,
}

impl RemoveLayerCommand {
    pub fn new(target: LayerId) -> Self {
        Self {
            target,
            location: None,
            removed: None,
        }
    }
}

impl Command for RemoveLayerCommand {
    fn execute(&mut self, state: &mut SceneState) {
        if self.location.is_none() {
            // Earlier removals in the same batch may have shifted the target.
            self.location = state.path_for_layer(self.target).and_then(split_path);
        }
        let Some((parent_path, index)) = self.location.clone() else {
            log::error!("remove: {:?} is not attached", self.target);
            return;
        };
        if let Some(parent) = resolve(state, &parent_path, "remove") {
            self.removed = state.take_layer(parent, index);
        }
    }

    fn undo(&mut self, state: &mut SceneState) {
        let (Some((parent_path, index)), Some(layer)) =
            (self.location.clone(), self.removed.take())
        else {
            return;
        };
        if let Some(parent) = resolve(state, &parent_path, "remove") {
            state.insert_layer(parent, index, layer);
        }
    }

    fn description(&self) -> &str {
        "Remove Layer"
    }

    fn release(&mut self, state: &mut SceneState) {
        if let Some(layer) = self.removed.take() {
            state.release_detached(layer);
        }
    }
}

/// Move a layer to another position, renaming it on the way.
///
/// Execution swaps the stored location and name with the current ones, so
/// undo and redo are the same operation.
#[derive(Debug)]
pub struct MoveLayerCommand {
    layer: LayerId,
    parent: LayerId,
    paths: Option<(Vec<usize>, Vec<usize>)>,
    index: usize,
    name: String,
}

impl MoveLayerCommand {
    pub fn new(layer: LayerId, parent: LayerId, index: usize, name: String) -> Self {
        Self {
            layer,
            parent,
            paths: None,
            index,
            name,
        }
    }

    fn apply(&mut self, state: &mut SceneState) {
        let Some((layer_path, parent_path)) = self.paths.clone() else {
            return;
        };
        log::debug!("move {layer_path:?} -> {parent_path:?}[{}]", self.index);

        let Some(layer) = resolve(state, &layer_path, "move") else {
            return;
        };
        let Some(parent) = resolve(state, &parent_path, "move") else {
            return;
        };
        let (Some(old_parent), Some(mut old_index)) =
            (state.tree.parent(layer), state.tree.index_of(layer))
        else {
            log::error!("move: {layer:?} is not attached");
            return;
        };

        let mut index = self.index;
        if state.take_layer(old_parent, old_index).is_none() {
            return;
        }
        if parent == old_parent {
            if index > old_index {
                index -= 1;
            } else if old_index > index {
                old_index += 1;
            }
        }
        if !state.insert_layer(parent, index, layer) {
            // Put it back where it came from.
            let restore = if parent == old_parent && old_index > index {
                old_index - 1
            } else {
                old_index
            };
            state.insert_layer(old_parent, restore, layer);
            return;
        }

        let old_name = state.set_layer_name(layer, std::mem::take(&mut self.name));

        self.index = old_index;
        self.name = old_name;
        match (state.path_for_layer(layer), state.path_for_layer(old_parent)) {
            (Some(layer_path), Some(parent_path)) => self.paths = Some((layer_path, parent_path)),
            _ => log::error!("move: lost track of {layer:?}"),
        }
    }
}

impl Command for MoveLayerCommand {
    fn execute(&mut self, state: &mut SceneState) {
        if self.paths.is_none() {
            match (state.path_for_layer(self.layer), state.path_for_layer(self.parent)) {
                (Some(layer_path), Some(parent_path)) => {
                    self.paths = Some((layer_path, parent_path))
                }
                _ => {
                    log::error!("move: {:?} or {:?} is not attached", self.layer, self.parent);
                    return;
                }
            }
        }
        self.apply(state);
    }

    fn undo(&mut self, state: &mut SceneState) {
        self.apply(state);
    }

    fn description(&self) -> &str {
        "Move Layer"
    }
}

/// Insert a recursive copy of a layer.
///
/// The copy is made on first execution and reused on every redo.
#[derive(Debug)]
pub struct CopyLayerCommand {
    source: LayerId,
    parent: LayerId,
    paths: Option<(Vec<usize>, Vec<usize>)>,
    index: usize,
    name: String,
    copy: Option<LayerId>,
}

impl CopyLayerCommand {
    pub fn new(source: LayerId, parent: LayerId, index: usize, name: String) -> Self {
        Self {
            source,
            parent,
            paths: None,
            index,
            name,
            copy: None,
        }
    }
}

impl Command for CopyLayerCommand {
    fn execute(&mut self, state: &mut SceneState) {
        if self.paths.is_none() {
            match (state.path_for_layer(self.source), state.path_for_layer(self.parent)) {
                (Some(source_path), Some(parent_path)) => {
                    self.paths = Some((source_path, parent_path))
                }
                _ => {
                    log::error!("copy: {:?} or {:?} is not attached", self.source, self.parent);
                    return;
                }
            }
        }
        let Some((source_path, parent_path)) = self.paths.clone() else {
            return;
        };
        let Some(parent) = resolve(state, &parent_path, "copy") else {
            return;
        };
        let copy = match self.copy {
            Some(copy) => copy,
            None => {
                let Some(source) = resolve(state, &source_path, "copy") else {
                    return;
                };
                let Some(copy) = state.tree.clone_recursive(source) else {
                    return;
                };
                if let Some(node) = state.tree.node_mut(copy) {
                    node.name = self.name.clone();
                }
                self.copy = Some(copy);
                copy
            }
        };
        state.insert_layer(parent, self.index, copy);
    }

    fn undo(&mut self, state: &mut SceneState) {
        let Some((_, parent_path)) = self.paths.clone() else {
            return;
        };
        if let Some(parent) = resolve(state, &parent_path, "copy") {
            state.take_layer(parent, self.index);
        }
    }

    fn description(&self) -> &str {
        "Copy Layer"
    }

    fn release(&mut self, state: &mut SceneState) {
        if let Some(copy) = self.copy.take() {
            state.release_detached(copy);
        }
    }
}

/// Flatten `count` siblings starting at `index` into one raster layer.
#[derive(Debug)]
pub struct MergeLayersCommand {
    parent_path: Vec<usize>,
    index: usize,
    count: usize,
    name: String,
    originals: Vec<LayerId>,
    merged: Option<LayerId>,
}

impl MergeLayersCommand {
    pub fn new(parent_path: Vec<usize>, index: usize, count: usize, name: String) -> Self {
        Self {
            parent_path,
            index,
            count,
            name,
            originals: Vec::new(),
            merged: None,
        }
    }
}

impl Command for MergeLayersCommand {
    fn execute(&mut self, state: &mut SceneState) {
        let Some(parent) = resolve(state, &self.parent_path, "merge") else {
            return;
        };
        self.originals = (0..self.count)
            .filter_map(|_| state.take_layer(parent, self.index))
            .collect();

        let merged = match self.merged {
            Some(merged) => merged,
            None => {
                let surface = state
                    .renderer
                    .render(&state.tree, &self.originals, &TileKeySet::new());
                let merged = state.tree.create(LayerNode::raster_with_surface(&self.name, surface));
                update_thumbnail(&mut state.tree, &state.renderer, merged, state.document_size);
                self.merged = Some(merged);
                merged
            }
        };
        state.insert_layer(parent, self.index, merged);
    }

    fn undo(&mut self, state: &mut SceneState) {
        let Some(parent) = resolve(state, &self.parent_path, "merge") else {
            return;
        };
        state.take_layer(parent, self.index);
        for (i, &layer) in self.originals.iter().enumerate() {
            state.insert_layer(parent, self.index + i, layer);
        }
    }

    fn description(&self) -> &str {
        "Merge Layers"
    }

    fn release(&mut self, state: &mut SceneState) {
        for layer in self.originals.drain(..) {
            state.release_detached(layer);
        }
        if let Some(merged) = self.merged.take() {
            state.release_detached(merged);
        }
    }
}

/// Apply a [`LayerEdit`] to one layer's content.
#[derive(Debug)]
pub struct EditLayerCommand {
    path: Vec<usize>,
    edit: Box<dyn LayerEdit>,
    text: String,
}

impl EditLayerCommand {
    pub fn new(path: Vec<usize>, edit: Box<dyn LayerEdit>, text: String) -> Self {
        Self { path, edit, text }
    }

    fn apply(&mut self, state: &mut SceneState, redo: bool) {
        let Some(layer) = resolve(state, &self.path, "edit") else {
            return;
        };
        if let Some(node) = state.tree.node_mut(layer) {
            if redo {
                self.edit.redo(node);
            } else {
                self.edit.undo(node);
            }
            node.set_thumbnail_dirty(true);
        }
        state.enqueue_tile_update(self.edit.modified_keys());
    }
}

impl Command for EditLayerCommand {
    fn execute(&mut self, state: &mut SceneState) {
        self.apply(state, true);
    }

    fn undo(&mut self, state: &mut SceneState) {
        self.apply(state, false);
    }

    fn description(&self) -> &str {
        &self.text
    }
}

/// Swap one property value of a layer.
#[derive(Debug)]
pub struct SetPropertyCommand {
    path: Vec<usize>,
    value: LayerProperty,
    text: String,
}

impl SetPropertyCommand {
    pub fn new(path: Vec<usize>, value: LayerProperty, text: String) -> Self {
        Self { path, value, text }
    }

    fn change(&mut self, state: &mut SceneState) {
        let Some(layer) = resolve(state, &self.path, "property") else {
            return;
        };
        let role = self.value.role();
        if role.affects_pixels() {
            state.enqueue_tile_update(state.tree.tile_keys_recursive(layer));
        }
        if let Some(node) = state.tree.node_mut(layer) {
            self.value = node.set_property(self.value.clone());
        }
        if role.affects_pixels() {
            state.enqueue_tile_update(state.tree.tile_keys_recursive(layer));
        }
        state.emit(SceneEvent::LayerPropertyChanged { layer, role });
    }
}

impl Command for SetPropertyCommand {
    fn execute(&mut self, state: &mut SceneState) {
        self.change(state);
    }

    fn undo(&mut self, state: &mut SceneState) {
        self.change(state);
    }

    fn description(&self) -> &str {
        &self.text
    }
}

/// Several commands applied as one undo step.
#[derive(Debug)]
pub struct CommandGroup {
    text: String,
    commands: Vec<Box<dyn Command>>,
}

impl CommandGroup {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            commands: Vec::new(),
        }
    }

    pub fn push(&mut self, command: Box<dyn Command>) {
        self.commands.push(command);
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

impl Command for CommandGroup {
    fn execute(&mut self, state: &mut SceneState) {
        for command in &mut self.commands {
            command.execute(state);
        }
    }

    fn undo(&mut self, state: &mut SceneState) {
        for command in self.commands.iter_mut().rev() {
            command.undo(state);
        }
    }

    fn description(&self) -> &str {
        &self.text
    }

    fn release(&mut self, state: &mut SceneState) {
        for command in &mut self.commands {
            command.release(state);
        }
    }
}

/// Manages the undo/redo history.
///
/// Commands before `index` are applied; the rest form the redo tail.
#[derive(Debug)]
pub struct UndoStack {
    commands: Vec<Box<dyn Command>>,
    index: usize,
    clean_index: Option<usize>,
}

impl Default for UndoStack {
    fn default() -> Self {
        Self::new()
    }
}

impl UndoStack {
    pub fn new() -> Self {
        Self {
            commands: Vec::new(),
            index: 0,
            clean_index: Some(0),
        }
    }

    /// Executes `command` and records it. Pushing discards the redo tail.
    pub fn push(&mut self, mut command: Box<dyn Command>, state: &mut SceneState) {
        log::debug!("pushing command {:?}", command.description());
        command.execute(state);
        for mut discarded in self.commands.drain(self.index..) {
            discarded.release(state);
        }
        if self.clean_index.is_some_and(|clean| clean > self.index) {
            self.clean_index = None;
        }
        self.commands.push(command);
        self.index += 1;
    }

    pub fn undo(&mut self, state: &mut SceneState) -> bool {
        if self.index == 0 {
            return false;
        }
        self.index -= 1;
        let command = &mut self.commands[self.index];
        log::debug!("undo {:?}", command.description());
        command.undo(state);
        true
    }

    pub fn redo(&mut self, state: &mut SceneState) -> bool {
        let Some(command) = self.commands.get_mut(self.index) else {
            return false;
        };
        log::debug!("redo {:?}", command.description());
        command.execute(state);
        self.index += 1;
        true
    }

    pub fn can_undo(&self) -> bool {
        self.index > 0
    }

    pub fn can_redo(&self) -> bool {
        self.index < self.commands.len()
    }

    pub fn undo_text(&self) -> Option<&str> {
        self.index
            .checked_sub(1)
            .and_then(|i| self.commands.get(i))
            .map(|c| c.description())
    }

    pub fn redo_text(&self) -> Option<&str> {
        self.commands.get(self.index).map(|c| c.description())
    }

    pub fn count(&self) -> usize {
        self.commands.len()
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn set_clean(&mut self) {
        self.clean_index = Some(self.index);
    }

    pub fn is_clean(&self) -> bool {
        self.clean_index == Some(self.index)
    }

    /// Drops the whole history, releasing every command.
    pub fn clear(&mut self, state: &mut SceneState) {
        for mut command in self.commands.drain(..) {
            command.release(state);
        }
        self.index = 0;
        self.clean_index = Some(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::IntSize;
    use crate::layer::PropertyRole;

    fn state_with(names: &[&str]) -> (SceneState, Vec<LayerId>) {
        let mut state = SceneState::new(IntSize::new(64, 64));
        let root = state.tree.root();
        let ids = names
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let id = state.tree.create(LayerNode::raster(name));
                state.tree.insert(root, i, id).unwrap();
                id
            })
            .collect();
        (state, ids)
    }

    fn names(state: &SceneState) -> Vec<String> {
        state.tree.child_names(state.tree.root())
    }

    #[test]
    fn test_push_undo_redo() {
        let (mut state, ids) = state_with(&["a", "b"]);
        let mut stack = UndoStack::new();
        stack.push(Box::new(RemoveLayerCommand::new(ids[0])), &mut state);
        assert_eq!(names(&state), ["b"]);
        assert!(stack.can_undo());
        assert_eq!(stack.undo_text(), Some("Remove Layer"));

        assert!(stack.undo(&mut state));
        assert_eq!(names(&state), ["a", "b"]);
        assert_eq!(stack.redo_text(), Some("Remove Layer"));
        assert!(stack.redo(&mut state));
        assert_eq!(names(&state), ["b"]);
        assert!(!stack.redo(&mut state));
    }

    #[test]
    fn test_push_releases_redo_tail() {
        let (mut state, ids) = state_with(&["a", "b"]);
        let mut stack = UndoStack::new();
        stack.push(Box::new(RemoveLayerCommand::new(ids[0])), &mut state);
        stack.push(Box::new(RemoveLayerCommand::new(ids[1])), &mut state);
        stack.undo(&mut state);
        assert!(stack.can_redo());

        let root = state.tree.root();
        let c = state.tree.create(LayerNode::raster("c"));
        stack.push(Box::new(AddLayerCommand::new(c, vec![], 0)), &mut state);
        assert!(!stack.can_redo());
        assert_eq!(stack.count(), 2);
        assert_eq!(state.tree.children(root), &[c, ids[1]]);
        // "a" is still owned by the first remove command.
        assert!(state.tree.is_alive(ids[0]));
    }

    #[test]
    fn test_clear_frees_detached_layers() {
        let (mut state, ids) = state_with(&["a"]);
        let mut stack = UndoStack::new();
        stack.push(Box::new(RemoveLayerCommand::new(ids[0])), &mut state);
        stack.clear(&mut state);
        assert!(!state.tree.is_alive(ids[0]));
        assert!(!stack.can_undo());
    }

    #[test]
    fn test_clean_state_tracking() {
        let (mut state, ids) = state_with(&["a", "b"]);
        let mut stack = UndoStack::new();
        assert!(stack.is_clean());
        stack.push(Box::new(RemoveLayerCommand::new(ids[0])), &mut state);
        assert!(!stack.is_clean());
        stack.set_clean();
        stack.undo(&mut state);
        assert!(!stack.is_clean());
        stack.redo(&mut state);
        assert!(stack.is_clean());

        stack.undo(&mut state);
        stack.push(Box::new(RemoveLayerCommand::new(ids[1])), &mut state);
        assert!(!stack.is_clean());
    }

    #[test]
    fn test_move_later_then_back() {
        let (mut state, ids) = state_with(&["a", "b", "c"]);
        let root = state.tree.root();
        let mut stack = UndoStack::new();
        stack.push(
            Box::new(MoveLayerCommand::new(ids[0], root, 2, "a".into())),
            &mut state,
        );
        assert_eq!(names(&state), ["b", "a", "c"]);
        stack.undo(&mut state);
        assert_eq!(names(&state), ["a", "b", "c"]);
        stack.redo(&mut state);
        assert_eq!(names(&state), ["b", "a", "c"]);
    }

    #[test]
    fn test_move_renames_and_restores() {
        let (mut state, ids) = state_with(&["a", "g"]);
        let root = state.tree.root();
        let group = state.tree.create(LayerNode::group("group"));
        state.tree.insert(root, 2, group).unwrap();
        let mut stack = UndoStack::new();
        stack.push(
            Box::new(MoveLayerCommand::new(ids[0], group, 0, "a 1".into())),
            &mut state,
        );
        assert_eq!(state.tree.parent(ids[0]), Some(group));
        assert_eq!(state.tree.node(ids[0]).unwrap().name, "a 1");
        stack.undo(&mut state);
        assert_eq!(state.tree.index_of(ids[0]), Some(0));
        assert_eq!(state.tree.parent(ids[0]), Some(root));
        assert_eq!(state.tree.node(ids[0]).unwrap().name, "a");
    }

    #[test]
    fn test_property_swap_emits_event() {
        let (mut state, ids) = state_with(&["a"]);
        let mut stack = UndoStack::new();
        stack.push(
            Box::new(SetPropertyCommand::new(
                vec![0],
                LayerProperty::Visible(false),
                "Hide".into(),
            )),
            &mut state,
        );
        assert!(!state.tree.node(ids[0]).unwrap().visible);
        assert!(state.events().iter().any(|e| matches!(
            e,
            SceneEvent::LayerPropertyChanged { role: PropertyRole::Visible, .. }
        )));
        stack.undo(&mut state);
        assert!(state.tree.node(ids[0]).unwrap().visible);
    }

    #[test]
    fn test_group_undoes_in_reverse() {
        let (mut state, ids) = state_with(&["a", "b", "c"]);
        let mut group = CommandGroup::new("Remove Layers");
        group.push(Box::new(RemoveLayerCommand::new(ids[0])));
        group.push(Box::new(RemoveLayerCommand::new(ids[1])));
        let mut stack = UndoStack::new();
        stack.push(Box::new(group), &mut state);
        assert_eq!(names(&state), ["c"]);
        assert_eq!(stack.undo_text(), Some("Remove Layers"));
        stack.undo(&mut state);
        assert_eq!(names(&state), ["a", "b", "c"]);
    }
}
