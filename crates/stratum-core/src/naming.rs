//! Sibling name uniqueness.

use crate::tree::{LayerId, LayerTree};

/// Returns `base` if no entry of `names` equals it, otherwise `base` with the
/// smallest positive suffix that is not taken (`"Layer 1"`, `"Layer 2"`, ...).
pub fn unduplicated_name<S: AsRef<str>>(names: &[S], base: &str) -> String {
    let taken = |candidate: &str| names.iter().any(|n| n.as_ref() == candidate);
    if !taken(base) {
        return base.to_string();
    }
    let mut suffix = 1usize;
    loop {
        let candidate = format!("{base} {suffix}");
        if !taken(&candidate) {
            return candidate;
        }
        suffix += 1;
    }
}

/// How a [`NameResolver`] treats layers that already live in the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveMode {
    /// Every layer gets a fresh unique name.
    Add,
    /// A layer already inside the destination keeps its name.
    Move,
}

/// Resolves unique names for one batch of layers entering the same parent.
///
/// Each resolved name is claimed for the rest of the batch.
#[derive(Debug)]
pub struct NameResolver {
    mode: ResolveMode,
    parent: LayerId,
    names: Vec<String>,
}

impl NameResolver {
    pub fn new(tree: &LayerTree, parent: LayerId, mode: ResolveMode) -> Self {
        Self {
            mode,
            parent,
            names: tree.child_names(parent),
        }
    }

    pub fn resolve(&mut self, tree: &LayerTree, layer: LayerId) -> String {
        let original = tree.node(layer).map(|n| n.name.clone()).unwrap_or_default();
        if self.mode == ResolveMode::Move && tree.parent(layer) == Some(self.parent) {
            return original;
        }
        let name = unduplicated_name(&self.names, &original);
        self.names.push(name.clone());
        name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::LayerNode;

    #[test]
    fn test_unused_name_is_kept() {
        let names = vec!["Background".to_string()];
        assert_eq!(unduplicated_name(&names, "Layer"), "Layer");
    }

    #[test]
    fn test_smallest_free_suffix() {
        let names = ["Layer", "Layer 2"];
        assert_eq!(unduplicated_name(&names, "Layer"), "Layer 1");
        let names = ["Layer", "Layer 1", "Layer 2"];
        assert_eq!(unduplicated_name(&names, "Layer"), "Layer 3");
    }

    #[test]
    fn test_resolver_claims_names_within_batch() {
        let mut tree = LayerTree::new();
        let root = tree.root();
        let layers: Vec<_> = (0..3).map(|_| tree.create(LayerNode::raster("Layer"))).collect();
        let mut resolver = NameResolver::new(&tree, root, ResolveMode::Add);
        let names: Vec<_> = layers.iter().map(|&l| resolver.resolve(&tree, l)).collect();
        assert_eq!(names, ["Layer", "Layer 1", "Layer 2"]);
    }

    #[test]
    fn test_move_within_parent_keeps_name() {
        let mut tree = LayerTree::new();
        let root = tree.root();
        let a = tree.create(LayerNode::raster("Layer"));
        let b = tree.create(LayerNode::raster("Layer"));
        tree.insert(root, 0, a).unwrap();
        let mut resolver = NameResolver::new(&tree, root, ResolveMode::Move);
        assert_eq!(resolver.resolve(&tree, a), "Layer");
        assert_eq!(resolver.resolve(&tree, b), "Layer 1");
    }
}
