//! # Stratum Core
//!
//! Layer tree with generation-checked handles, sparse tiled pixel surfaces,
//! blend modes and tile compositing, and the transactional layer scene that
//! turns every structural, property and content change into an undoable
//! command while tracking damaged tiles.
//!
//! This crate is the heart of the Stratum compositor.

pub mod geometry;
pub mod tile;
pub mod blend;
pub mod error;
pub mod layer;
pub mod tree;
pub mod naming;
pub mod edit;
pub mod render;
pub mod thumbnail;
pub mod commands;
pub mod scene;

pub use blend::{BlendMode, Blender, DefaultBlender};
pub use commands::{Command, CommandGroup, UndoStack};
pub use edit::{LayerEdit, TilePatchEdit};
pub use error::{SceneError, SceneResult};
pub use geometry::{IntPoint, IntRect, IntSize};
pub use layer::{LayerKind, LayerKindTag, LayerNode, LayerProperty, PropertyRole, THUMBNAIL_SIZE};
pub use render::{DrawDelegate, LayerRenderer};
pub use scene::{LayerRow, LayerScene, SceneEvent, SceneObserver, SceneState};
pub use tile::{TileKey, TileKeySet, TileSurface, TILE_SIZE};
pub use tree::{LayerId, LayerSnapshot, LayerTree};
