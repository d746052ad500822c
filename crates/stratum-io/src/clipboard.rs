//! Copy, cut and paste of layer subtrees through the private clipboard format.
//!
//! The host owns the system clipboard; these functions only produce and
//! consume [`ClipboardPayload`]s.

use thiserror::Error;

use stratum_core::{LayerId, LayerScene, SceneError};

use crate::stream::{decode_layers, encode_layers, StreamError};

/// MIME type of the private layer stream.
pub const LAYERS_MIME_TYPE: &str = "application/x-stratum-layers";

/// Data placed on, or taken from, the clipboard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClipboardPayload {
    pub mime_type: String,
    pub data: Vec<u8>,
}

impl ClipboardPayload {
    /// A payload in the private layer format.
    pub fn layers(data: Vec<u8>) -> Self {
        Self {
            mime_type: LAYERS_MIME_TYPE.to_string(),
            data,
        }
    }

    pub fn has_layers(&self) -> bool {
        self.mime_type == LAYERS_MIME_TYPE
    }
}

#[derive(Error, Debug)]
pub enum ClipboardError {
    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error(transparent)]
    Scene(#[from] SceneError),
}

/// Encodes `layers` and their subtrees. The scene is not modified.
pub fn copy_layers(
    scene: &LayerScene,
    layers: &[LayerId],
) -> Result<ClipboardPayload, ClipboardError> {
    let mut snapshots = Vec::with_capacity(layers.len());
    for &layer in layers {
        if layer == scene.root() {
            log::warn!("copy_layers rejected: the root layer cannot be copied");
            return Err(SceneError::RootLayer.into());
        }
        let snapshot = scene
            .check_layer(layer)
            .then(|| scene.snapshot_layer(layer))
            .flatten()
            .ok_or(SceneError::InvalidLayer(layer));
        match snapshot {
            Ok(snapshot) => snapshots.push(snapshot),
            Err(err) => {
                log::warn!("copy_layers rejected: {}", err);
                return Err(err.into());
            }
        }
    }

    let data = encode_layers(&snapshots)?;
    log::debug!("copied {} layers ({} bytes)", snapshots.len(), data.len());
    Ok(ClipboardPayload::layers(data))
}

/// Copies `layers`, then removes them as one "Cut Layers" undo step.
pub fn cut_layers(
    scene: &mut LayerScene,
    layers: &[LayerId],
) -> Result<ClipboardPayload, ClipboardError> {
    let payload = copy_layers(scene, layers)?;
    scene.remove_layers(layers, "Cut Layers")?;
    Ok(payload)
}

/// Inserts the layers of `payload` above the current layer as one
/// "Paste Layers" undo step and returns them.
///
/// Payloads in another format, or holding no layers, paste nothing.
pub fn paste_layers(
    scene: &mut LayerScene,
    payload: &ClipboardPayload,
) -> Result<Vec<LayerId>, ClipboardError> {
    if !payload.has_layers() {
        log::debug!("ignoring clipboard payload of type {}", payload.mime_type);
        return Ok(Vec::new());
    }
    let snapshots = decode_layers(&payload.data)?;
    if snapshots.is_empty() {
        return Ok(Vec::new());
    }

    let layers: Vec<LayerId> = snapshots
        .into_iter()
        .map(|snapshot| scene.instantiate_layer(snapshot))
        .collect();
    if let Err(err) = scene.add_layers_at_current(&layers, "Paste Layers") {
        for &layer in &layers {
            let _ = scene.destroy_layer(layer);
        }
        return Err(err.into());
    }
    Ok(layers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;
    use stratum_core::{IntRect, IntSize, LayerKind, LayerNode, TileSurface};

    fn init() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn names(scene: &LayerScene, parent: LayerId) -> Vec<String> {
        scene.tree().child_names(parent)
    }

    /// Root holding one group "Group" with a solid and a painted raster.
    fn scene_with_group() -> (LayerScene, LayerId) {
        let mut scene = LayerScene::new(IntSize::new(128, 128));
        let root = scene.root();
        let group = scene.create_layer(LayerNode::group("Group"));
        scene.add_layers(&[group], root, 0, "Add Group").unwrap();

        let mut surface = TileSurface::new();
        surface.set_pixel(70, 3, Rgba([0, 255, 0, 255]));
        let raster = scene.create_layer(LayerNode::raster_with_surface("Paint", surface));
        let fill = LayerNode::solid("Fill", Rgba([0, 0, 255, 255]), IntRect::new(0, 0, 8, 8));
        let solid = scene.create_layer(fill);
        scene.add_layers(&[solid, raster], group, 0, "Add Layers").unwrap();
        (scene, group)
    }

    #[test]
    fn test_copy_paste_duplicates_subtree_above_current() {
        init();
        let (mut scene, group) = scene_with_group();
        let payload = copy_layers(&scene, &[group]).unwrap();
        assert_eq!(payload.mime_type, LAYERS_MIME_TYPE);

        scene.set_current(Some(group)).unwrap();
        let pasted = paste_layers(&mut scene, &payload).unwrap();
        assert_eq!(pasted.len(), 1);

        let root = scene.root();
        assert_eq!(names(&scene, root), ["Group 1", "Group"]);
        assert_eq!(scene.current(), Some(pasted[0]));
        assert_eq!(names(&scene, pasted[0]), ["Fill", "Paint"]);

        let tree = scene.tree();
        let paint = tree.child(pasted[0], 1).unwrap();
        let surface = tree.node(paint).unwrap().surface().unwrap();
        assert_eq!(surface.pixel(70, 3), Rgba([0, 255, 0, 255]));
        let fill = tree.child(pasted[0], 0).unwrap();
        assert!(matches!(
            tree.node(fill).unwrap().kind,
            LayerKind::Solid { color: Rgba([0, 0, 255, 255]), .. }
        ));

        assert_eq!(scene.undo_text(), Some("Paste Layers"));
        assert!(scene.undo());
        assert_eq!(names(&scene, root), ["Group"]);
    }

    #[test]
    fn test_cut_then_paste_restores_layer() {
        init();
        let (mut scene, group) = scene_with_group();
        let root = scene.root();
        let payload = cut_layers(&mut scene, &[group]).unwrap();
        assert_eq!(scene.tree().child_count(root), 0);
        assert_eq!(scene.undo_text(), Some("Cut Layers"));

        let pasted = paste_layers(&mut scene, &payload).unwrap();
        assert_eq!(names(&scene, root), ["Group"]);
        assert_eq!(scene.tree().child_count(pasted[0]), 2);
    }

    #[test]
    fn test_paste_of_nothing_is_silent() {
        init();
        let (mut scene, _) = scene_with_group();
        let before = scene.undo_stack().count();

        let foreign = ClipboardPayload {
            mime_type: "text/plain".into(),
            data: b"hello".to_vec(),
        };
        assert!(paste_layers(&mut scene, &foreign).unwrap().is_empty());

        let empty = ClipboardPayload::layers(encode_layers(&[]).unwrap());
        assert!(paste_layers(&mut scene, &empty).unwrap().is_empty());
        assert_eq!(scene.undo_stack().count(), before);
    }

    #[test]
    fn test_copy_rejects_root_and_stale_layers() {
        init();
        let (mut scene, group) = scene_with_group();
        let root = scene.root();
        assert!(matches!(
            copy_layers(&scene, &[root]),
            Err(ClipboardError::Scene(SceneError::RootLayer))
        ));

        let detached = scene.create_layer(LayerNode::raster("Loose"));
        assert!(matches!(
            copy_layers(&scene, &[group, detached]),
            Err(ClipboardError::Scene(SceneError::InvalidLayer(_)))
        ));
    }

    #[test]
    fn test_corrupt_payload_adds_nothing() {
        init();
        let (mut scene, group) = scene_with_group();
        let mut payload = copy_layers(&scene, &[group]).unwrap();
        payload.data.truncate(payload.data.len() / 2);

        let root = scene.root();
        let before = scene.tree().len();
        assert!(matches!(paste_layers(&mut scene, &payload), Err(ClipboardError::Stream(_))));
        assert_eq!(names(&scene, root), ["Group"]);
        assert_eq!(scene.tree().len(), before);
    }
}
