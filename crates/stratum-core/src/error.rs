use thiserror::Error;

use crate::layer::PropertyRole;
use crate::tree::LayerId;

/// Reasons a tree or scene operation was refused.
///
/// A refused operation never leaves a partial mutation or an undo entry behind.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SceneError {
    #[error("layer {0:?} is stale, foreign, or not part of the scene")]
    InvalidLayer(LayerId),

    #[error("parent {0:?} is stale, foreign, or not part of the scene")]
    InvalidParent(LayerId),

    #[error("index {index} out of range for {count} children")]
    IndexOutOfRange { index: usize, count: usize },

    #[error("the root layer cannot be the target of this operation")]
    RootLayer,

    #[error("layer {0:?} cannot have children")]
    NotAGroup(LayerId),

    #[error("moving {0:?} would make it its own ancestor")]
    Cycle(LayerId),

    #[error("layer {0:?} is already attached to a parent")]
    NotDetached(LayerId),

    #[error("layer {0:?} is listed more than once")]
    Duplicate(LayerId),

    #[error("opacity {0} is not a finite number")]
    InvalidOpacity(f64),

    #[error("layer {layer:?} is locked against {role:?} changes")]
    Locked { layer: LayerId, role: Option<PropertyRole> },
}

pub type SceneResult<T> = Result<T, SceneError>;
