//! # Stratum I/O
//!
//! The private clipboard format for layer subtrees: a big-endian record
//! stream codec and the copy / cut / paste operations built on it.

pub mod stream;
pub mod clipboard;

pub use clipboard::{
    copy_layers, cut_layers, paste_layers, ClipboardError, ClipboardPayload, LAYERS_MIME_TYPE,
};
pub use stream::{
    decode_layers, encode_layers, StreamError, StreamReader, StreamWriter, STREAM_VERSION,
};
