//! Binary layer stream used for the private clipboard format.
//!
//! A stream is a sequence of big-endian records laid out as
//! `[2-byte length][2-byte record type][payload]`, where the length counts the
//! four header bytes. Layers nest the same way structures nest in classic
//! layout streams:
//!
//! HEADER → COUNT → BGNLAYER … ENDLAYER (× COUNT) → ENDSTREAM
//!
//! Inside a layer block come NAME, FLAGS, OPACITY and BLEND, then the kind
//! payload (TILE records for rasters, one SOLID record for solids, nested
//! BGNLAYER blocks for group children).

use std::io::{self, Read, Write};

use image::{Rgba, RgbaImage};
use thiserror::Error;

use stratum_core::tile::TRANSPARENT;
use stratum_core::{
    BlendMode, IntRect, LayerKind, LayerKindTag, LayerNode, LayerSnapshot, TileKey, TILE_SIZE,
};

/// Version written into every HEADER record.
pub const STREAM_VERSION: u16 = 1;

// ── Record Types ──────────────────────────────────────────────────────

mod record_type {
    pub const HEADER: u16 = 0x0002;
    pub const COUNT: u16 = 0x0103;
    pub const BGNLAYER: u16 = 0x0202;
    pub const NAME: u16 = 0x0306;
    pub const FLAGS: u16 = 0x0401;
    pub const OPACITY: u16 = 0x0505;
    pub const BLEND: u16 = 0x0601;
    pub const TILE: u16 = 0x0700;
    pub const SOLID: u16 = 0x0800;
    pub const ENDLAYER: u16 = 0x0900;
    pub const ENDSTREAM: u16 = 0x0A00;
}

const FLAG_VISIBLE: u8 = 0x01;
const FLAG_LOCKED: u8 = 0x02;

const TILE_BYTES: usize = (TILE_SIZE * TILE_SIZE * 4) as usize;

// ── Errors ────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid record at offset {offset}: {message}")]
    InvalidRecord { offset: u64, message: String },

    #[error("Unexpected record type 0x{record_type:04X}, expected 0x{expected:04X}")]
    UnexpectedRecord { record_type: u16, expected: u16 },

    #[error("Unsupported stream version: {0}")]
    UnsupportedVersion(u16),

    #[error("Unknown layer kind: {0}")]
    UnknownKind(u16),
}

// ── Record ────────────────────────────────────────────────────────────

#[derive(Debug)]
struct Record {
    record_type: u16,
    data: Vec<u8>,
    offset: u64,
}

impl Record {
    fn invalid(&self, message: impl Into<String>) -> StreamError {
        StreamError::InvalidRecord {
            offset: self.offset,
            message: message.into(),
        }
    }

    fn expect_len(&self, len: usize) -> Result<(), StreamError> {
        if self.data.len() != len {
            return Err(self.invalid(format!(
                "Record 0x{:04X} carries {} bytes, expected {}",
                self.record_type,
                self.data.len(),
                len
            )));
        }
        Ok(())
    }

    fn as_u8(&self) -> Result<u8, StreamError> {
        self.expect_len(1)?;
        Ok(self.data[0])
    }

    fn as_u16(&self) -> Result<u16, StreamError> {
        self.expect_len(2)?;
        Ok(u16::from_be_bytes([self.data[0], self.data[1]]))
    }

    fn as_u32(&self) -> Result<u32, StreamError> {
        self.expect_len(4)?;
        Ok(u32::from_be_bytes([self.data[0], self.data[1], self.data[2], self.data[3]]))
    }

    fn as_f64(&self) -> Result<f64, StreamError> {
        self.expect_len(8)?;
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&self.data);
        Ok(f64::from_be_bytes(bytes))
    }

    fn as_string(&self) -> Result<String, StreamError> {
        String::from_utf8(self.data.clone()).map_err(|_| self.invalid("Name is not valid UTF-8"))
    }
}

fn read_i32(bytes: &[u8]) -> i32 {
    i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

// ── Reader ────────────────────────────────────────────────────────────

pub struct StreamReader<R: Read> {
    reader: R,
    offset: u64,
}

impl<R: Read> StreamReader<R> {
    pub fn new(reader: R) -> Self {
        Self { reader, offset: 0 }
    }

    /// Reads every top-level layer subtree in the stream.
    pub fn read(&mut self) -> Result<Vec<LayerSnapshot>, StreamError> {
        self.read_header()?;

        let count = self.expect_record(record_type::COUNT)?.as_u32()?;
        let mut layers = Vec::new();
        for _ in 0..count {
            let begin = self.expect_record(record_type::BGNLAYER)?;
            layers.push(self.read_layer(&begin)?);
        }

        self.expect_record(record_type::ENDSTREAM)?;
        log::debug!("read {} layers from stream ({} bytes)", layers.len(), self.offset);
        Ok(layers)
    }

    fn read_record(&mut self) -> Result<Option<Record>, StreamError> {
        let offset = self.offset;
        let mut len_buf = [0u8; 2];
        match self.reader.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(StreamError::Io(e)),
        }

        let total_len = u16::from_be_bytes(len_buf) as usize;
        if total_len < 4 {
            return Err(StreamError::InvalidRecord {
                offset,
                message: format!("Record length {} is too small", total_len),
            });
        }

        let mut type_buf = [0u8; 2];
        let mut data = vec![0u8; total_len - 4];
        let truncated = |e: io::Error| match e.kind() {
            io::ErrorKind::UnexpectedEof => StreamError::InvalidRecord {
                offset,
                message: "Record is truncated".into(),
            },
            _ => StreamError::Io(e),
        };
        self.reader.read_exact(&mut type_buf).map_err(truncated)?;
        self.reader.read_exact(&mut data).map_err(truncated)?;
        self.offset += total_len as u64;

        Ok(Some(Record {
            record_type: u16::from_be_bytes(type_buf),
            data,
            offset,
        }))
    }

    /// Next record, which must exist.
    fn next_record(&mut self) -> Result<Record, StreamError> {
        self.read_record()?.ok_or(StreamError::InvalidRecord {
            offset: self.offset,
            message: "Unexpected end of stream".into(),
        })
    }

    /// Next record, which must be of type `expected`.
    fn expect_record(&mut self, expected: u16) -> Result<Record, StreamError> {
        let rec = self.next_record()?;
        if rec.record_type != expected {
            return Err(StreamError::UnexpectedRecord {
                record_type: rec.record_type,
                expected,
            });
        }
        Ok(rec)
    }

    fn read_header(&mut self) -> Result<(), StreamError> {
        let rec = self.read_record()?.ok_or(StreamError::InvalidRecord {
            offset: 0,
            message: "Empty stream".into(),
        })?;

        if rec.record_type != record_type::HEADER {
            return Err(StreamError::UnexpectedRecord {
                record_type: rec.record_type,
                expected: record_type::HEADER,
            });
        }

        let version = rec.as_u16()?;
        if version != STREAM_VERSION {
            return Err(StreamError::UnsupportedVersion(version));
        }
        Ok(())
    }

    /// Reads one layer block whose BGNLAYER record is `begin`.
    fn read_layer(&mut self, begin: &Record) -> Result<LayerSnapshot, StreamError> {
        let tag = begin.as_u16()?;
        let kind = LayerKindTag::from_u16(tag).ok_or(StreamError::UnknownKind(tag))?;
        let mut node = match kind {
            LayerKindTag::Raster => LayerNode::raster(""),
            LayerKindTag::Group => LayerNode::group(""),
            LayerKindTag::Solid => LayerNode::solid("", TRANSPARENT, IntRect::default()),
        };
        let mut children = Vec::new();

        loop {
            let rec = self.next_record()?;
            match rec.record_type {
                record_type::NAME => node.name = rec.as_string()?,
                record_type::FLAGS => {
                    let flags = rec.as_u8()?;
                    node.visible = flags & FLAG_VISIBLE != 0;
                    node.locked = flags & FLAG_LOCKED != 0;
                }
                record_type::OPACITY => {
                    let opacity = rec.as_f64()?;
                    if !opacity.is_finite() {
                        return Err(rec.invalid("Opacity is not a finite number"));
                    }
                    node.opacity = opacity.clamp(0.0, 1.0);
                }
                record_type::BLEND => {
                    let code = rec.as_u8()?;
                    node.blend_mode = BlendMode::from_u8(code)
                        .ok_or_else(|| rec.invalid(format!("Unknown blend mode {}", code)))?;
                }
                record_type::TILE if kind == LayerKindTag::Raster => {
                    let (key, tile) = parse_tile(&rec)?;
                    if let LayerKind::Raster(surface) = &mut node.kind {
                        if surface.insert_tile(key, tile).is_err() {
                            return Err(rec.invalid("Tile has the wrong dimensions"));
                        }
                    }
                }
                record_type::SOLID if kind == LayerKindTag::Solid => {
                    let (color, rect) = parse_solid(&rec)?;
                    node.kind = LayerKind::Solid { color, rect };
                }
                record_type::BGNLAYER if kind == LayerKindTag::Group => {
                    children.push(self.read_layer(&rec)?);
                }
                record_type::ENDLAYER => break,
                other => {
                    return Err(StreamError::UnexpectedRecord {
                        record_type: other,
                        expected: record_type::ENDLAYER,
                    });
                }
            }
        }

        Ok(LayerSnapshot { node, children })
    }
}

fn parse_tile(rec: &Record) -> Result<(TileKey, RgbaImage), StreamError> {
    rec.expect_len(8 + TILE_BYTES)?;
    let key = TileKey::new(read_i32(&rec.data[0..4]), read_i32(&rec.data[4..8]));
    let tile = RgbaImage::from_raw(TILE_SIZE as u32, TILE_SIZE as u32, rec.data[8..].to_vec())
        .ok_or_else(|| rec.invalid("Tile pixel data is incomplete"))?;
    Ok((key, tile))
}

fn parse_solid(rec: &Record) -> Result<(Rgba<u8>, IntRect), StreamError> {
    rec.expect_len(4 + 16)?;
    let d = &rec.data;
    let color = Rgba([d[0], d[1], d[2], d[3]]);
    let rect = IntRect::new(
        read_i32(&d[4..8]),
        read_i32(&d[8..12]),
        read_i32(&d[12..16]),
        read_i32(&d[16..20]),
    );
    Ok((color, rect))
}

// ── Writer ────────────────────────────────────────────────────────────

pub struct StreamWriter<W: Write> {
    writer: W,
    offset: u64,
}

impl<W: Write> StreamWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer, offset: 0 }
    }

    /// Writes a complete stream holding `layers` and their subtrees.
    pub fn write(&mut self, layers: &[LayerSnapshot]) -> Result<(), StreamError> {
        self.write_record(record_type::HEADER, &STREAM_VERSION.to_be_bytes())?;
        let count = u32::try_from(layers.len()).map_err(|_| StreamError::InvalidRecord {
            offset: self.offset,
            message: format!("Too many layers: {}", layers.len()),
        })?;
        self.write_record(record_type::COUNT, &count.to_be_bytes())?;
        for layer in layers {
            self.write_layer(layer)?;
        }
        self.write_record(record_type::ENDSTREAM, &[])?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    fn write_record(&mut self, record_type: u16, data: &[u8]) -> Result<(), StreamError> {
        let total_len = u16::try_from(data.len() + 4).map_err(|_| StreamError::InvalidRecord {
            offset: self.offset,
            message: format!("Record payload of {} bytes is too large", data.len()),
        })?;
        self.writer.write_all(&total_len.to_be_bytes())?;
        self.writer.write_all(&record_type.to_be_bytes())?;
        self.writer.write_all(data)?;
        self.offset += u64::from(total_len);
        Ok(())
    }

    fn write_layer(&mut self, layer: &LayerSnapshot) -> Result<(), StreamError> {
        let node = &layer.node;
        self.write_record(record_type::BGNLAYER, &node.kind.tag().to_u16().to_be_bytes())?;
        self.write_record(record_type::NAME, node.name.as_bytes())?;

        let mut flags = 0u8;
        if node.visible {
            flags |= FLAG_VISIBLE;
        }
        if node.locked {
            flags |= FLAG_LOCKED;
        }
        self.write_record(record_type::FLAGS, &[flags])?;
        self.write_record(record_type::OPACITY, &node.opacity.to_be_bytes())?;
        self.write_record(record_type::BLEND, &[node.blend_mode.to_u8()])?;

        match &node.kind {
            LayerKind::Raster(surface) => {
                let mut keys: Vec<TileKey> = surface.keys().into_iter().collect();
                keys.sort_unstable();
                for key in keys {
                    if let Some(tile) = surface.tile(key) {
                        self.write_tile(key, tile)?;
                    }
                }
            }
            LayerKind::Group => {
                for child in &layer.children {
                    self.write_layer(child)?;
                }
            }
            LayerKind::Solid { color, rect } => {
                let mut data = Vec::with_capacity(20);
                data.extend_from_slice(&color.0);
                for v in [rect.x, rect.y, rect.width, rect.height] {
                    data.extend_from_slice(&v.to_be_bytes());
                }
                self.write_record(record_type::SOLID, &data)?;
            }
        }

        self.write_record(record_type::ENDLAYER, &[])
    }

    fn write_tile(&mut self, key: TileKey, tile: &RgbaImage) -> Result<(), StreamError> {
        let mut data = Vec::with_capacity(8 + TILE_BYTES);
        data.extend_from_slice(&key.x.to_be_bytes());
        data.extend_from_slice(&key.y.to_be_bytes());
        data.extend_from_slice(tile.as_raw());
        self.write_record(record_type::TILE, &data)
    }
}

/// Encodes layer subtrees into a complete stream.
pub fn encode_layers(layers: &[LayerSnapshot]) -> Result<Vec<u8>, StreamError> {
    let mut writer = StreamWriter::new(Vec::new());
    writer.write(layers)?;
    Ok(writer.into_inner())
}

/// Decodes a complete stream into detached layer subtrees.
pub fn decode_layers(data: &[u8]) -> Result<Vec<LayerSnapshot>, StreamError> {
    StreamReader::new(data).read()
}
