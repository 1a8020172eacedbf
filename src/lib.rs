//! AOS archive parser, decoder, and packer.
//!
//! This crate reads and writes AOS archives, the asset container used by a
//! family of LiLiM visual-novel engines, and decodes the two engine-specific
//! payload formats found inside them.
//!
//! # Archive layout
//!
//! An archive is a fixed 273-byte header, a flat index of 40-byte entry
//! records, and a concatenated data region. All integers are little-endian;
//! all name fields are null-padded Shift-JIS.
//!
//! # Payload formats
//!
//! - **Scripts** (`.scr`) - Shift-JIS text compressed with a bit-serialized
//!   Huffman tree and a little-endian length prefix.
//! - **Images** (`.abm`) - BMP-header-prefixed bitmaps using engine-specific
//!   run-length schemes, optionally carrying a multi-frame animation table.
//! - **Masks** (`.msk`) - plain BMP data under a different extension.
//!
//! # Example
//!
//! ```no_run
//! use aos::{AosArchive, AosEntry};
//!
//! // Parse an existing archive
//! let data = std::fs::read("data.aos").unwrap();
//! let archive = AosArchive::parse(&data).unwrap();
//!
//! for entry in &archive.entries {
//!     println!("{}: {} bytes", entry.name, entry.data.len());
//! }
//!
//! // Build a new archive
//! let mut archive = AosArchive::new("data.aos");
//! archive.add_entry(AosEntry {
//!     name: "start.scr".to_string(),
//!     data: aos::compress_script(b"opening line"),
//! });
//! std::fs::write("new.aos", archive.serialize().unwrap()).unwrap();
//! ```

use encoding_rs::SHIFT_JIS;
use log::{debug, warn};
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::io::{Cursor, Read, Seek, SeekFrom};
use thiserror::Error;

/// Errors that can occur when working with AOS archives and their payloads.
#[derive(Error, Debug)]
pub enum AosError {
    /// An I/O error occurred while reading or writing.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The BMP file header does not start with "BM".
    #[error("Invalid BMP signature: 0x{0:04X}")]
    InvalidBmpSignature(u16),

    /// The BMP info header has a size other than the classic 40 bytes.
    #[error("Invalid BMP info header size: {0}")]
    InvalidBmpInfoSize(u32),

    /// An animated image declared zero frames.
    #[error("ABM animation has no frames")]
    NoFrames,

    /// The data ended before the structure it claims to contain.
    #[error("Truncated data")]
    Truncated,

    /// An entry name does not fit the 32-byte Shift-JIS name field.
    #[error("File name longer than 32 Shift-JIS bytes: {0}")]
    NameTooLong(String),

    /// Sidecar serialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Size of the fixed archive header.
pub const HEADER_SIZE: usize = 273;
/// Size of one entry record in the index.
pub const ENTRY_SIZE: usize = 40;
/// Size of the Shift-JIS name field in an entry record.
pub const ENTRY_NAME_SIZE: usize = 32;
/// Size of the Shift-JIS archive-name field in the header.
pub const ARCHIVE_NAME_SIZE: usize = 261;

/// An AOS archive: a named container of ordered entries.
///
/// Archives can be parsed from existing `.aos` files or built from scratch.
/// Entry order is significant - the index and the data region store entries
/// in exactly the order of `entries`.
#[derive(Debug, Clone)]
pub struct AosArchive {
    /// Archive name as stored in the 261-byte header field (e.g. `"data.aos"`).
    pub name: String,

    /// The entries in this archive, in index order.
    pub entries: Vec<AosEntry>,
}

/// A single entry in an AOS archive.
#[derive(Debug, Clone, Default)]
pub struct AosEntry {
    /// File name, decoded from the entry's 32-byte Shift-JIS field.
    pub name: String,

    /// Raw bytes of this entry in the data region.
    pub data: Vec<u8>,
}

impl AosArchive {
    /// Create a new empty archive with the given stored name.
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: Vec::new(),
        }
    }

    /// Add an entry to the archive.
    pub fn add_entry(&mut self, entry: AosEntry) {
        self.entries.push(entry);
    }

    /// Parse an AOS archive from raw bytes.
    pub fn parse(data: &[u8]) -> Result<Self, AosError> {
        if data.len() < HEADER_SIZE {
            return Err(AosError::Truncated);
        }

        // Header (273 bytes):
        //   0-3:    signature (0 in every archive observed)
        //   4-7:    data_offset - absolute offset of the data region
        //   8-11:   index_size - total bytes of entry records
        //   12-272: archive name, Shift-JIS, null-padded
        let mut cursor = Cursor::new(data);
        let signature = read_u32_le(&mut cursor)?;
        if signature != 0 {
            warn!("Unexpected AOS signature 0x{:08X}, continuing anyway", signature);
        }
        let data_offset = read_u32_le(&mut cursor)? as u64;
        let index_size = read_u32_le(&mut cursor)?;
        let mut name_field = [0u8; ARCHIVE_NAME_SIZE];
        cursor.read_exact(&mut name_field)?;
        let name = decode_sjis_name(&name_field);

        // Entry record (40 bytes): name 32, offset u32, size u32. Offsets
        // are relative to data_offset.
        let entry_count = index_size as usize / ENTRY_SIZE;
        let mut index = Vec::with_capacity(entry_count);
        for _ in 0..entry_count {
            let mut name_bytes = [0u8; ENTRY_NAME_SIZE];
            cursor.read_exact(&mut name_bytes)?;
            let offset = read_u32_le(&mut cursor)?;
            let size = read_u32_le(&mut cursor)?;
            index.push((decode_sjis_name(&name_bytes), offset, size));
        }

        // The index runs straight into the data region, but the header field
        // is authoritative: seek even when already positioned there.
        cursor.seek(SeekFrom::Start(data_offset))?;

        let mut entries = Vec::with_capacity(entry_count);
        for (entry_name, offset, size) in index {
            cursor.seek(SeekFrom::Start(data_offset + offset as u64))?;
            let mut buf = vec![0u8; size as usize];
            cursor.read_exact(&mut buf)?;
            debug!("entry {} at +{} ({} bytes)", entry_name, offset, size);
            entries.push(AosEntry {
                name: entry_name,
                data: buf,
            });
        }

        Ok(Self { name, entries })
    }

    /// Serialize the archive to bytes.
    ///
    /// Every entry name is validated against the 32-byte Shift-JIS field
    /// before anything is emitted; one oversized name fails the whole
    /// operation.
    pub fn serialize(&self) -> Result<Vec<u8>, AosError> {
        let index_size = self.entries.len() * ENTRY_SIZE;
        let data_offset = HEADER_SIZE + index_size;

        let mut name_fields = Vec::with_capacity(self.entries.len());
        for entry in &self.entries {
            name_fields.push(encode_sjis_name(&entry.name, ENTRY_NAME_SIZE)?);
        }

        let mut data = Vec::with_capacity(data_offset);
        write_u32_le(&mut data, 0); // signature
        write_u32_le(&mut data, data_offset as u32);
        write_u32_le(&mut data, index_size as u32);
        data.extend_from_slice(&encode_sjis_name(&self.name, ARCHIVE_NAME_SIZE)?);

        // Index placeholder, backfilled once the running offsets are known.
        data.extend(std::iter::repeat_n(0u8, index_size));

        let mut index = Vec::with_capacity(index_size);
        let mut running = 0u32;
        for (entry, name_field) in self.entries.iter().zip(&name_fields) {
            index.extend_from_slice(name_field);
            write_u32_le(&mut index, running);
            write_u32_le(&mut index, entry.data.len() as u32);
            running += entry.data.len() as u32;
            data.extend_from_slice(&entry.data);
        }
        data[HEADER_SIZE..HEADER_SIZE + index_size].copy_from_slice(&index);

        Ok(data)
    }
}

/// Decode a null-padded Shift-JIS name field.
fn decode_sjis_name(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    SHIFT_JIS.decode(&field[..end]).0.into_owned()
}

/// Encode a name into a null-padded Shift-JIS field of `field_len` bytes.
///
/// A name whose encoding fills the field exactly is stored with no
/// terminator. Validation is on encoded bytes, not characters, so multi-byte
/// names cannot silently overflow the field.
fn encode_sjis_name(name: &str, field_len: usize) -> Result<Vec<u8>, AosError> {
    let (encoded, _, _) = SHIFT_JIS.encode(name);
    if encoded.len() > field_len {
        return Err(AosError::NameTooLong(name.to_string()));
    }
    let mut field = encoded.into_owned();
    field.resize(field_len, 0);
    Ok(field)
}

// Helpers
fn read_u16_le<R: Read>(r: &mut R) -> Result<u16, std::io::Error> {
    let mut buf = [0u8; 2];
    r.read_exact(&mut buf)?;
    Ok(u16::from_le_bytes(buf))
}

fn read_u32_le<R: Read>(r: &mut R) -> Result<u32, std::io::Error> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_i32_le<R: Read>(r: &mut R) -> Result<i32, std::io::Error> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(i32::from_le_bytes(buf))
}

fn write_u16_le(v: &mut Vec<u8>, val: u16) {
    v.extend_from_slice(&val.to_le_bytes());
}

fn write_u32_le(v: &mut Vec<u8>, val: u32) {
    v.extend_from_slice(&val.to_le_bytes());
}

fn write_i32_le(v: &mut Vec<u8>, val: i32) {
    v.extend_from_slice(&val.to_le_bytes());
}

// --- Bit I/O ---
//
// Huffman-coded streams pack bits most-significant-first within each byte,
// while every integer header field stays little-endian. The two conventions
// never mix: integer reads and writes only happen on byte boundaries.

struct BitWriter {
    data: Vec<u8>,
    current: u8,
    bit_pos: u8,
}

impl BitWriter {
    fn new() -> Self {
        Self {
            data: Vec::new(),
            current: 0,
            bit_pos: 0,
        }
    }

    fn write_bit(&mut self, bit: bool) {
        if bit {
            self.current |= 1 << (7 - self.bit_pos);
        }
        self.bit_pos += 1;
        if self.bit_pos == 8 {
            self.data.push(self.current);
            self.current = 0;
            self.bit_pos = 0;
        }
    }

    fn write_bits(&mut self, bits: &[bool]) {
        for &bit in bits {
            self.write_bit(bit);
        }
    }

    /// Write a whole byte, most-significant bit first.
    fn write_byte(&mut self, byte: u8) {
        for shift in (0..8).rev() {
            self.write_bit((byte >> shift) & 1 != 0);
        }
    }

    /// Aligned little-endian u32, for the size prefix ahead of any bit data.
    fn write_u32_le(&mut self, value: u32) {
        debug_assert_eq!(self.bit_pos, 0, "integer write on unaligned bit stream");
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    /// Emit the partial byte, padding the unused low positions with zeros.
    /// Does nothing on an aligned writer.
    fn flush(&mut self) {
        if self.bit_pos > 0 {
            self.data.push(self.current);
            self.current = 0;
            self.bit_pos = 0;
        }
    }

    fn finish(mut self) -> Vec<u8> {
        self.flush();
        self.data
    }
}

struct BitReader<'a> {
    data: &'a [u8],
    pos: usize,
    current: u8,
    bits_left: u8,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            current: 0,
            bits_left: 0,
        }
    }

    /// Consume the highest unread bit of the current byte. Reads past the
    /// end of the data yield zero bits; the length prefixes in the formats
    /// bound every decode loop.
    fn read_bit(&mut self) -> bool {
        if self.bits_left == 0 {
            if self.pos >= self.data.len() {
                return false;
            }
            self.current = self.data[self.pos];
            self.pos += 1;
            self.bits_left = 8;
        }
        self.bits_left -= 1;
        (self.current >> self.bits_left) & 1 != 0
    }

    /// Read `count` bits (at most 8) as an unsigned value, first bit in the
    /// highest position. Straddles byte boundaries.
    fn read_bits(&mut self, count: u8) -> u8 {
        let mut value = 0;
        for _ in 0..count {
            value = (value << 1) | self.read_bit() as u8;
        }
        value
    }

    /// Aligned little-endian u32, for the size prefix ahead of any bit data.
    fn read_u32_le(&mut self) -> Result<u32, AosError> {
        debug_assert_eq!(self.bits_left, 0, "integer read on unaligned bit stream");
        if self.pos + 4 > self.data.len() {
            return Err(AosError::Truncated);
        }
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&self.data[self.pos..self.pos + 4]);
        self.pos += 4;
        Ok(u32::from_le_bytes(buf))
    }
}

// --- Huffman script codec ---
//
// A compressed script is:
//
//   uncompressed_length:u32_le
//   tree bits - pre-order: internal = 1 <left> <right>, leaf = 0 <byte msb-first>
//   body bits - one code per input byte
//   pad bits  - zeros to the next byte boundary
//
// The encoder works on a linked tree (parent pointers are needed to walk
// each leaf up to the root), the decoder on two flat child arrays indexed by
// internal-node id. There is no reason to unify the two representations.

const HUFFMAN_LEAF_COUNT: usize = 256;
const HUFFMAN_TABLE_SIZE: usize = 511;

const NO_NODE: usize = usize::MAX;

struct HuffNode {
    symbol: u8,
    left: usize,
    right: usize,
    parent: usize,
    is_right_child: bool,
    is_leaf: bool,
}

struct HuffmanEncoder {
    nodes: Vec<HuffNode>,
    root: usize,
    /// Bit-string code per byte value; empty for absent bytes, and for the
    /// lone symbol of a single-leaf tree.
    codes: Vec<Vec<bool>>,
}

impl HuffmanEncoder {
    fn from_bytes(input: &[u8]) -> Self {
        let mut counts = [0u32; HUFFMAN_LEAF_COUNT];
        for &b in input {
            counts[b as usize] += 1;
        }

        let mut nodes = Vec::new();
        let mut heap = BinaryHeap::new();
        for (symbol, &count) in counts.iter().enumerate() {
            if count == 0 {
                continue;
            }
            let id = nodes.len();
            nodes.push(HuffNode {
                symbol: symbol as u8,
                left: NO_NODE,
                right: NO_NODE,
                parent: NO_NODE,
                is_right_child: false,
                is_leaf: true,
            });
            heap.push(Reverse((count, id)));
        }

        // Combine the two least probable nodes until one root remains. The
        // node id in the key makes tie-breaking deterministic; the format
        // only requires round-trip, not bit-identity with any other encoder.
        while heap.len() > 1 {
            let Reverse((count0, left)) = heap.pop().expect("heap has two nodes");
            let Reverse((count1, right)) = heap.pop().expect("heap has two nodes");
            let id = nodes.len();
            nodes.push(HuffNode {
                symbol: 0,
                left,
                right,
                parent: NO_NODE,
                is_right_child: false,
                is_leaf: false,
            });
            nodes[left].parent = id;
            nodes[left].is_right_child = false;
            nodes[right].parent = id;
            nodes[right].is_right_child = true;
            heap.push(Reverse((count0 + count1, id)));
        }
        let root = heap.pop().map_or(NO_NODE, |Reverse((_, id))| id);

        // Walk each leaf up to the root collecting edge bits, then reverse.
        let mut codes = vec![Vec::new(); HUFFMAN_LEAF_COUNT];
        for id in 0..nodes.len() {
            if !nodes[id].is_leaf {
                continue;
            }
            let mut bits = Vec::new();
            let mut node = id;
            while nodes[node].parent != NO_NODE {
                bits.push(nodes[node].is_right_child);
                node = nodes[node].parent;
            }
            bits.reverse();
            codes[nodes[id].symbol as usize] = bits;
        }

        Self { nodes, root, codes }
    }

    /// Pre-order bit serialization of the tree.
    fn write_tree(&self, writer: &mut BitWriter) {
        if self.root != NO_NODE {
            self.write_node(self.root, writer);
        }
    }

    fn write_node(&self, id: usize, writer: &mut BitWriter) {
        let node = &self.nodes[id];
        if node.is_leaf {
            writer.write_bit(false);
            writer.write_byte(node.symbol);
        } else {
            writer.write_bit(true);
            self.write_node(node.left, writer);
            self.write_node(node.right, writer);
        }
    }
}

/// Decoder-side tree as two flat child arrays. Values below 256 are leaf
/// byte values; values from 256 up are internal-node ids, with the root of
/// any multi-leaf tree at 256.
struct HuffmanDecoder {
    bit0: [u16; HUFFMAN_TABLE_SIZE],
    bit1: [u16; HUFFMAN_TABLE_SIZE],
    next_id: u16,
    root: u16,
}

impl HuffmanDecoder {
    fn read_tree(reader: &mut BitReader) -> Self {
        let mut decoder = Self {
            bit0: [0; HUFFMAN_TABLE_SIZE],
            bit1: [0; HUFFMAN_TABLE_SIZE],
            next_id: HUFFMAN_LEAF_COUNT as u16,
            root: 0,
        };
        decoder.root = decoder.read_node(reader);
        decoder
    }

    fn read_node(&mut self, reader: &mut BitReader) -> u16 {
        if reader.read_bit() {
            // A well-formed stream has at most 255 internal nodes (ids up
            // to 510); the cap stops runaway recursion on corrupt input.
            if self.next_id as usize >= HUFFMAN_TABLE_SIZE {
                return 0;
            }
            let id = self.next_id;
            self.next_id += 1;
            let left = self.read_node(reader);
            self.bit0[id as usize] = left;
            let right = self.read_node(reader);
            self.bit1[id as usize] = right;
            id
        } else {
            reader.read_bits(8) as u16
        }
    }

    /// Descend from the root until a leaf value falls out. On a single-leaf
    /// tree the root already is the value and no bits are consumed.
    fn decode_symbol(&self, reader: &mut BitReader) -> u8 {
        let mut id = self.root;
        while id >= HUFFMAN_LEAF_COUNT as u16 {
            id = if reader.read_bit() {
                self.bit1[id as usize]
            } else {
                self.bit0[id as usize]
            };
        }
        id as u8
    }
}

/// Compress script bytes into the engine's Huffman container.
///
/// Input is treated as opaque bytes (Shift-JIS in practice). An input with a
/// single distinct byte serializes as the degenerate one-leaf tree and an
/// empty body; `decompress_script` reproduces it from the length prefix.
pub fn compress_script(input: &[u8]) -> Vec<u8> {
    let encoder = HuffmanEncoder::from_bytes(input);
    let mut writer = BitWriter::new();
    writer.write_u32_le(input.len() as u32);
    encoder.write_tree(&mut writer);
    for &byte in input {
        writer.write_bits(&encoder.codes[byte as usize]);
    }
    writer.finish()
}

/// Decompress a Huffman-compressed script. Output length is governed by the
/// stream's length prefix; trailing pad bits are never read.
pub fn decompress_script(input: &[u8]) -> Result<Vec<u8>, AosError> {
    let mut reader = BitReader::new(input);
    let length = reader.read_u32_le()? as usize;
    let decoder = HuffmanDecoder::read_tree(&mut reader);
    let mut output = Vec::with_capacity(length);
    for _ in 0..length {
        output.push(decoder.decode_symbol(&mut reader));
    }
    Ok(output)
}

// --- ABM image codec ---

/// Expected `type` field of the BMP file header ("BM").
pub const BMP_SIGNATURE: u16 = 0x4D42;
/// Expected size of the BMP info header.
pub const BMP_INFO_SIZE: u32 = 0x28;

/// The standard 14-byte BMP file header that fronts every ABM.
#[derive(Debug, Clone)]
pub struct BmpFileHeader {
    pub file_size: u32,
    pub reserved1: u16,
    pub reserved2: u16,
    pub pixel_offset: u32,
}

/// The standard 40-byte BMP info header. In an ABM the `bit_count` field is
/// repurposed as a variant selector rather than a true bit depth.
#[derive(Debug, Clone)]
pub struct BmpInfoHeader {
    pub width: i32,
    pub height: i32,
    pub planes: u16,
    pub bit_count: u16,
    pub compression: u32,
    pub image_size: u32,
    pub x_ppm: i32,
    pub y_ppm: i32,
    pub colors_used: u32,
    pub colors_important: u32,
}

/// Animation table of a multi-frame ABM, read directly after the two BMP
/// headers. `frame_offsets` are absolute file offsets; `frame_sequence_size`
/// counts bytes, so the sequence holds half that many u16 entries.
#[derive(Debug, Clone, Serialize)]
pub struct AbmAnimationHeader {
    pub abm_type: u16,
    pub anim_mode: u16,
    pub frame_count: u32,
    pub frame_sequence_size: u32,
    pub frame_offsets: Vec<u32>,
    pub frame_sequence: Vec<u16>,
}

/// One decoded animation frame with its synthesized name (`"{stem}#{i:03}"`).
#[derive(Debug, Clone)]
pub struct AbmFrame {
    pub name: String,
    pub pixels: Vec<u8>,
}

/// Result of decoding an ABM. Pixel buffers are top-row-first; the BMP
/// writer flips them back to the bottom-first order the format stores.
#[derive(Debug, Clone)]
pub enum AbmImage {
    /// One opaque (24-bit) or transparent (32-bit) bitmap.
    Single {
        width: i32,
        height: i32,
        bit_count: u16,
        pixels: Vec<u8>,
    },
    /// Animated variant; all frames are 32-bit after decoding.
    MultiFrame {
        width: i32,
        height: i32,
        header: AbmAnimationHeader,
        frames: Vec<AbmFrame>,
    },
    /// Encoded alpha mask (bit count 8), not decoded.
    NotImplemented,
    /// Unrecognized bit count, left undecoded.
    Unknown,
}

fn read_bmp_headers(
    cursor: &mut Cursor<&[u8]>,
) -> Result<(BmpFileHeader, BmpInfoHeader), AosError> {
    let signature = read_u16_le(cursor)?;
    if signature != BMP_SIGNATURE {
        return Err(AosError::InvalidBmpSignature(signature));
    }
    let file_header = BmpFileHeader {
        file_size: read_u32_le(cursor)?,
        reserved1: read_u16_le(cursor)?,
        reserved2: read_u16_le(cursor)?,
        pixel_offset: read_u32_le(cursor)?,
    };
    let info_size = read_u32_le(cursor)?;
    if info_size != BMP_INFO_SIZE {
        return Err(AosError::InvalidBmpInfoSize(info_size));
    }
    let info_header = BmpInfoHeader {
        width: read_i32_le(cursor)?,
        height: read_i32_le(cursor)?,
        planes: read_u16_le(cursor)?,
        bit_count: read_u16_le(cursor)?,
        compression: read_u32_le(cursor)?,
        image_size: read_u32_le(cursor)?,
        x_ppm: read_i32_le(cursor)?,
        y_ppm: read_i32_le(cursor)?,
        colors_used: read_u32_le(cursor)?,
        colors_important: read_u32_le(cursor)?,
    };
    Ok((file_header, info_header))
}

fn read_animation_header(cursor: &mut Cursor<&[u8]>) -> Result<AbmAnimationHeader, AosError> {
    let abm_type = read_u16_le(cursor)?;
    let anim_mode = read_u16_le(cursor)?;
    let frame_count = read_u32_le(cursor)?;
    let frame_sequence_size = read_u32_le(cursor)?;
    if frame_count == 0 {
        return Err(AosError::NoFrames);
    }
    let mut frame_offsets = Vec::with_capacity(frame_count as usize);
    for _ in 0..frame_count {
        frame_offsets.push(read_u32_le(cursor)?);
    }
    let mut frame_sequence = Vec::with_capacity((frame_sequence_size / 2) as usize);
    for _ in 0..frame_sequence_size / 2 {
        frame_sequence.push(read_u16_le(cursor)?);
    }
    Ok(AbmAnimationHeader {
        abm_type,
        anim_mode,
        frame_count,
        frame_sequence_size,
        frame_offsets,
        frame_sequence,
    })
}

/// Decode an ABM image. `stem` seeds the synthesized frame names of the
/// multi-frame variants.
///
/// Variant dispatch on `bit_count`:
///
/// | value | meaning |
/// |---|---|
/// | 1 | animated, first frame stored as raw opaque B,G,R |
/// | 2 | animated, all frames RLE-32 |
/// | 3 | animated, all frames RLE-32 |
/// | 8 | encoded alpha mask, not decoded |
/// | 24 | single opaque bitmap, RLE-24 |
/// | 32 | single transparent bitmap, RLE-32 |
pub fn decode_abm(data: &[u8], stem: &str) -> Result<AbmImage, AosError> {
    let mut cursor = Cursor::new(data);
    let (file_header, info) = read_bmp_headers(&mut cursor)?;

    // Dimensions are only consulted by the variants that decode pixels;
    // the not-implemented and unknown arms classify on bit_count alone.
    match info.bit_count {
        1 | 2 | 3 => decode_animation(data, &mut cursor, &info, stem),
        8 => Ok(AbmImage::NotImplemented),
        24 | 32 => {
            if info.width <= 0 || info.height <= 0 {
                return Err(AosError::Truncated);
            }
            let width = info.width as usize;
            let height = info.height as usize;
            cursor.seek(SeekFrom::Start(file_header.pixel_offset as u64))?;
            let start = cursor.position() as usize;
            if start > data.len() {
                return Err(AosError::Truncated);
            }
            let bytes_per_pixel = info.bit_count as usize / 8;
            let unpacked_size = width * height * bytes_per_pixel;
            let pixels = if info.bit_count == 24 {
                decode_rle24(&data[start..], unpacked_size)
            } else {
                decode_rle32(&data[start..], unpacked_size)
            };
            Ok(AbmImage::Single {
                width: info.width,
                height: info.height,
                bit_count: info.bit_count,
                pixels: flip_vertical(&pixels, width * bytes_per_pixel),
            })
        }
        other => {
            warn!("Unrecognized ABM bit count {}", other);
            Ok(AbmImage::Unknown)
        }
    }
}

fn decode_animation(
    data: &[u8],
    cursor: &mut Cursor<&[u8]>,
    info: &BmpInfoHeader,
    stem: &str,
) -> Result<AbmImage, AosError> {
    if info.width <= 0 || info.height <= 0 {
        return Err(AosError::Truncated);
    }
    let header = read_animation_header(cursor)?;
    let width = info.width as usize;
    let height = info.height as usize;
    // Downstream the animated variants are all 32-bit; variant 1 only
    // stores its first frame without an alpha lane.
    let unpacked_size = width * height * 4;

    let mut frames = Vec::with_capacity(header.frame_count as usize);
    for (i, &offset) in header.frame_offsets.iter().enumerate() {
        let offset = offset as usize;
        if offset > data.len() {
            return Err(AosError::Truncated);
        }
        let pixels = if info.bit_count == 1 && i == 0 {
            decode_raw_bgr(&data[offset..], width, height)?
        } else {
            decode_rle32(&data[offset..], unpacked_size)
        };
        frames.push(AbmFrame {
            name: format!("{}#{:03}", stem, i),
            pixels: flip_vertical(&pixels, width * 4),
        });
    }

    Ok(AbmImage::MultiFrame {
        width: info.width,
        height: info.height,
        header,
        frames,
    })
}

/// First frame of the bit-count-1 variant: raw B,G,R triplets expanded to
/// opaque B,G,R,0xFF.
fn decode_raw_bgr(input: &[u8], width: usize, height: usize) -> Result<Vec<u8>, AosError> {
    let pixel_count = width * height;
    if input.len() < pixel_count * 3 {
        return Err(AosError::Truncated);
    }
    let mut output = Vec::with_capacity(pixel_count * 4);
    for bgr in input[..pixel_count * 3].chunks_exact(3) {
        output.extend_from_slice(&[bgr[0], bgr[1], bgr[2], 0xFF]);
    }
    Ok(output)
}

/// RLE scheme for opaque 24-bit bitmaps, 3 bytes per pixel.
///
/// Opcodes:
///   0x00 n - leave n destination bytes at zero (skip run)
///   0xFF n - copy n input bytes verbatim
///   other  - literal: write the opcode byte at i and the following input
///            byte at i+1, but advance i by only one
///
/// The literal path consumes two input bytes per destination index step;
/// that matches how the engine's own files are laid out, odd as it looks.
fn decode_rle24(input: &[u8], unpacked_size: usize) -> Vec<u8> {
    let mut output = vec![0u8; unpacked_size];
    let mut pos = 0;
    let mut i = 0;
    while i < unpacked_size && pos < input.len() {
        let op = input[pos];
        pos += 1;
        match op {
            0x00 => {
                if pos >= input.len() {
                    break;
                }
                let n = input[pos] as usize;
                pos += 1;
                i += n;
            }
            0xFF => {
                if pos >= input.len() {
                    break;
                }
                let n = input[pos] as usize;
                pos += 1;
                if n == 0 {
                    continue;
                }
                let n = n.min(unpacked_size - i).min(input.len() - pos);
                output[i..i + n].copy_from_slice(&input[pos..pos + n]);
                pos += n;
                i += n;
            }
            value => {
                output[i] = value;
                if pos < input.len() && i + 1 < unpacked_size {
                    output[i + 1] = input[pos];
                }
                pos += 1;
                i += 1;
            }
        }
    }
    output
}

/// RLE scheme for transparent 32-bit bitmaps. The input stream carries only
/// B,G,R components; every third component completes a pixel and the
/// decoder synthesizes the alpha byte itself: zero in skip runs, 0xFF in
/// copy runs, and a repeat of the source byte on the single-literal path.
fn decode_rle32(input: &[u8], unpacked_size: usize) -> Vec<u8> {
    let mut output = vec![0u8; unpacked_size];
    let mut pos = 0;
    let mut i = 0;
    let mut color_component = 0;
    while i < unpacked_size && pos < input.len() {
        let op = input[pos];
        pos += 1;
        match op {
            0x00 => {
                if pos >= input.len() {
                    break;
                }
                let n = input[pos] as usize;
                pos += 1;
                for _ in 0..n {
                    if i >= unpacked_size {
                        break;
                    }
                    i += 1;
                    color_component += 1;
                    if color_component == 3 {
                        i += 1; // alpha slot stays zero
                        color_component = 0;
                    }
                }
            }
            0xFF => {
                if pos >= input.len() {
                    break;
                }
                let n = input[pos] as usize;
                pos += 1;
                for _ in 0..n {
                    if i >= unpacked_size || pos >= input.len() {
                        break;
                    }
                    output[i] = input[pos];
                    pos += 1;
                    i += 1;
                    color_component += 1;
                    if color_component == 3 {
                        if i < unpacked_size {
                            output[i] = 0xFF;
                        }
                        i += 1;
                        color_component = 0;
                    }
                }
            }
            value => {
                output[i] = value;
                i += 1;
                color_component += 1;
                if color_component == 3 {
                    if i < unpacked_size {
                        output[i] = value;
                    }
                    i += 1;
                    color_component = 0;
                }
            }
        }
    }
    output
}

/// Reverse row order. The format stores rows bottom-first; decoded buffers
/// are handed out top-first.
fn flip_vertical(pixels: &[u8], stride: usize) -> Vec<u8> {
    if stride == 0 {
        return pixels.to_vec();
    }
    let mut output = Vec::with_capacity(pixels.len());
    for row in pixels.chunks_exact(stride).rev() {
        output.extend_from_slice(row);
    }
    output
}

// --- BMP writer ---

/// Serialize a decoded top-row-first pixel buffer as a standard BMP.
///
/// Rows are flipped back to the bottom-first order the format requires, so
/// ordinary viewers render the image upright. No row padding is emitted.
pub fn write_bmp(width: i32, height: i32, bit_count: u16, pixels: &[u8]) -> Vec<u8> {
    let stride = width.max(0) as usize * (bit_count as usize / 8);
    let mut data = Vec::with_capacity(54 + pixels.len());
    write_u16_le(&mut data, BMP_SIGNATURE);
    write_u32_le(&mut data, 54 + pixels.len() as u32); // file_size
    write_u16_le(&mut data, 0); // reserved1
    write_u16_le(&mut data, 0); // reserved2
    write_u32_le(&mut data, 54); // pixel_offset
    write_u32_le(&mut data, BMP_INFO_SIZE);
    write_i32_le(&mut data, width);
    write_i32_le(&mut data, height);
    write_u16_le(&mut data, 1); // planes
    write_u16_le(&mut data, bit_count);
    write_u32_le(&mut data, 0); // compression (BI_RGB)
    write_u32_le(&mut data, pixels.len() as u32); // image_size
    write_i32_le(&mut data, 0); // x_ppm
    write_i32_le(&mut data, 0); // y_ppm
    write_u32_le(&mut data, 0); // colors_used
    write_u32_le(&mut data, 0); // colors_important
    data.extend_from_slice(&flip_vertical(pixels, stride));
    data
}

// --- Animation sidecar ---

/// JSON sidecar emitted next to the frames of a multi-frame ABM, carrying
/// everything a repacker would need to reassemble the animation.
#[derive(Debug, Serialize)]
pub struct AnimationSidecar<'a> {
    pub version: &'static str,
    pub frames: Vec<&'a str>,
    #[serde(flatten)]
    pub header: &'a AbmAnimationHeader,
}

impl<'a> AnimationSidecar<'a> {
    #[must_use]
    pub fn new(header: &'a AbmAnimationHeader, frames: &'a [AbmFrame]) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION"),
            frames: frames.iter().map(|f| f.name.as_str()).collect(),
            header,
        }
    }
}

// --- Entry dispatch ---

fn file_stem(name: &str) -> &str {
    name.rsplit_once('.').map_or(name, |(stem, _)| stem)
}

fn file_ext(name: &str) -> &str {
    name.rsplit_once('.').map_or("", |(_, ext)| ext)
}

/// Decode one archive entry into the file(s) it extracts to.
///
/// | entry | output |
/// |---|---|
/// | `.scr` | Huffman-decoded text as `.txt` |
/// | `.abm` | one `.bmp` per image or frame, plus a `.json` sidecar for animations |
/// | `.msk` | bytes unchanged, renamed `.bmp` |
/// | other | bytes unchanged |
///
/// Script decode failures are fatal. ABM failures fall back to writing the
/// raw entry unchanged, so one damaged image cannot abort a whole
/// extraction.
pub fn decode_entry(name: &str, data: &[u8]) -> Result<Vec<(String, Vec<u8>)>, AosError> {
    let stem = file_stem(name);
    let ext = file_ext(name);

    if ext.eq_ignore_ascii_case("scr") {
        let text = decompress_script(data)?;
        return Ok(vec![(format!("{}.txt", stem), text)]);
    }

    if ext.eq_ignore_ascii_case("abm") {
        return match decode_abm(data, stem) {
            Ok(AbmImage::Single {
                width,
                height,
                bit_count,
                pixels,
            }) => Ok(vec![(
                format!("{}.bmp", stem),
                write_bmp(width, height, bit_count, &pixels),
            )]),
            Ok(AbmImage::MultiFrame {
                width,
                height,
                header,
                frames,
            }) => {
                let mut files = Vec::with_capacity(frames.len() + 1);
                for frame in &frames {
                    files.push((
                        format!("{}.bmp", frame.name),
                        write_bmp(width, height, 32, &frame.pixels),
                    ));
                }
                let sidecar = AnimationSidecar::new(&header, &frames);
                files.push((
                    format!("{}.json", stem),
                    serde_json::to_vec_pretty(&sidecar)?,
                ));
                Ok(files)
            }
            Ok(AbmImage::NotImplemented) | Ok(AbmImage::Unknown) => {
                Ok(vec![(name.to_string(), data.to_vec())])
            }
            Err(e) => {
                warn!("ABM decode failed for {}: {}; writing raw entry", name, e);
                Ok(vec![(name.to_string(), data.to_vec())])
            }
        };
    }

    if ext.eq_ignore_ascii_case("msk") {
        return Ok(vec![(format!("{}.bmp", stem), data.to_vec())]);
    }

    Ok(vec![(name.to_string(), data.to_vec())])
}

/// Encode one input file into its archive-entry form: `.txt` compresses to
/// `.scr`, everything else (ABM images included) passes through unchanged.
pub fn encode_entry(name: &str, data: &[u8]) -> (String, Vec<u8>) {
    if file_ext(name).eq_ignore_ascii_case("txt") {
        (format!("{}.scr", file_stem(name)), compress_script(data))
    } else {
        (name.to_string(), data.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Helper to build an entry from literal bytes.
    fn entry(name: &str, data: &[u8]) -> AosEntry {
        AosEntry {
            name: name.to_string(),
            data: data.to_vec(),
        }
    }

    // Minimal ABM builder: BMP file header + info header with the given
    // variant selector; pixel data / animation table appended by the caller.
    fn abm_headers(width: i32, height: i32, bit_count: u16, pixel_offset: u32) -> Vec<u8> {
        let mut data = Vec::new();
        write_u16_le(&mut data, BMP_SIGNATURE);
        write_u32_le(&mut data, 0); // file_size, unchecked
        write_u16_le(&mut data, 0);
        write_u16_le(&mut data, 0);
        write_u32_le(&mut data, pixel_offset);
        write_u32_le(&mut data, BMP_INFO_SIZE);
        write_i32_le(&mut data, width);
        write_i32_le(&mut data, height);
        write_u16_le(&mut data, 1);
        write_u16_le(&mut data, bit_count);
        for _ in 0..6 {
            write_u32_le(&mut data, 0);
        }
        data
    }

    #[test]
    fn test_bit_writer_partial_flush() {
        let mut writer = BitWriter::new();
        for _ in 0..7 {
            writer.write_bit(true);
        }
        writer.flush();
        // Seven ones land in the high positions; the unused last bit is zero.
        assert_eq!(writer.data, vec![0xFE]);
    }

    #[test]
    fn test_bit_writer_flush_idempotent() {
        let mut writer = BitWriter::new();
        writer.write_byte(0xAB);
        writer.flush();
        writer.flush();
        assert_eq!(writer.data, vec![0xAB]);
    }

    #[test]
    fn test_bit_round_trip_straddle() {
        let mut writer = BitWriter::new();
        writer.write_bits(&[true, false, true]);
        writer.write_byte(0xC5);
        let bytes = writer.finish();

        let mut reader = BitReader::new(&bytes);
        assert_eq!(reader.read_bits(3), 0b101);
        // This byte read straddles the first and second output bytes.
        assert_eq!(reader.read_bits(8), 0xC5);
    }

    #[test]
    fn test_bit_reader_msb_first() {
        let data = [0xB5]; // 0b10110101
        let mut reader = BitReader::new(&data);
        let bits: Vec<bool> = (0..8).map(|_| reader.read_bit()).collect();
        assert_eq!(bits, vec![true, false, true, true, false, true, false, true]);
    }

    #[test]
    fn test_huffman_round_trip_two_symbols() {
        let input = b"AB";
        let compressed = compress_script(input);
        let decompressed = decompress_script(&compressed).expect("Should decompress");
        assert_eq!(decompressed, input);
    }

    #[test]
    fn test_huffman_round_trip_text() {
        let input = b"the quick brown fox jumps over the lazy dog, twice over".repeat(3);
        let compressed = compress_script(&input);
        let decompressed = decompress_script(&compressed).expect("Should decompress");
        assert_eq!(decompressed, input);
    }

    #[test]
    fn test_huffman_round_trip_all_byte_values() {
        let input: Vec<u8> = (0u16..=255).map(|b| b as u8).collect::<Vec<_>>().repeat(5);
        let compressed = compress_script(&input);
        let decompressed = decompress_script(&compressed).expect("Should decompress");
        assert_eq!(decompressed, input);
    }

    #[test]
    fn test_huffman_single_distinct_byte() {
        // Degenerate one-leaf tree: the code is empty, the length prefix
        // carries all the information.
        let input = b"AAAAAAAA";
        let compressed = compress_script(input);
        let decompressed = decompress_script(&compressed).expect("Should decompress");
        assert_eq!(decompressed, input);
    }

    #[test]
    fn test_huffman_empty_input() {
        let compressed = compress_script(b"");
        let decompressed = decompress_script(&compressed).expect("Should decompress");
        assert!(decompressed.is_empty());
    }

    #[test]
    fn test_script_length_prefix() {
        let compressed = compress_script(b"ABCD");
        assert_eq!(&compressed[..4], &4u32.to_le_bytes());
    }

    #[test]
    fn test_script_truncated_input() {
        assert!(matches!(
            decompress_script(&[0x01, 0x00]),
            Err(AosError::Truncated)
        ));
    }

    #[test]
    fn test_rle24_zero_run_regression() {
        // 3-byte skip, 0xFF no-op, 1-byte skip; the trailing 0x42 is never
        // reached because the destination fills first.
        let input = [0x00, 0x03, 0xFF, 0x00, 0x00, 0x01, 0x42];
        assert_eq!(decode_rle24(&input, 4), vec![0, 0, 0, 0]);
    }

    #[test]
    fn test_rle24_noop_opcodes() {
        let input = [0x00, 0x00, 0xFF, 0x00, 0xFF, 0x02, 0xAA, 0xBB];
        assert_eq!(decode_rle24(&input, 2), vec![0xAA, 0xBB]);
    }

    #[test]
    fn test_rle24_copy_run() {
        let input = [0xFF, 0x03, 0x10, 0x20, 0x30];
        assert_eq!(decode_rle24(&input, 3), vec![0x10, 0x20, 0x30]);
    }

    #[test]
    fn test_rle24_literal_pair() {
        // A literal opcode writes itself and the byte after it, then steps
        // the destination by one.
        let input = [0x41, 0x42];
        assert_eq!(decode_rle24(&input, 2), vec![0x41, 0x42]);
    }

    #[test]
    fn test_rle32_copy_run_synthesizes_alpha() {
        let input = [0xFF, 0x06, 0x10, 0x20, 0x30, 0x40, 0x50, 0x60];
        assert_eq!(
            decode_rle32(&input, 8),
            vec![0x10, 0x20, 0x30, 0xFF, 0x40, 0x50, 0x60, 0xFF]
        );
    }

    #[test]
    fn test_rle32_skip_run_leaves_alpha_zero() {
        // Six zero components advance over two whole pixels including their
        // alpha slots.
        let input = [0x00, 0x06];
        assert_eq!(decode_rle32(&input, 8), vec![0; 8]);
    }

    #[test]
    fn test_rle32_single_literal_duplicates_alpha() {
        let input = [0x01, 0x02, 0x03];
        assert_eq!(decode_rle32(&input, 4), vec![0x01, 0x02, 0x03, 0x03]);
    }

    #[test]
    fn test_flip_1x1_identity() {
        assert_eq!(flip_vertical(&[1, 2, 3], 3), vec![1, 2, 3]);
    }

    #[test]
    fn test_flip_2x2_rows() {
        // Bottom-first storage R2 R3 / R0 R1 flips to reading order.
        let bottom_first = [
            2, 2, 2, 3, 3, 3, //
            0, 0, 0, 1, 1, 1,
        ];
        let flipped = flip_vertical(&bottom_first, 6);
        assert_eq!(flipped, vec![0, 0, 0, 1, 1, 1, 2, 2, 2, 3, 3, 3]);
    }

    #[test]
    fn test_empty_archive_is_header_only() {
        let archive = AosArchive::new("empty.aos");
        let data = archive.serialize().expect("Should serialize");
        assert_eq!(data.len(), HEADER_SIZE);
        assert_eq!(&data[4..8], &273u32.to_le_bytes()); // data_offset
        assert_eq!(&data[8..12], &0u32.to_le_bytes()); // index_size

        let parsed = AosArchive::parse(&data).expect("Should parse");
        assert_eq!(parsed.name, "empty.aos");
        assert!(parsed.entries.is_empty());
    }

    #[test]
    fn test_entry_offset_chain() {
        let mut archive = AosArchive::new("chain.aos");
        archive.add_entry(entry("a.bin", &vec![1; 100]));
        archive.add_entry(entry("b.bin", &vec![2; 200]));
        archive.add_entry(entry("c.bin", &vec![3; 50]));

        let data = archive.serialize().expect("Should serialize");
        assert_eq!(&data[4..8], &393u32.to_le_bytes()); // 273 + 3 * 40

        // Offsets at entry_start + 32 are the running sizes of everything
        // before: 0, 100, 300.
        for (i, expected) in [0u32, 100, 300].iter().enumerate() {
            let at = HEADER_SIZE + i * ENTRY_SIZE + ENTRY_NAME_SIZE;
            assert_eq!(&data[at..at + 4], &expected.to_le_bytes());
        }

        let parsed = AosArchive::parse(&data).expect("Should parse");
        assert_eq!(parsed.entries.len(), 3);
        assert_eq!(parsed.entries[1].data, vec![2; 200]);
    }

    #[test]
    fn test_name_exactly_32_bytes_no_terminator() {
        let name = "a".repeat(32);
        let mut archive = AosArchive::new("full.aos");
        archive.add_entry(entry(&name, b"x"));

        let data = archive.serialize().expect("Should serialize");
        assert_eq!(&data[HEADER_SIZE..HEADER_SIZE + 32], name.as_bytes());

        let parsed = AosArchive::parse(&data).expect("Should parse");
        assert_eq!(parsed.entries[0].name, name);
    }

    #[test]
    fn test_name_too_long_fails_whole_serialize() {
        let mut archive = AosArchive::new("bad.aos");
        archive.add_entry(entry("ok.bin", b"x"));
        archive.add_entry(entry(&"b".repeat(33), b"y"));
        assert!(matches!(archive.serialize(), Err(AosError::NameTooLong(_))));
    }

    #[test]
    fn test_name_length_checked_in_shift_jis_bytes() {
        // 17 characters but 34 Shift-JIS bytes: must be rejected even though
        // the character count fits.
        let name = "あ".repeat(17);
        let mut archive = AosArchive::new("sjis.aos");
        archive.add_entry(entry(&name, b"x"));
        assert!(matches!(archive.serialize(), Err(AosError::NameTooLong(_))));
    }

    #[test]
    fn test_shift_jis_name_round_trip() {
        let mut archive = AosArchive::new("日本語.aos");
        archive.add_entry(entry("シナリオ.scr", b"data"));

        let data = archive.serialize().expect("Should serialize");
        let parsed = AosArchive::parse(&data).expect("Should parse");
        assert_eq!(parsed.name, "日本語.aos");
        assert_eq!(parsed.entries[0].name, "シナリオ.scr");
    }

    #[test]
    fn test_archive_byte_round_trip() {
        let mut archive = AosArchive::new("rt.aos");
        archive.add_entry(entry("one.scr", &compress_script(b"hello")));
        archive.add_entry(entry("two.dat", &[0xDE, 0xAD, 0xBE, 0xEF]));

        let first = archive.serialize().expect("Should serialize");
        let reparsed = AosArchive::parse(&first).expect("Should parse");
        let second = reparsed.serialize().expect("Should serialize again");
        assert_eq!(first, second);
    }

    #[test]
    fn test_abm_single_24bit() {
        // 2x2 opaque image, one copy run of all 12 bytes, stored bottom-first.
        let mut data = abm_headers(2, 2, 24, 54);
        data.extend_from_slice(&[0xFF, 12]);
        data.extend_from_slice(&[
            2, 2, 2, 3, 3, 3, // bottom row
            0, 0, 0, 1, 1, 1, // top row
        ]);

        let image = decode_abm(&data, "img").expect("Should decode");
        match image {
            AbmImage::Single {
                width,
                height,
                bit_count,
                pixels,
            } => {
                assert_eq!((width, height, bit_count), (2, 2, 24));
                assert_eq!(pixels, vec![0, 0, 0, 1, 1, 1, 2, 2, 2, 3, 3, 3]);
            }
            other => panic!("Expected Single, got {:?}", other),
        }
    }

    #[test]
    fn test_abm_single_32bit_length() {
        let mut data = abm_headers(2, 1, 32, 54);
        data.extend_from_slice(&[0xFF, 0x06, 1, 2, 3, 4, 5, 6]);

        let image = decode_abm(&data, "img").expect("Should decode");
        match image {
            AbmImage::Single { pixels, .. } => {
                // Exactly width * height * 4 bytes with synthesized alpha.
                assert_eq!(pixels, vec![1, 2, 3, 0xFF, 4, 5, 6, 0xFF]);
            }
            other => panic!("Expected Single, got {:?}", other),
        }
    }

    #[test]
    fn test_abm_multi_frame_names() {
        // 1x1, variant 2, three RLE-32 frames.
        let mut data = abm_headers(1, 1, 2, 0);
        write_u16_le(&mut data, 7); // abm_type
        write_u16_le(&mut data, 1); // anim_mode
        write_u32_le(&mut data, 3); // frame_count
        write_u32_le(&mut data, 4); // frame_sequence_size in bytes
        let offsets_at = data.len();
        for _ in 0..3 {
            write_u32_le(&mut data, 0); // frame offsets, patched below
        }
        write_u16_le(&mut data, 0);
        write_u16_le(&mut data, 1);

        let frame = [0xFF, 0x03, 0x10, 0x20, 0x30];
        for i in 0..3usize {
            let offset = data.len() as u32;
            data[offsets_at + i * 4..offsets_at + i * 4 + 4]
                .copy_from_slice(&offset.to_le_bytes());
            data.extend_from_slice(&frame);
        }

        let image = decode_abm(&data, "abc").expect("Should decode");
        match image {
            AbmImage::MultiFrame { header, frames, .. } => {
                assert_eq!(header.frame_count, 3);
                assert_eq!(header.frame_sequence, vec![0, 1]);
                let names: Vec<&str> = frames.iter().map(|f| f.name.as_str()).collect();
                assert_eq!(names, vec!["abc#000", "abc#001", "abc#002"]);
                assert_eq!(frames[0].pixels, vec![0x10, 0x20, 0x30, 0xFF]);
            }
            other => panic!("Expected MultiFrame, got {:?}", other),
        }
    }

    #[test]
    fn test_abm_variant1_raw_first_frame() {
        // 1x2, variant 1: first frame raw B,G,R triplets, second RLE-32.
        let mut data = abm_headers(1, 2, 1, 0);
        write_u16_le(&mut data, 0);
        write_u16_le(&mut data, 0);
        write_u32_le(&mut data, 2);
        write_u32_le(&mut data, 0);
        let offsets_at = data.len();
        write_u32_le(&mut data, 0);
        write_u32_le(&mut data, 0);

        let first = data.len() as u32;
        data.extend_from_slice(&[1, 2, 3, 4, 5, 6]); // two raw pixels
        let second = data.len() as u32;
        data.extend_from_slice(&[0x00, 0x06]); // fully transparent
        data[offsets_at..offsets_at + 4].copy_from_slice(&first.to_le_bytes());
        data[offsets_at + 4..offsets_at + 8].copy_from_slice(&second.to_le_bytes());

        let image = decode_abm(&data, "v1").expect("Should decode");
        match image {
            AbmImage::MultiFrame { frames, .. } => {
                // Raw rows are flipped like any other frame.
                assert_eq!(frames[0].pixels, vec![4, 5, 6, 0xFF, 1, 2, 3, 0xFF]);
                assert_eq!(frames[1].pixels, vec![0; 8]);
            }
            other => panic!("Expected MultiFrame, got {:?}", other),
        }
    }

    #[test]
    fn test_abm_zero_frames_is_fatal() {
        let mut data = abm_headers(1, 1, 2, 0);
        write_u16_le(&mut data, 0);
        write_u16_le(&mut data, 0);
        write_u32_le(&mut data, 0); // frame_count
        write_u32_le(&mut data, 0);
        assert!(matches!(decode_abm(&data, "x"), Err(AosError::NoFrames)));
    }

    #[test]
    fn test_abm_bit_count_8_not_implemented() {
        let data = abm_headers(4, 4, 8, 54);
        assert!(matches!(
            decode_abm(&data, "x"),
            Ok(AbmImage::NotImplemented)
        ));
    }

    #[test]
    fn test_abm_unknown_bit_count() {
        let data = abm_headers(4, 4, 16, 54);
        assert!(matches!(decode_abm(&data, "x"), Ok(AbmImage::Unknown)));
    }

    #[test]
    fn test_abm_undecoded_variants_ignore_dimensions() {
        // Variants that never touch pixels classify on bit_count alone,
        // even when width or height is garbage.
        let data = abm_headers(0, -3, 8, 54);
        assert!(matches!(
            decode_abm(&data, "x"),
            Ok(AbmImage::NotImplemented)
        ));

        let data = abm_headers(0, 0, 16, 54);
        assert!(matches!(decode_abm(&data, "x"), Ok(AbmImage::Unknown)));
    }

    #[test]
    fn test_abm_decoded_variants_reject_bad_dimensions() {
        let data = abm_headers(0, 2, 24, 54);
        assert!(matches!(decode_abm(&data, "x"), Err(AosError::Truncated)));

        let mut data = abm_headers(-1, 1, 2, 0);
        write_u16_le(&mut data, 0);
        write_u16_le(&mut data, 0);
        write_u32_le(&mut data, 1); // frame_count
        write_u32_le(&mut data, 0);
        write_u32_le(&mut data, 0); // frame offset
        assert!(matches!(decode_abm(&data, "x"), Err(AosError::Truncated)));
    }

    #[test]
    fn test_abm_bad_signature() {
        let mut data = abm_headers(1, 1, 24, 54);
        data[0] = b'X';
        assert!(matches!(
            decode_abm(&data, "x"),
            Err(AosError::InvalidBmpSignature(_))
        ));
    }

    #[test]
    fn test_abm_bad_info_size() {
        let mut data = abm_headers(1, 1, 24, 54);
        data[14] = 0x29;
        assert!(matches!(
            decode_abm(&data, "x"),
            Err(AosError::InvalidBmpInfoSize(0x29))
        ));
    }

    #[test]
    fn test_bmp_writer_emits_bottom_first() {
        // A top-first 1x2 buffer comes back out bottom-first after the header.
        let pixels = [1, 1, 1, 2, 2, 2];
        let bmp = write_bmp(1, 2, 24, &pixels);
        assert_eq!(&bmp[..2], b"BM");
        assert_eq!(&bmp[18..22], &1i32.to_le_bytes());
        assert_eq!(&bmp[22..26], &2i32.to_le_bytes());
        assert_eq!(&bmp[54..], &[2, 2, 2, 1, 1, 1]);
    }

    #[test]
    fn test_decode_entry_script() {
        let files = decode_entry("start.scr", &compress_script(b"hello")).expect("Should decode");
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].0, "start.txt");
        assert_eq!(files[0].1, b"hello");
    }

    #[test]
    fn test_decode_entry_mask_renamed() {
        let files = decode_entry("shadow.msk", &[1, 2, 3]).expect("Should decode");
        assert_eq!(files[0].0, "shadow.bmp");
        assert_eq!(files[0].1, vec![1, 2, 3]);
    }

    #[test]
    fn test_decode_entry_abm_failure_writes_raw() {
        // Garbage that fails the BMP signature check falls back to the raw
        // entry under its original name.
        let files = decode_entry("broken.abm", &[0x00, 0x01, 0x02]).expect("Should decode");
        assert_eq!(files[0].0, "broken.abm");
        assert_eq!(files[0].1, vec![0x00, 0x01, 0x02]);
    }

    #[test]
    fn test_decode_entry_passthrough() {
        let files = decode_entry("voice.ogg", &[9, 9]).expect("Should decode");
        assert_eq!(files[0].0, "voice.ogg");
    }

    #[test]
    fn test_encode_entry_text_to_script() {
        let (name, data) = encode_entry("start.txt", b"hello");
        assert_eq!(name, "start.scr");
        assert_eq!(
            decompress_script(&data).expect("Should decompress"),
            b"hello"
        );
    }

    #[test]
    fn test_encode_entry_abm_passthrough() {
        let (name, data) = encode_entry("cg01.abm", &[1, 2, 3]);
        assert_eq!(name, "cg01.abm");
        assert_eq!(data, vec![1, 2, 3]);
    }

    #[test]
    fn test_sidecar_fields() {
        let header = AbmAnimationHeader {
            abm_type: 7,
            anim_mode: 1,
            frame_count: 2,
            frame_sequence_size: 4,
            frame_offsets: vec![100, 200],
            frame_sequence: vec![0, 1],
        };
        let frames = vec![
            AbmFrame {
                name: "a#000".to_string(),
                pixels: Vec::new(),
            },
            AbmFrame {
                name: "a#001".to_string(),
                pixels: Vec::new(),
            },
        ];
        let json =
            serde_json::to_value(AnimationSidecar::new(&header, &frames)).expect("Should serialize");
        assert_eq!(json["frames"][1], "a#001");
        assert_eq!(json["abm_type"], 7);
        assert_eq!(json["frame_offsets"][1], 200);
    }
}
