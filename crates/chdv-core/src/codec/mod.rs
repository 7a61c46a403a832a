//! Block payload codecs and the per-file codec table.

pub mod bitstream;
pub mod cd;
pub mod ecc;
pub mod flac;
pub mod huffman;
pub mod lzma;
pub mod zlib;

use crate::error::{ChdError, Result};

pub const fn make_tag(tag: &[u8; 4]) -> u32 {
    u32::from_be_bytes(*tag)
}

/// Codec fourcc tags a file may name in its header.
pub mod tags {
    use super::make_tag;

    pub const ZLIB: u32 = make_tag(b"zlib");
    pub const LZMA: u32 = make_tag(b"lzma");
    pub const HUFFMAN: u32 = make_tag(b"huff");
    pub const FLAC: u32 = make_tag(b"flac");
    pub const CD_ZLIB: u32 = make_tag(b"cdzl");
    pub const CD_LZMA: u32 = make_tag(b"cdlz");
    pub const CD_FLAC: u32 = make_tag(b"cdfl");
    pub const AV_HUFFMAN: u32 = make_tag(b"avhu");
}

/// A codec this crate can decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecKind {
    Zlib,
    Lzma,
    Huffman,
    Flac,
    CdZlib,
    CdLzma,
}

impl CodecKind {
    fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            tags::ZLIB => Some(Self::Zlib),
            tags::LZMA => Some(Self::Lzma),
            tags::HUFFMAN => Some(Self::Huffman),
            tags::FLAC => Some(Self::Flac),
            tags::CD_ZLIB => Some(Self::CdZlib),
            tags::CD_LZMA => Some(Self::CdLzma),
            _ => None,
        }
    }

    pub fn decompress(self, input: &[u8], output: &mut [u8]) -> Result<()> {
        match self {
            Self::Zlib => zlib::decompress(input, output),
            Self::Lzma => lzma::decompress(input, output),
            Self::Huffman => huffman::decompress(input, output),
            Self::Flac => flac::decompress(input, output),
            Self::CdZlib => cd::decompress(cd::BaseCodec::Zlib, input, output),
            Self::CdLzma => cd::decompress(cd::BaseCodec::Lzma, input, output),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    tag: u32,
    kind: Option<CodecKind>,
}

/// The up-to-four codecs a file's header declares.
///
/// A recognized-but-undecodable tag (`cdfl`, `avhu`, ...) stays in the
/// table and only fails when a block actually selects it, so files that
/// declare such a codec without using it still verify.
#[derive(Debug, Clone, Copy)]
pub struct CodecTable {
    slots: [Option<Slot>; 4],
}

impl CodecTable {
    /// Builds the table from the header's tag list; a zero tag leaves the
    /// slot empty.
    pub fn from_tags(tags: [u32; 4]) -> Self {
        let slots = tags.map(|tag| {
            (tag != 0).then_some(Slot {
                tag,
                kind: CodecKind::from_tag(tag),
            })
        });
        Self { slots }
    }

    /// Decodes a block payload with the codec in `slot`.
    pub fn decompress(&self, slot: u8, input: &[u8], output: &mut [u8]) -> Result<()> {
        let entry = self
            .slots
            .get(slot as usize)
            .copied()
            .flatten()
            .ok_or(ChdError::InvalidFormat("block selects an empty codec slot"))?;
        match entry.kind {
            Some(kind) => kind.decompress(input, output),
            None => Err(ChdError::UnsupportedCodec(entry.tag)),
        }
    }

    /// Tag stored in a slot, if any.
    pub fn tag(&self, slot: u8) -> Option<u32> {
        self.slots.get(slot as usize).copied().flatten().map(|s| s.tag)
    }
}
