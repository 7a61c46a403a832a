//! File header and block map parsing for format versions 3 through 5.

use std::io::{Read, Seek, SeekFrom};

use byteorder::{BigEndian, ByteOrder};

use crate::codec::bitstream::BitReader;
use crate::codec::huffman::HuffmanDecoder;
use crate::codec::{tags, CodecTable};
use crate::digest;
use crate::error::{ChdError, Result};
use crate::map::{BlockCrc, BlockKind, BlockMap, BlockMapEntry};

pub const MAGIC: &[u8; 8] = b"MComprHD";

const V3_HEADER_LEN: u32 = 120;
const V4_HEADER_LEN: u32 = 108;
const V5_HEADER_LEN: u32 = 124;

// Anything larger is a corrupt header, not a real image.
const MAX_BLOCK_BYTES: u32 = 64 * 1024 * 1024;

// legacy (v3/v4) map entry types, low nibble of the flags byte
const LEGACY_COMPRESSED: u8 = 1;
const LEGACY_UNCOMPRESSED: u8 = 2;
const LEGACY_MINI: u8 = 3;
const LEGACY_SELF: u8 = 4;
const LEGACY_PARENT: u8 = 5;
const LEGACY_FLAG_NO_CRC: u8 = 0x10;

// v5 compressed-map block types
const COMP_NONE: u8 = 4;
const COMP_SELF: u8 = 5;
const COMP_PARENT: u8 = 6;
const COMP_RLE_SMALL: u8 = 7;
const COMP_RLE_LARGE: u8 = 8;
const COMP_SELF_0: u8 = 9;
const COMP_SELF_1: u8 = 10;
const COMP_PARENT_SELF: u8 = 11;
const COMP_PARENT_0: u8 = 12;
const COMP_PARENT_1: u8 = 13;

/// Parsed file header, normalized across versions.
#[derive(Debug, Clone)]
pub struct ChdHeader {
    pub version: u32,
    pub block_bytes: u32,
    pub total_blocks: u32,
    pub logical_bytes: u64,
    pub map_offset: u64,
    pub meta_offset: u64,
    pub codec_tags: [u32; 4],
    /// Recorded MD5 of the decoded stream (v3 only).
    pub data_md5: Option<[u8; 16]>,
    /// Recorded SHA-1 of the decoded stream (v3 `sha1`, v4/v5 `rawsha1`).
    pub data_sha1: Option<[u8; 20]>,
}

impl ChdHeader {
    pub fn read<R: Read>(reader: &mut R) -> Result<Self> {
        let mut prefix = [0u8; 16];
        reader.read_exact(&mut prefix)?;
        if &prefix[..8] != MAGIC {
            return Err(ChdError::InvalidFormat("bad magic"));
        }
        let length = BigEndian::read_u32(&prefix[8..]);
        let version = BigEndian::read_u32(&prefix[12..]);
        let expected_len = match version {
            3 => V3_HEADER_LEN,
            4 => V4_HEADER_LEN,
            5 => V5_HEADER_LEN,
            other => return Err(ChdError::UnsupportedVersion(other)),
        };
        if length != expected_len {
            return Err(ChdError::InvalidFormat("header length does not match version"));
        }

        // field offsets below are relative to the end of the 16-byte prefix
        let mut body = vec![0u8; (length - 16) as usize];
        reader.read_exact(&mut body)?;
        let header = match version {
            3 => Self::parse_v3(&body)?,
            4 => Self::parse_v4(&body)?,
            _ => Self::parse_v5(&body)?,
        };

        if header.block_bytes == 0 || header.block_bytes > MAX_BLOCK_BYTES {
            return Err(ChdError::InvalidFormat("implausible block size"));
        }
        Ok(header)
    }

    fn parse_v3(body: &[u8]) -> Result<Self> {
        let flags = BigEndian::read_u32(&body[0..]);
        if flags & 1 != 0 {
            return Err(ChdError::InvalidFormat("image requires a parent file"));
        }
        let compression = BigEndian::read_u32(&body[4..]);
        let md5: [u8; 16] = body[28..44].try_into().unwrap();
        let sha1: [u8; 20] = body[64..84].try_into().unwrap();
        let total_blocks = BigEndian::read_u32(&body[8..]);
        let block_bytes = BigEndian::read_u32(&body[60..]);
        let logical_bytes = BigEndian::read_u64(&body[12..]);
        if !blocks_fit(total_blocks, block_bytes, logical_bytes) {
            return Err(ChdError::InvalidFormat(
                "block count inconsistent with logical size",
            ));
        }
        Ok(Self {
            version: 3,
            block_bytes,
            total_blocks,
            logical_bytes,
            map_offset: u64::from(V3_HEADER_LEN),
            meta_offset: BigEndian::read_u64(&body[20..]),
            codec_tags: legacy_codec_tags(compression)?,
            data_md5: (!digest::is_absent(&md5)).then_some(md5),
            data_sha1: (!digest::is_absent(&sha1)).then_some(sha1),
        })
    }

    fn parse_v4(body: &[u8]) -> Result<Self> {
        let flags = BigEndian::read_u32(&body[0..]);
        if flags & 1 != 0 {
            return Err(ChdError::InvalidFormat("image requires a parent file"));
        }
        let compression = BigEndian::read_u32(&body[4..]);
        let raw_sha1: [u8; 20] = body[72..92].try_into().unwrap();
        let total_blocks = BigEndian::read_u32(&body[8..]);
        let block_bytes = BigEndian::read_u32(&body[28..]);
        let logical_bytes = BigEndian::read_u64(&body[12..]);
        if !blocks_fit(total_blocks, block_bytes, logical_bytes) {
            return Err(ChdError::InvalidFormat(
                "block count inconsistent with logical size",
            ));
        }
        Ok(Self {
            version: 4,
            block_bytes,
            total_blocks,
            logical_bytes,
            map_offset: u64::from(V4_HEADER_LEN),
            meta_offset: BigEndian::read_u64(&body[20..]),
            codec_tags: legacy_codec_tags(compression)?,
            data_md5: None,
            data_sha1: (!digest::is_absent(&raw_sha1)).then_some(raw_sha1),
        })
    }

    fn parse_v5(body: &[u8]) -> Result<Self> {
        let mut codec_tags = [0u32; 4];
        for (i, tag) in codec_tags.iter_mut().enumerate() {
            *tag = BigEndian::read_u32(&body[i * 4..]);
        }
        let parent_sha1 = &body[88..108];
        if !digest::is_absent(parent_sha1) {
            return Err(ChdError::InvalidFormat("image requires a parent file"));
        }
        let logical_bytes = BigEndian::read_u64(&body[16..]);
        let block_bytes = BigEndian::read_u32(&body[40..]);
        if block_bytes == 0 {
            return Err(ChdError::InvalidFormat("implausible block size"));
        }
        let total_blocks = logical_bytes
            .div_ceil(u64::from(block_bytes))
            .try_into()
            .map_err(|_| ChdError::InvalidFormat("block count overflows"))?;
        let raw_sha1: [u8; 20] = body[48..68].try_into().unwrap();
        Ok(Self {
            version: 5,
            block_bytes,
            total_blocks,
            logical_bytes,
            map_offset: BigEndian::read_u64(&body[24..]),
            meta_offset: BigEndian::read_u64(&body[32..]),
            codec_tags,
            data_md5: None,
            data_sha1: (!digest::is_absent(&raw_sha1)).then_some(raw_sha1),
        })
    }

    pub fn codec_table(&self) -> CodecTable {
        CodecTable::from_tags(self.codec_tags)
    }

    /// True for a v5 file whose blocks are stored without compression.
    fn uncompressed_v5(&self) -> bool {
        self.version == 5 && self.codec_tags[0] == 0
    }

    /// Reads and decodes the block map that follows this header.
    pub fn read_map<R: Read + Seek>(&self, reader: &mut R) -> Result<BlockMap> {
        reader.seek(SeekFrom::Start(self.map_offset))?;
        match self.version {
            3 | 4 => self.read_legacy_map(reader),
            5 if self.uncompressed_v5() => self.read_v5_uncompressed_map(reader),
            5 => self.read_v5_compressed_map(reader),
            other => Err(ChdError::UnsupportedVersion(other)),
        }
    }

    fn read_legacy_map<R: Read>(&self, reader: &mut R) -> Result<BlockMap> {
        let mut raw = vec![0u8; self.total_blocks as usize * 16];
        reader.read_exact(&mut raw)?;
        let mut entries = Vec::with_capacity(self.total_blocks as usize);
        for chunk in raw.chunks_exact(16) {
            let offset = BigEndian::read_u64(chunk);
            let crc = BigEndian::read_u32(&chunk[8..]);
            let length =
                u32::from(BigEndian::read_u16(&chunk[12..])) | (u32::from(chunk[14]) << 16);
            let flags = chunk[15];
            let kind = match flags & 0x0f {
                LEGACY_COMPRESSED => BlockKind::CodecSlot(0),
                LEGACY_UNCOMPRESSED => BlockKind::Raw,
                LEGACY_MINI => BlockKind::Mini,
                LEGACY_SELF => BlockKind::SelfRef,
                LEGACY_PARENT => {
                    return Err(ChdError::InvalidFormat("image requires a parent file"))
                }
                _ => return Err(ChdError::InvalidFormat("unknown block type in map")),
            };
            // mini and self entries carry no payload regardless of the
            // stored length field
            let length = match kind {
                BlockKind::Mini | BlockKind::SelfRef => 0,
                _ => length,
            };
            let crc = if flags & LEGACY_FLAG_NO_CRC != 0 {
                BlockCrc::None
            } else {
                BlockCrc::Crc32(crc)
            };
            entries.push(BlockMapEntry::new(kind, offset, length, crc));
        }
        Ok(BlockMap::new(entries))
    }

    fn read_v5_uncompressed_map<R: Read>(&self, reader: &mut R) -> Result<BlockMap> {
        let mut raw = vec![0u8; self.total_blocks as usize * 4];
        reader.read_exact(&mut raw)?;
        let entries = raw
            .chunks_exact(4)
            .map(|chunk| {
                let value = BigEndian::read_u32(chunk);
                if value == 0 {
                    // unallocated block reads as zeroes
                    BlockMapEntry::new(BlockKind::Mini, 0, 0, BlockCrc::None)
                } else {
                    BlockMapEntry::new(
                        BlockKind::Raw,
                        u64::from(value) * u64::from(self.block_bytes),
                        self.block_bytes,
                        BlockCrc::None,
                    )
                }
            })
            .collect();
        Ok(BlockMap::new(entries))
    }

    fn read_v5_compressed_map<R: Read>(&self, reader: &mut R) -> Result<BlockMap> {
        let mut map_header = [0u8; 16];
        reader.read_exact(&mut map_header)?;
        let comp_length = BigEndian::read_u32(&map_header);
        let first_offset = BigEndian::read_u48(&map_header[4..]);
        let map_crc = BigEndian::read_u16(&map_header[10..]);
        let length_bits = u32::from(map_header[12]);
        let self_bits = u32::from(map_header[13]);
        let parent_bits = u32::from(map_header[14]);
        if length_bits > 32 || self_bits > 32 || parent_bits > 32 {
            return Err(ChdError::InvalidFormat("implausible map field widths"));
        }
        // a compressed map never exceeds its raw form plus the code-length
        // tree; anything bigger is a corrupt header, not a real map
        if comp_length as usize > self.total_blocks as usize * 12 + 64 {
            return Err(ChdError::InvalidFormat("implausible compressed map size"));
        }

        let mut compressed = vec![0u8; comp_length as usize];
        reader.read_exact(&mut compressed)?;
        let mut bits = BitReader::new(&compressed);
        let mut decoder = HuffmanDecoder::new(16, 8);
        decoder.import_tree_rle(&mut bits)?;

        // first pass: block types, with run-length escapes
        let total = self.total_blocks as usize;
        let mut comp_types = vec![0u8; total];
        let mut last_comp = 0u8;
        let mut repeat = 0u32;
        for slot in comp_types.iter_mut() {
            if repeat > 0 {
                *slot = last_comp;
                repeat -= 1;
                continue;
            }
            let value = decoder.decode_one(&mut bits) as u8;
            match value {
                COMP_RLE_SMALL => {
                    *slot = last_comp;
                    repeat = 2 + decoder.decode_one(&mut bits);
                }
                COMP_RLE_LARGE => {
                    *slot = last_comp;
                    repeat = 2 + 16 + (decoder.decode_one(&mut bits) << 4);
                    repeat += decoder.decode_one(&mut bits);
                }
                value => {
                    last_comp = value;
                    *slot = value;
                }
            }
        }

        // second pass: per-block fields, rebuilding the raw map for the
        // checksum
        let mut raw_map = vec![0u8; total * 12];
        let mut entries = Vec::with_capacity(total);
        let mut cur_offset = first_offset;
        let mut last_self = 0u32;
        for (raw, &comp) in raw_map.chunks_exact_mut(12).zip(&comp_types) {
            let mut raw_comp = comp;
            let mut raw_length = 0u32;
            let mut raw_crc = 0u16;
            let entry = match comp {
                0..=3 => {
                    let length = bits.read(length_bits);
                    let offset = cur_offset;
                    cur_offset += u64::from(length);
                    let crc = bits.read(16) as u16;
                    raw_length = length;
                    raw_crc = crc;
                    BlockMapEntry::new(
                        BlockKind::CodecSlot(comp),
                        offset,
                        length,
                        BlockCrc::Crc16(crc),
                    )
                }
                COMP_NONE => {
                    let offset = cur_offset;
                    cur_offset += u64::from(self.block_bytes);
                    let crc = bits.read(16) as u16;
                    raw_length = self.block_bytes;
                    raw_crc = crc;
                    BlockMapEntry::new(
                        BlockKind::Raw,
                        offset,
                        self.block_bytes,
                        BlockCrc::Crc16(crc),
                    )
                }
                COMP_SELF => {
                    last_self = bits.read(self_bits);
                    BlockMapEntry::new(BlockKind::SelfRef, u64::from(last_self), 0, BlockCrc::None)
                }
                COMP_SELF_0 | COMP_SELF_1 => {
                    if comp == COMP_SELF_1 {
                        last_self += 1;
                    }
                    raw_comp = COMP_SELF;
                    BlockMapEntry::new(BlockKind::SelfRef, u64::from(last_self), 0, BlockCrc::None)
                }
                COMP_PARENT | COMP_PARENT_SELF | COMP_PARENT_0 | COMP_PARENT_1 => {
                    return Err(ChdError::InvalidFormat("image requires a parent file"))
                }
                _ => return Err(ChdError::InvalidFormat("unknown block type in map")),
            };
            raw[0] = raw_comp;
            raw[1] = (raw_length >> 16) as u8;
            raw[2] = (raw_length >> 8) as u8;
            raw[3] = raw_length as u8;
            raw[4] = (entry.offset >> 40) as u8;
            raw[5] = (entry.offset >> 32) as u8;
            raw[6] = (entry.offset >> 24) as u8;
            raw[7] = (entry.offset >> 16) as u8;
            raw[8] = (entry.offset >> 8) as u8;
            raw[9] = entry.offset as u8;
            raw[10] = (raw_crc >> 8) as u8;
            raw[11] = raw_crc as u8;
            entries.push(entry);
        }
        if bits.overflow() {
            return Err(ChdError::InvalidFormat("compressed map truncated"));
        }
        let actual = crc16::State::<crc16::CCITT_FALSE>::calculate(&raw_map);
        if actual != map_crc {
            return Err(ChdError::InvalidFormat("compressed map checksum mismatch"));
        }
        Ok(BlockMap::new(entries))
    }
}

/// True when `total` blocks of `block_bytes` cover `logical_bytes` with
/// every block but the last full and the last non-empty. Header-declared
/// counts that fail this would let a corrupt file demand an arbitrarily
/// large map allocation.
fn blocks_fit(total: u32, block_bytes: u32, logical_bytes: u64) -> bool {
    let total = u64::from(total);
    let block_bytes = u64::from(block_bytes);
    logical_bytes <= total * block_bytes
        && (total == 0 || logical_bytes > (total - 1) * block_bytes)
}

fn legacy_codec_tags(compression: u32) -> Result<[u32; 4]> {
    match compression {
        0 => Ok([0; 4]),
        // plain zlib and "zlib+" decode identically
        1 | 2 => Ok([tags::ZLIB, 0, 0, 0]),
        3 => Ok([tags::AV_HUFFMAN, 0, 0, 0]),
        _ => Err(ChdError::InvalidFormat("unknown legacy compression type")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn v5_header_bytes(
        codec_tags: [u32; 4],
        logical_bytes: u64,
        block_bytes: u32,
        map_offset: u64,
    ) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&V5_HEADER_LEN.to_be_bytes());
        out.extend_from_slice(&5u32.to_be_bytes());
        for tag in codec_tags {
            out.extend_from_slice(&tag.to_be_bytes());
        }
        out.extend_from_slice(&logical_bytes.to_be_bytes());
        out.extend_from_slice(&map_offset.to_be_bytes());
        out.extend_from_slice(&0u64.to_be_bytes()); // metaoffset
        out.extend_from_slice(&block_bytes.to_be_bytes());
        out.extend_from_slice(&block_bytes.to_be_bytes()); // unitbytes
        out.extend_from_slice(&[0x11; 20]); // rawsha1
        out.extend_from_slice(&[0x22; 20]); // sha1
        out.extend_from_slice(&[0x00; 20]); // parentsha1
        assert_eq!(out.len(), V5_HEADER_LEN as usize);
        out
    }

    #[test]
    fn parses_v5_header() {
        let bytes = v5_header_bytes([tags::ZLIB, tags::HUFFMAN, 0, 0], 10000, 4096, 124);
        let header = ChdHeader::read(&mut Cursor::new(bytes)).unwrap();
        assert_eq!(header.version, 5);
        assert_eq!(header.block_bytes, 4096);
        assert_eq!(header.total_blocks, 3); // ceil(10000 / 4096)
        assert_eq!(header.codec_tags[0], tags::ZLIB);
        assert_eq!(header.data_sha1, Some([0x11; 20]));
        assert_eq!(header.data_md5, None);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = v5_header_bytes([0; 4], 4096, 4096, 124);
        bytes[0] = b'X';
        assert!(matches!(
            ChdHeader::read(&mut Cursor::new(bytes)),
            Err(ChdError::InvalidFormat("bad magic"))
        ));
    }

    #[test]
    fn rejects_old_versions() {
        let mut bytes = v5_header_bytes([0; 4], 4096, 4096, 124);
        bytes[15] = 1;
        assert!(matches!(
            ChdHeader::read(&mut Cursor::new(bytes)),
            Err(ChdError::UnsupportedVersion(1))
        ));
    }

    #[test]
    fn rejects_parented_v5() {
        let mut bytes = v5_header_bytes([tags::ZLIB, 0, 0, 0], 4096, 4096, 124);
        let parent_at = bytes.len() - 20;
        bytes[parent_at] = 0xaa;
        assert!(matches!(
            ChdHeader::read(&mut Cursor::new(bytes)),
            Err(ChdError::InvalidFormat(_))
        ));
    }

    #[test]
    fn reads_v5_uncompressed_map() {
        let mut file = v5_header_bytes([0; 4], 3 * 512, 512, 124);
        // entries: block at unit 2, unallocated, block at unit 5
        for value in [2u32, 0, 5] {
            file.extend_from_slice(&value.to_be_bytes());
        }
        let mut cursor = Cursor::new(file);
        let header = ChdHeader::read(&mut cursor).unwrap();
        let map = header.read_map(&mut cursor).unwrap();
        assert_eq!(map.len(), 3);
        assert_eq!(map.entry(0).kind, BlockKind::Raw);
        assert_eq!(map.entry(0).offset, 2 * 512);
        assert_eq!(map.entry(1).kind, BlockKind::Mini);
        assert_eq!(map.entry(1).offset, 0);
        assert_eq!(map.entry(2).offset, 5 * 512);
    }

    #[test]
    fn rejects_inflated_legacy_block_count() {
        // a corrupt count would otherwise size the map allocation
        let mut file = Vec::new();
        file.extend_from_slice(MAGIC);
        file.extend_from_slice(&V3_HEADER_LEN.to_be_bytes());
        file.extend_from_slice(&3u32.to_be_bytes());
        let mut body = vec![0u8; (V3_HEADER_LEN - 16) as usize];
        BigEndian::write_u32(&mut body[4..], 1); // zlib compression
        BigEndian::write_u32(&mut body[8..], 0x7fff_ffff); // totalhunks
        BigEndian::write_u64(&mut body[12..], 1024);
        BigEndian::write_u32(&mut body[60..], 512); // hunkbytes
        file.extend_from_slice(&body);

        assert!(matches!(
            ChdHeader::read(&mut Cursor::new(file)),
            Err(ChdError::InvalidFormat(_))
        ));
    }

    #[test]
    fn rejects_oversized_compressed_map() {
        let mut file = v5_header_bytes([tags::ZLIB, 0, 0, 0], 1024, 512, 124);
        // map header claiming a 4 GiB compressed map for 2 blocks
        file.extend_from_slice(&u32::MAX.to_be_bytes());
        file.extend_from_slice(&[0u8; 12]);
        let mut cursor = Cursor::new(file);
        let header = ChdHeader::read(&mut cursor).unwrap();
        assert!(matches!(
            header.read_map(&mut cursor),
            Err(ChdError::InvalidFormat(_))
        ));
    }

    #[test]
    fn reads_legacy_map_entries() {
        let mut file = Vec::new();
        file.extend_from_slice(MAGIC);
        file.extend_from_slice(&V3_HEADER_LEN.to_be_bytes());
        file.extend_from_slice(&3u32.to_be_bytes());
        let mut body = vec![0u8; (V3_HEADER_LEN - 16) as usize];
        BigEndian::write_u32(&mut body[4..], 1); // zlib compression
        BigEndian::write_u32(&mut body[8..], 3); // totalhunks
        BigEndian::write_u64(&mut body[12..], 3 * 4096);
        BigEndian::write_u32(&mut body[60..], 4096); // hunkbytes
        body[28..44].fill(0x33); // md5
        body[64..84].fill(0x44); // sha1
        file.extend_from_slice(&body);

        // compressed, self, mini
        let mut entry = [0u8; 16];
        BigEndian::write_u64(&mut entry, 0x1000);
        BigEndian::write_u32(&mut entry[8..], 0xdeadbeef);
        BigEndian::write_u16(&mut entry[12..], 900);
        entry[15] = LEGACY_COMPRESSED;
        file.extend_from_slice(&entry);
        let mut entry = [0u8; 16];
        BigEndian::write_u64(&mut entry, 0); // source block 0
        entry[15] = LEGACY_SELF | LEGACY_FLAG_NO_CRC;
        file.extend_from_slice(&entry);
        let mut entry = [0u8; 16];
        BigEndian::write_u64(&mut entry, 0x4142434445464748);
        BigEndian::write_u32(&mut entry[8..], 0x12345678);
        entry[15] = LEGACY_MINI;
        file.extend_from_slice(&entry);

        let mut cursor = Cursor::new(file);
        let header = ChdHeader::read(&mut cursor).unwrap();
        assert_eq!(header.data_md5, Some([0x33; 16]));
        assert_eq!(header.codec_tags[0], tags::ZLIB);

        let map = header.read_map(&mut cursor).unwrap();
        assert_eq!(map.entry(0).kind, BlockKind::CodecSlot(0));
        assert_eq!(map.entry(0).length, 900);
        assert_eq!(map.entry(0).crc, BlockCrc::Crc32(0xdeadbeef));
        assert_eq!(map.entry(1).kind, BlockKind::SelfRef);
        assert_eq!(map.entry(1).crc, BlockCrc::None);
        assert_eq!(map.entry(1).length, 0);
        assert_eq!(map.entry(2).kind, BlockKind::Mini);
        assert_eq!(map.entry(2).offset, 0x4142434445464748);
        assert_eq!(map.entry(2).crc, BlockCrc::Crc32(0x12345678));
    }
}
