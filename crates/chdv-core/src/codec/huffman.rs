//! Canonical Huffman decoding for block payloads and the compressed map.
//!
//! Two serialized tree formats exist: a plain RLE list of code lengths
//! (used by the compressed map) and a two-level form where the lengths are
//! themselves Huffman-coded (used by `huff` block payloads). Both assign
//! canonical codes so only the lengths travel in the file.

use crate::codec::bitstream::BitReader;
use crate::error::{ChdError, Result};

/// Table-driven decoder for up to 2047 symbols and 16-bit codes.
///
/// The decode table packs `symbol << 5 | code_length` into a `u16` per
/// possible `maxbits`-wide prefix, so one peek resolves any symbol.
#[derive(Debug)]
pub struct HuffmanDecoder {
    numcodes: u32,
    maxbits: u32,
    lengths: Vec<u8>,
    lookup: Vec<u16>,
}

impl HuffmanDecoder {
    pub fn new(numcodes: u32, maxbits: u32) -> Self {
        assert!(numcodes <= 2047 && maxbits <= 16);
        Self {
            numcodes,
            maxbits,
            lengths: vec![0; numcodes as usize],
            lookup: Vec::new(),
        }
    }

    /// Builds a decoder directly from per-symbol code lengths.
    pub fn from_code_lengths(lengths: &[u8], maxbits: u32) -> Result<Self> {
        let mut decoder = Self::new(lengths.len() as u32, maxbits);
        decoder.lengths.copy_from_slice(lengths);
        decoder.assemble()?;
        Ok(decoder)
    }

    /// Reads an RLE-coded list of code lengths and builds the decode table.
    ///
    /// Each value is `numbits` wide; the value 1 escapes: a second 1 is a
    /// literal length of 1, anything else repeats `read(numbits) + 3`
    /// times.
    pub fn import_tree_rle(&mut self, reader: &mut BitReader<'_>) -> Result<()> {
        let numbits = if self.maxbits >= 16 {
            5
        } else if self.maxbits >= 8 {
            4
        } else {
            3
        };

        let mut curnode = 0usize;
        while curnode < self.numcodes as usize {
            let nodebits = reader.read(numbits);
            if nodebits != 1 {
                self.lengths[curnode] = nodebits as u8;
                curnode += 1;
                continue;
            }
            let nodebits = reader.read(numbits);
            if nodebits == 1 {
                self.lengths[curnode] = 1;
                curnode += 1;
                continue;
            }
            let repcount = reader.read(numbits) as usize + 3;
            if curnode + repcount > self.numcodes as usize {
                return Err(ChdError::Decompression(
                    "huffman tree repeat overruns code count".into(),
                ));
            }
            self.lengths[curnode..curnode + repcount].fill(nodebits as u8);
            curnode += repcount;
        }

        self.assemble()?;
        if reader.overflow() {
            return Err(ChdError::Decompression("huffman tree truncated".into()));
        }
        Ok(())
    }

    /// Reads a two-level tree: a small 24-symbol helper tree, then the code
    /// lengths coded through it (symbol `v` is length `v - 1`, symbol 0
    /// repeats the previous length `read(3) + 3` times, extended by
    /// `rlefullbits` more bits when that count saturates).
    pub fn import_tree_huffman(&mut self, reader: &mut BitReader<'_>) -> Result<()> {
        let mut small_lengths = [0u8; 24];
        small_lengths[0] = reader.read(3) as u8;
        let start = reader.read(3) as usize + 1;
        let mut count = 0;
        for (index, slot) in small_lengths.iter_mut().enumerate().skip(1) {
            if index < start || count == 7 {
                *slot = 0;
            } else {
                count = reader.read(3);
                *slot = if count == 7 { 0 } else { count as u8 };
            }
        }
        let small = HuffmanDecoder::from_code_lengths(&small_lengths, 6)?;

        let mut rlefullbits = 0u32;
        let mut temp = self.numcodes - 9;
        while temp != 0 {
            temp >>= 1;
            rlefullbits += 1;
        }

        let mut last = 0u8;
        let mut curnode = 0usize;
        while curnode < self.numcodes as usize {
            let value = small.decode_one(reader);
            if value != 0 {
                last = (value - 1) as u8;
                self.lengths[curnode] = last;
                curnode += 1;
            } else {
                let mut repcount = reader.read(3) + 3;
                if repcount == 3 + 7 {
                    repcount += reader.read(rlefullbits);
                }
                while repcount != 0 && curnode < self.numcodes as usize {
                    self.lengths[curnode] = last;
                    curnode += 1;
                    repcount -= 1;
                }
            }
        }

        self.assemble()?;
        if reader.overflow() {
            return Err(ChdError::Decompression("huffman tree truncated".into()));
        }
        Ok(())
    }

    /// Decodes one symbol. An unmapped prefix decodes to symbol 0 with no
    /// bits consumed; callers run fixed-length loops and rely on checksum
    /// verification to reject such streams.
    pub fn decode_one(&self, reader: &mut BitReader<'_>) -> u32 {
        let bits = reader.peek(self.maxbits);
        let entry = self.lookup[bits as usize];
        reader.consume(u32::from(entry & 0x1f));
        u32::from(entry >> 5)
    }

    /// Assigns canonical codes from the current lengths and fills the
    /// decode table.
    fn assemble(&mut self) -> Result<()> {
        let mut histo = [0u32; 33];
        for &len in &self.lengths {
            if u32::from(len) > self.maxbits {
                return Err(ChdError::Decompression(
                    "huffman code length exceeds maximum".into(),
                ));
            }
            if len > 0 {
                histo[len as usize] += 1;
            }
        }

        // Canonical numbering: longer codes first, each shorter tier
        // starting at half the boundary of the tier below it.
        let mut curstart = 0u32;
        for codelen in (1..=32usize).rev() {
            let nextstart = (curstart + histo[codelen]) >> 1;
            if codelen != 1 && nextstart * 2 != curstart + histo[codelen] {
                return Err(ChdError::Decompression(
                    "inconsistent huffman code lengths".into(),
                ));
            }
            histo[codelen] = curstart;
            curstart = nextstart;
        }

        self.lookup = vec![0u16; 1usize << self.maxbits];
        for (symbol, &len) in self.lengths.iter().enumerate() {
            if len == 0 {
                continue;
            }
            let code = histo[len as usize];
            histo[len as usize] += 1;
            let shift = self.maxbits - u32::from(len);
            let start = (code as usize) << shift;
            let end = (code as usize + 1) << shift;
            if end > self.lookup.len() {
                return Err(ChdError::Decompression(
                    "huffman code overruns decode table".into(),
                ));
            }
            let entry = ((symbol as u16) << 5) | u16::from(len);
            self.lookup[start..end].fill(entry);
        }
        Ok(())
    }
}

/// `huff` block payload: a two-level tree over 256 byte values, then one
/// symbol per output byte.
pub fn decompress(input: &[u8], output: &mut [u8]) -> Result<()> {
    let mut reader = BitReader::new(input);
    let mut decoder = HuffmanDecoder::new(256, 16);
    decoder.import_tree_huffman(&mut reader)?;
    for byte in output.iter_mut() {
        *byte = decoder.decode_one(&mut reader) as u8;
    }
    if reader.overflow() {
        return Err(ChdError::Decompression("huffman payload truncated".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_assignment_orders_longer_codes_first() {
        // a: len 1, b/c: len 2 -> a='1', b='00', c='01'
        let decoder = HuffmanDecoder::from_code_lengths(&[1, 2, 2], 2).unwrap();
        // bits: 1 00 01 1  -> a b c a
        let mut reader = BitReader::new(&[0b1000_1100]);
        assert_eq!(decoder.decode_one(&mut reader), 0);
        assert_eq!(decoder.decode_one(&mut reader), 1);
        assert_eq!(decoder.decode_one(&mut reader), 2);
        assert_eq!(decoder.decode_one(&mut reader), 0);
    }

    #[test]
    fn incomplete_tree_is_rejected() {
        // three 2-bit codes leave a quarter of the space uncovered
        assert!(HuffmanDecoder::from_code_lengths(&[2, 2, 2], 2).is_err());
    }

    #[test]
    fn rle_tree_import() {
        // maxbits 6 -> 3-bit length values. Lengths [1, 2, 3, 3] encoded
        // as: escape(001) literal-1(001), 010, 011, 011.
        let data = [0b0010_0101, 0b0011_0110];
        let mut reader = BitReader::new(&data);
        let mut decoder = HuffmanDecoder::new(4, 6);
        decoder.import_tree_rle(&mut reader).unwrap();

        // codes: s0='1', s1='01', s2='000', s3='001'
        let mut payload = BitReader::new(&[0b1010_0000, 0b1000_0000]);
        assert_eq!(decoder.decode_one(&mut payload), 0);
        assert_eq!(decoder.decode_one(&mut payload), 1);
        assert_eq!(decoder.decode_one(&mut payload), 2);
        assert_eq!(decoder.decode_one(&mut payload), 3);
    }

    #[test]
    fn rle_repeat_overrun_is_rejected() {
        // literal 2, then escape repeating length 0 three times into a
        // 2-code tree: 010, 001, 000, 000
        let data = [0b0100_0100, 0b0000_0000];
        let mut reader = BitReader::new(&data);
        let mut decoder = HuffmanDecoder::new(2, 6);
        assert!(decoder.import_tree_rle(&mut reader).is_err());
    }

    #[test]
    fn huff_payload_round_trip() {
        // Hand-packed two-level tree giving every byte value an 8-bit
        // code equal to itself, followed by the bytes 0xAB 0x00.
        let input = [0x3C, 0x1F, 0x7F, 0x5A, 0xB0, 0x00];
        let mut output = [0u8; 2];
        decompress(&input, &mut output).unwrap();
        assert_eq!(output, [0xAB, 0x00]);
    }

    #[test]
    fn truncated_payload_is_an_error() {
        let input = [0x3C, 0x1F, 0x7F, 0x50];
        let mut output = [0u8; 64];
        assert!(matches!(
            decompress(&input, &mut output),
            Err(ChdError::Decompression(_))
        ));
    }
}
