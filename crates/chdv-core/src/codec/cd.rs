//! CD-frame block payloads (`cdzl`, `cdlz`).
//!
//! A CD block is a run of 2448-byte frames, each 2352 bytes of sector data
//! followed by 96 bytes of subcode. The payload carries a per-frame flag
//! bitmap, a big-endian length of the sector-data stream, the sector data
//! compressed with the base codec, and the subcode stream compressed with
//! deflate. Flagged frames had their sync header and ECC stripped before
//! compression; both are rebuilt here.

use crate::codec::{ecc, lzma, zlib};
use crate::error::{ChdError, Result};

pub const MAX_SECTOR_DATA: usize = 2352;
pub const MAX_SUBCODE_DATA: usize = 96;
pub const FRAME_SIZE: usize = MAX_SECTOR_DATA + MAX_SUBCODE_DATA;

const SYNC_HEADER: [u8; 12] = [
    0x00, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x00,
];

/// Codec used for the sector-data stream; subcode is always deflate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaseCodec {
    Zlib,
    Lzma,
}

pub fn decompress(base: BaseCodec, input: &[u8], output: &mut [u8]) -> Result<()> {
    if output.len() % FRAME_SIZE != 0 {
        return Err(ChdError::InvalidFormat(
            "CD block size is not a whole number of frames",
        ));
    }
    let frames = output.len() / FRAME_SIZE;
    let flag_bytes = (frames + 7) / 8;
    let complen_bytes: usize = if output.len() < 65536 { 2 } else { 3 };
    let header_bytes = flag_bytes + complen_bytes;
    if input.len() < header_bytes {
        return Err(ChdError::Decompression("CD payload header truncated".into()));
    }

    let mut base_len =
        (usize::from(input[flag_bytes]) << 8) | usize::from(input[flag_bytes + 1]);
    if complen_bytes > 2 {
        base_len = (base_len << 8) | usize::from(input[flag_bytes + 2]);
    }
    if header_bytes + base_len > input.len() {
        return Err(ChdError::Decompression(
            "CD payload sector stream overruns input".into(),
        ));
    }

    let mut sectors = vec![0u8; frames * MAX_SECTOR_DATA];
    let mut subcode = vec![0u8; frames * MAX_SUBCODE_DATA];
    let base_stream = &input[header_bytes..header_bytes + base_len];
    match base {
        BaseCodec::Zlib => zlib::decompress(base_stream, &mut sectors)?,
        BaseCodec::Lzma => lzma::decompress(base_stream, &mut sectors)?,
    }
    zlib::decompress(&input[header_bytes + base_len..], &mut subcode)?;

    for frame in 0..frames {
        let out = &mut output[frame * FRAME_SIZE..(frame + 1) * FRAME_SIZE];
        out[..MAX_SECTOR_DATA]
            .copy_from_slice(&sectors[frame * MAX_SECTOR_DATA..(frame + 1) * MAX_SECTOR_DATA]);
        out[MAX_SECTOR_DATA..]
            .copy_from_slice(&subcode[frame * MAX_SUBCODE_DATA..(frame + 1) * MAX_SUBCODE_DATA]);
    }

    for frame in 0..frames {
        if input[frame / 8] & (0x80 >> (frame % 8)) != 0 {
            let sector = &mut output[frame * FRAME_SIZE..frame * FRAME_SIZE + MAX_SECTOR_DATA];
            sector[..SYNC_HEADER.len()].copy_from_slice(&SYNC_HEADER);
            ecc::generate(sector);
        }
    }
    Ok(())
}
