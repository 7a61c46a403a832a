use std::io::Cursor;

use claxon::frame::FrameReader;
use claxon::input::BufferedReader;

use crate::error::{ChdError, Result};

/// `flac` block payload: one endianness marker byte, then bare FLAC frames
/// of 16-bit stereo audio. Frames are decoded until the block is full.
pub fn decompress(input: &[u8], output: &mut [u8]) -> Result<()> {
    let big_endian = match input.first() {
        Some(b'L') => false,
        Some(b'B') => true,
        _ => {
            return Err(ChdError::Decompression(
                "flac: missing endianness marker".into(),
            ))
        }
    };

    let mut frames = FrameReader::new(BufferedReader::new(Cursor::new(&input[1..])));
    let mut sample_buf = Vec::new();
    let mut pos = 0usize;
    while pos < output.len() {
        let block = frames
            .read_next_or_eof(sample_buf)
            .map_err(|e| ChdError::Decompression(format!("flac: {e}")))?
            .ok_or_else(|| ChdError::Decompression("flac: stream ended early".into()))?;
        if block.channels() != 2 {
            return Err(ChdError::Decompression(format!(
                "flac: expected stereo, got {} channels",
                block.channels()
            )));
        }
        for (left, right) in block.stereo_samples() {
            if pos + 4 > output.len() {
                break;
            }
            let (left, right) = (left as u16, right as u16);
            if big_endian {
                output[pos..pos + 2].copy_from_slice(&left.to_be_bytes());
                output[pos + 2..pos + 4].copy_from_slice(&right.to_be_bytes());
            } else {
                output[pos..pos + 2].copy_from_slice(&left.to_le_bytes());
                output[pos + 2..pos + 4].copy_from_slice(&right.to_le_bytes());
            }
            pos += 4;
        }
        sample_buf = block.into_buffer();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_marker_is_rejected() {
        let mut output = vec![0u8; 16];
        assert!(matches!(
            decompress(b"Xjunk", &mut output),
            Err(ChdError::Decompression(_))
        ));
        assert!(matches!(
            decompress(&[], &mut output),
            Err(ChdError::Decompression(_))
        ));
    }

    #[test]
    fn truncated_stream_is_rejected() {
        let mut output = vec![0u8; 16];
        assert!(matches!(
            decompress(b"L", &mut output),
            Err(ChdError::Decompression(_))
        ));
    }

    #[test]
    fn empty_block_needs_no_frames() {
        let mut output = [];
        decompress(b"L", &mut output).unwrap();
    }
}
