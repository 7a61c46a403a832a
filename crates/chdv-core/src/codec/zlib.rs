use std::io::Read;

use flate2::read::DeflateDecoder;

use crate::error::{ChdError, Result};

/// `zlib` block payload: a raw deflate stream with no zlib wrapper.
pub fn decompress(input: &[u8], output: &mut [u8]) -> Result<()> {
    let mut decoder = DeflateDecoder::new(input);
    decoder
        .read_exact(output)
        .map_err(|e| ChdError::Decompression(format!("inflate: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::DeflateEncoder;
    use flate2::Compression;
    use std::io::Write;

    #[test]
    fn inflates_raw_deflate_stream() {
        let plain: Vec<u8> = (0..512u32).map(|i| (i % 7) as u8).collect();
        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&plain).unwrap();
        let packed = encoder.finish().unwrap();

        let mut output = vec![0u8; plain.len()];
        decompress(&packed, &mut output).unwrap();
        assert_eq!(output, plain);
    }

    #[test]
    fn short_stream_is_an_error() {
        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"tiny").unwrap();
        let packed = encoder.finish().unwrap();

        let mut output = vec![0u8; 64];
        assert!(matches!(
            decompress(&packed, &mut output),
            Err(ChdError::Decompression(_))
        ));
    }
}
