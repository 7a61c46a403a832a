use std::io::Cursor;

use lzma_rs::decompress::{Options, UnpackedSize};

use crate::error::{ChdError, Result};

/// `lzma` block payload: a headerless raw LZMA stream.
///
/// The file stores neither properties nor unpacked size; both are fixed by
/// convention (lc=3 lp=0 pb=2, dictionary and unpacked size = block size),
/// so a 5-byte properties header is synthesized in front of the payload
/// before handing it to the decoder.
pub fn decompress(input: &[u8], output: &mut [u8]) -> Result<()> {
    let mut framed = Vec::with_capacity(5 + input.len());
    framed.push(0x5d); // (pb * 5 + lp) * 9 + lc
    framed.extend_from_slice(&(output.len() as u32).to_le_bytes());
    framed.extend_from_slice(input);

    let options = Options {
        unpacked_size: UnpackedSize::UseProvided(Some(output.len() as u64)),
        memlimit: None,
        allow_incomplete: false,
    };
    let mut reader = Cursor::new(framed);
    let mut decoded = Vec::with_capacity(output.len());
    lzma_rs::lzma_decompress_with_options(&mut reader, &mut decoded, &options)
        .map_err(|e| ChdError::Decompression(format!("lzma: {e:?}")))?;
    if decoded.len() != output.len() {
        return Err(ChdError::Decompression(format!(
            "lzma: decoded {} bytes, wanted {}",
            decoded.len(),
            output.len()
        )));
    }
    output.copy_from_slice(&decoded);
    Ok(())
}
