use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChdError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid format: {0}")]
    InvalidFormat(&'static str),
    #[error("unsupported CHD version {0}")]
    UnsupportedVersion(u32),
    #[error("unsupported codec {}", format_tag(*.0))]
    UnsupportedCodec(u32),
    #[error("decompression error: {0}")]
    Decompression(String),
    #[error("checksum mismatch in block {block} (expected {expected:#010x}, actual {actual:#010x})")]
    ChecksumMismatch {
        block: u32,
        expected: u32,
        actual: u32,
    },
    #[error("{kind} digest mismatch")]
    DigestMismatch { kind: &'static str },
    #[error("verification cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, ChdError>;

/// Renders a codec tag as its four-character form when printable, the raw
/// hex value otherwise.
fn format_tag(tag: u32) -> String {
    let bytes = tag.to_be_bytes();
    if bytes.iter().all(|b| b.is_ascii_graphic() || *b == b' ') {
        format!("'{}'", String::from_utf8_lossy(&bytes))
    } else {
        format!("{tag:#010x}")
    }
}
