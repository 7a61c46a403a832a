use md5::{Digest as _, Md5};
use sha1::Sha1;

/// Incremental MD5 + SHA-1 over the decoded stream, fed strictly in block
/// order by the hashing stage. Either digest may be absent: headers record
/// an all-zero value for a digest they never computed.
pub struct StreamDigests {
    md5: Option<Md5>,
    sha1: Option<Sha1>,
}

/// Final digest values after the full stream has been hashed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DigestValues {
    pub md5: Option<[u8; 16]>,
    pub sha1: Option<[u8; 20]>,
}

impl StreamDigests {
    /// Creates the hashers the header's recorded digests call for.
    pub fn new(want_md5: bool, want_sha1: bool) -> Self {
        Self {
            md5: want_md5.then(Md5::new),
            sha1: want_sha1.then(Sha1::new),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        if let Some(md5) = &mut self.md5 {
            md5.update(data);
        }
        if let Some(sha1) = &mut self.sha1 {
            sha1.update(data);
        }
    }

    pub fn finalize(self) -> DigestValues {
        DigestValues {
            md5: self.md5.map(|d| d.finalize().into()),
            sha1: self.sha1.map(|d| d.finalize().into()),
        }
    }
}

/// True when `recorded` is the all-zero placeholder for "not computed".
pub fn is_absent(recorded: &[u8]) -> bool {
    recorded.iter().all(|b| *b == 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_digests() {
        let mut digests = StreamDigests::new(true, true);
        digests.update(b"abc");
        let values = digests.finalize();
        assert_eq!(
            values.md5.unwrap(),
            [
                0x90, 0x01, 0x50, 0x98, 0x3c, 0xd2, 0x4f, 0xb0, 0xd6, 0x96, 0x3f, 0x7d, 0x28,
                0xe1, 0x7f, 0x72
            ]
        );
        assert_eq!(
            values.sha1.unwrap(),
            [
                0xa9, 0x99, 0x3e, 0x36, 0x47, 0x06, 0x81, 0x6a, 0xba, 0x3e, 0x25, 0x71, 0x78,
                0x50, 0xc2, 0x6c, 0x9c, 0xd0, 0xd8, 0x9d
            ]
        );
    }

    #[test]
    fn disabled_hashers_yield_nothing() {
        let mut digests = StreamDigests::new(false, true);
        digests.update(b"data");
        let values = digests.finalize();
        assert!(values.md5.is_none());
        assert!(values.sha1.is_some());
    }

    #[test]
    fn absent_placeholder() {
        assert!(is_absent(&[0u8; 20]));
        assert!(!is_absent(&[0, 0, 1, 0]));
    }
}
