use std::io::{Read, Seek};

use tracing::{debug, info};

use crate::error::{ChdError, Result};
use crate::header::ChdHeader;
use crate::map::BlockMap;
use crate::pipeline::{self, PipelineConfig};

/// An opened image: parsed header plus fully decoded block map.
pub struct Chd<R> {
    reader: R,
    header: ChdHeader,
    map: BlockMap,
}

/// Outcome of a successful verification pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifyReport {
    pub blocks: u32,
    pub bytes: u64,
    /// Computed digests, present where the header recorded one.
    pub md5: Option<[u8; 16]>,
    pub sha1: Option<[u8; 20]>,
}

impl<R: Read + Seek> Chd<R> {
    /// Parses the header and block map and validates self references.
    pub fn open(mut reader: R) -> Result<Self> {
        let header = ChdHeader::read(&mut reader)?;
        let map = header.read_map(&mut reader)?;
        map.resolve_self_refs()?;
        debug!(
            version = header.version,
            blocks = header.total_blocks,
            block_bytes = header.block_bytes,
            "opened image"
        );
        Ok(Self {
            reader,
            header,
            map,
        })
    }

    pub fn header(&self) -> &ChdHeader {
        &self.header
    }

    pub fn map(&self) -> &BlockMap {
        &self.map
    }

    pub fn into_inner(self) -> R {
        self.reader
    }

    /// Verifies the image with the default pipeline configuration.
    pub fn verify(&mut self) -> Result<VerifyReport> {
        self.verify_with(&PipelineConfig::default())
    }

    /// Decodes every block, checks per-block checksums, and compares the
    /// whole-stream digests against the ones recorded in the header.
    pub fn verify_with(&mut self, config: &PipelineConfig) -> Result<VerifyReport> {
        let digests =
            pipeline::verify_blocks(&mut self.reader, &self.header, &self.map, config)?;

        if let (Some(computed), Some(recorded)) = (digests.md5, self.header.data_md5) {
            if computed != recorded {
                return Err(ChdError::DigestMismatch { kind: "MD5" });
            }
        }
        if let (Some(computed), Some(recorded)) = (digests.sha1, self.header.data_sha1) {
            if computed != recorded {
                return Err(ChdError::DigestMismatch { kind: "SHA-1" });
            }
        }

        info!(
            blocks = self.header.total_blocks,
            bytes = self.header.logical_bytes,
            "image verified"
        );
        Ok(VerifyReport {
            blocks: self.header.total_blocks,
            bytes: self.header.logical_bytes,
            md5: digests.md5,
            sha1: digests.sha1,
        })
    }
}
