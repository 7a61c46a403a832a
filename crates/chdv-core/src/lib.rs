//! Verification of CHD block-compressed disk images.
//!
//! A CHD file stores a disk image as fixed-size blocks, each compressed
//! with one of up to four codecs, stored raw, synthesized from an 8-byte
//! pattern, or duplicating an earlier block. [`Chd::open`] parses the
//! header and block map; [`Chd::verify`] decodes every block on a worker
//! pipeline, checks per-block checksums, and compares the stream digests
//! recorded in the header.

pub mod buffer;
pub mod chd;
pub mod codec;
pub mod digest;
pub mod error;
pub mod header;
pub mod map;
pub mod pipeline;

pub use buffer::{BufferPool, PooledBuffer};
pub use chd::{Chd, VerifyReport};
pub use error::{ChdError, Result};
pub use header::ChdHeader;
pub use map::{BlockKind, BlockMap, BlockMapEntry};
pub use pipeline::PipelineConfig;
