use std::sync::atomic::AtomicBool;

use crate::buffer::BufferPool;
use crate::codec::CodecTable;
use crate::error::{ChdError, Result};
use crate::map::{BlockCrc, BlockKind, BlockMap};

/// Decodes single blocks into their full uncompressed form.
///
/// Shared by every worker thread; all mutable state lives in the map
/// entries and the buffer pool.
pub struct BlockDecoder<'a> {
    map: &'a BlockMap,
    codecs: &'a CodecTable,
    /// Pool of block-sized buffers, used for duplicate caches.
    cache_pool: &'a BufferPool,
    cancelled: &'a AtomicBool,
}

impl<'a> BlockDecoder<'a> {
    pub fn new(
        map: &'a BlockMap,
        codecs: &'a CodecTable,
        cache_pool: &'a BufferPool,
        cancelled: &'a AtomicBool,
    ) -> Self {
        Self {
            map,
            codecs,
            cache_pool,
            cancelled,
        }
    }

    /// Decodes block `index` into `out` (one full block) and verifies its
    /// checksum. `payload` holds the stored bytes for kinds that have any.
    ///
    /// If later blocks duplicate this one, the decoded contents are also
    /// published on the map entry before returning.
    pub fn decode(&self, index: u32, payload: Option<&[u8]>, out: &mut [u8]) -> Result<()> {
        let entry = self.map.entry(index);
        match entry.kind {
            BlockKind::CodecSlot(slot) => {
                let payload = payload
                    .ok_or(ChdError::InvalidFormat("compressed block without payload"))?;
                self.codecs.decompress(slot, payload, out)?;
                verify_crc(index, entry.crc, out)?;
            }
            BlockKind::Raw => {
                let payload = payload
                    .ok_or(ChdError::InvalidFormat("stored block without payload"))?;
                if payload.len() != out.len() {
                    return Err(ChdError::InvalidFormat("stored block has wrong length"));
                }
                out.copy_from_slice(payload);
                verify_crc(index, entry.crc, out)?;
            }
            BlockKind::Mini => {
                let seed = entry.offset.to_be_bytes();
                for chunk in out.chunks_mut(seed.len()) {
                    chunk.copy_from_slice(&seed[..chunk.len()]);
                }
                verify_crc(index, entry.crc, out)?;
            }
            BlockKind::SelfRef => {
                // the source block was decoded and checksummed already
                let source = self.map.entry(entry.source_index());
                source.consume_cache_into(out, self.cancelled)?;
            }
        }

        if entry.use_count() > 0 {
            let mut cache = self.cache_pool.rent();
            cache.copy_from_slice(out);
            entry.publish_cache(cache);
        }
        Ok(())
    }
}

fn verify_crc(index: u32, expected: BlockCrc, data: &[u8]) -> Result<()> {
    match expected {
        BlockCrc::Crc32(expected) => {
            let actual = crc32fast::hash(data);
            if actual != expected {
                return Err(ChdError::ChecksumMismatch {
                    block: index,
                    expected,
                    actual,
                });
            }
        }
        BlockCrc::Crc16(expected) => {
            let actual = crc16::State::<crc16::CCITT_FALSE>::calculate(data);
            if actual != expected {
                return Err(ChdError::ChecksumMismatch {
                    block: index,
                    expected: u32::from(expected),
                    actual: u32::from(actual),
                });
            }
        }
        BlockCrc::None => {}
    }
    Ok(())
}
