use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use tracing::debug;

use crate::buffer::PooledBuffer;
use crate::error::{ChdError, Result};

/// How a block's payload is stored in the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    /// Compressed with the codec in the given table slot (0..=3).
    CodecSlot(u8),
    /// Stored uncompressed at the payload offset.
    Raw,
    /// No payload; the block is an 8-byte pattern tiled from the offset field.
    Mini,
    /// Duplicate of an earlier block in the same file.
    SelfRef,
}

/// Expected checksum of a block's decoded contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockCrc {
    Crc32(u32),
    Crc16(u16),
    /// No per-block checksum recorded.
    None,
}

/// One entry of the block map, plus the transient state the pipeline needs
/// when other blocks duplicate this one.
#[derive(Debug)]
pub struct BlockMapEntry {
    pub kind: BlockKind,
    /// File offset of the payload; pattern seed for `Mini`; source block
    /// index for `SelfRef`.
    pub offset: u64,
    /// Stored payload length in bytes (zero for `Mini` and `SelfRef`).
    pub length: u32,
    pub crc: BlockCrc,
    /// How many later blocks duplicate this one. Set once by
    /// [`BlockMap::resolve_self_refs`], then counted down by consumers.
    use_count: AtomicU32,
    cache: Mutex<Option<PooledBuffer>>,
    cache_ready: Condvar,
}

impl BlockMapEntry {
    pub fn new(kind: BlockKind, offset: u64, length: u32, crc: BlockCrc) -> Self {
        Self {
            kind,
            offset,
            length,
            crc,
            use_count: AtomicU32::new(0),
            cache: Mutex::new(None),
            cache_ready: Condvar::new(),
        }
    }

    /// Source block index for a `SelfRef` entry.
    pub fn source_index(&self) -> u32 {
        debug_assert_eq!(self.kind, BlockKind::SelfRef);
        self.offset as u32
    }

    pub fn use_count(&self) -> u32 {
        self.use_count.load(Ordering::Acquire)
    }

    fn add_use(&self) {
        self.use_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Publishes this block's decoded contents for pending duplicates.
    ///
    /// Called by the worker that decoded the block, before it forwards the
    /// block downstream. Wakes every duplicate waiting in
    /// [`consume_cache_into`](Self::consume_cache_into).
    pub fn publish_cache(&self, decoded: PooledBuffer) {
        let mut slot = lock_or_recover(&self.cache);
        *slot = Some(decoded);
        drop(slot);
        self.cache_ready.notify_all();
    }

    /// Copies this block's cached contents into `dest`, waiting if the
    /// decode of this block is still in flight on another worker.
    ///
    /// Decrements the use count; the last consumer releases the cache
    /// buffer back to its pool. Returns [`ChdError::Cancelled`] if the
    /// pipeline is torn down while waiting.
    pub fn consume_cache_into(&self, dest: &mut [u8], cancelled: &AtomicBool) -> Result<()> {
        let mut slot = lock_or_recover(&self.cache);
        loop {
            if let Some(cache) = slot.as_ref() {
                dest.copy_from_slice(cache);
                break;
            }
            if cancelled.load(Ordering::Acquire) {
                return Err(ChdError::Cancelled);
            }
            let (guard, _timeout) = self
                .cache_ready
                .wait_timeout(slot, Duration::from_millis(50))
                .unwrap_or_else(|e| e.into_inner());
            slot = guard;
        }
        if self.use_count.fetch_sub(1, Ordering::AcqRel) == 1 {
            // Last duplicate served; return the buffer to the pool.
            slot.take();
        }
        Ok(())
    }
}

fn lock_or_recover<'a, T>(mutex: &'a Mutex<T>) -> std::sync::MutexGuard<'a, T> {
    // A poisoned lock means a worker panicked; cancellation is already in
    // flight, and the cached bytes are still valid to read.
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// The fully parsed block map of a CHD file.
#[derive(Debug)]
pub struct BlockMap {
    entries: Vec<BlockMapEntry>,
}

impl BlockMap {
    pub fn new(entries: Vec<BlockMapEntry>) -> Self {
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, index: u32) -> &BlockMapEntry {
        &self.entries[index as usize]
    }

    pub fn entries(&self) -> &[BlockMapEntry] {
        &self.entries
    }

    /// Validates every `SelfRef` entry and charges its source's use count.
    ///
    /// Must run while the pipeline is idle; counts are reset first so a
    /// second verification pass starts clean. A self reference must point
    /// strictly backward, and its source must not itself be a `SelfRef`;
    /// either violation is a format error, since no writer produces such a
    /// map and the pipeline's wait-for-source step depends on sources
    /// being dispatched first.
    pub fn resolve_self_refs(&self) -> Result<()> {
        for entry in &self.entries {
            entry.use_count.store(0, Ordering::Release);
        }
        let mut self_refs = 0usize;
        for (index, entry) in self.entries.iter().enumerate() {
            if entry.kind != BlockKind::SelfRef {
                continue;
            }
            self_refs += 1;
            let source = entry.source_index() as usize;
            if source >= index {
                return Err(ChdError::InvalidFormat(
                    "self-referencing block does not point backward",
                ));
            }
            let source_entry = &self.entries[source];
            if source_entry.kind == BlockKind::SelfRef {
                return Err(ChdError::InvalidFormat(
                    "self-referencing block points at another self reference",
                ));
            }
            source_entry.add_use();
        }
        debug!(
            blocks = self.entries.len(),
            self_refs, "resolved self references"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferPool;

    fn raw(offset: u64) -> BlockMapEntry {
        BlockMapEntry::new(BlockKind::Raw, offset, 16, BlockCrc::None)
    }

    fn self_ref(source: u32) -> BlockMapEntry {
        BlockMapEntry::new(BlockKind::SelfRef, source as u64, 0, BlockCrc::None)
    }

    #[test]
    fn resolver_counts_uses() {
        let map = BlockMap::new(vec![raw(0), self_ref(0), self_ref(0), raw(32)]);
        map.resolve_self_refs().unwrap();
        assert_eq!(map.entry(0).use_count(), 2);
        assert_eq!(map.entry(3).use_count(), 0);
    }

    #[test]
    fn resolver_rejects_forward_reference() {
        let map = BlockMap::new(vec![self_ref(1), raw(0)]);
        assert!(matches!(
            map.resolve_self_refs(),
            Err(ChdError::InvalidFormat(_))
        ));
    }

    #[test]
    fn resolver_rejects_chained_reference() {
        let map = BlockMap::new(vec![raw(0), self_ref(0), self_ref(1)]);
        assert!(matches!(
            map.resolve_self_refs(),
            Err(ChdError::InvalidFormat(_))
        ));
    }

    #[test]
    fn cache_round_trip_releases_on_last_use() {
        let pool = BufferPool::new(8);
        let entry = raw(0);
        entry.add_use();
        entry.add_use();

        let mut cached = pool.rent();
        cached.copy_from_slice(b"abcdefgh");
        entry.publish_cache(cached);

        let cancelled = AtomicBool::new(false);
        let mut dest = [0u8; 8];
        entry.consume_cache_into(&mut dest, &cancelled).unwrap();
        assert_eq!(&dest, b"abcdefgh");
        assert_eq!(pool.idle(), 0);

        entry.consume_cache_into(&mut dest, &cancelled).unwrap();
        // Last consumer returned the cache buffer to the pool.
        assert_eq!(pool.idle(), 1);
        assert_eq!(entry.use_count(), 0);
    }

    #[test]
    fn consume_observes_cancellation() {
        let entry = raw(0);
        entry.add_use();
        let cancelled = AtomicBool::new(true);
        let mut dest = [0u8; 16];
        assert!(matches!(
            entry.consume_cache_into(&mut dest, &cancelled),
            Err(ChdError::Cancelled)
        ));
    }

    #[test]
    fn consume_waits_for_publisher() {
        use std::sync::Arc;

        let pool = BufferPool::new(4);
        let entry = Arc::new(raw(0));
        entry.add_use();
        let cancelled = Arc::new(AtomicBool::new(false));

        let waiter = {
            let entry = Arc::clone(&entry);
            let cancelled = Arc::clone(&cancelled);
            std::thread::spawn(move || {
                let mut dest = [0u8; 4];
                entry.consume_cache_into(&mut dest, &cancelled).unwrap();
                dest
            })
        };

        std::thread::sleep(Duration::from_millis(20));
        let mut cached = pool.rent();
        cached.copy_from_slice(b"wxyz");
        entry.publish_cache(cached);

        assert_eq!(&waiter.join().unwrap(), b"wxyz");
    }
}
