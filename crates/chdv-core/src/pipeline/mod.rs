//! Bounded three-stage verification pipeline.
//!
//! One producer thread (the caller's) performs every file read and feeds
//! decode tasks to N worker threads over a bounded channel; a single
//! hasher thread puts completed blocks back into index order and feeds the
//! stream digests. An admission gate caps the number of blocks in flight
//! so a slow stage cannot pile up buffers, and the first error cancels all
//! stages.

mod decoder;
mod reorder;

pub use decoder::BlockDecoder;
pub use reorder::ReadySet;

use std::io::{Read, Seek, SeekFrom};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use tracing::debug;

use crate::buffer::{BufferPool, PooledBuffer};
use crate::digest::{DigestValues, StreamDigests};
use crate::error::{ChdError, Result};
use crate::header::ChdHeader;
use crate::map::BlockMap;

/// How often blocking stages recheck the cancellation flag.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Decode worker threads.
    pub workers: usize,
    /// Channel capacity per worker.
    pub queue_factor: usize,
    /// In-flight block cap per worker.
    pub inflight_factor: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            queue_factor: 5,
            inflight_factor: 100,
        }
    }
}

impl PipelineConfig {
    pub fn with_workers(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
            ..Self::default()
        }
    }
}

struct DecodeTask {
    index: u32,
    payload: Option<PooledBuffer>,
}

struct DoneBlock {
    index: u32,
    data: PooledBuffer,
}

/// Cancellation flag plus the first error any stage hit.
struct Shared {
    cancelled: AtomicBool,
    first_error: Mutex<Option<ChdError>>,
}

impl Shared {
    fn new() -> Self {
        Self {
            cancelled: AtomicBool::new(false),
            first_error: Mutex::new(None),
        }
    }

    /// Records `err` if it is the first and raises the cancellation flag.
    /// `Cancelled` never displaces a real error.
    fn fail(&self, err: ChdError) {
        if !matches!(err, ChdError::Cancelled) {
            let mut slot = self
                .first_error
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if slot.is_none() {
                *slot = Some(err);
            }
        }
        self.cancelled.store(true, Ordering::Release);
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Counting gate bounding blocks between admission (producer) and release
/// (hasher).
struct AdmissionGate {
    permits: Mutex<usize>,
    freed: Condvar,
}

impl AdmissionGate {
    fn new(permits: usize) -> Self {
        Self {
            permits: Mutex::new(permits),
            freed: Condvar::new(),
        }
    }

    fn acquire(&self, shared: &Shared) -> Result<()> {
        let mut permits = self.permits.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if *permits > 0 {
                *permits -= 1;
                return Ok(());
            }
            if shared.is_cancelled() {
                return Err(ChdError::Cancelled);
            }
            let (guard, _) = self
                .freed
                .wait_timeout(permits, POLL_INTERVAL)
                .unwrap_or_else(|e| e.into_inner());
            permits = guard;
        }
    }

    fn release(&self) {
        let mut permits = self.permits.lock().unwrap_or_else(|e| e.into_inner());
        *permits += 1;
        drop(permits);
        self.freed.notify_one();
    }
}

fn send_or_cancel<T>(tx: &Sender<T>, value: T, shared: &Shared) -> Result<()> {
    let mut value = value;
    loop {
        match tx.send_timeout(value, POLL_INTERVAL) {
            Ok(()) => return Ok(()),
            Err(SendTimeoutError::Timeout(returned)) => {
                if shared.is_cancelled() {
                    return Err(ChdError::Cancelled);
                }
                value = returned;
            }
            Err(SendTimeoutError::Disconnected(_)) => return Err(ChdError::Cancelled),
        }
    }
}

/// Decodes every block and returns the digests of the logical stream.
///
/// `reader` is only touched from the calling thread, which acts as the
/// pipeline's producer.
pub fn verify_blocks<R: Read + Seek>(
    reader: &mut R,
    header: &ChdHeader,
    map: &BlockMap,
    config: &PipelineConfig,
) -> Result<DigestValues> {
    let total = u64::from(header.total_blocks);
    let block_bytes64 = u64::from(header.block_bytes);
    // every block but the last must be full, and the last must be non-empty
    let fits = header.logical_bytes <= total * block_bytes64
        && (total == 0 || header.logical_bytes > (total - 1) * block_bytes64);
    if !fits {
        return Err(ChdError::InvalidFormat(
            "logical size inconsistent with block count",
        ));
    }
    if map.len() != header.total_blocks as usize {
        return Err(ChdError::InvalidFormat("map length does not match block count"));
    }
    map.resolve_self_refs()?;

    let workers = config.workers.max(1);
    let queue_depth = workers * config.queue_factor.max(1);
    let block_bytes = header.block_bytes as usize;
    let codecs = header.codec_table();

    let payload_pool = BufferPool::new(block_bytes);
    let block_pool = BufferPool::new(block_bytes);
    let shared = Shared::new();
    let gate = AdmissionGate::new(workers * config.inflight_factor.max(1));
    let want_md5 = header.data_md5.is_some();
    let want_sha1 = header.data_sha1.is_some();

    let (work_tx, work_rx) = bounded::<Option<DecodeTask>>(queue_depth);
    let (done_tx, done_rx) = bounded::<Option<DoneBlock>>(queue_depth);

    debug!(
        blocks = header.total_blocks,
        workers, "starting verification pipeline"
    );

    let result = std::thread::scope(|scope| -> Result<DigestValues> {
        for _ in 0..workers {
            let work_rx = work_rx.clone();
            let done_tx = done_tx.clone();
            let decoder = BlockDecoder::new(map, &codecs, &block_pool, &shared.cancelled);
            let shared = &shared;
            let block_pool = &block_pool;
            scope.spawn(move || run_worker(work_rx, done_tx, decoder, block_pool, shared, map));
        }
        drop(work_rx);
        drop(done_tx);

        let hasher = {
            let shared = &shared;
            let gate = &gate;
            scope.spawn(move || {
                run_hasher(done_rx, header, shared, gate, want_md5, want_sha1, workers)
            })
        };

        run_producer(reader, header, map, work_tx, &payload_pool, &shared, &gate, workers);

        match hasher.join() {
            Ok(result) => result,
            Err(_) => Err(ChdError::Cancelled),
        }
    });

    let first_error = shared
        .first_error
        .into_inner()
        .unwrap_or_else(|e| e.into_inner());
    if let Some(err) = first_error {
        return Err(err);
    }
    let digests = result?;
    debug!(blocks = header.total_blocks, "verification pipeline finished");
    Ok(digests)
}

#[allow(clippy::too_many_arguments)]
fn run_producer<R: Read + Seek>(
    reader: &mut R,
    header: &ChdHeader,
    map: &BlockMap,
    work_tx: Sender<Option<DecodeTask>>,
    pool: &BufferPool,
    shared: &Shared,
    gate: &AdmissionGate,
    workers: usize,
) {
    let block_bytes = header.block_bytes as usize;
    for index in 0..header.total_blocks {
        if shared.is_cancelled() || gate.acquire(shared).is_err() {
            break;
        }
        let entry = map.entry(index);
        let payload = if entry.length > 0 {
            if entry.length as usize > block_bytes {
                shared.fail(ChdError::InvalidFormat("stored block longer than block size"));
                break;
            }
            let mut buf = pool.rent();
            let read = reader
                .seek(SeekFrom::Start(entry.offset))
                .and_then(|_| reader.read_exact(&mut buf[..entry.length as usize]));
            if let Err(err) = read {
                shared.fail(err.into());
                break;
            }
            Some(buf)
        } else {
            None
        };
        if send_or_cancel(&work_tx, Some(DecodeTask { index, payload }), shared).is_err() {
            break;
        }
    }
    // one sentinel per worker; if this fails the channel teardown will
    // stop them instead
    for _ in 0..workers {
        if send_or_cancel(&work_tx, None, shared).is_err() {
            break;
        }
    }
}

fn run_worker(
    work_rx: Receiver<Option<DecodeTask>>,
    done_tx: Sender<Option<DoneBlock>>,
    decoder: BlockDecoder<'_>,
    pool: &BufferPool,
    shared: &Shared,
    map: &BlockMap,
) {
    loop {
        let task = match work_rx.recv_timeout(POLL_INTERVAL) {
            Ok(Some(task)) => task,
            Ok(None) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {
                if shared.is_cancelled() {
                    break;
                }
                continue;
            }
        };
        if shared.is_cancelled() {
            // keep draining so the producer never blocks on a full queue
            continue;
        }
        let entry = map.entry(task.index);
        let payload = task
            .payload
            .as_deref()
            .map(|buf| &buf[..entry.length as usize]);
        let mut out = pool.rent();
        match decoder.decode(task.index, payload, &mut out) {
            Ok(()) => {
                let done = DoneBlock {
                    index: task.index,
                    data: out,
                };
                if send_or_cancel(&done_tx, Some(done), shared).is_err() {
                    break;
                }
            }
            Err(err) => shared.fail(err),
        }
    }
    let _ = done_tx.send(None);
}

fn run_hasher(
    done_rx: Receiver<Option<DoneBlock>>,
    header: &ChdHeader,
    shared: &Shared,
    gate: &AdmissionGate,
    want_md5: bool,
    want_sha1: bool,
    workers: usize,
) -> Result<DigestValues> {
    let mut digests = StreamDigests::new(want_md5, want_sha1);
    let mut ready = ReadySet::new();
    let mut hashed_bytes = 0u64;
    let mut finished_workers = 0usize;
    let block_bytes = u64::from(header.block_bytes);

    loop {
        let done = match done_rx.recv_timeout(POLL_INTERVAL) {
            Ok(Some(done)) => done,
            Ok(None) => {
                finished_workers += 1;
                if finished_workers == workers {
                    break;
                }
                continue;
            }
            Err(RecvTimeoutError::Timeout) => {
                if shared.is_cancelled() {
                    return Err(ChdError::Cancelled);
                }
                continue;
            }
            Err(RecvTimeoutError::Disconnected) => break,
        };
        for data in ready.insert(done.index, done.data) {
            // the final block may extend past the logical end of the image
            let take = (header.logical_bytes - hashed_bytes).min(block_bytes);
            digests.update(&data[..take as usize]);
            hashed_bytes += take;
            drop(data);
            gate.release();
        }
    }

    if shared.is_cancelled() {
        return Err(ChdError::Cancelled);
    }
    if ready.next_index() != header.total_blocks {
        return Err(ChdError::InvalidFormat("pipeline ended before hashing every block"));
    }
    Ok(digests.finalize())
}
