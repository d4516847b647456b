//! The per-filter worker thread.
//!
//! The worker owns the bitmap, the metadata cache and the table of outstanding
//! external transactions, and is the only thread that touches them. Other
//! threads reach it through [`Shared`]: a mutex-guarded state and pending
//! queue plus a condition variable.
//!
//! Each iteration pops one transaction, clones it into the parent's address
//! space if it is external, runs exactly one driver hook on it and acts on the
//! hook's [`TxnAction`]. Metadata transactions jump to the head of the queue;
//! data transactions join the tail.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};

use crate::bitmap::Bitmap;
use crate::block::{is_block_aligned, DataRange};
use crate::blockdev::BlockDevice;
use crate::cache::{BlockCache, CacheHandle, CacheStats, CachedBlock};
use crate::config::FilterConfig;
use crate::driver::{FilterDriver, TxnAction};
use crate::error::{FilterError, FilterResult};
use crate::sync_io::{read_block_sync, write_block_sync};
use crate::txn::{DeviceId, IoOp, Txn, TxnId, TxnIdGen, TxnOrigin};

/// Lifecycle of a worker. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum WorkerState {
    /// Accepting and processing transactions.
    Working,
    /// Unbound: new external transactions are rejected and queued ones fail.
    Stopping,
    /// Released: the worker exits once its queue is empty.
    Exiting,
}

/// Counters published by the worker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStats {
    /// External transactions accepted onto the queue.
    pub enqueued: u64,
    /// External transactions refused at the queue entry point.
    pub rejected: u64,
    /// Transactions popped from the queue.
    pub processed: u64,
    /// Transactions sent to the parent device.
    pub forwarded: u64,
    /// Transactions a hook asked to requeue.
    pub requeued: u64,
    /// External transactions completed.
    pub completed: u64,
    /// External transactions failed validation.
    pub invalid: u64,
    /// Late completions dropped after the worker drained.
    pub dropped: u64,
    /// Bitmap compression passes run.
    pub compress_passes: u64,
}

struct Pending {
    state: WorkerState,
    queue: VecDeque<Txn>,
    /// Metadata transactions at the head of `queue`.
    meta_len: usize,
    range: DataRange,
    drained: bool,
}

/// State shared between a worker and the threads that feed it.
pub(crate) struct Shared {
    device: DeviceId,
    pending: Mutex<Pending>,
    ready: Condvar,
    stats: Mutex<WorkerStats>,
}

impl Shared {
    pub(crate) fn new(device: DeviceId) -> Self {
        Self {
            device,
            pending: Mutex::new(Pending {
                state: WorkerState::Working,
                queue: VecDeque::new(),
                meta_len: 0,
                range: DataRange::default(),
                drained: false,
            }),
            ready: Condvar::new(),
            stats: Mutex::new(WorkerStats::default()),
        }
    }

    pub(crate) fn state(&self) -> WorkerState {
        self.pending.lock().state
    }

    pub(crate) fn stats(&self) -> WorkerStats {
        self.stats.lock().clone()
    }

    /// Moves to `state` if it is later than the current one.
    pub(crate) fn set_state(&self, state: WorkerState) -> bool {
        let mut pending = self.pending.lock();
        if state <= pending.state {
            return false;
        }
        info!(device = %self.device, from = ?pending.state, to = ?state, "worker state change");
        pending.state = state;
        drop(pending);
        self.ready.notify_all();
        true
    }

    fn set_range(&self, range: DataRange) {
        self.pending.lock().range = range;
    }

    /// Entry point for transactions from outside the filter.
    pub(crate) fn enqueue_external(&self, mut txn: Txn) {
        if txn.length == 0 {
            self.stats.lock().rejected += 1;
            debug!(device = %self.device, offset = txn.offset, "rejecting zero-length txn");
            txn.complete(Err(FilterError::invalid("zero-length transaction")), 0);
            return;
        }
        let mut pending = self.pending.lock();
        if pending.state != WorkerState::Working {
            drop(pending);
            self.stats.lock().rejected += 1;
            debug!(device = %self.device, offset = txn.offset, "rejecting txn, device closed");
            txn.complete(Err(FilterError::HandleClosed), 0);
            return;
        }
        txn.device = Some(self.device);
        pending.queue.push_back(txn);
        drop(pending);
        self.stats.lock().enqueued += 1;
        self.ready.notify_one();
    }

    /// Entry point for transactions the worker created, including their
    /// completions coming back from the parent.
    pub(crate) fn enqueue_internal(&self, txn: Txn) {
        self.enqueue_batch(vec![txn]);
    }

    /// Queues internal transactions, metadata at the head and data at the
    /// tail, keeping each group in the given order.
    fn enqueue_batch(&self, txns: Vec<Txn>) {
        let mut pending = self.pending.lock();
        if pending.drained {
            drop(pending);
            self.stats.lock().dropped += txns.len() as u64;
            for txn in txns {
                warn!(device = %self.device, ?txn, "dropping completion after worker exit");
            }
            return;
        }
        for txn in txns {
            if txn.blkoff() < pending.range.blkoff {
                // Behind earlier metadata, ahead of all data.
                let at = pending.meta_len;
                pending.queue.insert(at, txn);
                pending.meta_len += 1;
            } else {
                pending.queue.push_back(txn);
            }
        }
        drop(pending);
        self.ready.notify_one();
    }

    fn requeue(&self, txn: Txn) {
        self.pending.lock().queue.push_back(txn);
        self.ready.notify_one();
    }

    /// Blocks until a transaction is available. Returns `None` once the
    /// worker is exiting and the queue is empty.
    fn pop(&self) -> Option<(Txn, WorkerState)> {
        let mut pending = self.pending.lock();
        loop {
            if let Some(txn) = pending.queue.pop_front() {
                pending.meta_len = pending.meta_len.saturating_sub(1);
                return Some((txn, pending.state));
            }
            if pending.state == WorkerState::Exiting {
                pending.drained = true;
                return None;
            }
            self.ready.wait(&mut pending);
        }
    }
}

/// Worker-side view handed to driver hooks.
pub struct Worker {
    shared: Arc<Shared>,
    parent: Arc<dyn BlockDevice>,
    config: FilterConfig,
    ids: Arc<TxnIdGen>,
    bitmap: Bitmap,
    cache: CacheHandle,
    outstanding: HashMap<TxnId, Txn>,
    range: DataRange,
    total_blocks: u64,
    iterations: u64,
    /// Set once no more transactions will be processed.
    closed: bool,
}

/// Body of the worker thread. Reports the negotiated data range (or the
/// failure) through `bound`, then runs until the device is released.
pub(crate) fn run_worker(
    shared: Arc<Shared>,
    parent: Arc<dyn BlockDevice>,
    mut driver: Box<dyn FilterDriver>,
    config: FilterConfig,
    total_blocks: u64,
    bound: oneshot::Sender<FilterResult<DataRange>>,
) -> FilterResult<()> {
    let mut worker = match Worker::new(shared, parent, config, total_blocks) {
        Ok(worker) => worker,
        Err(e) => {
            let _ = bound.send(Err(e.clone()));
            return Err(e);
        }
    };
    match worker.prepare(driver.as_mut()) {
        Ok(range) => {
            let _ = bound.send(Ok(range));
        }
        Err(e) => {
            warn!(error = %e, "driver prepare failed");
            worker.closed = true;
            if let Err(release) = driver.release(&mut worker) {
                warn!(error = %release, "driver release failed");
            }
            let _ = bound.send(Err(e.clone()));
            return Err(e);
        }
    }
    worker.run(driver)
}

impl Worker {
    pub(crate) fn new(
        shared: Arc<Shared>,
        parent: Arc<dyn BlockDevice>,
        config: FilterConfig,
        total_blocks: u64,
    ) -> FilterResult<Self> {
        config.validate()?;
        let ids = Arc::new(TxnIdGen::new());
        let bitmap = Bitmap::new(total_blocks)?;
        let cache = BlockCache::new(config.cache_entries, config.cache_buckets, Arc::clone(&ids))?
            .into_handle();
        debug!(parent = parent.name(), total_blocks, "worker initialised");
        Ok(Self {
            shared,
            parent,
            config,
            ids,
            bitmap,
            cache,
            outstanding: HashMap::new(),
            range: DataRange::default(),
            total_blocks,
            iterations: 0,
            closed: false,
        })
    }

    /// Identity of the device this worker serves.
    pub fn device_id(&self) -> DeviceId {
        self.shared.device
    }

    /// The parent device.
    pub fn parent(&self) -> &dyn BlockDevice {
        self.parent.as_ref()
    }

    /// Number of filter blocks on the parent.
    pub fn total_blocks(&self) -> u64 {
        self.total_blocks
    }

    /// The data region; empty until `prepare` has returned.
    pub fn data_range(&self) -> DataRange {
        self.range
    }

    /// Current lifecycle state.
    pub fn state(&self) -> WorkerState {
        self.shared.state()
    }

    /// True if `blkoff` is in the data region.
    pub fn is_data(&self, blkoff: u64) -> bool {
        self.range.contains(blkoff)
    }

    /// True if block `blkoff` is marked.
    pub fn check_block(&self, blkoff: u64) -> bool {
        self.bitmap.is_set(blkoff)
    }

    /// True if every block in `[blkoff, blkmax)` is marked; otherwise
    /// `blkoff` is advanced to the first unmarked block.
    pub fn check_blocks(&mut self, blkoff: &mut u64, blkmax: u64) -> bool {
        self.bitmap.get(blkoff, blkmax)
    }

    /// Marks block `blkoff`.
    pub fn mark_block(&mut self, blkoff: u64) -> FilterResult<()> {
        self.bitmap.set(blkoff)
    }

    /// Unmarks every block in `[blkoff, blkmax)`.
    pub fn clear_blocks(&mut self, blkoff: u64, blkmax: u64) -> FilterResult<()> {
        self.bitmap.clr(blkoff, blkmax)
    }

    /// Runs a bitmap compression pass.
    pub fn compress_bitmap(&mut self) {
        self.bitmap.compress();
        self.shared.stats.lock().compress_passes += 1;
        debug!(
            rle_chunks = self.bitmap.rle_chunk_count(),
            chunks = self.bitmap.chunk_count(),
            "bitmap compression pass"
        );
    }

    /// The block bitmap.
    pub fn bitmap(&self) -> &Bitmap {
        &self.bitmap
    }

    /// Pins metadata block `blkoff` in the cache, fetching it if needed.
    /// Data blocks cannot be cached, and nothing can be pinned once the
    /// worker has stopped processing (e.g. from `release`).
    pub fn acquire_block(&mut self, blkoff: u64) -> FilterResult<CachedBlock> {
        if self.closed {
            return Err(FilterError::HandleClosed);
        }
        if blkoff >= self.total_blocks {
            return Err(FilterError::invalid(format!(
                "block {} is beyond the device ({} blocks)",
                blkoff, self.total_blocks
            )));
        }
        if self.is_data(blkoff) {
            return Err(FilterError::invalid(format!(
                "block {} is in the data region {}",
                blkoff, self.range
            )));
        }
        BlockCache::acquire(&self.cache, blkoff)
    }

    /// Cache statistics.
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.borrow().stats()
    }

    /// Reads the start of block `blkoff` from the parent, blocking this thread.
    pub fn read_blocking(&self, blkoff: u64, out: &mut [u8]) -> FilterResult<()> {
        read_block_sync(self.parent.as_ref(), blkoff, out)
    }

    /// Writes `data` to block `blkoff` on the parent, blocking this thread.
    /// A cached copy of a metadata block is updated to match.
    pub fn write_blocking(&self, blkoff: u64, data: &[u8]) -> FilterResult<()> {
        write_block_sync(self.parent.as_ref(), blkoff, data)?;
        if !self.is_data(blkoff) {
            self.cache.borrow_mut().refresh(blkoff, data);
        }
        Ok(())
    }

    fn set_range(&mut self, range: DataRange) {
        self.range = range;
        self.shared.set_range(range);
    }

    fn prepare(&mut self, driver: &mut dyn FilterDriver) -> FilterResult<DataRange> {
        let total = self.total_blocks;
        let range = driver.prepare(self, total)?;
        match range.blkoff.checked_add(range.blklen) {
            Some(blkmax) if blkmax <= total => {}
            _ => {
                return Err(FilterError::invalid(format!(
                    "data range {} exceeds {} blocks",
                    range, total
                )))
            }
        }
        self.set_range(range);
        self.flush();
        info!(
            device = %self.shared.device,
            parent = self.parent.name(),
            data = %range,
            "filter prepared"
        );
        Ok(range)
    }

    fn run(mut self, mut driver: Box<dyn FilterDriver>) -> FilterResult<()> {
        while let Some((txn, state)) = self.shared.pop() {
            self.process(driver.as_mut(), txn, state);
            self.flush();
            self.iterations += 1;
            if self.iterations % self.config.compress_interval == 0 {
                self.compress_bitmap();
            }
        }
        self.closed = true;
        let result = driver.release(&mut self);
        if let Err(e) = &result {
            warn!(device = %self.shared.device, error = %e, "driver release failed");
        }
        self.fail_outstanding();
        info!(device = %self.shared.device, iterations = self.iterations, "worker exited");
        result
    }

    fn is_external(&self, txn: &Txn) -> bool {
        txn.device == Some(self.shared.device)
    }

    fn process(&mut self, driver: &mut dyn FilterDriver, mut txn: Txn, state: WorkerState) {
        self.shared.stats.lock().processed += 1;
        if state != WorkerState::Working && txn.status.is_ok() {
            txn.status = Err(FilterError::HandleClosed);
        }
        if txn.status.is_err() {
            self.complete(txn);
            return;
        }
        if self.is_external(&txn) {
            match self.clone_external(txn) {
                Some(clone) => txn = clone,
                None => return,
            }
        }

        let pre_io = txn.is_pre_io();
        trace!(id = txn.id.0, op = %txn.op, offset = txn.offset, pre_io, "running hook");
        let action = match (pre_io, txn.op) {
            (true, IoOp::Read) => driver.before_read(self, txn),
            (true, IoOp::Write) => driver.before_write(self, txn),
            (false, IoOp::Read) => driver.after_read(self, txn),
            (false, IoOp::Write) => driver.after_write(self, txn),
        };
        match action {
            TxnAction::Ignore => {}
            TxnAction::Requeue(txn) => {
                self.shared.stats.lock().requeued += 1;
                self.shared.requeue(txn);
            }
            TxnAction::Continue(txn) if pre_io => self.forward(txn),
            TxnAction::Continue(txn) => {
                warn!(id = txn.id.0, offset = txn.offset, "hook continued a txn after I/O");
                self.complete(txn);
            }
            TxnAction::Complete(txn) => self.complete(txn),
        }
    }

    /// Validates an external transaction and makes the clone that will travel
    /// to the parent. The original waits in the outstanding table.
    fn clone_external(&mut self, mut txn: Txn) -> Option<Txn> {
        let data_len = self.range.byte_length();
        if !is_block_aligned(txn.offset) || !is_block_aligned(txn.length) || txn.offset >= data_len {
            self.shared.stats.lock().invalid += 1;
            debug!(
                offset = txn.offset,
                length = txn.length,
                data_len,
                "rejecting misaligned or out-of-range txn"
            );
            let reason = format!(
                "offset {} length {} outside a {} byte device",
                txn.offset, txn.length, data_len
            );
            txn.device = None;
            txn.complete(Err(FilterError::invalid(reason)), 0);
            return None;
        }
        let id = self.ids.next_id();
        let length = txn.length.min(data_len - txn.offset);
        let clone = Txn::internal(
            self.ids.next_id(),
            txn.op,
            self.range.byte_offset() + txn.offset,
            length,
            txn.buffer(),
            TxnOrigin::Clone(id),
        );
        self.outstanding.insert(id, txn);
        Some(clone)
    }

    fn forward(&mut self, mut txn: Txn) {
        let first = txn.blkoff();
        if let Some(cursor) = txn.cursor_mut() {
            cursor.blkoff = first;
        }
        let shared = Arc::clone(&self.shared);
        txn.set_completion(move |done| shared.enqueue_internal(done));
        self.shared.stats.lock().forwarded += 1;
        trace!(id = txn.id.0, op = %txn.op, offset = txn.offset, "forwarding to parent");
        self.parent.queue(txn);
    }

    /// Routes a finished transaction: externals to their callback, clones back
    /// onto their original, cache I/O to the cache.
    fn complete(&mut self, mut txn: Txn) {
        if self.is_external(&txn) {
            self.shared.stats.lock().completed += 1;
            trace!(id = txn.id.0, status = ?txn.status, actual = txn.actual, "completing external txn");
            txn.device = None;
            txn.finish();
            return;
        }
        match txn.cookie.map(|c| c.origin) {
            Some(TxnOrigin::Clone(id)) => match self.outstanding.remove(&id) {
                Some(mut original) => {
                    original.status = txn.status.clone();
                    original.actual = txn.actual;
                    self.complete(original);
                }
                None => warn!(id = id.0, "clone completed for an unknown txn"),
            },
            Some(TxnOrigin::Cache(_)) => self.cache.borrow_mut().process(txn),
            None => {
                warn!(?txn, "completing a txn this worker does not own");
                txn.finish();
            }
        }
    }

    /// Queues whatever the cache produced during the last hook.
    fn flush(&mut self) {
        let txns = self.cache.borrow_mut().take_outbox();
        if !txns.is_empty() {
            self.shared.enqueue_batch(txns);
        }
    }

    fn fail_outstanding(&mut self) {
        let outstanding = std::mem::take(&mut self.outstanding);
        if !outstanding.is_empty() {
            warn!(count = outstanding.len(), "failing outstanding txns at exit");
        }
        for (_, mut txn) in outstanding {
            txn.status = Err(FilterError::HandleClosed);
            txn.actual = 0;
            self.complete(txn);
        }
    }
}
