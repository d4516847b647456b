//! Fixed-size pool of metadata block buffers.
//!
//! Entries are addressed by block offset through a small array of hash
//! buckets and recycled through an LRU list. A pinned entry (refcount above
//! zero) is never in the LRU. Unpinned clean entries stay addressable in their
//! bucket until they are repurposed, so a later acquire of the same offset
//! hits without I/O. Writes that bypass the cache must go through
//! [`BlockCache::refresh`] to keep such entries coherent.
//!
//! The cache never queues transactions itself. Fetches and write-backs are
//! collected in an outbox that the worker drains after every hook call, and
//! dependents woken by a completion go the same way.
//!
//! At most one read or write is in flight for any entry at a time: a fetch is
//! only issued when an entry is repurposed, and a write-back only once the
//! entry is unpinned with no I/O outstanding.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::block::BLOCK_SIZE;
use crate::error::{FilterError, FilterResult};
use crate::txn::{IoOp, Txn, TxnBuffer, TxnCookie, TxnIdGen, TxnOrigin};

/// Statistics tracking for the block cache.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Acquires satisfied by an entry already holding the block.
    pub hits: u64,
    /// Acquires that repurposed an entry and issued a fetch.
    pub misses: u64,
    /// Entries repurposed while still holding another block.
    pub evictions: u64,
    /// Acquires failed because every entry was pinned.
    pub exhausted: u64,
    /// Write-backs completed successfully.
    pub writebacks: u64,
    /// Fetches or write-backs that failed.
    pub fetch_errors: u64,
}

impl CacheStats {
    /// Calculates the cache hit rate as a ratio of hits to total acquires.
    ///
    /// Returns 0.0 if there have been no acquires.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct Slot {
    blkoff: Option<u64>,
    buffer: TxnBuffer,
    ready: bool,
    dirty: bool,
    refcount: u32,
    in_flight: Option<IoOp>,
    error: Option<FilterError>,
    deps: VecDeque<Txn>,
}

impl Slot {
    fn new() -> Self {
        Self {
            blkoff: None,
            buffer: Arc::new(Mutex::new(vec![0u8; BLOCK_SIZE as usize])),
            ready: false,
            dirty: false,
            refcount: 0,
            in_flight: None,
            error: None,
            deps: VecDeque::new(),
        }
    }
}

/// Shared handle to a worker's cache. Never leaves the worker thread.
pub(crate) type CacheHandle = Rc<RefCell<BlockCache>>;

pub(crate) struct BlockCache {
    slots: Vec<Slot>,
    buckets: Vec<Vec<usize>>,
    lru: VecDeque<usize>,
    outbox: Vec<Txn>,
    ids: Arc<TxnIdGen>,
    stats: CacheStats,
}

/// djb2a over the little-endian bytes of the offset.
fn hash_blkoff(blkoff: u64) -> u64 {
    blkoff
        .to_le_bytes()
        .iter()
        .fold(5381u64, |h, &b| h.wrapping_mul(33) ^ u64::from(b))
}

impl BlockCache {
    pub(crate) fn new(entries: usize, buckets: usize, ids: Arc<TxnIdGen>) -> FilterResult<Self> {
        if entries == 0 || !buckets.is_power_of_two() {
            return Err(FilterError::invalid(format!(
                "cache of {} entries in {} buckets",
                entries, buckets
            )));
        }
        debug!(entries, buckets, "created block cache");
        Ok(Self {
            slots: (0..entries).map(|_| Slot::new()).collect(),
            buckets: vec![Vec::new(); buckets],
            lru: (0..entries).collect(),
            outbox: Vec::new(),
            ids,
            stats: CacheStats::default(),
        })
    }

    pub(crate) fn into_handle(self) -> CacheHandle {
        Rc::new(RefCell::new(self))
    }

    /// Finds or repurposes an entry for `blkoff` and pins it. The returned
    /// block is not necessarily ready.
    pub(crate) fn acquire(cache: &CacheHandle, blkoff: u64) -> FilterResult<CachedBlock> {
        let slot = cache.borrow_mut().pin(blkoff)?;
        Ok(CachedBlock {
            cache: Rc::clone(cache),
            slot,
        })
    }

    pub(crate) fn stats(&self) -> CacheStats {
        self.stats.clone()
    }

    /// Transactions the worker must queue, in order.
    pub(crate) fn take_outbox(&mut self) -> Vec<Txn> {
        std::mem::take(&mut self.outbox)
    }

    /// Number of entries that can be repurposed right now.
    pub(crate) fn lru_len(&self) -> usize {
        self.lru.len()
    }

    fn bucket_of(&self, blkoff: u64) -> usize {
        (hash_blkoff(blkoff) & (self.buckets.len() as u64 - 1)) as usize
    }

    fn lookup(&self, blkoff: u64) -> Option<usize> {
        self.buckets[self.bucket_of(blkoff)]
            .iter()
            .copied()
            .find(|&slot| self.slots[slot].blkoff == Some(blkoff))
    }

    fn unlink_bucket(&mut self, slot: usize) {
        if let Some(old) = self.slots[slot].blkoff.take() {
            let bucket = self.bucket_of(old);
            self.buckets[bucket].retain(|&s| s != slot);
        }
    }

    fn pin(&mut self, blkoff: u64) -> FilterResult<usize> {
        if let Some(slot) = self.lookup(blkoff) {
            let entry = &mut self.slots[slot];
            if entry.refcount == 0 {
                if let Some(pos) = self.lru.iter().position(|&s| s == slot) {
                    self.lru.remove(pos);
                }
            }
            let entry = &mut self.slots[slot];
            entry.refcount += 1;
            self.stats.hits += 1;
            trace!(blkoff, slot, refcount = entry.refcount, "cache hit");
            return Ok(slot);
        }

        let Some(slot) = self.lru.pop_front() else {
            self.stats.exhausted += 1;
            debug!(blkoff, "cache exhausted, every entry pinned");
            return Err(FilterError::NoResources {
                reason: format!("no unpinned cache entry for block {}", blkoff),
            });
        };
        if let Some(old) = self.slots[slot].blkoff {
            self.stats.evictions += 1;
            debug!(slot, old, blkoff, "evicting cache entry");
            self.unlink_bucket(slot);
        }
        self.stats.misses += 1;

        let id = self.ids.next_id();
        let entry = &mut self.slots[slot];
        entry.blkoff = Some(blkoff);
        entry.ready = false;
        entry.dirty = false;
        entry.error = None;
        entry.refcount = 1;
        entry.in_flight = Some(IoOp::Read);
        entry.buffer.lock().fill(0);
        let txn = Txn::internal(
            id,
            IoOp::Read,
            blkoff * BLOCK_SIZE,
            BLOCK_SIZE,
            Arc::clone(&entry.buffer),
            TxnOrigin::Cache(slot),
        );
        let bucket = self.bucket_of(blkoff);
        self.buckets[bucket].push(slot);
        self.outbox.push(txn);
        debug!(blkoff, slot, "cache miss, fetching");
        Ok(slot)
    }

    fn release(&mut self, slot: usize) {
        let entry = &mut self.slots[slot];
        debug_assert!(entry.refcount > 0);
        entry.refcount = entry.refcount.saturating_sub(1);
        if entry.refcount > 0 {
            return;
        }
        if entry.in_flight.is_some() {
            trace!(slot, "release deferred until I/O completes");
            return;
        }
        self.settle(slot);
    }

    /// Places an unpinned entry with no I/O outstanding.
    fn settle(&mut self, slot: usize) {
        let entry = &self.slots[slot];
        if entry.error.is_some() {
            // Forget the block so the next acquire fetches it again.
            self.unlink_bucket(slot);
            self.lru.push_front(slot);
        } else if entry.dirty {
            self.start_writeback(slot);
        } else {
            self.lru.push_back(slot);
        }
    }

    fn start_writeback(&mut self, slot: usize) {
        let id = self.ids.next_id();
        let entry = &mut self.slots[slot];
        let Some(blkoff) = entry.blkoff else {
            return;
        };
        entry.refcount = 1;
        entry.ready = false;
        entry.dirty = false;
        entry.in_flight = Some(IoOp::Write);
        let txn = Txn::internal(
            id,
            IoOp::Write,
            blkoff * BLOCK_SIZE,
            BLOCK_SIZE,
            Arc::clone(&entry.buffer),
            TxnOrigin::Cache(slot),
        );
        debug!(blkoff, slot, "writing back dirty block");
        self.outbox.push(txn);
    }

    /// Mirrors a write of `data` to the start of block `blkoff` made directly
    /// on the parent. The rest of the block is zeroed, as the direct write
    /// does. A write-back in flight may still carry the old contents, so the
    /// entry is marked dirty to write it again once that completes.
    pub(crate) fn refresh(&mut self, blkoff: u64, data: &[u8]) {
        let Some(slot) = self.lookup(blkoff) else {
            return;
        };
        let entry = &mut self.slots[slot];
        if entry.error.is_some() {
            return;
        }
        {
            let mut buffer = entry.buffer.lock();
            buffer.fill(0);
            let n = data.len().min(buffer.len());
            buffer[..n].copy_from_slice(&data[..n]);
        }
        entry.dirty = entry.in_flight == Some(IoOp::Write);
        debug!(blkoff, slot, dirty = entry.dirty, "refreshed cached block");
    }

    /// Handles the completion of a fetch or write-back.
    pub(crate) fn process(&mut self, txn: Txn) {
        let slot = match txn.cookie {
            Some(TxnCookie {
                origin: TxnOrigin::Cache(slot),
                ..
            }) if slot < self.slots.len() => slot,
            _ => {
                warn!(?txn, "cache asked to process a foreign transaction");
                return;
            }
        };
        let entry = &mut self.slots[slot];
        if entry.in_flight != Some(txn.op) {
            warn!(slot, op = %txn.op, "unexpected cache completion");
            return;
        }
        entry.in_flight = None;
        match (&txn.status, txn.op) {
            (Ok(()), IoOp::Read) => {
                entry.ready = true;
            }
            (Ok(()), IoOp::Write) => {
                entry.ready = true;
                self.stats.writebacks += 1;
            }
            (Err(e), IoOp::Read) => {
                warn!(blkoff = ?entry.blkoff, error = %e, "metadata fetch failed");
                // The buffer never held the block; never write it back.
                entry.dirty = false;
                entry.error = Some(e.clone());
                self.stats.fetch_errors += 1;
            }
            (Err(e), IoOp::Write) => {
                // The data in memory is intact; the write is not retried.
                warn!(blkoff = ?entry.blkoff, error = %e, "metadata write-back failed");
                entry.ready = true;
                self.stats.fetch_errors += 1;
            }
        }
        let woken = entry.deps.len();
        let failed = match (&txn.status, txn.op) {
            (Err(e), IoOp::Read) => Some(e.clone()),
            _ => None,
        };
        for mut dep in entry.deps.drain(..) {
            // Dependents of a failed fetch fail with it.
            if let Some(e) = &failed {
                dep.status = Err(e.clone());
            }
            self.outbox.push(dep);
        }
        if woken > 0 {
            trace!(slot, woken, "requeueing dependents");
        }
        if txn.op == IoOp::Write {
            entry.refcount = entry.refcount.saturating_sub(1);
        }
        if entry.refcount == 0 {
            self.settle(slot);
        }
    }
}

/// A pinned cache entry. Dropping the guard unpins it; an unpinned dirty
/// entry is written back.
pub struct CachedBlock {
    cache: CacheHandle,
    slot: usize,
}

impl CachedBlock {
    /// Block offset on the parent device.
    pub fn blkoff(&self) -> u64 {
        self.cache.borrow().slots[self.slot].blkoff.unwrap_or_default()
    }

    /// True once the block's data has been fetched.
    pub fn is_ready(&self) -> bool {
        self.cache.borrow().slots[self.slot].ready
    }

    /// True if the block has been modified since it was last written.
    pub fn is_dirty(&self) -> bool {
        self.cache.borrow().slots[self.slot].dirty
    }

    /// The error of a failed fetch, if any.
    pub fn error(&self) -> Option<FilterError> {
        self.cache.borrow().slots[self.slot].error.clone()
    }

    /// Number of pins on this block.
    pub fn refcount(&self) -> u32 {
        self.cache.borrow().slots[self.slot].refcount
    }

    /// Hands `txn` back if the block is ready or has failed. Otherwise parks
    /// it until the block's I/O completes, after which it is queued again.
    pub fn wait(&self, txn: Txn) -> Option<Txn> {
        let mut cache = self.cache.borrow_mut();
        let entry = &mut cache.slots[self.slot];
        if entry.ready || entry.error.is_some() {
            return Some(txn);
        }
        trace!(slot = self.slot, id = txn.id().0, "txn waiting on block");
        entry.deps.push_back(txn);
        None
    }

    /// Copies block bytes starting at `offset` into `out`.
    pub fn read(&self, offset: usize, out: &mut [u8]) -> FilterResult<()> {
        let cache = self.cache.borrow();
        let entry = &cache.slots[self.slot];
        if !entry.ready {
            return Err(FilterError::invalid("block is not ready"));
        }
        let data = entry.buffer.lock();
        let end = bounds(offset, out.len())?;
        out.copy_from_slice(&data[offset..end]);
        Ok(())
    }

    /// Copies `data` into the block at `offset` and marks it dirty. Fails
    /// with the fetch error on a block that could not be read.
    pub fn write(&self, offset: usize, data: &[u8]) -> FilterResult<()> {
        let end = bounds(offset, data.len())?;
        let mut cache = self.cache.borrow_mut();
        let entry = &mut cache.slots[self.slot];
        if let Some(e) = &entry.error {
            return Err(e.clone());
        }
        entry.buffer.lock()[offset..end].copy_from_slice(data);
        entry.dirty = true;
        Ok(())
    }
}

fn bounds(offset: usize, len: usize) -> FilterResult<usize> {
    match offset.checked_add(len) {
        Some(end) if end as u64 <= BLOCK_SIZE => Ok(end),
        _ => Err(FilterError::invalid(format!(
            "range {}+{} is outside the block",
            offset, len
        ))),
    }
}

impl Clone for CachedBlock {
    fn clone(&self) -> Self {
        self.cache.borrow_mut().slots[self.slot].refcount += 1;
        Self {
            cache: Rc::clone(&self.cache),
            slot: self.slot,
        }
    }
}

impl Drop for CachedBlock {
    fn drop(&mut self) {
        self.cache.borrow_mut().release(self.slot);
    }
}

impl fmt::Debug for CachedBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cache = self.cache.borrow();
        let entry = &cache.slots[self.slot];
        f.debug_struct("CachedBlock")
            .field("slot", &self.slot)
            .field("blkoff", &entry.blkoff)
            .field("ready", &entry.ready)
            .field("dirty", &entry.dirty)
            .field("refcount", &entry.refcount)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(entries: usize) -> CacheHandle {
        BlockCache::new(entries, 32, Arc::new(TxnIdGen::new()))
            .unwrap()
            .into_handle()
    }

    /// Completes every outboxed transaction as the parent would.
    fn complete_io(cache: &CacheHandle, ok: bool) -> usize {
        let txns = cache.borrow_mut().take_outbox();
        let count = txns.len();
        for mut txn in txns {
            if ok {
                txn.actual = txn.length;
            } else {
                txn.status = Err(FilterError::io("media error"));
            }
            cache.borrow_mut().process(txn);
        }
        count
    }

    #[test]
    fn test_rejects_bad_geometry() {
        let ids = Arc::new(TxnIdGen::new());
        assert!(BlockCache::new(0, 32, Arc::clone(&ids)).is_err());
        assert!(BlockCache::new(16, 12, ids).is_err());
    }

    #[test]
    fn test_miss_issues_fetch() {
        let cache = cache(4);
        let block = BlockCache::acquire(&cache, 3).unwrap();
        assert!(!block.is_ready());
        assert_eq!(block.blkoff(), 3);

        let outbox = cache.borrow_mut().take_outbox();
        assert_eq!(outbox.len(), 1);
        assert_eq!(outbox[0].op, IoOp::Read);
        assert_eq!(outbox[0].offset, 3 * BLOCK_SIZE);
        assert_eq!(outbox[0].length, BLOCK_SIZE);
        assert_eq!(cache.borrow().stats().misses, 1);
    }

    #[test]
    fn test_acquire_twice_same_block() {
        let cache = cache(4);
        let a = BlockCache::acquire(&cache, 9).unwrap();
        let b = BlockCache::acquire(&cache, 9).unwrap();
        assert_eq!(a.slot, b.slot);
        assert_eq!(a.refcount(), 2);
        assert_eq!(cache.borrow_mut().take_outbox().len(), 1);
        assert_eq!(cache.borrow().stats().hits, 1);
    }

    #[test]
    fn test_exhaustion() {
        let cache = cache(256);
        let pinned: Vec<_> = (0..256)
            .map(|b| BlockCache::acquire(&cache, b).unwrap())
            .collect();
        let result = BlockCache::acquire(&cache, 256);
        assert!(matches!(result, Err(FilterError::NoResources { .. })));
        assert_eq!(cache.borrow().stats().exhausted, 1);
        drop(pinned);
    }

    #[test]
    fn test_clean_release_returns_to_lru() {
        let cache = cache(4);
        let block = BlockCache::acquire(&cache, 1).unwrap();
        complete_io(&cache, true);
        assert!(block.is_ready());
        assert_eq!(cache.borrow().lru_len(), 3);

        drop(block);
        assert_eq!(cache.borrow().lru_len(), 4);
        assert_eq!(cache.borrow().lru.back(), Some(&0));

        // Still addressable: a second acquire hits without I/O.
        let again = BlockCache::acquire(&cache, 1).unwrap();
        assert!(again.is_ready());
        assert!(cache.borrow_mut().take_outbox().is_empty());
        assert_eq!(cache.borrow().lru_len(), 3);
    }

    #[test]
    fn test_dirty_release_writes_back() {
        let cache = cache(4);
        let block = BlockCache::acquire(&cache, 2).unwrap();
        complete_io(&cache, true);
        block.write(16, b"root hash").unwrap();
        assert!(block.is_dirty());
        let slot = block.slot;
        drop(block);

        {
            let c = cache.borrow();
            assert_eq!(c.slots[slot].refcount, 1);
            assert!(!c.slots[slot].ready);
            assert_eq!(c.slots[slot].in_flight, Some(IoOp::Write));
            assert_eq!(c.lru_len(), 3);
        }
        let outbox = cache.borrow_mut().take_outbox();
        assert_eq!(outbox.len(), 1);
        assert_eq!(outbox[0].op, IoOp::Write);
        let mut out = [0u8; 9];
        outbox[0].copy_from(16, &mut out);
        assert_eq!(&out, b"root hash");

        for mut txn in outbox {
            txn.actual = txn.length;
            cache.borrow_mut().process(txn);
        }
        let c = cache.borrow();
        assert_eq!(c.slots[slot].refcount, 0);
        assert!(!c.slots[slot].dirty);
        assert_eq!(c.lru_len(), 4);
        assert_eq!(c.stats().writebacks, 1);
    }

    #[test]
    fn test_dirty_during_read_writes_back_on_completion() {
        let cache = cache(4);
        let block = BlockCache::acquire(&cache, 5).unwrap();
        block.write(0, &[1, 2, 3]).unwrap();
        let slot = block.slot;
        drop(block);
        // Fetch still outstanding: nothing settles yet.
        assert_eq!(cache.borrow().lru_len(), 3);
        let fetch = cache.borrow_mut().take_outbox();
        assert_eq!(fetch.len(), 1);

        for mut txn in fetch {
            txn.actual = txn.length;
            cache.borrow_mut().process(txn);
        }
        let outbox = cache.borrow_mut().take_outbox();
        assert_eq!(outbox.len(), 1);
        assert_eq!(outbox[0].op, IoOp::Write);
        assert_eq!(cache.borrow().slots[slot].refcount, 1);
    }

    #[test]
    fn test_dirty_then_failed_fetch_not_written_back() {
        let cache = cache(4);
        let block = BlockCache::acquire(&cache, 5).unwrap();
        block.write(0, &[1, 2, 3]).unwrap();
        drop(block);
        complete_io(&cache, false);

        assert!(cache.borrow_mut().take_outbox().is_empty());
        assert!(cache.borrow().lookup(5).is_none());
        assert_eq!(cache.borrow().lru_len(), 4);
        assert_eq!(cache.borrow().stats().writebacks, 0);
    }

    #[test]
    fn test_write_rejected_after_failed_fetch() {
        let cache = cache(4);
        let block = BlockCache::acquire(&cache, 5).unwrap();
        complete_io(&cache, false);
        assert!(matches!(
            block.write(0, &[1]),
            Err(FilterError::Io { .. })
        ));
        assert!(!block.is_dirty());
        drop(block);
        assert!(cache.borrow_mut().take_outbox().is_empty());
    }

    #[test]
    fn test_refresh_updates_cached_copy() {
        let cache = cache(4);
        let block = BlockCache::acquire(&cache, 3).unwrap();
        complete_io(&cache, true);
        block.write(100, &[7; 4]).unwrap();
        drop(block);
        // Write-back of the old contents is in flight.
        let writeback = cache.borrow_mut().take_outbox();
        assert_eq!(writeback.len(), 1);

        cache.borrow_mut().refresh(3, b"fresh");
        let slot = cache.borrow().lookup(3).unwrap();
        assert!(cache.borrow().slots[slot].dirty);
        for mut txn in writeback {
            txn.actual = txn.length;
            cache.borrow_mut().process(txn);
        }
        // The refreshed contents go out in a second write-back.
        let again = cache.borrow_mut().take_outbox();
        assert_eq!(again.len(), 1);
        let mut out = [0u8; 5];
        again[0].copy_from(0, &mut out);
        assert_eq!(&out, b"fresh");
        let mut tail = [0xFFu8; 4];
        again[0].copy_from(100, &mut tail);
        assert_eq!(tail, [0; 4]);
    }

    #[test]
    fn test_refresh_of_clean_entry() {
        let cache = cache(4);
        drop({
            let block = BlockCache::acquire(&cache, 2).unwrap();
            complete_io(&cache, true);
            block
        });
        cache.borrow_mut().refresh(2, b"v2");
        cache.borrow_mut().refresh(9, b"not cached");

        let block = BlockCache::acquire(&cache, 2).unwrap();
        assert!(!block.is_dirty());
        let mut out = [0u8; 2];
        block.read(0, &mut out).unwrap();
        assert_eq!(&out, b"v2");
        assert!(cache.borrow_mut().take_outbox().is_empty());
        assert!(cache.borrow().lookup(9).is_none());
    }

    #[test]
    fn test_dependents_requeued_in_order() {
        let cache = cache(4);
        let block = BlockCache::acquire(&cache, 7).unwrap();
        let fetch = cache.borrow_mut().take_outbox();

        for offset in [10u64, 20, 30] {
            let txn = Txn::new(IoOp::Read, offset * BLOCK_SIZE, BLOCK_SIZE);
            assert!(block.wait(txn).is_none());
        }
        for mut txn in fetch {
            txn.actual = txn.length;
            cache.borrow_mut().process(txn);
        }
        let woken: Vec<u64> = cache
            .borrow_mut()
            .take_outbox()
            .iter()
            .map(|t| t.offset / BLOCK_SIZE)
            .collect();
        assert_eq!(woken, vec![10, 20, 30]);

        let txn = Txn::new(IoOp::Read, 0, BLOCK_SIZE);
        assert!(block.wait(txn).is_some());
    }

    #[test]
    fn test_failed_fetch_fails_dependents() {
        let cache = cache(4);
        let block = BlockCache::acquire(&cache, 6).unwrap();
        assert!(block.wait(Txn::new(IoOp::Read, 0, BLOCK_SIZE)).is_none());
        complete_io(&cache, false);
        let woken = cache.borrow_mut().take_outbox();
        assert_eq!(woken.len(), 1);
        assert!(matches!(woken[0].status, Err(FilterError::Io { .. })));
    }

    #[test]
    fn test_failed_fetch_is_forgotten() {
        let cache = cache(4);
        let block = BlockCache::acquire(&cache, 4).unwrap();
        complete_io(&cache, false);
        assert!(!block.is_ready());
        assert!(matches!(block.error(), Some(FilterError::Io { .. })));
        let txn = Txn::new(IoOp::Read, 0, BLOCK_SIZE);
        assert!(block.wait(txn).is_some());
        drop(block);

        let again = BlockCache::acquire(&cache, 4).unwrap();
        assert!(again.error().is_none());
        assert_eq!(cache.borrow_mut().take_outbox().len(), 1);
        assert_eq!(cache.borrow().stats().fetch_errors, 1);
        assert_eq!(cache.borrow().stats().misses, 2);
    }

    #[test]
    fn test_eviction_reuses_least_recent() {
        let cache = cache(2);
        for blkoff in [1u64, 2] {
            let block = BlockCache::acquire(&cache, blkoff).unwrap();
            complete_io(&cache, true);
            drop(block);
        }
        // Touch 1 so that 2 is least recent.
        drop(BlockCache::acquire(&cache, 1).unwrap());
        let block = BlockCache::acquire(&cache, 3).unwrap();
        complete_io(&cache, true);
        drop(block);

        assert_eq!(cache.borrow().stats().evictions, 1);
        assert!(cache.borrow().lookup(2).is_none());
        assert!(cache.borrow().lookup(1).is_some());
        assert!(cache.borrow().lookup(3).is_some());
    }

    #[test]
    fn test_read_write_bounds() {
        let cache = cache(1);
        let block = BlockCache::acquire(&cache, 0).unwrap();
        let mut out = [0u8; 4];
        assert!(block.read(0, &mut out).is_err());
        complete_io(&cache, true);
        block.write(BLOCK_SIZE as usize - 4, &[9; 4]).unwrap();
        block.read(BLOCK_SIZE as usize - 4, &mut out).unwrap();
        assert_eq!(out, [9; 4]);
        assert!(block.write(BLOCK_SIZE as usize - 3, &[9; 4]).is_err());
    }

    #[test]
    fn test_clone_pins() {
        let cache = cache(2);
        let block = BlockCache::acquire(&cache, 0).unwrap();
        let other = block.clone();
        assert_eq!(block.refcount(), 2);
        drop(other);
        assert_eq!(block.refcount(), 1);
    }

    #[test]
    fn test_hit_rate() {
        let stats = CacheStats {
            hits: 3,
            misses: 1,
            ..Default::default()
        };
        assert!((stats.hit_rate() - 0.75).abs() < f64::EPSILON);
        assert_eq!(CacheStats::default().hit_rate(), 0.0);
    }
}
