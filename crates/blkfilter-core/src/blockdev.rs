//! Block device abstraction consumed by the filter, and an in-memory device.
//!
//! [`BlockDevice`] is the seam to the host environment: the filter queues
//! transactions on its parent through it, and a bound filter device exposes
//! the same trait upward so filters can stack. [`MemBlockDevice`] is a sparse
//! in-memory implementation with fault injection, used by tests and demos.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{FilterError, FilterResult};
use crate::txn::{IoOp, Txn};

/// Ioctl: reply with the device size in bytes as a little-endian `u64`.
pub const IOCTL_BLOCK_GET_SIZE: u32 = 0x0100_0001;
/// Ioctl: reply with the block size in bytes as a little-endian `u64`.
pub const IOCTL_BLOCK_GET_BLOCKSIZE: u32 = 0x0100_0002;

/// Writes `value` as a little-endian `u64` ioctl reply.
pub fn reply_u64(value: u64, output: &mut [u8]) -> FilterResult<usize> {
    const LEN: usize = std::mem::size_of::<u64>();
    if output.len() < LEN {
        return Err(FilterError::BufferTooSmall {
            needed: LEN,
            actual: output.len(),
        });
    }
    output[..LEN].copy_from_slice(&value.to_le_bytes());
    Ok(LEN)
}

/// A block device that accepts asynchronous transactions.
pub trait BlockDevice: Send + Sync {
    /// Human-readable device name.
    fn name(&self) -> &str;

    /// Size of one device block in bytes.
    fn block_size(&self) -> u64;

    /// Total size in bytes; zero for devices that are not seekable.
    fn size(&self) -> u64;

    /// Accepts a transaction. The device must eventually finish it by
    /// calling [`Txn::complete`], possibly on another thread.
    fn queue(&self, txn: Txn);

    /// Handles a control request, returning the number of reply bytes.
    fn ioctl(&self, op: u32, _input: &[u8], output: &mut [u8]) -> FilterResult<usize> {
        match op {
            IOCTL_BLOCK_GET_SIZE => reply_u64(self.size(), output),
            IOCTL_BLOCK_GET_BLOCKSIZE => reply_u64(self.block_size(), output),
            _ => Err(FilterError::not_supported(format!(
                "ioctl {:#x} on {}",
                op,
                self.name()
            ))),
        }
    }
}

/// I/O statistics for [`MemBlockDevice`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemDeviceStats {
    /// Read transactions completed successfully.
    pub reads_completed: u64,
    /// Write transactions completed successfully.
    pub writes_completed: u64,
    /// Total bytes read.
    pub bytes_read: u64,
    /// Total bytes written.
    pub bytes_written: u64,
    /// Transactions failed, injected faults included.
    pub errors: u64,
}

/// Sparse in-memory block device.
///
/// Storage is kept per device block and only materialised when written, so
/// large devices cost nothing until touched. Transactions complete inline on
/// the submitting thread unless hold mode parks them for the caller to
/// complete later.
pub struct MemBlockDevice {
    name: String,
    block_size: u64,
    size: u64,
    blocks: Mutex<HashMap<u64, Box<[u8]>>>,
    faults: Mutex<HashSet<u64>>,
    hold: AtomicBool,
    held: Mutex<VecDeque<Txn>>,
    stats: Mutex<MemDeviceStats>,
}

impl MemBlockDevice {
    /// Creates a device of `blocks` blocks of `block_size` bytes.
    pub fn new(name: impl Into<String>, block_size: u64, blocks: u64) -> Self {
        let name = name.into();
        debug!(name = %name, block_size, blocks, "created in-memory block device");
        Self {
            name,
            block_size,
            size: block_size * blocks,
            blocks: Mutex::new(HashMap::new()),
            faults: Mutex::new(HashSet::new()),
            hold: AtomicBool::new(false),
            held: Mutex::new(VecDeque::new()),
            stats: Mutex::new(MemDeviceStats::default()),
        }
    }

    /// Makes every transaction touching device block `blkoff` fail with
    /// [`FilterError::Io`].
    pub fn inject_fault(&self, blkoff: u64) {
        self.faults.lock().insert(blkoff);
    }

    /// Removes an injected fault.
    pub fn clear_fault(&self, blkoff: u64) {
        self.faults.lock().remove(&blkoff);
    }

    /// When set, submitted transactions are parked instead of completed.
    pub fn set_hold(&self, hold: bool) {
        self.hold.store(hold, Ordering::SeqCst);
    }

    /// Number of parked transactions.
    pub fn held_count(&self) -> usize {
        self.held.lock().len()
    }

    /// Performs and completes every parked transaction. Returns how many.
    pub fn complete_held(&self) -> usize {
        let held: Vec<Txn> = self.held.lock().drain(..).collect();
        let count = held.len();
        for txn in held {
            self.execute(txn);
        }
        count
    }

    /// Snapshot of the I/O statistics.
    pub fn stats(&self) -> MemDeviceStats {
        self.stats.lock().clone()
    }

    /// Reads bytes directly from the backing store, bypassing transactions.
    pub fn read_at(&self, offset: u64, out: &mut [u8]) {
        let blocks = self.blocks.lock();
        let mut done = 0usize;
        while done < out.len() {
            let pos = offset + done as u64;
            let blkoff = pos / self.block_size;
            let within = (pos % self.block_size) as usize;
            let n = (self.block_size as usize - within).min(out.len() - done);
            match blocks.get(&blkoff) {
                Some(block) => out[done..done + n].copy_from_slice(&block[within..within + n]),
                None => out[done..done + n].fill(0),
            }
            done += n;
        }
    }

    /// Writes bytes directly to the backing store, bypassing transactions.
    pub fn write_at(&self, offset: u64, data: &[u8]) {
        let mut blocks = self.blocks.lock();
        let mut done = 0usize;
        while done < data.len() {
            let pos = offset + done as u64;
            let blkoff = pos / self.block_size;
            let within = (pos % self.block_size) as usize;
            let n = (self.block_size as usize - within).min(data.len() - done);
            let block = blocks
                .entry(blkoff)
                .or_insert_with(|| vec![0u8; self.block_size as usize].into_boxed_slice());
            block[within..within + n].copy_from_slice(&data[done..done + n]);
            done += n;
        }
    }

    fn check(&self, txn: &Txn) -> FilterResult<()> {
        if txn.length == 0 {
            return Err(FilterError::invalid("zero-length transaction"));
        }
        if txn.offset % self.block_size != 0 || txn.length % self.block_size != 0 {
            return Err(FilterError::invalid(format!(
                "offset {} / length {} not aligned to {}",
                txn.offset, txn.length, self.block_size
            )));
        }
        match txn.offset.checked_add(txn.length) {
            Some(end) if end <= self.size => {}
            _ => {
                return Err(FilterError::invalid(format!(
                    "offset {} + length {} beyond device size {}",
                    txn.offset, txn.length, self.size
                )))
            }
        }
        let first = txn.offset / self.block_size;
        let last = (txn.offset + txn.length - 1) / self.block_size;
        let faults = self.faults.lock();
        if let Some(blkoff) = (first..=last).find(|b| faults.contains(b)) {
            return Err(FilterError::io(format!(
                "media error at block {} on {}",
                blkoff, self.name
            )));
        }
        Ok(())
    }

    fn execute(&self, txn: Txn) {
        if let Err(e) = self.check(&txn) {
            warn!(device = %self.name, offset = txn.offset, length = txn.length, error = %e, "mem device rejected txn");
            self.stats.lock().errors += 1;
            txn.complete(Err(e), 0);
            return;
        }
        let length = txn.length as usize;
        match txn.op {
            IoOp::Read => {
                let mut data = vec![0u8; length];
                self.read_at(txn.offset, &mut data);
                txn.copy_to(0, &data);
                let mut stats = self.stats.lock();
                stats.reads_completed += 1;
                stats.bytes_read += length as u64;
            }
            IoOp::Write => {
                let mut data = vec![0u8; length];
                txn.copy_from(0, &mut data);
                self.write_at(txn.offset, &data);
                let mut stats = self.stats.lock();
                stats.writes_completed += 1;
                stats.bytes_written += length as u64;
            }
        }
        let actual = txn.length;
        txn.complete(Ok(()), actual);
    }
}

impl BlockDevice for MemBlockDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn block_size(&self) -> u64 {
        self.block_size
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn queue(&self, txn: Txn) {
        if self.hold.load(Ordering::SeqCst) {
            self.held.lock().push_back(txn);
            return;
        }
        self.execute(txn);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn submit(dev: &MemBlockDevice, txn: Txn) -> Txn {
        let (tx, rx) = mpsc::channel();
        dev.queue(txn.on_complete(move |t| tx.send(t).unwrap()));
        rx.recv().unwrap()
    }

    #[test]
    fn test_write_read_roundtrip() {
        let dev = MemBlockDevice::new("ram0", 512, 64);
        let done = submit(&dev, Txn::with_data(IoOp::Write, 1024, vec![0xAB; 1024]));
        assert!(done.status.is_ok());
        assert_eq!(done.actual, 1024);

        let done = submit(&dev, Txn::new(IoOp::Read, 1024, 1024));
        assert_eq!(done.actual, 1024);
        assert!(done.data().iter().all(|&b| b == 0xAB));

        let stats = dev.stats();
        assert_eq!(stats.reads_completed, 1);
        assert_eq!(stats.writes_completed, 1);
        assert_eq!(stats.bytes_read, 1024);
    }

    #[test]
    fn test_unwritten_reads_zero() {
        let dev = MemBlockDevice::new("ram0", 512, 64);
        let mut out = [0xFFu8; 700];
        dev.read_at(100, &mut out);
        assert!(out.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_unaligned_write_at_spans_blocks() {
        let dev = MemBlockDevice::new("ram0", 512, 8);
        dev.write_at(500, &[7u8; 30]);
        let mut out = [0u8; 40];
        dev.read_at(495, &mut out);
        assert_eq!(&out[..5], &[0u8; 5]);
        assert_eq!(&out[5..35], &[7u8; 30]);
        assert_eq!(&out[35..], &[0u8; 5]);
    }

    #[test]
    fn test_out_of_bounds_rejected() {
        let dev = MemBlockDevice::new("ram0", 512, 4);
        let done = submit(&dev, Txn::new(IoOp::Read, 1536, 1024));
        assert!(matches!(done.status, Err(FilterError::InvalidArgs { .. })));
        assert_eq!(done.actual, 0);
        assert_eq!(dev.stats().errors, 1);
    }

    #[test]
    fn test_injected_fault() {
        let dev = MemBlockDevice::new("ram0", 512, 16);
        dev.inject_fault(3);
        let done = submit(&dev, Txn::new(IoOp::Read, 1024, 2048));
        assert!(matches!(done.status, Err(FilterError::Io { .. })));

        dev.clear_fault(3);
        let done = submit(&dev, Txn::new(IoOp::Read, 1024, 2048));
        assert!(done.status.is_ok());
    }

    #[test]
    fn test_hold_mode() {
        let dev = MemBlockDevice::new("ram0", 512, 16);
        dev.set_hold(true);
        let (tx, rx) = mpsc::channel();
        dev.queue(Txn::new(IoOp::Read, 0, 512).on_complete(move |t| tx.send(t.actual).unwrap()));
        assert_eq!(dev.held_count(), 1);
        assert!(rx.try_recv().is_err());

        assert_eq!(dev.complete_held(), 1);
        assert_eq!(rx.recv().unwrap(), 512);
        assert_eq!(dev.held_count(), 0);
    }

    #[test]
    fn test_default_ioctl() {
        let dev = MemBlockDevice::new("ram0", 512, 16);
        let mut out = [0u8; 8];
        assert_eq!(dev.ioctl(IOCTL_BLOCK_GET_SIZE, &[], &mut out).unwrap(), 8);
        assert_eq!(u64::from_le_bytes(out), 8192);
        dev.ioctl(IOCTL_BLOCK_GET_BLOCKSIZE, &[], &mut out).unwrap();
        assert_eq!(u64::from_le_bytes(out), 512);

        let mut short = [0u8; 4];
        assert!(matches!(
            dev.ioctl(IOCTL_BLOCK_GET_SIZE, &[], &mut short),
            Err(FilterError::BufferTooSmall { needed: 8, actual: 4 })
        ));
        assert!(matches!(
            dev.ioctl(0xdead, &[], &mut out),
            Err(FilterError::NotSupported { .. })
        ));
    }
}
