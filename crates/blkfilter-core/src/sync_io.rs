//! Synchronous single-block I/O against a parent device.
//!
//! The calling thread blocks on a one-shot channel that the transaction's
//! completion closure fulfils. These helpers must not be called from inside
//! an async runtime.

use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::block::BLOCK_SIZE;
use crate::blockdev::BlockDevice;
use crate::error::{FilterError, FilterResult};
use crate::txn::{IoOp, Txn};

fn check_args(parent: &dyn BlockDevice, blkoff: u64, length: usize) -> FilterResult<()> {
    if length == 0 {
        return Err(FilterError::invalid("sync I/O length is zero"));
    }
    if length as u64 > BLOCK_SIZE {
        return Err(FilterError::invalid(format!(
            "sync I/O length {} exceeds block size {}",
            length, BLOCK_SIZE
        )));
    }
    match blkoff.checked_mul(BLOCK_SIZE) {
        Some(offset) if offset < parent.size() => Ok(()),
        _ => Err(FilterError::invalid(format!(
            "block {} is beyond {}",
            blkoff,
            parent.name()
        ))),
    }
}

fn submit_and_wait(parent: &dyn BlockDevice, txn: Txn) -> FilterResult<Txn> {
    let (tx, rx) = oneshot::channel();
    let txn = txn.on_complete(move |done| {
        // The waiter only disappears if its thread panicked.
        let _ = tx.send(done);
    });
    parent.queue(txn);
    let done = rx
        .blocking_recv()
        .map_err(|_| FilterError::io("transaction dropped without completion"))?;
    done.status.clone()?;
    if done.actual < done.length {
        warn!(
            offset = done.offset,
            actual = done.actual,
            length = done.length,
            "incomplete sync I/O"
        );
        return Err(FilterError::io(format!(
            "incomplete I/O: only {} of {} bytes",
            done.actual, done.length
        )));
    }
    Ok(done)
}

/// Reads `out.len()` bytes from the start of block `blkoff` on `parent`.
pub fn read_block_sync(parent: &dyn BlockDevice, blkoff: u64, out: &mut [u8]) -> FilterResult<()> {
    check_args(parent, blkoff, out.len())?;
    debug!(blkoff, length = out.len(), "sync read");
    let done = submit_and_wait(parent, Txn::new(IoOp::Read, blkoff * BLOCK_SIZE, BLOCK_SIZE))?;
    done.copy_from(0, out);
    Ok(())
}

/// Writes `data` to the start of block `blkoff` on `parent`. The rest of the
/// block is zero-filled.
pub fn write_block_sync(parent: &dyn BlockDevice, blkoff: u64, data: &[u8]) -> FilterResult<()> {
    check_args(parent, blkoff, data.len())?;
    debug!(blkoff, length = data.len(), "sync write");
    let txn = Txn::new(IoOp::Write, blkoff * BLOCK_SIZE, BLOCK_SIZE);
    txn.copy_to(0, data);
    submit_and_wait(parent, txn)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockdev::MemBlockDevice;

    #[test]
    fn test_sync_roundtrip() {
        let dev = MemBlockDevice::new("ram0", 512, 64);
        write_block_sync(&dev, 2, b"header").unwrap();

        let mut out = [0u8; 6];
        read_block_sync(&dev, 2, &mut out).unwrap();
        assert_eq!(&out, b"header");

        let mut raw = [0u8; 6];
        dev.read_at(2 * BLOCK_SIZE, &mut raw);
        assert_eq!(&raw, b"header");
    }

    #[test]
    fn test_sync_rejects_bad_args() {
        let dev = MemBlockDevice::new("ram0", 512, 32);
        let mut empty = [0u8; 0];
        assert!(matches!(
            read_block_sync(&dev, 0, &mut empty),
            Err(FilterError::InvalidArgs { .. })
        ));
        let mut big = vec![0u8; BLOCK_SIZE as usize + 1];
        assert!(matches!(
            read_block_sync(&dev, 0, &mut big),
            Err(FilterError::InvalidArgs { .. })
        ));
        let mut out = [0u8; 8];
        assert!(matches!(
            read_block_sync(&dev, 2, &mut out),
            Err(FilterError::InvalidArgs { .. })
        ));
    }

    #[test]
    fn test_sync_propagates_device_error() {
        let dev = MemBlockDevice::new("ram0", 512, 64);
        dev.inject_fault(16);
        let mut out = [0u8; 8];
        assert!(matches!(
            read_block_sync(&dev, 1, &mut out),
            Err(FilterError::Io { .. })
        ));
    }
}
