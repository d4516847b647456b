//! I/O transactions exchanged between consumers, the worker and the parent
//! device.
//!
//! A [`Txn`] is an owned request: whoever holds it is responsible for it, and
//! it finishes by being handed to its one-shot completion closure. The worker
//! distinguishes three kinds:
//!
//! 1. *External* transactions enter through a device's `queue` and are tagged
//!    with that device's identity.
//! 2. *Clones* are made by the worker from external transactions, translated
//!    into the parent's address space, and carry a cookie pointing back at the
//!    original.
//! 3. *Cache* transactions are created by metadata cache misses and write-backs
//!    and carry a cookie naming their cache slot.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use tracing::trace;
use uuid::Uuid;

use crate::block::{block_of, BlockCursor};
use crate::error::FilterResult;

/// Identifier of a transaction, unique per worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxnId(pub u64);

/// Atomic counter for generating transaction ids.
#[derive(Debug)]
pub struct TxnIdGen {
    next: AtomicU64,
}

impl TxnIdGen {
    /// Create a new ID generator starting from 1.
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Generate the next unique id.
    pub fn next_id(&self) -> TxnId {
        TxnId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for TxnIdGen {
    fn default() -> Self {
        Self::new()
    }
}

/// Identity of a filter device, used to tag the transactions it accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId(pub Uuid);

impl DeviceId {
    /// Creates a fresh random identity.
    pub fn new() -> Self {
        DeviceId(Uuid::new_v4())
    }
}

impl Default for DeviceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Type of I/O operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IoOp {
    /// Read data from the device into the buffer.
    Read,
    /// Write data from the buffer to the device.
    Write,
}

impl fmt::Display for IoOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoOp::Read => write!(f, "read"),
            IoOp::Write => write!(f, "write"),
        }
    }
}

/// Data buffer shared between a transaction and its clones.
pub type TxnBuffer = Arc<Mutex<Vec<u8>>>;

/// One-shot completion closure; receives the finished transaction.
pub type CompletionFn = Box<dyn FnOnce(Txn) + Send>;

/// Where an internal transaction came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TxnOrigin {
    /// A fetch or write-back for the cache slot with this index.
    Cache(usize),
    /// A clone of the external transaction with this id.
    Clone(TxnId),
}

/// Tracking information attached to transactions the worker owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TxnCookie {
    pub(crate) origin: TxnOrigin,
    pub(crate) cursor: BlockCursor,
}

/// A block I/O transaction.
pub struct Txn {
    pub(crate) id: TxnId,
    /// Operation to perform.
    pub op: IoOp,
    /// Byte offset on the device this transaction is addressed to.
    pub offset: u64,
    /// Number of bytes to transfer.
    pub length: u64,
    /// Final (or current) status.
    pub status: FilterResult<()>,
    /// Bytes actually transferred; zero until the I/O has happened.
    pub actual: u64,
    buffer: TxnBuffer,
    /// Set while a filter device holds this transaction as external.
    pub(crate) device: Option<DeviceId>,
    /// Set on transactions a worker created.
    pub(crate) cookie: Option<TxnCookie>,
    on_complete: Option<CompletionFn>,
}

impl Txn {
    /// Creates a transaction with a zeroed buffer of `length` bytes.
    pub fn new(op: IoOp, offset: u64, length: u64) -> Self {
        let buffer = Arc::new(Mutex::new(vec![0u8; length as usize]));
        Self::with_buffer(op, offset, length, buffer)
    }

    /// Creates a transaction whose buffer is `data`.
    pub fn with_data(op: IoOp, offset: u64, data: Vec<u8>) -> Self {
        let length = data.len() as u64;
        Self::with_buffer(op, offset, length, Arc::new(Mutex::new(data)))
    }

    /// Creates a transaction over an existing shared buffer.
    pub fn with_buffer(op: IoOp, offset: u64, length: u64, buffer: TxnBuffer) -> Self {
        Self {
            id: TxnId(0),
            op,
            offset,
            length,
            status: Ok(()),
            actual: 0,
            buffer,
            device: None,
            cookie: None,
            on_complete: None,
        }
    }

    /// Sets the completion closure, builder style.
    pub fn on_complete<F>(mut self, f: F) -> Self
    where
        F: FnOnce(Txn) + Send + 'static,
    {
        self.set_completion(f);
        self
    }

    /// Sets (or replaces) the completion closure.
    pub fn set_completion<F>(&mut self, f: F)
    where
        F: FnOnce(Txn) + Send + 'static,
    {
        self.on_complete = Some(Box::new(f));
    }

    /// The transaction id; zero until a worker or device assigns one.
    pub fn id(&self) -> TxnId {
        self.id
    }

    /// First block addressed by this transaction.
    pub fn blkoff(&self) -> u64 {
        block_of(self.offset)
    }

    /// True if no bytes have been transferred yet.
    pub fn is_pre_io(&self) -> bool {
        self.actual == 0
    }

    /// A handle to the shared data buffer.
    pub fn buffer(&self) -> TxnBuffer {
        Arc::clone(&self.buffer)
    }

    /// Locks the data buffer for direct access.
    pub fn data(&self) -> MutexGuard<'_, Vec<u8>> {
        self.buffer.lock()
    }

    /// Copies bytes starting at `offset` within the buffer into `out`.
    /// Returns the number of bytes copied.
    pub fn copy_from(&self, offset: usize, out: &mut [u8]) -> usize {
        let data = self.buffer.lock();
        if offset >= data.len() {
            return 0;
        }
        let n = out.len().min(data.len() - offset);
        out[..n].copy_from_slice(&data[offset..offset + n]);
        n
    }

    /// Copies `src` into the buffer starting at `offset`, growing the buffer
    /// if needed. Returns the number of bytes copied.
    pub fn copy_to(&self, offset: usize, src: &[u8]) -> usize {
        let mut data = self.buffer.lock();
        let end = offset + src.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[offset..end].copy_from_slice(src);
        src.len()
    }

    /// Produces an independent transaction over the same buffer. The clone
    /// has a fresh status and no completion closure, and belongs to nobody.
    pub fn clone_txn(&self) -> Txn {
        Txn::with_buffer(self.op, self.offset, self.length, self.buffer())
    }

    /// The progress cursor, present on worker-owned transactions.
    pub fn cursor(&self) -> Option<&BlockCursor> {
        self.cookie.as_ref().map(|c| &c.cursor)
    }

    /// Mutable access to the progress cursor.
    pub fn cursor_mut(&mut self) -> Option<&mut BlockCursor> {
        self.cookie.as_mut().map(|c| &mut c.cursor)
    }

    /// Marks every block of the cursor as processed, if there is one.
    pub fn finish_cursor(&mut self) {
        if let Some(cursor) = self.cursor_mut() {
            cursor.finish();
        }
    }

    /// Records the outcome and runs the completion closure.
    pub fn complete(mut self, status: FilterResult<()>, actual: u64) {
        self.status = status;
        self.actual = actual;
        self.finish();
    }

    /// Runs the completion closure with the current status.
    pub fn finish(mut self) {
        match self.on_complete.take() {
            Some(cb) => cb(self),
            None => trace!(id = self.id.0, offset = self.offset, "txn finished without a callback"),
        }
    }

    pub(crate) fn internal(
        id: TxnId,
        op: IoOp,
        offset: u64,
        length: u64,
        buffer: TxnBuffer,
        origin: TxnOrigin,
    ) -> Self {
        let mut txn = Txn::with_buffer(op, offset, length, buffer);
        txn.id = id;
        txn.cookie = Some(TxnCookie {
            origin,
            cursor: BlockCursor::for_bytes(offset, length),
        });
        txn
    }
}

impl fmt::Debug for Txn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Txn")
            .field("id", &self.id)
            .field("op", &self.op)
            .field("offset", &self.offset)
            .field("length", &self.length)
            .field("status", &self.status)
            .field("actual", &self.actual)
            .field("device", &self.device)
            .field("cookie", &self.cookie)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BLOCK_SIZE;
    use crate::error::FilterError;

    #[test]
    fn test_txn_id_gen() {
        let gen = TxnIdGen::new();
        assert_eq!(gen.next_id(), TxnId(1));
        assert_eq!(gen.next_id(), TxnId(2));
        assert_eq!(gen.next_id(), TxnId(3));
    }

    #[test]
    fn test_clone_shares_buffer() {
        let txn = Txn::new(IoOp::Read, 0, 16);
        let clone = txn.clone_txn();
        clone.copy_to(4, &[1, 2, 3]);

        let mut out = [0u8; 3];
        assert_eq!(txn.copy_from(4, &mut out), 3);
        assert_eq!(out, [1, 2, 3]);
        assert!(clone.status.is_ok());
        assert_eq!(clone.actual, 0);
    }

    #[test]
    fn test_copy_from_past_end() {
        let txn = Txn::with_data(IoOp::Write, 0, vec![9u8; 4]);
        let mut out = [0u8; 8];
        assert_eq!(txn.copy_from(2, &mut out), 2);
        assert_eq!(&out[..2], &[9, 9]);
        assert_eq!(txn.copy_from(10, &mut out), 0);
    }

    #[test]
    fn test_complete_runs_callback() {
        let (tx, rx) = std::sync::mpsc::channel();
        let txn = Txn::new(IoOp::Read, 0, 8).on_complete(move |t| {
            tx.send((t.status.clone(), t.actual)).unwrap();
        });
        txn.complete(Err(FilterError::HandleClosed), 0);
        let (status, actual) = rx.recv().unwrap();
        assert_eq!(status, Err(FilterError::HandleClosed));
        assert_eq!(actual, 0);
    }

    #[test]
    fn test_internal_cursor() {
        let buffer = Arc::new(Mutex::new(vec![0u8; BLOCK_SIZE as usize]));
        let mut txn = Txn::internal(
            TxnId(5),
            IoOp::Read,
            2 * BLOCK_SIZE,
            BLOCK_SIZE,
            buffer,
            TxnOrigin::Cache(0),
        );
        assert_eq!(txn.cursor(), Some(&BlockCursor::new(2, 3)));
        txn.finish_cursor();
        assert!(txn.cursor().unwrap().is_done());
        assert_eq!(txn.cookie.unwrap().origin, TxnOrigin::Cache(0));
    }

    #[test]
    fn test_free_txn_has_no_cursor() {
        let mut txn = Txn::new(IoOp::Write, 0, 8);
        assert!(txn.cursor().is_none());
        assert!(txn.cursor_mut().is_none());
        assert!(txn.is_pre_io());
    }

    #[test]
    fn test_device_ids_unique() {
        assert_ne!(DeviceId::new(), DeviceId::new());
    }
}
