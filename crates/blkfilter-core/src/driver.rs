//! Callback contract implemented by concrete filter drivers.
//!
//! Every hook runs on the worker thread, one at a time. A hook receives the
//! transaction by value and must hand it back in its [`TxnAction`] or keep
//! ownership of it elsewhere (for instance by parking it on a
//! [`CachedBlock`](crate::cache::CachedBlock)).

use std::sync::Arc;

use crate::block::DataRange;
use crate::error::{FilterError, FilterResult};
use crate::txn::Txn;
use crate::worker::Worker;

/// What the worker does with a transaction after a hook returns.
#[derive(Debug)]
pub enum TxnAction {
    /// The hook kept the transaction; nothing more happens this iteration.
    Ignore,
    /// Queue the transaction again at the tail.
    Requeue(Txn),
    /// Forward the transaction to the parent device. Only valid before I/O.
    Continue(Txn),
    /// Processing is finished, successfully or not.
    Complete(Txn),
}

/// Ioctl handler of a driver. Unlike the hooks it may be called from any
/// thread, so it is shared rather than owned by the worker.
pub trait FilterControl: Send + Sync {
    /// Handles a control request, returning the number of reply bytes.
    /// [`FilterError::NotSupported`] passes the request on to the parent.
    fn ioctl(&self, op: u32, _input: &[u8], _output: &mut [u8]) -> FilterResult<usize> {
        Err(FilterError::not_supported(format!("ioctl {:#x}", op)))
    }
}

/// Control handler that supports nothing.
#[derive(Debug, Default)]
pub struct NoControl;

impl FilterControl for NoControl {}

/// A block transform plugged into the worker.
pub trait FilterDriver: Send + 'static {
    /// Called once at bind, before the device is visible. Returns the data
    /// region to expose out of the parent's `total_blocks` blocks.
    fn prepare(&mut self, worker: &mut Worker, total_blocks: u64) -> FilterResult<DataRange>;

    /// Called once when the worker exits, including after a failed
    /// [`prepare`](FilterDriver::prepare).
    fn release(&mut self, worker: &mut Worker) -> FilterResult<()>;

    /// Read transaction before I/O.
    fn before_read(&mut self, _worker: &mut Worker, mut txn: Txn) -> TxnAction {
        txn.finish_cursor();
        TxnAction::Continue(txn)
    }

    /// Write transaction before I/O.
    fn before_write(&mut self, _worker: &mut Worker, mut txn: Txn) -> TxnAction {
        txn.finish_cursor();
        TxnAction::Continue(txn)
    }

    /// Read transaction after I/O.
    fn after_read(&mut self, _worker: &mut Worker, mut txn: Txn) -> TxnAction {
        txn.finish_cursor();
        TxnAction::Complete(txn)
    }

    /// Write transaction after I/O.
    fn after_write(&mut self, _worker: &mut Worker, mut txn: Txn) -> TxnAction {
        txn.finish_cursor();
        TxnAction::Complete(txn)
    }

    /// The driver's ioctl handler.
    fn control(&self) -> Arc<dyn FilterControl> {
        Arc::new(NoControl)
    }
}

/// Driver that exposes the whole parent unchanged.
#[derive(Debug, Default)]
pub struct Passthrough;

impl FilterDriver for Passthrough {
    fn prepare(&mut self, _worker: &mut Worker, total_blocks: u64) -> FilterResult<DataRange> {
        Ok(DataRange::new(0, total_blocks))
    }

    fn release(&mut self, _worker: &mut Worker) -> FilterResult<()> {
        Ok(())
    }
}
