#![warn(missing_docs)]

//! blkfilter core: a framework for block-device filters
//!
//! A filter sits between a consumer and a parent block device. A driver
//! supplies a few hooks that inspect, transform or reject every transaction
//! before and after it reaches the parent. The framework supplies the worker
//! thread that runs those hooks, a metadata block cache and a compressible
//! per-block bitmap, and exposes the result as a new block device.

pub mod bitmap;
pub mod block;
pub mod blockdev;
pub mod cache;
pub mod config;
pub mod device;
pub mod driver;
pub mod error;
pub mod sync_io;
pub mod txn;
pub mod worker;

pub use bitmap::{Bitmap, Run, MAX_DEPTH, MAX_RUNS};
pub use block::{BlockCursor, DataRange, BITS_PER_CHUNK, BLOCK_SIZE};
pub use blockdev::{BlockDevice, MemBlockDevice, MemDeviceStats, IOCTL_BLOCK_GET_BLOCKSIZE, IOCTL_BLOCK_GET_SIZE};
pub use cache::{CacheStats, CachedBlock};
pub use config::FilterConfig;
pub use device::FilterDevice;
pub use driver::{FilterControl, FilterDriver, NoControl, Passthrough, TxnAction};
pub use error::{FilterError, FilterResult};
pub use sync_io::{read_block_sync, write_block_sync};
pub use txn::{DeviceId, IoOp, Txn, TxnBuffer, TxnId, TxnIdGen};
pub use worker::{Worker, WorkerState, WorkerStats};
