//! The externally visible filter device.
//!
//! Binding spawns the worker thread and waits for the driver's `prepare` to
//! negotiate the data region. The device then forwards transactions to the
//! worker and exposes only the data region, so it is itself a
//! [`BlockDevice`] and filters can be stacked.

use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::block::{DataRange, BLOCK_SIZE};
use crate::blockdev::{reply_u64, BlockDevice, IOCTL_BLOCK_GET_BLOCKSIZE, IOCTL_BLOCK_GET_SIZE};
use crate::config::FilterConfig;
use crate::driver::{FilterControl, FilterDriver};
use crate::error::{FilterError, FilterResult};
use crate::txn::{DeviceId, Txn};
use crate::worker::{run_worker, Shared, WorkerState, WorkerStats};

/// A bound filter instance.
pub struct FilterDevice {
    name: String,
    id: DeviceId,
    range: DataRange,
    shared: Arc<Shared>,
    parent: Arc<dyn BlockDevice>,
    control: Arc<dyn FilterControl>,
    thread: Mutex<Option<JoinHandle<FilterResult<()>>>>,
}

impl FilterDevice {
    /// Binds `driver` on top of `parent`.
    ///
    /// The parent's block size must divide [`BLOCK_SIZE`] and the parent must
    /// hold at least one block, otherwise this fails with
    /// [`FilterError::NotSupported`]. Returns once the driver's `prepare` has
    /// run on the worker thread; if it fails, the driver has already been
    /// released and the error is returned.
    pub fn bind<D: FilterDriver>(
        parent: Arc<dyn BlockDevice>,
        driver: D,
        config: FilterConfig,
    ) -> FilterResult<Self> {
        config.validate()?;
        let block_size = parent.block_size();
        if block_size == 0 || BLOCK_SIZE % block_size != 0 {
            return Err(FilterError::not_supported(format!(
                "{} has block size {}, which does not divide {}",
                parent.name(),
                block_size,
                BLOCK_SIZE
            )));
        }
        let total_blocks = parent.size() / BLOCK_SIZE;
        if total_blocks == 0 {
            return Err(FilterError::not_supported(format!(
                "{} holds no complete {} byte block",
                parent.name(),
                BLOCK_SIZE
            )));
        }

        let name = config.device_name(parent.name());
        let id = DeviceId::new();
        let shared = Arc::new(Shared::new(id));
        let control = driver.control();
        let (bound_tx, bound_rx) = oneshot::channel();

        let thread = {
            let shared = Arc::clone(&shared);
            let parent = Arc::clone(&parent);
            thread::Builder::new()
                .name(name.clone())
                .spawn(move || {
                    run_worker(
                        shared,
                        parent,
                        Box::new(driver),
                        config,
                        total_blocks,
                        bound_tx,
                    )
                })?
        };

        let range = match bound_rx.blocking_recv() {
            Ok(Ok(range)) => range,
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(e);
            }
            Err(_) => {
                let _ = thread.join();
                return Err(FilterError::io("worker exited during bind"));
            }
        };
        info!(
            device = %name,
            id = %id,
            data = %range,
            size = range.byte_length(),
            "filter device bound"
        );
        Ok(Self {
            name,
            id,
            range,
            shared,
            parent,
            control,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Identity used to tag accepted transactions.
    pub fn id(&self) -> DeviceId {
        self.id
    }

    /// The data region on the parent.
    pub fn data_range(&self) -> DataRange {
        self.range
    }

    /// Logical size in bytes: the data region only.
    pub fn get_size(&self) -> u64 {
        self.range.byte_length()
    }

    /// Current worker state.
    pub fn state(&self) -> WorkerState {
        self.shared.state()
    }

    /// Worker counters.
    pub fn stats(&self) -> WorkerStats {
        self.shared.stats()
    }

    /// Stops accepting work. Queued transactions fail with
    /// [`FilterError::HandleClosed`].
    pub fn unbind(&self) {
        if self.shared.set_state(WorkerState::Stopping) {
            debug!(device = %self.name, "unbind");
        }
    }

    /// Lets the worker exit once its queue drains. The driver's `release`
    /// hook runs on the worker thread.
    pub fn release(&self) {
        if self.shared.set_state(WorkerState::Exiting) {
            debug!(device = %self.name, "release");
        }
    }

    /// Waits for the worker thread to exit and returns the result of the
    /// driver's `release` hook. Later calls return `Ok(())`.
    pub fn join(&self) -> FilterResult<()> {
        let Some(thread) = self.thread.lock().take() else {
            return Ok(());
        };
        match thread.join() {
            Ok(result) => result,
            Err(_) => {
                warn!(device = %self.name, "worker thread panicked");
                Err(FilterError::io("worker thread panicked"))
            }
        }
    }
}

impl BlockDevice for FilterDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn block_size(&self) -> u64 {
        BLOCK_SIZE
    }

    fn size(&self) -> u64 {
        self.get_size()
    }

    fn queue(&self, txn: Txn) {
        self.shared.enqueue_external(txn);
    }

    fn ioctl(&self, op: u32, input: &[u8], output: &mut [u8]) -> FilterResult<usize> {
        match op {
            IOCTL_BLOCK_GET_SIZE => reply_u64(self.get_size(), output),
            IOCTL_BLOCK_GET_BLOCKSIZE => reply_u64(BLOCK_SIZE, output),
            _ => match self.control.ioctl(op, input, output) {
                Err(FilterError::NotSupported { .. }) => self.parent.ioctl(op, input, output),
                other => other,
            },
        }
    }
}

impl Drop for FilterDevice {
    fn drop(&mut self) {
        self.release();
        if let Err(e) = self.join() {
            debug!(device = %self.name, error = %e, "worker finished with error");
        }
    }
}

impl fmt::Debug for FilterDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterDevice")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("range", &self.range)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockdev::MemBlockDevice;
    use crate::driver::Passthrough;

    #[test]
    fn test_bind_rejects_odd_block_size() {
        let parent = Arc::new(MemBlockDevice::new("odd", 3000, 100));
        let result = FilterDevice::bind(parent, Passthrough, FilterConfig::default());
        assert!(matches!(result, Err(FilterError::NotSupported { .. })));
    }

    #[test]
    fn test_bind_rejects_tiny_parent() {
        let parent = Arc::new(MemBlockDevice::new("tiny", 512, 8));
        let result = FilterDevice::bind(parent, Passthrough, FilterConfig::default());
        assert!(matches!(result, Err(FilterError::NotSupported { .. })));
    }

    #[test]
    fn test_bind_rejects_bad_config() {
        let parent = Arc::new(MemBlockDevice::new("ram0", 512, 64));
        let config = FilterConfig {
            cache_buckets: 3,
            ..Default::default()
        };
        let result = FilterDevice::bind(parent, Passthrough, config);
        assert!(matches!(result, Err(FilterError::InvalidArgs { .. })));
    }

    #[test]
    fn test_passthrough_geometry() {
        let parent = Arc::new(MemBlockDevice::new("ram0", 512, 64));
        let dev = FilterDevice::bind(parent, Passthrough, FilterConfig::default()).unwrap();
        assert_eq!(dev.name(), "ram0-filter");
        assert_eq!(dev.get_size(), 4 * BLOCK_SIZE);
        assert_eq!(dev.block_size(), BLOCK_SIZE);
        assert_eq!(dev.state(), WorkerState::Working);

        dev.unbind();
        assert_eq!(dev.state(), WorkerState::Stopping);
        dev.release();
        dev.join().unwrap();
        assert_eq!(dev.state(), WorkerState::Exiting);
        assert!(dev.join().is_ok());
    }
}
