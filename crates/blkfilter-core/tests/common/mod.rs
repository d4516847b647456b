//! Helpers shared by the integration tests.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Installs a test-friendly subscriber honouring `RUST_LOG`. Safe to call
/// from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_test_writer())
        .with(EnvFilter::from_default_env())
        .try_init();
}
