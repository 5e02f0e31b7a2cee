//! Shared fakes and helpers for statdag's integration tests.
//!
//! - [`fake_executor`]: scripted query executor that records dispatch order
//!   and concurrency.
//! - [`fake_worker`]: in-memory worker processes for pool and correlation
//!   tests.
//! - [`builders`]: fluent config builders.

pub mod builders;
pub mod fake_executor;
pub mod fake_worker;

use std::future::Future;
use std::sync::Once;
use std::time::Duration;

use tracing_subscriber::{EnvFilter, fmt};

/// Budget for a single awaited operation in a test. Under a paused clock it
/// is measured in virtual time.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

static INIT: Once = Once::new();

/// Install a per-test tracing subscriber once per test binary.
///
/// Output is captured by the harness and shown for failing tests only.
/// `RUST_LOG=statdag=debug cargo test` raises verbosity; the default keeps
/// statdag's own `info` events and silences everything else below `warn`.
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("warn,statdag=info"));

        let _ = fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .with_target(true)
            .try_init();
    });
}

/// Await `f`, panicking if it takes longer than [`TEST_TIMEOUT`].
pub async fn with_timeout<F, T>(f: F) -> T
where
    F: Future<Output = T>,
{
    match tokio::time::timeout(TEST_TIMEOUT, f).await {
        Ok(value) => value,
        Err(_) => panic!("test operation did not finish within {TEST_TIMEOUT:?}"),
    }
}
