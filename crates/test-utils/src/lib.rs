//! Fixtures shared by the helper's tests.

mod mock_host;
pub use mock_host::*;
mod network;
pub use network::*;

/// Install a tracing subscriber that writes through the test harness.
///
/// Controlled by `RUST_LOG`. Safe to call from every test.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
