pub mod bench;
pub mod gate;

pub use bench::TestBench;
pub use gate::ScriptedGate;

use tracing_subscriber::EnvFilter;

/// Route engine logs through the test writer, filtered by `RUST_LOG`.
/// Safe to call from every test.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
