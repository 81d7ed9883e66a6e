//! Helpers for tests of the building blocks in this crate.
//!
//! Only compiled when `test` is enabled.

/// Install a tracing subscriber that writes through the test harness so log lines show up next
/// to the failing test.  Honours `RUST_LOG`, defaulting to `ipcox_core=trace`.
///
/// Safe to call from every test; only the first call does anything.
pub fn init_test_logging() {
    use std::sync::OnceLock;

    const DEFAULT_LOG_FILTER: &str = "ipcox_core=trace,info";
    static INIT_LOGGING: OnceLock<()> = OnceLock::new();

    INIT_LOGGING.get_or_init(|| {
        let _ = tracing_subscriber::FmtSubscriber::builder()
            .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()))
            .with_test_writer()
            .try_init();
    });
}
