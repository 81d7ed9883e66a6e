//! Helpers for testing the RPC implementation.
//!
//! This module is only compiled when `test` is enabled.  Integration tests pull it in with a
//! `#[path]` attribute, so it must not refer to anything through `crate::`.
use futures::StreamExt;
use futures::channel::mpsc;

/// Initialize tracing with a subscriber and some reasonable defaults suitable for enabling log
/// output in tests.
///
/// This is idempotent; it can be called from multiple tests in multiple threads but will only
/// initialize tracing once.
pub fn init_test_logging() {
    use std::sync::OnceLock;

    const DEFAULT_LOG_FILTER: &str = "ipcox_rpc=trace,info";
    static INIT_LOGGING: OnceLock<()> = OnceLock::new();

    INIT_LOGGING.get_or_init(|| {
        let _ = tracing_subscriber::FmtSubscriber::builder()
            .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()))
            .with_test_writer()
            .try_init();
    });
}

/// One end of an in-memory transport built from a pair of bounded channels.
pub type TestTransport = (
    futures::stream::Map<mpsc::Receiver<String>, fn(String) -> Result<String, std::io::Error>>,
    mpsc::Sender<String>,
);

/// Two transports wired to each other: whatever is sent on one is received on the other.
pub fn setup_test_channel() -> (TestTransport, TestTransport) {
    let (tx1, rx1) = mpsc::channel(16);
    let (tx2, rx2) = mpsc::channel(16);
    let ok: fn(String) -> Result<String, std::io::Error> = Ok;

    ((rx2.map(ok), tx1), (rx1.map(ok), tx2))
}
