//! Test logging.

/// Installs a fmt subscriber honoring `RUST_LOG`, defaulting to `info`.
///
/// Safe to call from every test; only the first call installs anything.
pub fn init_test_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
