//! Shared fixtures for the agentrpc integration suites: test agents and
//! tracing setup. The end-to-end scenarios live in `tests/`.

pub mod agents;

/// Initialize tracing and the TLS provider for a test binary. Safe to call
/// repeatedly.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let _ = rustls::crypto::ring::default_provider().install_default();
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
