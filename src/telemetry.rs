use tracing_subscriber::{fmt, EnvFilter};

/// Installs the JSON tracing subscriber. Filtering follows `RUST_LOG`,
/// defaulting to `info` for this crate.
pub fn init() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("billing_reconciler=info"));
    let _ = fmt().with_env_filter(filter).json().try_init();
}
