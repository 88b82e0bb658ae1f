use std::sync::Once;

use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// Initialize tracing with an env-filter (`RUST_LOG` style).
///
/// Safe to call more than once; only the first call installs the subscriber.
/// Defaults to `info` for this crate when no filter is set.
pub fn init_logging() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("aircast=info"));

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    });
}
