//! Logging bootstrap.

/// Initialize the tracing subscriber with timestamps.
///
/// Call this at the start of the binaries or of integration tests. The
/// filter is taken from `RUST_LOG` when set, defaulting to `hearth=info`.
/// Calling it twice is harmless; the second call is a no-op.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("hearth=info"));

    let _ = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_names(true)
                .with_timer(fmt::time::uptime()),
        )
        .with(filter)
        .try_init();
}
