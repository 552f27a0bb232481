use tracing_subscriber::EnvFilter;

/// Initializes a `tracing_subscriber` using `UTTSOURCE_LOG` first, then `RUST_LOG`, then a default.
///
/// Log field contract for the reader:
/// - Include `sweep` on any randomization event.
/// - Include `chunk` (original chunk index) on any paging event.
/// - Include `epoch` and `worker` on epoch start/end events.
pub fn init_tracing() {
    let filter = env_filter();
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

pub fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env("UTTSOURCE_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"))
}
