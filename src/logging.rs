use tracing_subscriber::EnvFilter;

/// Installs a `tracing_subscriber` on stderr, filtered by `FITRUN_LOG`, then `RUST_LOG`, then `info`.
///
/// Log field contract:
/// - `run` on every event tied to a run.
/// - `worker` with the worker token wherever one acts.
/// - `id` on any claim, outcome or merge-row event.
///
/// Calling it twice is harmless; the second call keeps the first subscriber.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_writer(std::io::stderr)
        .try_init();
}

pub fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env("FITRUN_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"))
}
