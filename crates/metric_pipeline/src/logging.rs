use tracing_subscriber::EnvFilter;

/// Environment variable consulted before `RUST_LOG`.
pub const LOG_ENV: &str = "METRIC_PIPELINE_LOG";

/// Initializes a `tracing_subscriber` using `METRIC_PIPELINE_LOG` first, then `RUST_LOG`,
/// then `info`.
///
/// Field conventions used across the crate:
/// - `worker` on every producer event.
/// - `step` and `learning_rate` on controller events.
/// - `identities` / `images` when reporting catalog size.
pub fn init_tracing() {
    let filter = env_filter();
    // A second init (tests, embedding binaries) keeps the first subscriber.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .try_init();
}

pub fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"))
}
