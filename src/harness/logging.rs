use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber for the harness process.
///
/// `RUST_LOG` wins when set; otherwise `default_level` (from the logging
/// settings) is applied to this crate only. Release builds log JSON so the
/// fleet scheduler can ingest the stream.
pub fn init_logging_with_level(default_level: &str) {
    let fallback = format!("device_harness={default_level}");
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    if cfg!(debug_assertions) {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .try_init();
    } else {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .json()
            .with_target(false)
            .try_init();
    }
}

pub fn init_logging() {
    init_logging_with_level("info");
}
