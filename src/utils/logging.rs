/// Installs the `tracing` subscriber used by the `subflow` binary.
///
/// Library code only emits events; embedding applications that already
/// installed a subscriber keep theirs, since this never replaces one.
pub fn init(level: &str) {
    let installed = tracing_subscriber::fmt()
        .with_max_level(parse_level(level))
        .with_target(false)
        .try_init()
        .is_ok();
    if installed {
        tracing::debug!("Logging initialised at level '{}'", level.trim());
    }
}

/// Maps a configured level name onto a `tracing` level, defaulting to INFO.
pub fn parse_level(level: &str) -> tracing::Level {
    match level.trim().to_lowercase().as_str() {
        "error" => tracing::Level::ERROR,
        "warn" | "warning" => tracing::Level::WARN,
        "debug" => tracing::Level::DEBUG,
        "trace" => tracing::Level::TRACE,
        _ => tracing::Level::INFO,
    }
}
