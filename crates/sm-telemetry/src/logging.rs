use tracing_subscriber::{fmt, EnvFilter};

/// Output format for the global subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable single-line output for terminals.
    Human,
    /// JSON lines for log shippers.
    Json,
}

/// Install the global tracing subscriber.
///
/// The filter comes from `RUST_LOG` when set, otherwise `default_level`
/// (e.g. "info" or "sm_daemon=debug,warn"). Calling this more than once
/// is harmless; later calls are no-ops.
pub fn init(service_name: &str, default_level: &str, format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_level(true)
        .with_file(true)
        .with_line_number(true);

    match format {
        LogFormat::Human => builder.try_init().ok(),
        LogFormat::Json => builder.json().try_init().ok(),
    };

    tracing::info!(service = service_name, format = ?format, "logging initialised");
}

/// Human-readable logging, the default for interactive runs.
pub fn init_logging(service_name: &str, default_level: &str) {
    init(service_name, default_level, LogFormat::Human);
}

/// JSON logging for headless/server deployments.
pub fn init_logging_json(service_name: &str, default_level: &str) {
    init(service_name, default_level, LogFormat::Json);
}
