use tracing_subscriber::{EnvFilter, fmt};

/// Install the global subscriber. `RUST_LOG` wins over the `info` default;
/// `EXAM_LOG_JSON=1` switches to JSON lines.
pub fn init_tracing() -> Result<(), String> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("EXAM_LOG_JSON")
        .map(|value| matches!(value.trim(), "1" | "true"))
        .unwrap_or(false);

    let builder = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder
            .json()
            .with_span_events(fmt::format::FmtSpan::CLOSE)
            .try_init()
            .map_err(|err| err.to_string())
    } else {
        builder.try_init().map_err(|err| err.to_string())
    }
}
