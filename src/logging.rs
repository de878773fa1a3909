use tracing_subscriber::{fmt, EnvFilter};

/// Sets up the global tracing subscriber for the refresh daemon and CLI.
///
/// `RUST_LOG` wins over `default_filter`. `LOG_FORMAT=compact` drops file/line
/// locations, which is what the long-running scheduler usually wants; anything
/// else keeps the full format with locations for local debugging.
pub fn init_tracing(default_filter: &str) -> Result<(), anyhow::Error> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let compact = crate::util::env::env_opt("LOG_FORMAT")
        .map(|v| v.trim().eq_ignore_ascii_case("compact"))
        .unwrap_or(false);

    let result = if compact {
        fmt()
            .with_env_filter(filter)
            .with_target(true)
            .compact()
            .try_init()
    } else {
        fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_line_number(true)
            .with_file(true)
            .try_init()
    };
    result.map_err(|e| anyhow::anyhow!("failed to initialize tracing: {}", e))
}
