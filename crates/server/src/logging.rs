//! Tracing subscriber setup.

use tracing_subscriber::EnvFilter;

use certgate_config::{LogFormat, LoggingConfig};

/// Pick the filter: `RUST_LOG` wins, then `--verbose`, then the configured
/// level.
pub fn env_filter(config: &LoggingConfig, verbose: bool) -> EnvFilter {
    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    EnvFilter::new(directive(config, verbose, rust_log.as_deref()))
}

fn directive<'a>(config: &'a LoggingConfig, verbose: bool, rust_log: Option<&'a str>) -> &'a str {
    match rust_log.map(str::trim) {
        Some(from_env) if !from_env.is_empty() => from_env,
        _ if verbose => "debug",
        _ => config.level.as_str(),
    }
}

/// Install the global subscriber.
pub fn init(config: &LoggingConfig, verbose: bool) -> anyhow::Result<()> {
    let filter = env_filter(config, verbose);

    match config.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .json()
            .try_init(),
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .pretty()
            .try_init(),
    }
    .map_err(|e| anyhow::anyhow!("failed to initialize logging: {e}"))
}
