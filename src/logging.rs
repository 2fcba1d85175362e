use tracing_subscriber::EnvFilter;

use crate::config::{ExporterConfig, LogFormat};
use crate::domain::reconciler::UNREPORTED_LOG_TARGET;

/// `RUST_LOG` wins; otherwise the configured level.
/// Logs go to stderr so `check` output stays clean on stdout.
pub fn init(config: &ExporterConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(config)));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    match config.log_format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.pretty().init(),
    }
}

/// Verbose mode keeps the unreported-node lines visible at any configured level.
fn default_directives(config: &ExporterConfig) -> String {
    if config.verbose {
        format!("{},{UNREPORTED_LOG_TARGET}=info", config.log_level)
    } else {
        config.log_level.clone()
    }
}
