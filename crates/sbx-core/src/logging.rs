//! Tracing integration for structured logging.
//!
//! Shared setup for the client and server binaries:
//! - Configurable verbosity levels
//! - Optional file output
//! - JSON or text format

use std::path::Path;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::Result;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// Structured JSON output.
    Json,
}

/// Initialize the logging system.
///
/// `verbosity` maps repeated `-v` flags: 0=error, 1=warn, 2=info, 3=debug,
/// 4+=trace. `RUST_LOG` overrides the computed filter when set.
pub fn init_logging(verbosity: u8, log_file: Option<&Path>, format: LogFormat) -> Result<()> {
    let level = match verbosity {
        0 => "error",
        1 => "warn",
        2 => "info",
        3 => "debug",
        _ => "trace",
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "sbx_core={level},sbx_client={level},sbx_server={level}"
        ))
    });

    let registry = tracing_subscriber::registry().with(filter);

    let init_result = match (log_file, format) {
        (None, LogFormat::Text) => registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_file(verbosity >= 3)
                    .with_line_number(verbosity >= 3),
            )
            .try_init(),
        (None, LogFormat::Json) => registry.with(fmt::layer().json()).try_init(),
        (Some(path), format) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            match format {
                LogFormat::Text => registry
                    .with(
                        fmt::layer()
                            .with_writer(file)
                            .with_ansi(false)
                            .with_target(true),
                    )
                    .try_init(),
                LogFormat::Json => registry
                    .with(fmt::layer().json().with_writer(file))
                    .try_init(),
            }
        }
    };

    init_result.map_err(|e| crate::Error::Io(std::io::Error::other(e.to_string())))
}

/// Initialize logging with defaults for testing.
///
/// Silently ignores errors (the subscriber may already be installed).
pub fn init_test_logging() {
    let _ = init_logging(2, None, LogFormat::Text);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_format_default_is_text() {
        assert_eq!(LogFormat::default(), LogFormat::Text);
    }

    #[test]
    fn init_is_idempotent_in_process() {
        init_test_logging();
        init_test_logging();
    }
}
