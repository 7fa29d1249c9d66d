use tracing::subscriber::SetGlobalDefaultError;
use tracing_log::log::SetLoggerError;
use tracing_log::LogTracer;
use tracing_subscriber::{fmt, EnvFilter};

/// Failure to install process-wide logging
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("Failed to set logger: {0}")]
    Logger(#[from] SetLoggerError),

    #[error("Failed to set global subscriber: {0}")]
    Subscriber(#[from] SetGlobalDefaultError),
}

/// Installs the global tracing subscriber.
///
/// Output is filtered by the `RUST_LOG` environment variable (default
/// `info`) and written as JSON when `json` is set, as plain text otherwise.
/// Records from the `log` crate are forwarded as well.
///
/// The library itself only emits events; installing a subscriber is left to
/// binaries and tests.
pub fn init_logging(json: bool) -> Result<(), LoggingError> {
    LogTracer::init()?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    if json {
        tracing::subscriber::set_global_default(builder.json().with_current_span(true).finish())?;
    } else {
        tracing::subscriber::set_global_default(builder.finish())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_reports_error() {
        // Whatever the first call returns, a logger is installed afterwards
        let _ = init_logging(false);
        assert!(matches!(init_logging(true), Err(LoggingError::Logger(_))));
    }
}
