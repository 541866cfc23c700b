use eyre::{Result, WrapErr, eyre};
use tracing_subscriber::{EnvFilter, Registry, layer::SubscriberExt, util::SubscriberInitExt};

/// Default filter when neither `RUST_LOG` nor an explicit level is given
pub const DEFAULT_FILTER: &str = "info";

/// Output format of the log subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum LogFormat {
    /// One JSON object per line, for log shippers
    #[default]
    Json,
    /// Multi-line human readable output for local development
    Pretty,
}

fn env_filter(level: Option<&str>) -> Result<EnvFilter> {
    match level {
        Some(level) => {
            EnvFilter::try_new(level).wrap_err_with(|| format!("Invalid log level: {level}"))
        }
        None => Ok(EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))),
    }
}

/// Install the global subscriber.
///
/// `level` overrides `RUST_LOG` when given. Fails instead of panicking when a
/// subscriber is already installed (e.g. by an embedding application).
pub fn init_tracing(format: LogFormat, level: Option<&str>) -> Result<()> {
    let filter = env_filter(level)?;
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    let installed = match format {
        LogFormat::Json => Registry::default()
            .with(filter)
            .with(
                fmt_layer
                    .json()
                    .with_current_span(true)
                    .with_span_list(false),
            )
            .try_init(),
        LogFormat::Pretty => Registry::default()
            .with(filter)
            .with(fmt_layer.pretty().with_ansi(true))
            .try_init(),
    };
    installed.map_err(|e| eyre!("Failed to install tracing subscriber: {e}"))?;

    tracing::info!(?format, "Rampart logging initialized");
    Ok(())
}

/// Span wrapping one request through the pipeline
pub fn create_request_span(request_id: &str, client: &str) -> tracing::Span {
    tracing::info_span!("request", request_id = request_id, client = client)
}

/// Span wrapping one outbound attempt to an upstream
pub fn create_upstream_span(service: &str, attempt: u32) -> tracing::Span {
    tracing::info_span!("upstream_attempt", service = service, attempt = attempt)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_level_is_rejected() {
        assert!(init_tracing(LogFormat::Json, Some("rampart=loud")).is_err());
    }

    #[test]
    fn second_init_fails_without_panicking() {
        let _ = init_tracing(LogFormat::Pretty, Some("warn"));
        assert!(init_tracing(LogFormat::Json, Some("warn")).is_err());
    }

    #[test]
    fn test_create_request_span() {
        let span = create_request_span("req-123", "203.0.113.7");
        if let Some(metadata) = span.metadata() {
            assert_eq!(metadata.name(), "request");
        }
    }

    #[test]
    fn test_create_upstream_span() {
        let span = create_upstream_span("combat", 2);
        if let Some(metadata) = span.metadata() {
            assert_eq!(metadata.name(), "upstream_attempt");
        }
    }
}
