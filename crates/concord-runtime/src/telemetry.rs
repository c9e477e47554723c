//! Tracing subscriber setup for binaries and tests embedding the engine

use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use concord_core::{ConcordError, ConcordResult};

/// Log output format
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line, human readable
    #[default]
    Pretty,
    /// Single line per event
    Compact,
    /// Structured JSON, one object per line
    Json,
}

/// Install a global subscriber. Level filtering comes from `RUST_LOG`,
/// defaulting to `info`.
///
/// Fails if a global subscriber is already installed.
pub fn init_tracing(format: LogFormat) -> ConcordResult<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    let result = match format {
        LogFormat::Pretty => registry.with(fmt::layer().pretty().with_target(true)).try_init(),
        LogFormat::Compact => registry.with(fmt::layer().compact().with_target(true)).try_init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_target(true).with_current_span(false))
            .try_init(),
    };

    result.map_err(|e| ConcordError::Config(format!("tracing already initialised: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_fails() {
        // Whichever call runs first in this process wins; any later one errors.
        let _ = init_tracing(LogFormat::Compact);
        assert!(matches!(
            init_tracing(LogFormat::Json),
            Err(ConcordError::Config(_))
        ));
    }

    #[test]
    fn test_log_format_serde() {
        let format: LogFormat = serde_json::from_str("\"json\"").unwrap();
        assert_eq!(format, LogFormat::Json);
        assert_eq!(LogFormat::default(), LogFormat::Pretty);
    }
}
