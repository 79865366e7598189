//! Tracing subscriber setup for the binary

pub mod config;

pub use config::{LogFormat, ObservabilityConfig};

use tracing_subscriber::EnvFilter;

#[derive(Debug, thiserror::Error)]
pub enum ObservabilityError {
    #[error("invalid log filter `{filter}`: {reason}")]
    Filter { filter: String, reason: String },
    #[error("tracing subscriber already installed: {0}")]
    AlreadyInstalled(String),
}

/// Install the global `fmt` subscriber
pub fn init_tracing(config: &ObservabilityConfig) -> Result<(), ObservabilityError> {
    let filter = EnvFilter::try_new(&config.filter).map_err(|e| ObservabilityError::Filter {
        filter: config.filter.clone(),
        reason: e.to_string(),
    })?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    let installed = match config.format {
        LogFormat::Json => builder.json().with_current_span(false).try_init(),
        LogFormat::Text => builder.try_init(),
    };
    installed.map_err(|e| ObservabilityError::AlreadyInstalled(e.to_string()))?;

    tracing::info!(
        service = %config.service_name,
        version = %config.version,
        format = ?config.format,
        "Logging initialised"
    );
    Ok(())
}
