//! Logging Configuration
//!
//! All settings are loaded from environment variables.
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | RUST_LOG | info | `EnvFilter` directives |
//! | CDC_BRIDGE_LOG_FORMAT | text | `text` or `json` |
//! | CDC_BRIDGE_SERVICE | cdc-bridge | service name attached to the startup line |

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone)]
pub struct ObservabilityConfig {
    /// `EnvFilter` directives
    pub filter: String,
    pub format: LogFormat,
    pub service_name: String,
    pub version: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl ObservabilityConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        ObservabilityConfig {
            filter: lookup("RUST_LOG")
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| "info".to_string()),
            format: match lookup("CDC_BRIDGE_LOG_FORMAT").as_deref() {
                Some(f) if f.eq_ignore_ascii_case("json") => LogFormat::Json,
                _ => LogFormat::Text,
            },
            service_name: lookup("CDC_BRIDGE_SERVICE").unwrap_or_else(|| "cdc-bridge".to_string()),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}
