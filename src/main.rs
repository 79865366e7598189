//! CDC bridge binary
//!
//! Reads change notifications from the configured source and appends them
//! to the event log until interrupted.
//!
//! ## Usage
//!
//! ```text
//! cdc-bridge <config.toml>
//! CDC_BRIDGE_CONFIG=/etc/cdc-bridge.toml cdc-bridge
//! ```
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | CDC_BRIDGE_CONFIG | - | Config file path when no argument is given |
//! | CDC_BRIDGE_BROKERS | - | Comma-separated broker list override |
//! | CDC_BRIDGE_TOPICS | - | Comma-separated topic list override |
//! | CDC_BRIDGE_GROUP_ID | - | Consumer group override |
//! | CDC_BRIDGE_LOG_ENDPOINT | - | `memory://` or `file://<dir>` override |
//! | CDC_BRIDGE_OFFSET_RESET | - | `earliest` or `latest` override |
//! | CDC_BRIDGE_COMMIT_MODE | - | `after_append` or `auto` override |
//! | RUST_LOG | info | Log filter |
//! | CDC_BRIDGE_LOG_FORMAT | text | `text` or `json` |

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use cdc_bridge::config::{BridgeConfig, CONFIG_PATH_ENV};
use cdc_bridge::observability::{init_tracing, ObservabilityConfig};
use cdc_bridge::Bridge;
use std::process::ExitCode;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[cfg(unix)]
async fn terminate() {
    match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            error!(error = %e, "Cannot install SIGTERM handler");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(e) = init_tracing(&ObservabilityConfig::from_env()) {
        eprintln!("cdc-bridge: {}", e);
        return ExitCode::FAILURE;
    }

    let Some(path) = BridgeConfig::path_from_args_or_env() else {
        error!(
            env = CONFIG_PATH_ENV,
            "No config file given; pass a path or set the environment variable"
        );
        return ExitCode::FAILURE;
    };

    let config = match BridgeConfig::load(&path) {
        Ok(config) => config,
        Err(e) => {
            error!(path = %path.display(), error = %e, "Invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    let mut bridge = match Bridge::connect(&config).await {
        Ok(bridge) => bridge,
        Err(e) => {
            error!(error = %e, "Startup failed");
            return ExitCode::FAILURE;
        }
    };

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = signal::ctrl_c() => {}
            _ = terminate() => {}
        }
        info!("Shutdown signal received");
        trigger.cancel();
    });

    match bridge.run(cancel).await {
        Ok(stats) => {
            info!(
                appended = stats.appended_events,
                skipped = stats.decode_skips + stats.lookup_skips,
                dead_letters = stats.dead_letters,
                "Bridge shutdown complete"
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Bridge failed");
            ExitCode::FAILURE
        }
    }
}
