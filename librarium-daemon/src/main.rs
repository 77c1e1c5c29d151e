//! # librarium-daemon
//!
//! The Librarium plugin host daemon.
//!
//! This daemon is responsible for:
//! - Loading every enabled installed plugin at startup
//! - Hot-reloading plugins on install, update and enable events
//! - Owning the order resolver and hook dispatcher used by the pipeline
//! - Draining plugin runtimes on shutdown
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    librarium-daemon                          │
//! │                                                              │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐      │
//! │  │   Plugin     │  │   Plugin     │  │   Config     │      │
//! │  │   Manager    │  │   Registry   │  │   Store      │      │
//! │  └──────────────┘  └──────────────┘  └──────────────┘      │
//! │                                                              │
//! │  ┌────────────────────────────────────────────────────┐    │
//! │  │     Hook Dispatcher (order, pools, deadlines)      │    │
//! │  └────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!           ┌──────────────────┼──────────────────┐
//!           ▼                  ▼                  ▼
//!      ┌─────────┐      ┌─────────────┐    ┌──────────┐
//!      │Converter│      │   Parsers   │    │Enrichers │
//!      │ Plugins │      │  Generators │    │          │
//!      └─────────┘      └─────────────┘    └──────────┘
//! ```
//!
//! ## Configuration
//!
//! The daemon reads configuration from `$XDG_CONFIG_HOME/librarium/config.toml`.
//!
//! ## Running
//!
//! ```bash
//! # Start the daemon
//! cargo run --bin librarium-daemon
//!
//! # With debug logging
//! RUST_LOG=debug cargo run --bin librarium-daemon
//! ```

use anyhow::Result;
use librarium_daemon::config::Config;
use librarium_daemon::daemon::Daemon;
use librarium_daemon::plugin::LoadOutcome;
use librarium_runtime::EngineSet;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration from config.toml
    let (config, load_error) = match Config::load_default() {
        Ok(cfg) => (cfg, None),
        Err(e) => (Config::default(), Some(e)),
    };

    // Initialize logging; RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.daemon.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    info!("Starting librarium-daemon v{}", env!("CARGO_PKG_VERSION"));
    match load_error {
        None => info!("Loaded configuration from default path"),
        Some(e) => warn!("Failed to load config, using defaults: {:#}", e),
    }

    let daemon = Daemon::from_config(&config, EngineSet::with_defaults()).await?;

    // Load installed plugins
    let reports = daemon.manager().load_all().await?;
    for report in &reports {
        match &report.outcome {
            LoadOutcome::Loaded => info!(
                "Plugin: {} v{} loaded ({} warning(s))",
                report.key,
                report.version.as_deref().unwrap_or("?"),
                report.warnings.len()
            ),
            LoadOutcome::Failed(e) => error!("Plugin: {} failed to load: {}", report.key, e),
            other => info!("Plugin: {} {:?}", report.key, other),
        }
        for warning in &report.warnings {
            warn!("Plugin {}: {}", report.key, warning);
        }
    }

    info!("Daemon startup complete");
    info!("Press Ctrl+C to stop");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;

    info!("Shutting down...");
    daemon.shutdown().await;

    info!("Daemon stopped");
    Ok(())
}
