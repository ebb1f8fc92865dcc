use std::sync::Arc;

use anyhow::Result;
use clap::Parser;

use watchpost_core::config::WatchpostConfig;

use watchpost_daemon::cli::DaemonCli;
use watchpost_daemon::logging;
use watchpost_daemon::orchestrator::{Adapters, Orchestrator};
use watchpost_daemon::platform::PlatformClient;

/// Default platform API endpoint when `WATCHPOST_PLATFORM_BASE_URL` is unset.
const DEFAULT_PLATFORM_BASE_URL: &str = "http://127.0.0.1:10204";

#[tokio::main]
async fn main() -> Result<()> {
    let cli = DaemonCli::parse();

    let mut config = WatchpostConfig::load(&cli.config)
        .await
        .map_err(|e| anyhow::anyhow!("failed to load config {}: {}", cli.config.display(), e))?;

    // CLI overrides win over config file and environment variables
    if let Some(level) = cli.log_level {
        config.general.log_level = level;
    }
    if let Some(format) = cli.log_format {
        config.general.log_format = format;
    }
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("config validation failed: {}", e))?;

    if cli.validate {
        println!("configuration OK: {}", cli.config.display());
        return Ok(());
    }

    logging::init_tracing(&config.general)?;
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        "watchpost-daemon starting"
    );

    let base_url = std::env::var("WATCHPOST_PLATFORM_BASE_URL")
        .unwrap_or_else(|_| DEFAULT_PLATFORM_BASE_URL.to_owned());
    let platform = Arc::new(PlatformClient::new(base_url));

    let adapters = Adapters {
        data_source: platform.clone(),
        strategy_source: platform.clone(),
        shield_source: platform.clone(),
        cmdb: platform,
        sink_factory: None,
    };

    let mut orchestrator = Orchestrator::build_from_config(config, adapters)?;
    orchestrator.run().await?;

    tracing::info!("watchpost-daemon shut down");
    Ok(())
}
