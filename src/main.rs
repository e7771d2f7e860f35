use std::path::PathBuf;

use clap::Parser;

use tunnel_proxy::config::loader::{load_config, ConfigError};
use tunnel_proxy::config::validation::validate_config;
use tunnel_proxy::lifecycle::startup;
use tunnel_proxy::observability::logging::init_logging;
use tunnel_proxy::ProxyConfig;

#[derive(Parser, Debug)]
#[command(name = "tunnel-proxy", version)]
#[command(about = "CONNECT proxy that replays inner requests with a chosen TLS fingerprint", long_about = None)]
struct Cli {
    /// Path to a TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address, overriding `listener.bind_address`.
    #[arg(short, long)]
    bind: Option<String>,

    /// Log level, overriding `observability.log_level`.
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => ProxyConfig::default(),
    };
    if let Some(bind) = cli.bind {
        config.listener.bind_address = bind;
    }
    if let Some(level) = cli.log_level {
        config.observability.log_level = level;
    }
    validate_config(&config).map_err(ConfigError::Validation)?;

    init_logging(&config.observability)?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "tunnel-proxy starting");

    if let Err(e) = startup::run(config).await {
        tracing::error!(error = %e, "Proxy stopped with error");
        return Err(e.into());
    }
    Ok(())
}
