// src/main.rs
use anyhow::Result;
use api_gateway::config::LoggingConfig;
use api_gateway::{Gateway, GatewayConfig};
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "api-gateway", version, about = "Front door for the backend services")]
struct Args {
    /// YAML configuration file; built-in defaults are used when omitted
    #[arg(short, long, env = "CONFIG_FILE")]
    config: Option<String>,

    /// Load and validate the configuration, then exit
    #[arg(long)]
    check: bool,
}

fn init_logging(config: &LoggingConfig) {
    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if config.format.eq_ignore_ascii_case("json") {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = GatewayConfig::load(args.config.as_deref())?;
    init_logging(&config.logging);

    if args.check {
        tracing::info!(routes = config.routes.len(), services = config.services.len(), "Configuration is valid");
        return Ok(());
    }

    tracing::info!(
        environment = ?config.environment,
        listen_addr = %config.listen_addr,
        "Starting API gateway"
    );
    let gateway = Gateway::new(config)?;
    gateway.start().await?;

    Ok(())
}
