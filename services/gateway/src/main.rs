//! Edge gateway - Main Entry Point

use anyhow::Result;
use clap::{Arg, Command};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use edge_gateway::{GatewayConfig, start_server};

fn init_logging(format: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "edge_gateway=info,tower_http=info".into());
    let registry = tracing_subscriber::registry().with(filter);

    if format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("edge-gateway")
        .version(env!("CARGO_PKG_VERSION"))
        .author("Control System Team")
        .about("Edge gateway for the Control System identity and order services")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path (optional; environment variables override it)")
                .default_value("gateway.toml"),
        )
        .arg(
            Arg::new("routes")
                .long("routes")
                .help("Print the route table and exit")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .help("Log output format")
                .value_parser(["text", "json"])
                .default_value("text"),
        )
        .get_matches();

    let log_format = matches
        .get_one::<String>("log-format")
        .map_or("text", String::as_str);
    init_logging(log_format);

    let config_path = matches.get_one::<String>("config").map(String::as_str);
    let config = match GatewayConfig::load(config_path) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {:#}", e);
            std::process::exit(1);
        }
    };

    if matches.get_flag("routes") {
        edge_gateway::server::print_routes(&config);
        return Ok(());
    }

    info!("Starting edge gateway v{}", env!("CARGO_PKG_VERSION"));
    info!("Server will bind to: {}", config.server_address());
    info!("Upstreams:");
    for (name, url) in &config.upstreams {
        info!("  {}: {}", name, url);
    }
    info!("Features enabled:");
    info!("  CORS: {}", config.cors.enabled);
    info!(
        "  Rate Limiting: {} ({:?}, {} per {}s)",
        config.rate_limiting.enabled,
        config.rate_limiting.strategy,
        config.rate_limiting.requests_per_window,
        config.rate_limiting.window_seconds
    );
    info!("  Metrics: {}", config.monitoring.metrics_enabled);
    info!("  Doc merge policy: {:?}", config.docs.merge_policy);

    if let Err(e) = start_server(config).await {
        error!("Server error: {:#}", e);
        std::process::exit(1);
    }

    Ok(())
}
