use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use causeway::cli::{Cli, Commands};
use causeway::config::Config;
use causeway::session::SessionRegistry;
use causeway::websocket::AppState;
use negotiation_webrtc::{NegotiatorOptions, WebRtcNegotiator};

#[tokio::main]
async fn main() {
    // Default to INFO level if RUST_LOG is not set
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    // Check if running as probe client
    if let Some(Commands::Probe { url }) = cli.command {
        if let Err(err) = causeway::cli::run_probe(url).await {
            error!("probe failed: {err}");
            std::process::exit(1);
        }
        return;
    }

    // Otherwise, run as relay server
    let mut config = Config::from_env();
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(static_dir) = cli.static_dir {
        config.static_dir = Some(static_dir);
    }

    info!("starting causeway signaling relay on port {}", config.port);
    let ice_urls: Vec<String> = config
        .ice_servers
        .iter()
        .flat_map(|server| server.urls.iter().cloned())
        .collect();
    info!("ice servers: {}", ice_urls.join(", "));

    let negotiator = match WebRtcNegotiator::with_options(NegotiatorOptions {
        echo_data_channels: config.data_channel_echo,
    }) {
        Ok(negotiator) => Arc::new(negotiator),
        Err(err) => {
            error!("failed to initialize negotiation engine: {err}");
            std::process::exit(1);
        }
    };

    let state = AppState {
        config: Arc::new(config.clone()),
        registry: SessionRegistry::new(),
        negotiator,
    };
    let app = causeway::build_router(state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind to address");

    info!("causeway listening on {}", addr);

    axum::serve(listener, app)
        .await
        .expect("Failed to start server");
}
