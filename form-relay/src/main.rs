use std::{path::PathBuf, sync::Arc};

use clap::{Parser, Subcommand};
use form_relay::{
    api::{self, ApiState},
    config::RelayConfig,
    gateway::{self, Gateway},
    relay::Relay,
};
use tokio::net::TcpListener;

#[derive(Parser, Debug)]
#[command(name = "form-relay", about = "Residential proxy relay")]
pub struct CliArgs {
    /// Enable debug logging
    #[arg(short, long, default_value = "false")]
    pub debug: bool,
    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Subcommand, Debug)]
pub enum CliCommand {
    /// Run the relay: node hub, status api and proxy gateway
    #[command(name = "run")]
    Run {
        /// JSON config file, defaults are used when absent
        #[arg(short = 'C', long)]
        config: Option<PathBuf>,
        /// Node WebSocket and status api listen address
        #[arg(long)]
        api_addr: Option<String>,
        /// Client proxy listen address
        #[arg(long)]
        proxy_addr: Option<String>,
        /// Shared store, e.g. redis://127.0.0.1:6379
        #[arg(long)]
        redis_url: Option<String>,
    },
    /// Print the effective configuration
    #[command(name = "config")]
    Config {
        #[arg(short = 'C', long)]
        config: Option<PathBuf>,
    },
}

fn load_config(path: Option<PathBuf>) -> anyhow::Result<RelayConfig> {
    match path {
        Some(path) => Ok(RelayConfig::from_file(path)?),
        None => Ok(RelayConfig::default()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    let level = if args.debug { log::Level::Debug } else { log::Level::Info };
    simple_logger::init_with_level(level)?;

    match args.command {
        CliCommand::Run {
            config,
            api_addr,
            proxy_addr,
            redis_url,
        } => {
            let mut config = load_config(config)?;
            if let Some(addr) = api_addr {
                config.api_addr = addr;
            }
            if let Some(addr) = proxy_addr {
                config.proxy_addr = addr;
            }
            if redis_url.is_some() {
                config.store.redis_url = redis_url;
            }
            run(config).await?;
        }
        CliCommand::Config { config } => {
            let config = load_config(config)?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

async fn run(config: RelayConfig) -> anyhow::Result<()> {
    log::info!("Opening shared store");
    let store = Relay::open_store(&config).await?;
    let relay = Relay::builder(config).store(store).build();
    let gateway = Arc::new(Gateway::new(relay.clone()));

    let (shutdown_tx, _) = tokio::sync::broadcast::channel(16);
    let background = relay.spawn_background(&shutdown_tx);

    let api_listener = TcpListener::bind(&relay.config.api_addr).await?;
    let proxy_listener = TcpListener::bind(&relay.config.proxy_addr).await?;

    let state = ApiState {
        relay: relay.clone(),
        gateway: gateway.clone(),
    };
    let api_handle = tokio::spawn(api::serve(state, api_listener, shutdown_tx.subscribe()));
    let proxy_handle = tokio::spawn(gateway::serve(gateway, proxy_listener, shutdown_tx.subscribe()));

    log::info!("Awaiting shutdown signal");
    tokio::signal::ctrl_c().await?;
    log::info!("Shutting down");
    let _ = shutdown_tx.send(());

    for handle in [api_handle, proxy_handle] {
        match handle.await {
            Ok(Err(e)) => log::error!("Listener exited with error: {e}"),
            Err(e) => log::error!("Listener task failed: {e}"),
            Ok(Ok(())) => {}
        }
    }
    for handle in background {
        let _ = handle.await;
    }
    Ok(())
}
