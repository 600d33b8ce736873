use std::path::PathBuf;

use clap::{Parser, Subcommand};

use warp_tunnel::config::{
    load_client_config, load_server_config, validation, ClientConfig, ServerConfig,
};
use warp_tunnel::{connect, observability, serve, ConnectOptions, Shutdown};

#[derive(Parser)]
#[command(name = "warp")]
#[command(about = "Self-hosted HTTP tunnel", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the public-facing tunnel server
    Serve {
        /// TOML config file; flags override its values
        #[arg(long)]
        config: Option<PathBuf>,

        /// Bind address, e.g. 0.0.0.0:8080
        #[arg(long)]
        bind: Option<String>,

        /// Accepted API key; repeat for several
        #[arg(long = "api-key")]
        api_keys: Vec<String>,

        /// Path clients dial in on
        #[arg(long)]
        connect_path: Option<String>,
    },
    /// Expose a local app through a tunnel server
    Connect {
        /// TOML config file; flags override its values
        #[arg(long)]
        config: Option<PathBuf>,

        /// Server base url, e.g. https://tunnel.example
        #[arg(long)]
        server: Option<String>,

        /// API key presented at registration
        #[arg(long)]
        api_key: Option<String>,

        /// Domain to claim
        #[arg(long)]
        domain: Option<String>,

        /// Local base url to replay requests against
        #[arg(long)]
        local_addr: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    observability::logging::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            config,
            bind,
            api_keys,
            connect_path,
        } => {
            let mut config = match config {
                Some(path) => load_server_config(&path)?,
                None => ServerConfig::default(),
            };
            if let Some(bind) = bind {
                config.bind_address = bind;
            }
            if !api_keys.is_empty() {
                config.api_keys = api_keys;
            }
            if let Some(connect_path) = connect_path {
                config.connect_path = connect_path;
            }
            if let Err(errors) = validation::validate_server_config(&config) {
                for error in &errors {
                    tracing::error!(%error, "invalid configuration");
                }
                std::process::exit(2);
            }

            let shutdown = Shutdown::new();
            shutdown.on_ctrl_c();
            serve(config, &shutdown).await?;
        }

        Commands::Connect {
            config,
            server,
            api_key,
            domain,
            local_addr,
        } => {
            let mut config = match config {
                Some(path) => load_client_config(&path)?,
                None => ClientConfig::default(),
            };
            if let Some(server) = server {
                config.server = server;
            }
            if let Some(api_key) = api_key {
                config.api_key = api_key;
            }
            if let Some(domain) = domain {
                config.domain = domain;
            }
            if let Some(local_addr) = local_addr {
                config.local_addr = local_addr;
            }
            if let Err(errors) = validation::validate_client_config(&config) {
                for error in &errors {
                    tracing::error!(%error, "invalid configuration");
                }
                std::process::exit(2);
            }

            let domain = config.domain.clone();
            let mut tunnel = connect(ConnectOptions::from(config)).await?;
            tunnel.registered().await?;
            tracing::info!(domain = %domain, "tunnel is live");

            match tunnel.closed().await {
                Some(error) => {
                    tracing::error!(%error, "tunnel ended abnormally");
                    std::process::exit(1);
                }
                None => tracing::info!("tunnel closed"),
            }
        }
    }

    Ok(())
}
