use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use scale_chat::config::{self, ChatConfig, FileConfig};
use scale_chat::{ChatServer, client, metrics};

#[derive(Parser)]
#[command(name = "scale-chat")]
#[command(about = "Horizontally-scalable WebSocket chat relay")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a relay instance
    Serve(ServeArgs),
    /// Chat interactively from the terminal
    Connect(ConnectArgs),
}

#[derive(Args)]
struct ServeArgs {
    /// Config file (missing file = defaults)
    #[arg(long, default_value = "./scale-chat.toml")]
    config: PathBuf,

    /// Listen address for both listeners
    #[arg(long)]
    host: Option<String>,

    /// Client WebSocket port
    #[arg(short, long)]
    port: Option<u16>,

    /// Metrics and health port
    #[arg(long)]
    metrics_port: Option<u16>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

#[derive(Args)]
struct ConnectArgs {
    /// Server URL, e.g. ws://localhost:8080/ws/lobby
    url: String,

    /// Sender id shown to other clients
    #[arg(long, default_value = "anonymous")]
    sender: String,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

fn init_logging(debug: bool) {
    let default_directive = if debug {
        "scale_chat=debug,tower_http=debug,info"
    } else {
        "scale_chat=info,tower_http=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Serve(args) => {
            init_logging(args.debug);
            run_server(args).await
        }
        Commands::Connect(args) => {
            init_logging(args.debug);
            client::run_client(&args.url, &args.sender).await
        }
    };

    if let Err(e) = result {
        error!("{e:#}");
        std::process::exit(1);
    }
}

async fn run_server(args: ServeArgs) -> Result<()> {
    info!("Starting scale-chat relay");

    let mut file_config: FileConfig = config::load_config(Some(&args.config))
        .extract()
        .with_context(|| format!("invalid configuration ({})", args.config.display()))?;
    if let Some(host) = args.host {
        file_config.server.host = host;
    }
    if let Some(port) = args.port {
        file_config.server.port = port;
    }
    if let Some(port) = args.metrics_port {
        file_config.server.metrics_port = port;
    }
    let config = ChatConfig::from_file(&file_config)?;

    let prometheus = metrics::install_recorder()?;
    let running = ChatServer::new(config)
        .with_prometheus(prometheus)
        .start()
        .await?;

    let shutdown = running.shutdown_token();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received shutdown signal, cleaning up...");
                shutdown.cancel();
            }
            Err(e) => error!(error = %e, "could not install Ctrl+C handler"),
        }
    });

    running.wait().await
}
