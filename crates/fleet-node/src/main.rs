//! Fleet Node -- cluster node for a fleet of game-server services.
//!
//! Usage:
//!   fleet-node                      # Run with default config
//!   fleet-node --config path.toml   # Run with custom config
//!   fleet-node config               # Print the effective config
//!   fleet-node key                  # Show the transport key fingerprint

use clap::{Parser, Subcommand};

use fleet_network::{worker_threads, Role};
use fleet_node::config::NodeConfig;
use fleet_node::expand_tilde;
use fleet_node::identity::TransportKey;

#[derive(Parser)]
#[command(name = "fleet-node", about = "Fleet cluster node")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "~/.fleet/config.toml")]
    config: String,

    /// Log as JSON lines
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the node (default)
    Run,
    /// Print the effective configuration as TOML
    Config,
    /// Show or generate the transport encryption key
    Key,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let config_path = expand_tilde(&cli.config);
    let cfg = NodeConfig::load_or_default(&config_path)?;

    match cli.command {
        Some(Commands::Config) => {
            print!("{}", toml::to_string_pretty(&cfg)?);
        }
        Some(Commands::Key) => {
            let key_path = expand_tilde(&cfg.network.transport_key);
            let key = TransportKey::load_or_create(&key_path)?;
            println!("Fingerprint: {}", key.fingerprint());
            println!("Key file: {}", key_path.display());
        }
        Some(Commands::Run) | None => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(cfg.network.worker_threads.unwrap_or_else(|| worker_threads(Role::Node)))
                .enable_all()
                .build()?;
            runtime.block_on(run_node(cfg))?;
        }
    }

    Ok(())
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "fleet_node=info,fleet_network=info".into());
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn run_node(cfg: NodeConfig) -> anyhow::Result<()> {
    let mut node = fleet_node::node::start(&cfg).await?;
    tracing::info!(
        listeners = ?node.listen_addrs(),
        "all tasks spawned, press Ctrl-C to stop"
    );

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            tracing::info!("shutting down...");
        }
        _ = node.wait() => {
            tracing::info!("shutdown requested by the cluster");
        }
    }

    node.shutdown().await;
    Ok(())
}
